//! YAML configuration: five top-level maps (`emulator`, `switch`,
//! `devices`, `ports`, `vcss`) with string-valued numeric leaves parsed
//! base-0, so `0x` hex, `0o` octal, `0b` binary and decimal all work.
//!
//! Loading happens in two phases: deserialize the file into the section
//! structs below, then apply them onto a [`SwitchState`] — switch sizing
//! first, then the device catalog, then per-port overrides (attaching
//! referenced devices), then the VCS table.

use crate::state::device::{attach, DeviceTemplate, Mld};
use crate::state::pcicfg::{CfgSpaceBuilder, PciCfgError};
use crate::state::{
    BindStatus, DeviceType, Granularity, Port, PortState, SwitchState, Vcs, VcsState,
    MAX_LD, MAX_PORTS, MAX_VCSS, MAX_VPPBS_PER_VCS,
};
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid number {value:?} for {key}")]
    Number { key: String, value: String },

    #[error("config space for device {device}: {source}")]
    PciCfg {
        device: String,
        #[source]
        source: PciCfgError,
    },

    #[error("topology: {0}")]
    Sizing(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub emulator: EmulatorSection,
    pub switch: SwitchSection,
    pub devices: BTreeMap<String, DeviceSection>,
    pub ports: BTreeMap<String, PortSection>,
    pub vcss: BTreeMap<String, VcsSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EmulatorSection {
    #[serde(rename = "verbosity-hex")]
    pub verbosity_hex: Option<String>,
    #[serde(rename = "verbosity-mctp")]
    pub verbosity_mctp: Option<String>,
    #[serde(rename = "tcp-port")]
    pub tcp_port: Option<String>,
    pub dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SwitchSection {
    pub version: Option<String>,
    pub vid: Option<String>,
    pub did: Option<String>,
    pub svid: Option<String>,
    pub ssid: Option<String>,
    pub sn: Option<String>,
    pub max_msg_size_n: Option<String>,
    pub msg_rsp_limit_n: Option<String>,
    pub bos_running: Option<String>,
    pub bos_pcnt: Option<String>,
    pub bos_opcode: Option<String>,
    pub bos_rc: Option<String>,
    pub bos_ext: Option<String>,
    pub ingress_port: Option<String>,
    pub num_ports: Option<String>,
    pub num_vcss: Option<String>,
    pub num_vppbs: Option<String>,
    pub num_decoders: Option<String>,
    pub mlw: Option<String>,
    pub mls: Option<String>,
    pub speeds: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub did: Option<String>,
    pub port: DevicePortSection,
    pub pcicfg: PciCfgSection,
    pub mld: Option<MldSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DevicePortSection {
    pub dv: Option<String>,
    pub dt: Option<String>,
    pub cv: Option<String>,
    pub mlw: Option<String>,
    pub mls: Option<String>,
    pub rootport: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PciCfgSection {
    pub vendor: Option<String>,
    pub device: Option<String>,
    pub command: Option<String>,
    pub status: Option<String>,
    pub revid: Option<String>,
    pub baseclass: Option<String>,
    pub subclass: Option<String>,
    pub pi: Option<String>,
    pub cacheline: Option<String>,
    #[serde(rename = "type")]
    pub header_type: Option<String>,
    pub subvendor: Option<String>,
    pub subsystem: Option<String>,
    pub intline: Option<String>,
    pub intpin: Option<String>,
    pub mingnt: Option<String>,
    pub maxlat: Option<String>,
    /// Capability id -> CSV byte string.
    pub cap: BTreeMap<String, String>,
    /// Packed `id:ver` key -> CSV byte string.
    pub ecap: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MldSection {
    pub memory_size: Option<String>,
    pub num: Option<String>,
    pub epc: Option<String>,
    pub ttr: Option<String>,
    pub granularity: Option<String>,
    pub epc_en: Option<String>,
    pub ttr_en: Option<String>,
    pub egress_mod_pcnt: Option<String>,
    pub egress_sev_pcnt: Option<String>,
    pub sample_interval: Option<String>,
    pub rcb: Option<String>,
    pub comp_interval: Option<String>,
    pub bp_avg_pcnt: Option<String>,
    pub rng1: Option<String>,
    pub rng2: Option<String>,
    pub alloc_bw: Option<String>,
    pub bw_limit: Option<String>,
    pub mmap: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PortSection {
    pub device: Option<String>,
    pub mlw: Option<String>,
    pub mls: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VcsSection {
    pub state: Option<String>,
    pub uspid: Option<String>,
    pub num_vppb: Option<String>,
    pub vppbs: BTreeMap<String, VppbSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VppbSection {
    pub bind_status: Option<String>,
    pub ppid: Option<String>,
    pub ldid: Option<String>,
}

/// Settings the config may override that belong to the process, not the
/// switch model. These win over built-in defaults; explicit CLI flags win
/// over these.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EmulatorOverrides {
    pub tcp_port: Option<u16>,
    pub verbosity: Option<u64>,
    pub verbosity_mctp: Option<u64>,
}

/// Parse a numeric leaf with C `strtoul(_, _, 0)` semantics.
pub fn parse_num(key: &str, s: &str) -> Result<u64, ConfigError> {
    let t = s.trim();
    let bad = || ConfigError::Number {
        key: key.to_string(),
        value: s.to_string(),
    };
    let (digits, radix) = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(oct) = t.strip_prefix("0o") {
        (oct, 8)
    } else if let Some(bin) = t.strip_prefix("0b") {
        (bin, 2)
    } else {
        (t, 10)
    };
    u64::from_str_radix(digits, radix).map_err(|_| bad())
}

fn opt_num(key: &str, v: &Option<String>) -> Result<Option<u64>, ConfigError> {
    v.as_deref().map(|s| parse_num(key, s)).transpose()
}

/// Parse a CSV byte-list leaf (`"0x23,0x01,0x00"`).
fn parse_csv(key: &str, s: &str) -> Result<Vec<u64>, ConfigError> {
    s.split(',')
        .filter(|t| !t.trim().is_empty())
        .map(|t| parse_num(key, t))
        .collect()
}

/// Read and deserialize a configuration file.
pub fn load_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply a parsed configuration onto the switch state. Returns the
/// emulator-level overrides for the caller to reconcile with the CLI.
pub fn apply(cfg: &ConfigFile, st: &mut SwitchState) -> Result<EmulatorOverrides, ConfigError> {
    let overrides = apply_emulator(&cfg.emulator, st)?;
    apply_switch(&cfg.switch, st)?;
    apply_devices(&cfg.devices, st)?;
    apply_ports(&cfg.ports, st)?;
    apply_vcss(&cfg.vcss, st)?;
    Ok(overrides)
}

fn apply_emulator(
    em: &EmulatorSection,
    st: &mut SwitchState,
) -> Result<EmulatorOverrides, ConfigError> {
    if let Some(dir) = &em.dir {
        st.dir = Some(PathBuf::from(dir));
    }
    Ok(EmulatorOverrides {
        tcp_port: opt_num("emulator.tcp-port", &em.tcp_port)?.map(|v| v as u16),
        verbosity: opt_num("emulator.verbosity-hex", &em.verbosity_hex)?,
        verbosity_mctp: opt_num("emulator.verbosity-mctp", &em.verbosity_mctp)?,
    })
}

fn apply_switch(sw: &SwitchSection, st: &mut SwitchState) -> Result<(), ConfigError> {
    macro_rules! set {
        ($field:ident, $key:literal, $ty:ty) => {
            if let Some(v) = opt_num($key, &sw.$field)? {
                st.$field = v as $ty;
            }
        };
    }
    set!(version, "switch.version", u8);
    set!(vid, "switch.vid", u16);
    set!(did, "switch.did", u16);
    set!(svid, "switch.svid", u16);
    set!(ssid, "switch.ssid", u16);
    set!(sn, "switch.sn", u64);
    set!(max_msg_size_n, "switch.max_msg_size_n", u8);
    set!(msg_rsp_limit_n, "switch.msg_rsp_limit_n", u8);
    set!(ingress_port, "switch.ingress_port", u8);
    set!(num_vppbs, "switch.num_vppbs", u16);
    set!(num_decoders, "switch.num_decoders", u8);
    set!(mlw, "switch.mlw", u8);
    set!(mls, "switch.mls", u8);
    set!(speeds, "switch.speeds", u8);

    if let Some(v) = opt_num("switch.bos_running", &sw.bos_running)? {
        st.bos.running = v != 0;
    }
    if let Some(v) = opt_num("switch.bos_pcnt", &sw.bos_pcnt)? {
        st.bos.pcnt = v as u8;
    }
    if let Some(v) = opt_num("switch.bos_opcode", &sw.bos_opcode)? {
        st.bos.opcode = v as u16;
    }
    if let Some(v) = opt_num("switch.bos_rc", &sw.bos_rc)? {
        st.bos.rc = v as u16;
    }
    if let Some(v) = opt_num("switch.bos_ext", &sw.bos_ext)? {
        st.bos.ext = v as u16;
    }

    // Resize the topology after the link defaults are known: fresh ports
    // inherit them.
    if let Some(n) = opt_num("switch.num_ports", &sw.num_ports)? {
        let n = n as usize;
        if n > MAX_PORTS {
            return Err(ConfigError::Sizing(format!("num_ports {n} exceeds {MAX_PORTS}")));
        }
        st.ports = (0..n)
            .map(|i| Port::new(i as u8, st.mlw, st.mls, st.speeds))
            .collect();
    }
    if let Some(n) = opt_num("switch.num_vcss", &sw.num_vcss)? {
        let n = n as usize;
        if n > MAX_VCSS {
            return Err(ConfigError::Sizing(format!("num_vcss {n} exceeds {MAX_VCSS}")));
        }
        st.vcss = (0..n).map(|i| Vcs::new(i as u8)).collect();
    }
    Ok(())
}

fn apply_devices(
    devices: &BTreeMap<String, DeviceSection>,
    st: &mut SwitchState,
) -> Result<(), ConfigError> {
    for (name, section) in devices {
        let Some(did) = opt_num("device.did", &section.did)? else {
            warn!("device {name} has no did, skipping");
            continue;
        };
        let did = did as usize;
        if st.devices.len() <= did {
            st.devices.resize_with(did + 1, DeviceTemplate::default);
        }

        let mut dev = DeviceTemplate {
            did: did as u8,
            name: name.clone(),
            ..Default::default()
        };
        let p = &section.port;
        if let Some(v) = opt_num("device.port.dv", &p.dv)? {
            dev.dv = v as u8;
        }
        if let Some(v) = opt_num("device.port.dt", &p.dt)? {
            dev.dt = DeviceType::from_wire(v as u8).unwrap_or_default();
        }
        if let Some(v) = opt_num("device.port.cv", &p.cv)? {
            dev.cv = v as u8;
        }
        if let Some(v) = opt_num("device.port.mlw", &p.mlw)? {
            dev.mlw = v as u8;
        }
        if let Some(v) = opt_num("device.port.mls", &p.mls)? {
            dev.mls = v as u8;
        }
        if let Some(v) = opt_num("device.port.rootport", &p.rootport)? {
            dev.rootport = v != 0;
        }

        dev.cfgspace = Some(build_cfgspace(name, &section.pcicfg)?);

        if let Some(m) = &section.mld {
            dev.mld = Some(Box::new(build_mld(m)?));
        }

        info!("loaded device template {name} (did {did})");
        st.devices[did] = dev;
    }
    Ok(())
}

fn build_cfgspace(
    device: &str,
    pci: &PciCfgSection,
) -> Result<Box<crate::state::pcicfg::CfgSpace>, ConfigError> {
    let mut b = CfgSpaceBuilder::new();
    let fields: [(&str, &Option<String>); 16] = [
        ("vendor", &pci.vendor),
        ("device", &pci.device),
        ("command", &pci.command),
        ("status", &pci.status),
        ("revid", &pci.revid),
        ("baseclass", &pci.baseclass),
        ("subclass", &pci.subclass),
        ("pi", &pci.pi),
        ("cacheline", &pci.cacheline),
        ("type", &pci.header_type),
        ("subvendor", &pci.subvendor),
        ("subsystem", &pci.subsystem),
        ("intline", &pci.intline),
        ("intpin", &pci.intpin),
        ("mingnt", &pci.mingnt),
        ("maxlat", &pci.maxlat),
    ];
    for (key, value) in fields {
        if let Some(v) = value {
            b.header_field(key, parse_num(key, v)?);
        }
    }
    for (id, body) in &pci.cap {
        let id = parse_num("pcicfg.cap id", id)? as u8;
        let bytes = parse_csv("pcicfg.cap", body)?
            .into_iter()
            .map(|v| v as u8)
            .collect();
        b.capability(id, bytes);
    }
    for (key, body) in &pci.ecap {
        let packed = parse_num("pcicfg.ecap id", key)?;
        let bytes = parse_csv("pcicfg.ecap", body)?
            .into_iter()
            .map(|v| v as u8)
            .collect();
        b.extended_capability((packed >> 4) as u16, (packed & 0xF) as u8, bytes);
    }
    b.build().map_err(|source| ConfigError::PciCfg {
        device: device.to_string(),
        source,
    })
}

fn build_mld(m: &MldSection) -> Result<Mld, ConfigError> {
    let mut mld = Mld::default();
    if let Some(v) = opt_num("mld.memory_size", &m.memory_size)? {
        mld.memory_size = v;
    }
    if let Some(v) = opt_num("mld.num", &m.num)? {
        mld.num = (v as u16).min(MAX_LD as u16);
    }
    if let Some(v) = opt_num("mld.epc", &m.epc)? {
        mld.epc = v != 0;
    }
    if let Some(v) = opt_num("mld.ttr", &m.ttr)? {
        mld.ttr = v != 0;
    }
    if let Some(v) = opt_num("mld.granularity", &m.granularity)? {
        mld.granularity = Granularity::from_wire(v as u8).unwrap_or_default();
    }
    if let Some(v) = opt_num("mld.epc_en", &m.epc_en)? {
        mld.epc_en = v != 0;
    }
    if let Some(v) = opt_num("mld.ttr_en", &m.ttr_en)? {
        mld.ttr_en = v != 0;
    }
    if let Some(v) = opt_num("mld.egress_mod_pcnt", &m.egress_mod_pcnt)? {
        mld.egress_mod_pcnt = v as u8;
    }
    if let Some(v) = opt_num("mld.egress_sev_pcnt", &m.egress_sev_pcnt)? {
        mld.egress_sev_pcnt = v as u8;
    }
    if let Some(v) = opt_num("mld.sample_interval", &m.sample_interval)? {
        mld.sample_interval = v as u8;
    }
    if let Some(v) = opt_num("mld.rcb", &m.rcb)? {
        mld.rcb = v as u16;
    }
    if let Some(v) = opt_num("mld.comp_interval", &m.comp_interval)? {
        mld.comp_interval = v as u8;
    }
    if let Some(v) = opt_num("mld.bp_avg_pcnt", &m.bp_avg_pcnt)? {
        mld.bp_avg_pcnt = v as u8;
    }
    if let Some(s) = &m.rng1 {
        for (i, v) in parse_csv("mld.rng1", s)?.into_iter().take(MAX_LD).enumerate() {
            mld.rng1[i] = v;
        }
    }
    if let Some(s) = &m.rng2 {
        for (i, v) in parse_csv("mld.rng2", s)?.into_iter().take(MAX_LD).enumerate() {
            mld.rng2[i] = v;
        }
    }
    if let Some(s) = &m.alloc_bw {
        for (i, v) in parse_csv("mld.alloc_bw", s)?.into_iter().take(MAX_LD).enumerate() {
            mld.alloc_bw[i] = v as u8;
        }
    }
    if let Some(s) = &m.bw_limit {
        for (i, v) in parse_csv("mld.bw_limit", s)?.into_iter().take(MAX_LD).enumerate() {
            mld.bw_limit[i] = v as u8;
        }
    }
    if let Some(v) = opt_num("mld.mmap", &m.mmap)? {
        mld.mmap = v != 0;
    }
    Ok(mld)
}

fn apply_ports(
    ports: &BTreeMap<String, PortSection>,
    st: &mut SwitchState,
) -> Result<(), ConfigError> {
    for (key, section) in ports {
        let id = parse_num("ports key", key)? as usize;
        let Some(port) = st.ports.get_mut(id) else {
            warn!("port {id} out of range, skipping");
            continue;
        };
        if let Some(v) = opt_num("port.mlw", &section.mlw)? {
            port.mlw = v as u8;
        }
        if let Some(v) = opt_num("port.mls", &section.mls)? {
            port.mls = v as u8;
        }
        if let Some(v) = opt_num("port.state", &section.state)? {
            port.state = PortState::from_wire(v as u8).unwrap_or_default();
        }
        if let Some(device) = &section.device {
            port.device_name = Some(device.clone());
        }
    }

    // Instantiate referenced devices once every override is in place.
    let SwitchState {
        ports: st_ports,
        devices,
        dir,
        ..
    } = st;
    for port in st_ports.iter_mut() {
        let Some(name) = port.device_name.clone() else {
            continue;
        };
        match devices.iter().find(|d| d.name == name) {
            Some(dev) => {
                if let Err(e) = attach(port, dev, dir.as_deref()) {
                    warn!("attach of {name} to port {} failed: {e}", port.ppid);
                }
            }
            None => warn!("port {} references unknown device {name}", port.ppid),
        }
    }
    Ok(())
}

fn apply_vcss(
    vcss: &BTreeMap<String, VcsSection>,
    st: &mut SwitchState,
) -> Result<(), ConfigError> {
    for (key, section) in vcss {
        let id = parse_num("vcss key", key)? as usize;
        let Some(vcs) = st.vcss.get_mut(id) else {
            warn!("vcs {id} out of range, skipping");
            continue;
        };
        if let Some(v) = opt_num("vcs.state", &section.state)? {
            vcs.state = VcsState::from_wire(v as u8).unwrap_or_default();
        }
        if let Some(v) = opt_num("vcs.uspid", &section.uspid)? {
            vcs.uspid = v as u8;
        }
        if let Some(v) = opt_num("vcs.num_vppb", &section.num_vppb)? {
            // The wire carries the count as a u8, so 255 is the practical
            // ceiling even though the slot array holds MAX_VPPBS_PER_VCS.
            vcs.num = v.min(MAX_VPPBS_PER_VCS as u64 - 1) as u8;
        }
        for (bkey, bsec) in &section.vppbs {
            let bid = parse_num("vppbs key", bkey)? as usize;
            let Some(vppb) = vcs.vppbs.get_mut(bid) else {
                warn!("vppb {bid} out of range in vcs {id}, skipping");
                continue;
            };
            if let Some(v) = opt_num("vppb.bind_status", &bsec.bind_status)? {
                vppb.bind_status = BindStatus::from_wire(v as u8).unwrap_or_default();
            }
            if let Some(v) = opt_num("vppb.ppid", &bsec.ppid)? {
                vppb.ppid = v as u8;
            }
            if let Some(v) = opt_num("vppb.ldid", &bsec.ldid)? {
                vppb.ldid = v as u16;
            }
        }
    }
    Ok(())
}
