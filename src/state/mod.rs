//! In-memory model of the emulated switch.
//!
//! A [`Switch`] owns every mutable structure behind one mutex: the port
//! array, the VCS array with their vPPB slots, and the device catalog.
//! Handlers take the lock across their whole validate-act-respond window,
//! so a reader can never observe a half-applied bind.

pub mod device;
pub mod pcicfg;

pub use device::{DeviceTemplate, Mld};
pub use pcicfg::CfgSpace;

use crate::fmapi::payload::{PortStateBlk, SwitchIdentity};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const MAX_LD: usize = 16;
pub const MAX_PORTS: usize = 256;
pub const MAX_VCSS: usize = 256;
pub const MAX_VPPBS_PER_VCS: usize = 256;
pub const CFG_SPACE_SIZE: usize = 4096;

/// Default topology sizing when no configuration file is loaded.
pub const DEFAULT_PORTS: usize = 32;
pub const DEFAULT_VCSS: usize = 32;
pub const DEFAULT_VPPBS: u16 = 256;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("topology exceeds limits: {0}")]
    Sizing(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Port configuration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortState {
    #[default]
    Disabled,
    Binding,
    Unbinding,
    Dsp,
    Usp,
}

impl PortState {
    pub fn to_wire(self) -> u8 {
        match self {
            PortState::Disabled => 0,
            PortState::Binding => 1,
            PortState::Unbinding => 2,
            PortState::Dsp => 3,
            PortState::Usp => 4,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(PortState::Disabled),
            1 => Some(PortState::Binding),
            2 => Some(PortState::Unbinding),
            3 => Some(PortState::Dsp),
            4 => Some(PortState::Usp),
            _ => None,
        }
    }

    /// True for the states a bound port may legitimately be in.
    pub fn is_bound(self) -> bool {
        matches!(
            self,
            PortState::Binding | PortState::Unbinding | PortState::Dsp | PortState::Usp
        )
    }
}

/// Type of the device connected to a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    #[default]
    None,
    Type1,
    Type2,
    Type3,
    Type3Pooled,
}

impl DeviceType {
    pub fn to_wire(self) -> u8 {
        match self {
            DeviceType::None => 0,
            DeviceType::Type1 => 1,
            DeviceType::Type2 => 2,
            DeviceType::Type3 => 3,
            DeviceType::Type3Pooled => 4,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(DeviceType::None),
            1 => Some(DeviceType::Type1),
            2 => Some(DeviceType::Type2),
            3 => Some(DeviceType::Type3),
            4 => Some(DeviceType::Type3Pooled),
            _ => None,
        }
    }

    pub fn is_type3(self) -> bool {
        matches!(self, DeviceType::Type3 | DeviceType::Type3Pooled)
    }
}

/// PCIe link training state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ltssm {
    #[default]
    Detect,
    Polling,
    Configuration,
    Recovery,
    L0,
    L0s,
    L1,
    L2,
    Disabled,
    Loopback,
    HotReset,
}

impl Ltssm {
    pub fn to_wire(self) -> u8 {
        match self {
            Ltssm::Detect => 0,
            Ltssm::Polling => 1,
            Ltssm::Configuration => 2,
            Ltssm::Recovery => 3,
            Ltssm::L0 => 4,
            Ltssm::L0s => 5,
            Ltssm::L1 => 6,
            Ltssm::L2 => 7,
            Ltssm::Disabled => 8,
            Ltssm::Loopback => 9,
            Ltssm::HotReset => 10,
        }
    }
}

/// vPPB binding status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindStatus {
    #[default]
    Unbound,
    InProgress,
    BoundPort,
    BoundLd,
}

impl BindStatus {
    pub fn to_wire(self) -> u8 {
        match self {
            BindStatus::Unbound => 0,
            BindStatus::InProgress => 1,
            BindStatus::BoundPort => 2,
            BindStatus::BoundLd => 3,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(BindStatus::Unbound),
            1 => Some(BindStatus::InProgress),
            2 => Some(BindStatus::BoundPort),
            3 => Some(BindStatus::BoundLd),
            _ => None,
        }
    }
}

/// VCS state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VcsState {
    #[default]
    Disabled,
    Enabled,
}

impl VcsState {
    pub fn to_wire(self) -> u8 {
        match self {
            VcsState::Disabled => 0,
            VcsState::Enabled => 1,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(VcsState::Disabled),
            1 => Some(VcsState::Enabled),
            _ => None,
        }
    }
}

/// MLD allocation granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    #[default]
    Mb256,
    Mb512,
    Gb1,
}

impl Granularity {
    pub fn to_wire(self) -> u8 {
        match self {
            Granularity::Mb256 => 0,
            Granularity::Mb512 => 1,
            Granularity::Gb1 => 2,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Granularity::Mb256),
            1 => Some(Granularity::Mb512),
            2 => Some(Granularity::Gb1),
            _ => None,
        }
    }

    /// The granularity unit in bytes.
    pub fn bytes(self) -> u64 {
        match self {
            Granularity::Mb256 => 256 << 20,
            Granularity::Mb512 => 512 << 20,
            Granularity::Gb1 => 1 << 30,
        }
    }
}

/// Background operation status block (ISC BOS).
#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundOp {
    pub running: bool,
    pub pcnt: u8,
    pub opcode: u16,
    pub rc: u16,
    pub ext: u16,
}

/// A vPPB slot inside a VCS.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vppb {
    pub bind_status: BindStatus,
    pub ppid: u8,
    pub ldid: u16,
}

/// A virtual CXL switch.
#[derive(Debug, Clone, Default)]
pub struct Vcs {
    pub vcsid: u8,
    pub state: VcsState,
    /// Upstream physical port id.
    pub uspid: u8,
    /// Valid vPPB count.
    pub num: u8,
    pub vppbs: Vec<Vppb>,
}

impl Vcs {
    pub fn new(vcsid: u8) -> Self {
        Vcs {
            vcsid,
            state: VcsState::Disabled,
            uspid: 0,
            num: 0,
            vppbs: vec![Vppb::default(); MAX_VPPBS_PER_VCS],
        }
    }
}

/// A physical switch port.
#[derive(Debug, Default)]
pub struct Port {
    pub ppid: u8,
    pub state: PortState,
    /// CXL version of the connected device.
    pub dv: u8,
    pub dt: DeviceType,
    /// CXL version bitmask.
    pub cv: u8,
    /// Maximum link width.
    pub mlw: u8,
    /// Negotiated link width (wire encoding, `min << 4`).
    pub nlw: u8,
    /// Supported speeds bit vector.
    pub speeds: u8,
    /// Maximum link speed.
    pub mls: u8,
    /// Current (negotiated) link speed.
    pub cls: u8,
    pub ltssm: Ltssm,
    /// First lane index.
    pub lane: u8,
    pub lane_rev: bool,
    pub perst: bool,
    pub prsnt: bool,
    pub pwrctrl: bool,
    /// Count of additional supported logical devices; 0 for a non-MLD.
    pub ld: u16,
    /// Name of the connected device template, if any.
    pub device_name: Option<String>,
    pub cfgspace: Option<Box<CfgSpace>>,
    pub mld: Option<Box<Mld>>,
    /// PCI device address for the sysfs passthrough backend.
    pub pci_addr: Option<String>,
}

impl Port {
    /// A fresh port carrying the switch-wide link defaults.
    pub fn new(ppid: u8, mlw: u8, mls: u8, speeds: u8) -> Self {
        Port {
            ppid,
            state: PortState::Dsp,
            mlw,
            mls,
            speeds,
            ltssm: Ltssm::L0,
            ..Default::default()
        }
    }

    /// Snapshot for the Get Physical Port State response.
    pub fn to_state_blk(&self) -> PortStateBlk {
        PortStateBlk {
            ppid: self.ppid,
            state: self.state.to_wire(),
            dv: self.dv,
            dt: self.dt.to_wire(),
            cv: self.cv,
            mlw: self.mlw,
            nlw: self.nlw,
            speeds: self.speeds,
            mls: self.mls,
            cls: self.cls,
            ltssm: self.ltssm.to_wire(),
            lane: self.lane,
            lane_rev: self.lane_rev,
            perst: self.perst,
            prsnt: self.prsnt,
            pwrctrl: self.pwrctrl,
            ld: self.ld as u8,
        }
    }
}

/// Everything mutable about the switch, guarded by the [`Switch`] mutex.
#[derive(Debug, Default)]
pub struct SwitchState {
    pub version: u8,
    pub vid: u16,
    pub did: u16,
    pub svid: u16,
    pub ssid: u16,
    pub sn: u64,
    /// Max FM API message size as a power-of-two exponent.
    pub max_msg_size_n: u8,
    /// Response message limit as a power-of-two exponent.
    pub msg_rsp_limit_n: u8,
    pub bos: BackgroundOp,
    pub ingress_port: u8,
    pub num_vppbs: u16,
    pub num_decoders: u8,
    /// Port link defaults applied to fresh ports.
    pub mlw: u8,
    pub mls: u8,
    pub speeds: u8,
    /// Directory for memory-backed device images.
    pub dir: Option<PathBuf>,
    pub ports: Vec<Port>,
    pub vcss: Vec<Vcs>,
    pub devices: Vec<DeviceTemplate>,
}

impl SwitchState {
    /// Build a switch sized `num_ports` x `num_vcss` with default ports.
    pub fn new(num_ports: usize, num_vcss: usize, num_vppbs: u16) -> Result<Self, StateError> {
        if num_ports > MAX_PORTS || num_vcss > MAX_VCSS {
            return Err(StateError::Sizing(format!(
                "{num_ports} ports / {num_vcss} VCSs requested"
            )));
        }
        let mut st = SwitchState {
            max_msg_size_n: 10,
            msg_rsp_limit_n: 10,
            num_vppbs,
            mlw: 16,
            mls: 5,
            speeds: 0x3F,
            ..Default::default()
        };
        for i in 0..num_ports {
            st.ports.push(Port::new(i as u8, st.mlw, st.mls, st.speeds));
        }
        for i in 0..num_vcss {
            st.vcss.push(Vcs::new(i as u8));
        }
        Ok(st)
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn num_vcss(&self) -> usize {
        self.vcss.len()
    }

    /// Identify Switch Device snapshot. The bitmaps and the active vPPB
    /// count are always computed from a live scan, never cached.
    pub fn identity(&self) -> SwitchIdentity {
        let mut active_ports = [0u8; 32];
        for p in &self.ports {
            if p.state != PortState::Disabled {
                active_ports[p.ppid as usize / 8] |= 1 << (p.ppid % 8);
            }
        }
        let mut active_vcss = [0u8; 32];
        let mut active_vppbs = 0u16;
        for v in &self.vcss {
            if v.state == VcsState::Enabled {
                active_vcss[v.vcsid as usize / 8] |= 1 << (v.vcsid % 8);
            }
            for b in v.vppbs.iter().take(v.num as usize) {
                if b.bind_status != BindStatus::Unbound {
                    active_vppbs += 1;
                }
            }
        }
        SwitchIdentity {
            ingress_port: self.ingress_port,
            num_ports: self.ports.len() as u8,
            num_vcss: self.vcss.len() as u8,
            active_ports,
            active_vcss,
            num_vppbs: self.num_vppbs,
            active_vppbs,
            num_decoders: self.num_decoders,
        }
    }

    /// Check the cross-object invariants. Called from tests after every
    /// mutating scenario.
    pub fn check_invariants(&self) -> Result<(), StateError> {
        let fail = |msg: String| Err(StateError::Invariant(msg));
        if self.ports.len() > MAX_PORTS || self.vcss.len() > MAX_VCSS {
            return fail("topology exceeds MAX_PORTS/MAX_VCSS".into());
        }
        for v in &self.vcss {
            if v.num as usize > MAX_VPPBS_PER_VCS {
                return fail(format!("vcs {} num exceeds limit", v.vcsid));
            }
            for (i, b) in v.vppbs.iter().take(v.num as usize).enumerate() {
                match b.bind_status {
                    BindStatus::BoundPort | BindStatus::BoundLd => {
                        let Some(p) = self.ports.get(b.ppid as usize) else {
                            return fail(format!("vcs {} vppb {i} bound to missing port", v.vcsid));
                        };
                        if p.state == PortState::Disabled {
                            return fail(format!("vcs {} vppb {i} bound to disabled port", v.vcsid));
                        }
                        if b.bind_status == BindStatus::BoundLd
                            && (p.ld == 0 || b.ldid >= p.ld)
                        {
                            return fail(format!("vcs {} vppb {i} ldid out of range", v.vcsid));
                        }
                    }
                    _ => {}
                }
            }
        }
        for p in &self.ports {
            if p.dt == DeviceType::Type3Pooled {
                match &p.mld {
                    Some(m) if m.num == p.ld => {}
                    _ => return fail(format!("port {} pooled without matching mld", p.ppid)),
                }
            }
            if let Some(m) = &p.mld {
                for i in 1..m.num as usize {
                    if m.rng1[i] < m.rng1[i - 1] || m.rng2[i] < m.rng2[i - 1] {
                        return fail(format!("port {} mld ranges not monotone", p.ppid));
                    }
                }
                for i in 0..m.num as usize {
                    if m.alloc_bw[i] > 100 || m.bw_limit[i] > 100 {
                        return fail(format!("port {} mld bandwidth out of range", p.ppid));
                    }
                }
            }
        }
        Ok(())
    }

    /// Pretty-print the loaded topology (the `--state` CLI flag).
    pub fn print(&self) {
        println!(
            "switch: vid {:#06x} did {:#06x} svid {:#06x} ssid {:#06x} sn {:#018x}",
            self.vid, self.did, self.svid, self.ssid, self.sn
        );
        println!(
            "        ports {} vcss {} vppbs {} decoders {}",
            self.ports.len(),
            self.vcss.len(),
            self.num_vppbs,
            self.num_decoders
        );
        for d in &self.devices {
            println!(
                "device {:3}: {:24} dt {:?} mld {}",
                d.did,
                d.name,
                d.dt,
                d.mld.as_ref().map_or(0, |m| m.num)
            );
        }
        for p in &self.ports {
            if p.prsnt || p.state != PortState::Dsp {
                println!(
                    "port {:3}: {:?} dt {:?} ld {} device {}",
                    p.ppid,
                    p.state,
                    p.dt,
                    p.ld,
                    p.device_name.as_deref().unwrap_or("-")
                );
                if let Some(space) = &p.cfgspace {
                    print_cfg_header(space);
                }
            }
        }
        for v in &self.vcss {
            if v.state == VcsState::Enabled {
                println!("vcs {:3}: uspid {} vppbs {}", v.vcsid, v.uspid, v.num);
                for (i, b) in v.vppbs.iter().take(v.num as usize).enumerate() {
                    println!(
                        "    vppb {:3}: {:?} ppid {} ldid {}",
                        i, b.bind_status, b.ppid, b.ldid
                    );
                }
            }
        }
    }
}

/// Dump the standard config header (first 64 bytes) of a port's space.
fn print_cfg_header(space: &CfgSpace) {
    for row in 0..4 {
        let off = row * 16;
        let bytes = &space.as_bytes()[off..off + 16];
        let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
        println!("    {:04x}: {}", off, hex.join(" "));
    }
}

/// The switch: one mutex over all mutable state.
///
/// The mutex is non-reentrant; handlers must not call back into a locking
/// path while holding the guard.
#[derive(Debug)]
pub struct Switch {
    state: Mutex<SwitchState>,
}

impl Switch {
    pub fn new(state: SwitchState) -> Self {
        Switch {
            state: Mutex::new(state),
        }
    }

    /// Acquire the switch lock. A poisoned mutex yields the inner state
    /// anyway: handler panics must not wedge the management plane.
    pub fn lock(&self) -> MutexGuard<'_, SwitchState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_topology_sizes() {
        let st = SwitchState::new(DEFAULT_PORTS, DEFAULT_VCSS, DEFAULT_VPPBS).unwrap();
        assert_eq!(st.num_ports(), 32);
        assert_eq!(st.num_vcss(), 32);
        assert_eq!(st.ports[5].state, PortState::Dsp);
        assert_eq!(st.ports[5].ltssm, Ltssm::L0);
        st.check_invariants().unwrap();
    }

    #[test]
    fn oversized_topology_rejected() {
        assert!(SwitchState::new(MAX_PORTS + 1, 1, 0).is_err());
    }

    #[test]
    fn identity_scans_live_state() {
        let mut st = SwitchState::new(8, 2, 16).unwrap();
        st.ports[3].state = PortState::Disabled;
        st.vcss[1].state = VcsState::Enabled;
        st.vcss[1].num = 2;
        st.vcss[1].vppbs[0].bind_status = BindStatus::BoundPort;

        let id = st.identity();
        assert_eq!(id.active_ports[0], 0b1111_0111);
        assert_eq!(id.active_vcss[0], 0b0000_0010);
        assert_eq!(id.active_vppbs, 1);
        assert_eq!(id.num_ports, 8);

        // A later unbind must be reflected on the next scan.
        st.vcss[1].vppbs[0].bind_status = BindStatus::Unbound;
        assert_eq!(st.identity().active_vppbs, 0);
    }

    #[test]
    fn invariant_catches_dangling_bind() {
        let mut st = SwitchState::new(4, 1, 4).unwrap();
        st.vcss[0].num = 1;
        st.vcss[0].vppbs[0] = Vppb {
            bind_status: BindStatus::BoundPort,
            ppid: 99,
            ldid: 0,
        };
        assert!(st.check_invariants().is_err());
    }

    #[test]
    fn granularity_bytes() {
        assert_eq!(Granularity::Mb256.bytes(), 268_435_456);
        assert_eq!(Granularity::Mb512.bytes(), 536_870_912);
        assert_eq!(Granularity::Gb1.bytes(), 1_073_741_824);
    }

    #[test]
    fn wire_enums_round_trip() {
        for v in 0..=4u8 {
            assert_eq!(PortState::from_wire(v).unwrap().to_wire(), v);
            assert_eq!(DeviceType::from_wire(v).unwrap().to_wire(), v);
        }
        for v in 0..=3u8 {
            assert_eq!(BindStatus::from_wire(v).unwrap().to_wire(), v);
        }
        for v in 0..=2u8 {
            assert_eq!(Granularity::from_wire(v).unwrap().to_wire(), v);
        }
    }
}
