//! Device templates and the attach/detach engine.
//!
//! The catalog is immutable after load: connecting a device *copies* the
//! template onto the port (scalars, config space, MLD) so no port ever
//! aliases catalog state. Memory-backed MLDs get a per-port image file
//! mapped shared read/write; external processes see writes immediately.

use super::pcicfg::CfgSpace;
use super::{DeviceType, Granularity, Ltssm, Port, PortState, MAX_LD};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("device requests memory backing but no image directory is configured")]
    NoImageDir,

    #[error("backing file {path}: {source}")]
    Backing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Multi-logical-device state owned by a port (or, as a template, by a
/// catalog entry — templates never hold a mapping).
#[derive(Debug, Default)]
pub struct Mld {
    /// Total device memory in bytes.
    pub memory_size: u64,
    /// Logical device count, 1..=16.
    pub num: u16,
    pub epc: bool,
    pub ttr: bool,
    pub granularity: Granularity,
    /// Per-LD allocation range starts, in granularity units.
    pub rng1: [u64; MAX_LD],
    /// Per-LD allocation range ends (inclusive), in granularity units.
    pub rng2: [u64; MAX_LD],
    /// Allocated bandwidth fraction per LD, 0..=100.
    pub alloc_bw: [u8; MAX_LD],
    /// Bandwidth limit fraction per LD, 0..=100.
    pub bw_limit: [u8; MAX_LD],
    pub epc_en: bool,
    pub ttr_en: bool,
    pub egress_mod_pcnt: u8,
    pub egress_sev_pcnt: u8,
    pub sample_interval: u8,
    pub rcb: u16,
    pub comp_interval: u8,
    pub bp_avg_pcnt: u8,
    /// Whether attach should map a backing file for the payload memory.
    pub mmap: bool,
    /// Per-LD PCIe configuration spaces.
    pub cfgspace: Vec<Box<CfgSpace>>,
    /// Mapped payload memory, present only on attached ports.
    pub memspace: Option<MmapMut>,
    pub mempath: Option<PathBuf>,
}

impl Mld {
    /// Copy every field except the live mapping; used both for template
    /// deep-copies and attach.
    pub fn template_copy(&self) -> Mld {
        Mld {
            memory_size: self.memory_size,
            num: self.num,
            epc: self.epc,
            ttr: self.ttr,
            granularity: self.granularity,
            rng1: self.rng1,
            rng2: self.rng2,
            alloc_bw: self.alloc_bw,
            bw_limit: self.bw_limit,
            epc_en: self.epc_en,
            ttr_en: self.ttr_en,
            egress_mod_pcnt: self.egress_mod_pcnt,
            egress_sev_pcnt: self.egress_sev_pcnt,
            sample_interval: self.sample_interval,
            rcb: self.rcb,
            comp_interval: self.comp_interval,
            bp_avg_pcnt: self.bp_avg_pcnt,
            mmap: self.mmap,
            cfgspace: self.cfgspace.clone(),
            memspace: None,
            mempath: None,
        }
    }

    /// Byte window of one LD inside the payload memory: `(base, size)`.
    pub fn ld_window(&self, ldid: u16) -> (u64, u64) {
        let g = self.granularity.bytes();
        let base = g * self.rng1[ldid as usize];
        let max = g * (self.rng2[ldid as usize] + 1);
        (base, max - base)
    }
}

/// A named entry in the device catalog.
#[derive(Debug, Default)]
pub struct DeviceTemplate {
    pub did: u8,
    pub name: String,
    /// Upstream (root port) vs endpoint.
    pub rootport: bool,
    /// CXL version of the device.
    pub dv: u8,
    pub dt: DeviceType,
    /// CXL version bitmask.
    pub cv: u8,
    pub mlw: u8,
    pub mls: u8,
    pub cfgspace: Option<Box<CfgSpace>>,
    pub mld: Option<Box<Mld>>,
}

/// Attach `dev` onto `port`, copying the template and, for memory-backed
/// MLDs, creating and mapping `<dir>/portNN`.
///
/// All fallible work happens before the port is touched; an I/O failure
/// leaves the port exactly as it was and removes any file this call
/// created.
pub fn attach(port: &mut Port, dev: &DeviceTemplate, dir: Option<&Path>) -> Result<(), AttachError> {
    let mld = match &dev.mld {
        Some(template) => {
            let mut mld = template.template_copy();

            // One config space per LD, cloned from the device's.
            mld.cfgspace = (0..mld.num)
                .map(|_| {
                    dev.cfgspace
                        .clone()
                        .unwrap_or_else(|| Box::new(CfgSpace::default()))
                })
                .collect();

            if mld.mmap {
                let dir = dir.ok_or(AttachError::NoImageDir)?;
                let path = dir.join(format!("port{:02}", port.ppid));
                let map = map_backing(&path, mld.memory_size).map_err(|source| {
                    let _ = std::fs::remove_file(&path);
                    AttachError::Backing {
                        path: path.clone(),
                        source,
                    }
                })?;
                mld.memspace = Some(map);
                mld.mempath = Some(path);
            }
            Some(Box::new(mld))
        }
        None => None,
    };

    port.dv = dev.dv;
    port.dt = dev.dt;
    port.cv = dev.cv;
    port.state = if dev.rootport {
        PortState::Usp
    } else {
        PortState::Dsp
    };
    // Link negotiation; the shift keeps the wire encoding of the width.
    port.nlw = dev.mlw.min(port.mlw) << 4;
    port.cls = dev.mls.min(port.mls);
    port.prsnt = true;
    port.perst = false;
    port.ltssm = Ltssm::L0;
    port.lane = 0;
    port.cfgspace = dev.cfgspace.clone();
    port.ld = mld.as_ref().map_or(0, |m| m.num);
    port.mld = mld;
    port.device_name = Some(dev.name.clone());
    Ok(())
}

fn map_backing(path: &Path, size: u64) -> io::Result<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.set_len(size)?;
    // Shared mapping over a file this process just sized.
    unsafe { MmapMut::map_mut(&file) }
}

/// Detach whatever is connected to `port`: zero the device scalars, drop
/// the config space and the MLD. Dropping the MLD unmaps the backing
/// store; the image file itself persists on disk.
pub fn detach(port: &mut Port) {
    port.dv = 0;
    port.dt = DeviceType::None;
    port.cv = 0;
    port.nlw = 0;
    port.cls = 0;
    port.ltssm = Ltssm::Detect;
    port.lane = 0;
    port.lane_rev = false;
    port.perst = false;
    port.prsnt = false;
    port.pwrctrl = false;
    port.ld = 0;
    port.cfgspace = None;
    port.mld = None;
    port.device_name = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::pcicfg::CfgSpaceBuilder;

    fn sld_template() -> DeviceTemplate {
        let mut b = CfgSpaceBuilder::new();
        b.header_field("vendor", 0x1af4);
        b.header_field("device", 0x1234);
        DeviceTemplate {
            did: 0,
            name: "sld0".into(),
            dv: 2,
            dt: DeviceType::Type3,
            cv: 0x02,
            mlw: 8,
            mls: 4,
            cfgspace: Some(b.build().unwrap()),
            ..Default::default()
        }
    }

    fn mld_template(mmap: bool) -> DeviceTemplate {
        let mut t = sld_template();
        t.name = "mld0".into();
        t.dt = DeviceType::Type3Pooled;
        t.mld = Some(Box::new(Mld {
            memory_size: 1 << 20,
            num: 4,
            granularity: Granularity::Mb256,
            rng1: {
                let mut r = [0u64; MAX_LD];
                for (i, v) in r.iter_mut().enumerate().take(4) {
                    *v = i as u64;
                }
                r
            },
            rng2: {
                let mut r = [0u64; MAX_LD];
                for (i, v) in r.iter_mut().enumerate().take(4) {
                    *v = i as u64;
                }
                r
            },
            mmap,
            ..Default::default()
        }));
        t
    }

    #[test]
    fn attach_copies_scalars_and_negotiates_link() {
        let mut port = Port::new(3, 16, 5, 0x3F);
        attach(&mut port, &sld_template(), None).unwrap();
        assert_eq!(port.dt, DeviceType::Type3);
        assert_eq!(port.state, PortState::Dsp);
        assert_eq!(port.nlw, 8 << 4);
        assert_eq!(port.cls, 4);
        assert!(port.prsnt);
        assert!(!port.perst);
        assert_eq!(port.ltssm, Ltssm::L0);
        assert_eq!(port.cfgspace.as_ref().unwrap().read_u16(0x00), 0x1af4);
        assert_eq!(port.ld, 0);
        assert!(port.mld.is_none());
    }

    #[test]
    fn attach_rootport_sets_upstream() {
        let mut t = sld_template();
        t.rootport = true;
        let mut port = Port::new(0, 16, 5, 0x3F);
        attach(&mut port, &t, None).unwrap();
        assert_eq!(port.state, PortState::Usp);
    }

    #[test]
    fn attach_mld_deep_copies_and_maps() {
        let dir = tempfile::tempdir().unwrap();
        let mut port = Port::new(7, 16, 5, 0x3F);
        attach(&mut port, &mld_template(true), Some(dir.path())).unwrap();

        assert_eq!(port.ld, 4);
        let mld = port.mld.as_ref().unwrap();
        assert_eq!(mld.cfgspace.len(), 4);
        assert_eq!(mld.cfgspace[2].read_u16(0x00), 0x1af4);
        let path = mld.mempath.as_ref().unwrap();
        assert_eq!(path.file_name().unwrap(), "port07");
        assert_eq!(std::fs::metadata(path).unwrap().len(), 1 << 20);
        assert!(mld.memspace.is_some());
    }

    #[test]
    fn attach_without_dir_fails_cleanly() {
        let mut port = Port::new(1, 16, 5, 0x3F);
        let err = attach(&mut port, &mld_template(true), None).unwrap_err();
        assert!(matches!(err, AttachError::NoImageDir));
        // Rollback: the port must be untouched.
        assert!(!port.prsnt);
        assert!(port.mld.is_none());
        assert_eq!(port.dt, DeviceType::None);
    }

    #[test]
    fn detach_clears_device_state_but_keeps_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut port = Port::new(7, 16, 5, 0x3F);
        attach(&mut port, &mld_template(true), Some(dir.path())).unwrap();
        let path = port.mld.as_ref().unwrap().mempath.clone().unwrap();

        detach(&mut port);
        assert!(!port.prsnt);
        assert_eq!(port.ld, 0);
        assert!(port.mld.is_none());
        assert!(port.cfgspace.is_none());
        assert!(port.device_name.is_none());
        // The image file persists after detach.
        assert!(path.exists());
    }

    #[test]
    fn ld_window_uses_granularity_units() {
        let t = mld_template(false);
        let mld = t.mld.as_ref().unwrap();
        let (base, size) = mld.ld_window(2);
        assert_eq!(base, 2 * (256 << 20));
        assert_eq!(size, 256 << 20);
    }
}
