//! Config-space access backends.
//!
//! The PSC config and port-control opcodes have two legitimate targets: the
//! emulated per-port buffers, or — in QEMU passthrough mode — the real PCI
//! device behind the port. Both live behind [`ConfigBackend`]; the
//! dispatcher selects one at startup based on the run mode.

use crate::fmapi::payload::PortCtrlOp;
use crate::state::pcicfg::CfgSpace;
use crate::state::{Port, CFG_SPACE_SIZE};
use log::debug;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("register access rejected: {0}")]
    InvalidAccess(String),

    #[error("operation not supported on this port: {0}")]
    Unsupported(String),

    #[error("pci access: {0}")]
    Io(#[from] io::Error),
}

/// Where config reads/writes and port power controls land.
pub trait ConfigBackend: Send + Sync {
    /// Read four bytes at `reg`, zeroing bytes whose enable bit is clear.
    fn cfg_read(&self, port: &mut Port, reg: u16, fdbe: u8) -> Result<[u8; 4], BackendError>;

    /// Write the enabled bytes of `data` at `reg`.
    fn cfg_write(
        &self,
        port: &mut Port,
        reg: u16,
        fdbe: u8,
        data: [u8; 4],
    ) -> Result<(), BackendError>;

    /// Apply a Physical Port Control opcode.
    fn port_control(&self, port: &mut Port, op: PortCtrlOp) -> Result<(), BackendError>;
}

/// Pure-emulation backend: all accesses hit the port's owned buffer.
///
/// A port without a buffer gets one lazily; the management plane may probe
/// config space before any device is connected.
#[derive(Debug, Default)]
pub struct EmulatedBackend;

fn port_buffer(port: &mut Port) -> &mut CfgSpace {
    port.cfgspace.get_or_insert_with(Box::default)
}

/// Byte-enable masked read out of a 4 KiB buffer.
pub fn masked_read(space: &CfgSpace, reg: u16, fdbe: u8) -> [u8; 4] {
    let mut data = [0u8; 4];
    for (i, slot) in data.iter_mut().enumerate() {
        let off = reg as usize + i;
        if fdbe & (1 << i) != 0 && off < CFG_SPACE_SIZE {
            *slot = space.as_bytes()[off];
        }
    }
    data
}

/// Byte-enable masked write into a 4 KiB buffer.
pub fn masked_write(space: &mut CfgSpace, reg: u16, fdbe: u8, data: [u8; 4]) {
    for (i, byte) in data.iter().enumerate() {
        let off = reg as usize + i;
        if fdbe & (1 << i) != 0 && off < CFG_SPACE_SIZE {
            space.as_bytes_mut()[off] = *byte;
        }
    }
}

impl ConfigBackend for EmulatedBackend {
    fn cfg_read(&self, port: &mut Port, reg: u16, fdbe: u8) -> Result<[u8; 4], BackendError> {
        Ok(masked_read(port_buffer(port), reg, fdbe))
    }

    fn cfg_write(
        &self,
        port: &mut Port,
        reg: u16,
        fdbe: u8,
        data: [u8; 4],
    ) -> Result<(), BackendError> {
        masked_write(port_buffer(port), reg, fdbe, data);
        Ok(())
    }

    fn port_control(&self, port: &mut Port, op: PortCtrlOp) -> Result<(), BackendError> {
        match op {
            PortCtrlOp::AssertPerst => port.perst = true,
            PortCtrlOp::DeassertPerst => port.perst = false,
            // Reset is a no-op in the pure emulation.
            PortCtrlOp::ResetPpb => {}
        }
        Ok(())
    }
}

/// QEMU passthrough backend: config accesses go to the real device's
/// sysfs config file, and PERST control toggles the slot power node.
#[derive(Debug)]
pub struct SysfsBackend {
    devices_root: PathBuf,
    slots_root: PathBuf,
}

impl Default for SysfsBackend {
    fn default() -> Self {
        SysfsBackend {
            devices_root: PathBuf::from("/sys/bus/pci/devices"),
            slots_root: PathBuf::from("/sys/bus/pci/slots"),
        }
    }
}

impl SysfsBackend {
    /// Roots are parameters so tests can point them at a scratch tree.
    pub fn with_roots(devices_root: PathBuf, slots_root: PathBuf) -> Self {
        SysfsBackend {
            devices_root,
            slots_root,
        }
    }

    /// Map the byte enables onto an access width, with the PCI alignment
    /// rules: words need a 2-byte aligned register, dwords a 4-byte one.
    fn access_len(reg: u16, fdbe: u8) -> Result<usize, BackendError> {
        match fdbe {
            0x1 => Ok(1),
            0x3 if reg & 0x1 == 0 => Ok(2),
            0xF if reg & 0x3 == 0 => Ok(4),
            0x3 | 0xF => Err(BackendError::InvalidAccess(format!(
                "register {reg:#x} unaligned for byte enables {fdbe:#x}"
            ))),
            _ => Err(BackendError::InvalidAccess(format!(
                "byte enable pattern {fdbe:#x} unsupported in passthrough mode"
            ))),
        }
    }

    fn config_file(&self, port: &Port) -> Result<PathBuf, BackendError> {
        let addr = port.pci_addr.as_deref().ok_or_else(|| {
            BackendError::Unsupported(format!("port {} has no PCI device", port.ppid))
        })?;
        Ok(self.devices_root.join(addr).join("config"))
    }
}

impl ConfigBackend for SysfsBackend {
    fn cfg_read(&self, port: &mut Port, reg: u16, fdbe: u8) -> Result<[u8; 4], BackendError> {
        let len = Self::access_len(reg, fdbe)?;
        let path = self.config_file(port)?;
        let mut file = OpenOptions::new().read(true).open(&path)?;
        file.seek(SeekFrom::Start(reg as u64))?;
        let mut data = [0u8; 4];
        file.read_exact(&mut data[..len])?;
        debug!("pci read {path:?} reg {reg:#x} len {len}");
        Ok(data)
    }

    fn cfg_write(
        &self,
        port: &mut Port,
        reg: u16,
        fdbe: u8,
        data: [u8; 4],
    ) -> Result<(), BackendError> {
        let len = Self::access_len(reg, fdbe)?;
        let path = self.config_file(port)?;
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(reg as u64))?;
        file.write_all(&data[..len])?;
        debug!("pci write {path:?} reg {reg:#x} len {len}");
        Ok(())
    }

    fn port_control(&self, port: &mut Port, op: PortCtrlOp) -> Result<(), BackendError> {
        let power = |value: &str| -> Result<(), BackendError> {
            let path = self
                .slots_root
                .join(port.ppid.to_string())
                .join("power");
            std::fs::write(&path, value)?;
            debug!("slot power {path:?} <- {value}");
            Ok(())
        };
        match op {
            PortCtrlOp::AssertPerst => {
                power("0")?;
                port.perst = true;
            }
            PortCtrlOp::DeassertPerst => {
                power("1")?;
                port.perst = false;
            }
            PortCtrlOp::ResetPpb => {}
        }
        Ok(())
    }
}
