//! PCIe configuration-space buffers and the builder that assembles them
//! from configuration input.
//!
//! Capability chains are collected as scratch lists of (id, payload) pairs
//! and emitted as the final linked structure in one pass; parse state never
//! lives inside the buffer being built.

use super::CFG_SPACE_SIZE;
use thiserror::Error;

// Standard configuration header offsets.
const OFF_VENDOR: usize = 0x00;
const OFF_DEVICE: usize = 0x02;
const OFF_COMMAND: usize = 0x04;
const OFF_STATUS: usize = 0x06;
const OFF_REVISION: usize = 0x08;
const OFF_PROG_IF: usize = 0x09;
const OFF_SUBCLASS: usize = 0x0A;
const OFF_BASECLASS: usize = 0x0B;
const OFF_CACHELINE: usize = 0x0C;
const OFF_HEADER_TYPE: usize = 0x0E;
const OFF_SUBVENDOR: usize = 0x2C;
const OFF_SUBSYSTEM: usize = 0x2E;
const OFF_CAP_PTR: usize = 0x34;
const OFF_INT_LINE: usize = 0x3C;
const OFF_INT_PIN: usize = 0x3D;
const OFF_MIN_GNT: usize = 0x3E;
const OFF_MAX_LAT: usize = 0x3F;

/// First standard capability lands right after the header.
const CAP_BASE: usize = 0x40;
/// Extended capabilities start at the top of the legacy space.
const ECAP_BASE: usize = 0x100;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PciCfgError {
    #[error("capability chain overflows config space at offset {0:#x}")]
    CapOverflow(usize),

    #[error("extended capability chain overflows config space at offset {0:#x}")]
    EcapOverflow(usize),
}

/// A 4 KiB PCIe configuration space image.
#[derive(Clone)]
pub struct CfgSpace(pub [u8; CFG_SPACE_SIZE]);

impl Default for CfgSpace {
    fn default() -> Self {
        CfgSpace([0; CFG_SPACE_SIZE])
    }
}

impl std::fmt::Debug for CfgSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CfgSpace {{ vendor: {:#06x}, device: {:#06x} }}",
            self.read_u16(OFF_VENDOR),
            self.read_u16(OFF_DEVICE)
        )
    }
}

impl CfgSpace {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub fn read_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.0[off], self.0[off + 1]])
    }

    fn write_u16(&mut self, off: usize, v: u16) {
        self.0[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
}

/// Standard capability scratch entry.
struct Cap {
    id: u8,
    body: Vec<u8>,
}

/// Extended capability scratch entry.
struct Ecap {
    id: u16,
    ver: u8,
    body: Vec<u8>,
}

/// Assembles a [`CfgSpace`] from named header fields and capability lists.
#[derive(Default)]
pub struct CfgSpaceBuilder {
    space: CfgSpace,
    caps: Vec<Cap>,
    ecaps: Vec<Ecap>,
}

impl CfgSpaceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a standard-header field by its configuration key name. Unknown
    /// keys are ignored, matching the loader's tolerance for extra input.
    pub fn header_field(&mut self, key: &str, value: u64) {
        match key {
            "vendor" => self.space.write_u16(OFF_VENDOR, value as u16),
            "device" => self.space.write_u16(OFF_DEVICE, value as u16),
            "command" => self.space.write_u16(OFF_COMMAND, value as u16),
            "status" => self.space.write_u16(OFF_STATUS, value as u16),
            "revid" => self.space.0[OFF_REVISION] = value as u8,
            "pi" => self.space.0[OFF_PROG_IF] = value as u8,
            "subclass" => self.space.0[OFF_SUBCLASS] = value as u8,
            "baseclass" => self.space.0[OFF_BASECLASS] = value as u8,
            "cacheline" => self.space.0[OFF_CACHELINE] = value as u8,
            "type" => self.space.0[OFF_HEADER_TYPE] = value as u8,
            "subvendor" => self.space.write_u16(OFF_SUBVENDOR, value as u16),
            "subsystem" => self.space.write_u16(OFF_SUBSYSTEM, value as u16),
            "intline" => self.space.0[OFF_INT_LINE] = value as u8,
            "intpin" => self.space.0[OFF_INT_PIN] = value as u8,
            "mingnt" => self.space.0[OFF_MIN_GNT] = value as u8,
            "maxlat" => self.space.0[OFF_MAX_LAT] = value as u8,
            _ => {}
        }
    }

    /// Queue a standard capability (2-byte header + body).
    pub fn capability(&mut self, id: u8, body: Vec<u8>) {
        self.caps.push(Cap { id, body });
    }

    /// Queue an extended capability. `id` and `ver` pack into the 4-byte
    /// extended capability header.
    pub fn extended_capability(&mut self, id: u16, ver: u8, body: Vec<u8>) {
        self.ecaps.push(Ecap { id, ver, body });
    }

    /// Emit the final image: header fields, then the standard capability
    /// chain from 0x40, then the extended chain from 0x100.
    pub fn build(mut self) -> Result<Box<CfgSpace>, PciCfgError> {
        let mut off = CAP_BASE;
        for (i, cap) in self.caps.iter().enumerate() {
            let next_off = off + 2 + cap.body.len();
            if next_off > ECAP_BASE {
                return Err(PciCfgError::CapOverflow(off));
            }
            if i == 0 {
                self.space.0[OFF_CAP_PTR] = off as u8;
            }
            let last = i + 1 == self.caps.len();
            self.space.0[off] = cap.id;
            self.space.0[off + 1] = if last { 0 } else { next_off as u8 };
            self.space.0[off + 2..off + 2 + cap.body.len()].copy_from_slice(&cap.body);
            off = next_off;
        }

        let mut off = ECAP_BASE;
        for (i, ecap) in self.ecaps.iter().enumerate() {
            let next_off = off + 4 + ecap.body.len();
            if next_off > CFG_SPACE_SIZE {
                return Err(PciCfgError::EcapOverflow(off));
            }
            let last = i + 1 == self.ecaps.len();
            let next = if last { 0 } else { next_off as u32 };
            let dword =
                ecap.id as u32 | ((ecap.ver as u32 & 0xF) << 16) | ((next & 0xFFF) << 20);
            self.space.0[off..off + 4].copy_from_slice(&dword.to_le_bytes());
            self.space.0[off + 4..off + 4 + ecap.body.len()].copy_from_slice(&ecap.body);
            off = next_off;
        }

        Ok(Box::new(self.space))
    }
}
