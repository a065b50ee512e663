//! FM API payload variants and their wire layouts.
//!
//! Request layouts decode with [`FmRequest::decode`] keyed by opcode;
//! response layouts with [`FmResponse::decode`]. Unknown opcodes fall back
//! to the raw-bytes variant, consumed only by the tunnel handler and the
//! unsupported responder. All fields are fixed-width little-endian.

use super::{opcode, CodecError, Reader, Writer};

/// Maximum VCS blocks in one Get Virtual CXL Switch Info response.
pub const MAX_VCS_PER_RSP: usize = 8;

/// Byte-enable patterns accepted by the config handlers (low 4 bits).
pub const FDBE_MASK: u8 = 0x0F;

/// Config-space access direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgOp {
    Read,
    Write,
}

impl CfgOp {
    pub fn to_wire(self) -> u8 {
        match self {
            CfgOp::Read => 0,
            CfgOp::Write => 1,
        }
    }

    pub fn from_wire(b: u8) -> Result<Self, CodecError> {
        match b {
            0 => Ok(CfgOp::Read),
            1 => Ok(CfgOp::Write),
            _ => Err(CodecError::BadField {
                field: "cfg op",
                value: b as u32,
            }),
        }
    }
}

/// Physical Port Control sub-opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCtrlOp {
    AssertPerst,
    DeassertPerst,
    ResetPpb,
}

impl PortCtrlOp {
    pub fn to_wire(self) -> u8 {
        match self {
            PortCtrlOp::AssertPerst => 0,
            PortCtrlOp::DeassertPerst => 1,
            PortCtrlOp::ResetPpb => 2,
        }
    }

    pub fn from_wire(b: u8) -> Result<Self, CodecError> {
        match b {
            0 => Ok(PortCtrlOp::AssertPerst),
            1 => Ok(PortCtrlOp::DeassertPerst),
            2 => Ok(PortCtrlOp::ResetPpb),
            _ => Err(CodecError::BadField {
                field: "port control opcode",
                value: b as u32,
            }),
        }
    }
}

/// PSC / MPC CXL.io config request body (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigReq {
    pub ppid: u8,
    /// Logical device id; meaningful for the MPC variant only.
    pub ldid: u16,
    pub reg: u8,
    pub ext: u8,
    /// First-dword byte enables, low 4 bits.
    pub fdbe: u8,
    pub op: CfgOp,
    pub data: [u8; 4],
}

impl ConfigReq {
    /// Full register offset `(ext << 8) | reg`.
    pub fn reg_offset(&self) -> u16 {
        ((self.ext as u16) << 8) | self.reg as u16
    }

    fn decode(r: &mut Reader) -> Result<Self, CodecError> {
        let ppid = r.u8()?;
        let ldid = r.u16()?;
        let reg = r.u8()?;
        let ext = r.u8()?;
        let fdbe = r.u8()? & FDBE_MASK;
        let op = CfgOp::from_wire(r.u8()?)?;
        let mut data = [0u8; 4];
        data.copy_from_slice(r.bytes(4)?);
        r.skip(1)?;
        Ok(ConfigReq {
            ppid,
            ldid,
            reg,
            ext,
            fdbe,
            op,
            data,
        })
    }

    fn encode(&self, w: &mut Writer) -> Result<(), CodecError> {
        w.u8(self.ppid)?;
        w.u16(self.ldid)?;
        w.u8(self.reg)?;
        w.u8(self.ext)?;
        w.u8(self.fdbe & FDBE_MASK)?;
        w.u8(self.op.to_wire())?;
        w.bytes(&self.data)?;
        w.zeros(1)
    }
}

/// MPC CXL.io memory request body (20 bytes + write data).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemReq {
    pub ppid: u8,
    pub ldid: u16,
    pub op: CfgOp,
    pub offset: u64,
    pub len: u16,
    /// Write payload; empty for reads.
    pub data: Vec<u8>,
}

impl MemReq {
    fn decode(r: &mut Reader) -> Result<Self, CodecError> {
        let ppid = r.u8()?;
        let ldid = r.u16()?;
        r.skip(1)?;
        let op = CfgOp::from_wire(r.u8()?)?;
        r.skip(3)?;
        let offset = r.u64()?;
        let len = r.u16()?;
        r.skip(2)?;
        let data = match op {
            CfgOp::Write => r.bytes(len as usize)?.to_vec(),
            CfgOp::Read => Vec::new(),
        };
        Ok(MemReq {
            ppid,
            ldid,
            op,
            offset,
            len,
            data,
        })
    }

    fn encode(&self, w: &mut Writer) -> Result<(), CodecError> {
        w.u8(self.ppid)?;
        w.u16(self.ldid)?;
        w.zeros(1)?;
        w.u8(self.op.to_wire())?;
        w.zeros(3)?;
        w.u64(self.offset)?;
        w.u16(self.len)?;
        w.zeros(2)?;
        if self.op == CfgOp::Write {
            w.bytes(&self.data)?;
        }
        Ok(())
    }
}

/// One LD allocation range pair, in granularity units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LdRange {
    pub rng1: u64,
    pub rng2: u64,
}

/// QoS control scalars (8 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QosControl {
    pub epc_en: u8,
    pub ttr_en: u8,
    pub egress_mod_pcnt: u8,
    pub egress_sev_pcnt: u8,
    pub sample_interval: u8,
    pub rcb: u16,
    pub comp_interval: u8,
}

impl QosControl {
    fn decode(r: &mut Reader) -> Result<Self, CodecError> {
        Ok(QosControl {
            epc_en: r.u8()?,
            ttr_en: r.u8()?,
            egress_mod_pcnt: r.u8()?,
            egress_sev_pcnt: r.u8()?,
            sample_interval: r.u8()?,
            rcb: r.u16()?,
            comp_interval: r.u8()?,
        })
    }

    fn encode(&self, w: &mut Writer) -> Result<(), CodecError> {
        w.u8(self.epc_en)?;
        w.u8(self.ttr_en)?;
        w.u8(self.egress_mod_pcnt)?;
        w.u8(self.egress_sev_pcnt)?;
        w.u8(self.sample_interval)?;
        w.u16(self.rcb)?;
        w.u8(self.comp_interval)
    }
}

/// Per-port block of the Get Physical Port State response (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStateBlk {
    pub ppid: u8,
    pub state: u8,
    pub dv: u8,
    pub dt: u8,
    pub cv: u8,
    pub mlw: u8,
    pub nlw: u8,
    pub speeds: u8,
    pub mls: u8,
    pub cls: u8,
    pub ltssm: u8,
    pub lane: u8,
    pub lane_rev: bool,
    pub perst: bool,
    pub prsnt: bool,
    pub pwrctrl: bool,
    pub ld: u8,
}

impl PortStateBlk {
    fn decode(r: &mut Reader) -> Result<Self, CodecError> {
        let mut b = PortStateBlk {
            ppid: r.u8()?,
            state: r.u8()?,
            dv: r.u8()?,
            dt: r.u8()?,
            cv: r.u8()?,
            mlw: r.u8()?,
            nlw: r.u8()?,
            speeds: r.u8()?,
            mls: r.u8()?,
            cls: r.u8()?,
            ltssm: r.u8()?,
            lane: r.u8()?,
            ..Default::default()
        };
        let flags = r.u8()?;
        b.lane_rev = flags & 0x01 != 0;
        b.perst = flags & 0x02 != 0;
        b.prsnt = flags & 0x04 != 0;
        b.pwrctrl = flags & 0x08 != 0;
        b.ld = r.u8()?;
        r.skip(2)?;
        Ok(b)
    }

    fn encode(&self, w: &mut Writer) -> Result<(), CodecError> {
        w.u8(self.ppid)?;
        w.u8(self.state)?;
        w.u8(self.dv)?;
        w.u8(self.dt)?;
        w.u8(self.cv)?;
        w.u8(self.mlw)?;
        w.u8(self.nlw)?;
        w.u8(self.speeds)?;
        w.u8(self.mls)?;
        w.u8(self.cls)?;
        w.u8(self.ltssm)?;
        w.u8(self.lane)?;
        let flags = (self.lane_rev as u8)
            | (self.perst as u8) << 1
            | (self.prsnt as u8) << 2
            | (self.pwrctrl as u8) << 3;
        w.u8(flags)?;
        w.u8(self.ld)?;
        w.zeros(2)
    }
}

/// Identify Switch Device response body (72 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchIdentity {
    pub ingress_port: u8,
    pub num_ports: u8,
    pub num_vcss: u8,
    pub active_ports: [u8; 32],
    pub active_vcss: [u8; 32],
    pub num_vppbs: u16,
    pub active_vppbs: u16,
    pub num_decoders: u8,
}

impl SwitchIdentity {
    fn decode(r: &mut Reader) -> Result<Self, CodecError> {
        let ingress_port = r.u8()?;
        let num_ports = r.u8()?;
        let num_vcss = r.u8()?;
        let mut active_ports = [0u8; 32];
        active_ports.copy_from_slice(r.bytes(32)?);
        let mut active_vcss = [0u8; 32];
        active_vcss.copy_from_slice(r.bytes(32)?);
        Ok(SwitchIdentity {
            ingress_port,
            num_ports,
            num_vcss,
            active_ports,
            active_vcss,
            num_vppbs: r.u16()?,
            active_vppbs: r.u16()?,
            num_decoders: r.u8()?,
        })
    }

    fn encode(&self, w: &mut Writer) -> Result<(), CodecError> {
        w.u8(self.ingress_port)?;
        w.u8(self.num_ports)?;
        w.u8(self.num_vcss)?;
        w.bytes(&self.active_ports)?;
        w.bytes(&self.active_vcss)?;
        w.u16(self.num_vppbs)?;
        w.u16(self.active_vppbs)?;
        w.u8(self.num_decoders)
    }
}

/// vPPB status entry inside a VCS info block (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VppbStatusBlk {
    pub status: u8,
    pub ppid: u8,
    pub ldid: u16,
}

/// One VCS block of the Get Virtual CXL Switch Info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsInfoBlk {
    pub vcsid: u8,
    pub state: u8,
    pub uspid: u8,
    /// Total vPPBs in the VCS.
    pub total: u8,
    /// The returned window of vPPB status entries.
    pub vppbs: Vec<VppbStatusBlk>,
}

impl VcsInfoBlk {
    fn decode(r: &mut Reader) -> Result<Self, CodecError> {
        let vcsid = r.u8()?;
        let state = r.u8()?;
        let uspid = r.u8()?;
        let total = r.u8()?;
        let num = r.u8()?;
        let mut vppbs = Vec::with_capacity(num as usize);
        for _ in 0..num {
            vppbs.push(VppbStatusBlk {
                status: r.u8()?,
                ppid: r.u8()?,
                ldid: r.u16()?,
            });
        }
        Ok(VcsInfoBlk {
            vcsid,
            state,
            uspid,
            total,
            vppbs,
        })
    }

    fn encode(&self, w: &mut Writer) -> Result<(), CodecError> {
        w.u8(self.vcsid)?;
        w.u8(self.state)?;
        w.u8(self.uspid)?;
        w.u8(self.total)?;
        w.u8(self.vppbs.len() as u8)?;
        for b in &self.vppbs {
            w.u8(b.status)?;
            w.u8(b.ppid)?;
            w.u16(b.ldid)?;
        }
        Ok(())
    }
}

/// FM API request payloads, one variant per opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FmRequest {
    IscIdentify,
    IscBos,
    IscMsgLimitGet,
    IscMsgLimitSet { limit: u8 },
    PscIdentify,
    PscPortState { ports: Vec<u8> },
    PscPortControl { ppid: u8, op: PortCtrlOp },
    PscConfig(ConfigReq),
    VscInfo { start: u8, limit: u8, vcss: Vec<u8> },
    VscBind { vcsid: u8, vppbid: u8, ppid: u8, ldid: u16 },
    VscUnbind { vcsid: u8, vppbid: u8, option: u8 },
    VscAer { vcsid: u8, vppbid: u8, error_type: u32, header: [u8; 32] },
    MpcTmc { ppid: u8, mtype: u8, msg: Vec<u8> },
    MpcConfig(ConfigReq),
    MpcMem(MemReq),
    MccInfo,
    MccAllocGet { start: u8, limit: u8 },
    MccAllocSet { start: u8, ranges: Vec<LdRange> },
    MccQosCtrlGet,
    MccQosCtrlSet(QosControl),
    MccQosStatus,
    MccQosBwAllocGet { start: u8, num: u8 },
    MccQosBwAllocSet { start: u8, list: Vec<u8> },
    MccQosBwLimitGet { start: u8, num: u8 },
    MccQosBwLimitSet { start: u8, list: Vec<u8> },
    /// Unknown opcode; body preserved verbatim.
    Raw(Vec<u8>),
}

impl FmRequest {
    /// Decode the request payload for `op` from `buf`.
    pub fn decode(op: u16, buf: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(buf);
        let req = match op {
            opcode::ISC_ID => FmRequest::IscIdentify,
            opcode::ISC_BOS => FmRequest::IscBos,
            opcode::ISC_MSG_LIMIT_GET => FmRequest::IscMsgLimitGet,
            opcode::ISC_MSG_LIMIT_SET => FmRequest::IscMsgLimitSet { limit: r.u8()? },
            opcode::PSC_ID => FmRequest::PscIdentify,
            opcode::PSC_PORT => {
                let num = r.u8()?;
                FmRequest::PscPortState {
                    ports: r.bytes(num as usize)?.to_vec(),
                }
            }
            opcode::PSC_PORT_CTRL => {
                let ppid = r.u8()?;
                let op = PortCtrlOp::from_wire(r.u8()?)?;
                r.skip(2)?;
                FmRequest::PscPortControl { ppid, op }
            }
            opcode::PSC_CFG => FmRequest::PscConfig(ConfigReq::decode(&mut r)?),
            opcode::VSC_INFO => {
                let start = r.u8()?;
                let limit = r.u8()?;
                let num = r.u8()?;
                FmRequest::VscInfo {
                    start,
                    limit,
                    vcss: r.bytes(num as usize)?.to_vec(),
                }
            }
            opcode::VSC_BIND => {
                let vcsid = r.u8()?;
                let vppbid = r.u8()?;
                let ppid = r.u8()?;
                r.skip(1)?;
                let ldid = r.u16()?;
                FmRequest::VscBind {
                    vcsid,
                    vppbid,
                    ppid,
                    ldid,
                }
            }
            opcode::VSC_UNBIND => {
                let vcsid = r.u8()?;
                let vppbid = r.u8()?;
                let option = r.u8()?;
                r.skip(1)?;
                FmRequest::VscUnbind {
                    vcsid,
                    vppbid,
                    option,
                }
            }
            opcode::VSC_AER => {
                let vcsid = r.u8()?;
                let vppbid = r.u8()?;
                r.skip(2)?;
                let error_type = r.u32()?;
                let mut header = [0u8; 32];
                header.copy_from_slice(r.bytes(32)?);
                FmRequest::VscAer {
                    vcsid,
                    vppbid,
                    error_type,
                    header,
                }
            }
            opcode::MPC_TMC => {
                let ppid = r.u8()?;
                let mtype = r.u8()?;
                let len = r.u16()?;
                FmRequest::MpcTmc {
                    ppid,
                    mtype,
                    msg: r.bytes(len as usize)?.to_vec(),
                }
            }
            opcode::MPC_CFG => FmRequest::MpcConfig(ConfigReq::decode(&mut r)?),
            opcode::MPC_MEM => FmRequest::MpcMem(MemReq::decode(&mut r)?),
            opcode::MCC_INFO => FmRequest::MccInfo,
            opcode::MCC_ALLOC_GET => {
                let start = r.u8()?;
                let limit = r.u8()?;
                r.skip(2)?;
                FmRequest::MccAllocGet { start, limit }
            }
            opcode::MCC_ALLOC_SET => {
                let num = r.u8()?;
                let start = r.u8()?;
                r.skip(2)?;
                let mut ranges = Vec::with_capacity(num as usize);
                for _ in 0..num {
                    ranges.push(LdRange {
                        rng1: r.u64()?,
                        rng2: r.u64()?,
                    });
                }
                FmRequest::MccAllocSet { start, ranges }
            }
            opcode::MCC_QOS_CTRL_GET => FmRequest::MccQosCtrlGet,
            opcode::MCC_QOS_CTRL_SET => FmRequest::MccQosCtrlSet(QosControl::decode(&mut r)?),
            opcode::MCC_QOS_STAT => FmRequest::MccQosStatus,
            opcode::MCC_QOS_BW_ALLOC_GET => {
                let start = r.u8()?;
                let num = r.u8()?;
                FmRequest::MccQosBwAllocGet { start, num }
            }
            opcode::MCC_QOS_BW_ALLOC_SET => {
                let start = r.u8()?;
                let num = r.u8()?;
                FmRequest::MccQosBwAllocSet {
                    start,
                    list: r.bytes(num as usize)?.to_vec(),
                }
            }
            opcode::MCC_QOS_BW_LIMIT_GET => {
                let start = r.u8()?;
                let num = r.u8()?;
                FmRequest::MccQosBwLimitGet { start, num }
            }
            opcode::MCC_QOS_BW_LIMIT_SET => {
                let start = r.u8()?;
                let num = r.u8()?;
                FmRequest::MccQosBwLimitSet {
                    start,
                    list: r.bytes(num as usize)?.to_vec(),
                }
            }
            _ => FmRequest::Raw(buf.to_vec()),
        };
        Ok(req)
    }

    /// Encode the request payload into `out`, returning the written length.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        let mut w = Writer::new(out);
        match self {
            FmRequest::IscIdentify
            | FmRequest::IscBos
            | FmRequest::IscMsgLimitGet
            | FmRequest::PscIdentify
            | FmRequest::MccInfo
            | FmRequest::MccQosCtrlGet
            | FmRequest::MccQosStatus => {}
            FmRequest::IscMsgLimitSet { limit } => w.u8(*limit)?,
            FmRequest::PscPortState { ports } => {
                w.u8(ports.len() as u8)?;
                w.bytes(ports)?;
            }
            FmRequest::PscPortControl { ppid, op } => {
                w.u8(*ppid)?;
                w.u8(op.to_wire())?;
                w.zeros(2)?;
            }
            FmRequest::PscConfig(c) | FmRequest::MpcConfig(c) => c.encode(&mut w)?,
            FmRequest::VscInfo { start, limit, vcss } => {
                w.u8(*start)?;
                w.u8(*limit)?;
                w.u8(vcss.len() as u8)?;
                w.bytes(vcss)?;
            }
            FmRequest::VscBind {
                vcsid,
                vppbid,
                ppid,
                ldid,
            } => {
                w.u8(*vcsid)?;
                w.u8(*vppbid)?;
                w.u8(*ppid)?;
                w.zeros(1)?;
                w.u16(*ldid)?;
            }
            FmRequest::VscUnbind {
                vcsid,
                vppbid,
                option,
            } => {
                w.u8(*vcsid)?;
                w.u8(*vppbid)?;
                w.u8(*option)?;
                w.zeros(1)?;
            }
            FmRequest::VscAer {
                vcsid,
                vppbid,
                error_type,
                header,
            } => {
                w.u8(*vcsid)?;
                w.u8(*vppbid)?;
                w.zeros(2)?;
                w.u32(*error_type)?;
                w.bytes(header)?;
            }
            FmRequest::MpcTmc { ppid, mtype, msg } => {
                w.u8(*ppid)?;
                w.u8(*mtype)?;
                w.u16(msg.len() as u16)?;
                w.bytes(msg)?;
            }
            FmRequest::MpcMem(m) => m.encode(&mut w)?,
            FmRequest::MccAllocGet { start, limit } => {
                w.u8(*start)?;
                w.u8(*limit)?;
                w.zeros(2)?;
            }
            FmRequest::MccAllocSet { start, ranges } => {
                w.u8(ranges.len() as u8)?;
                w.u8(*start)?;
                w.zeros(2)?;
                for rng in ranges {
                    w.u64(rng.rng1)?;
                    w.u64(rng.rng2)?;
                }
            }
            FmRequest::MccQosCtrlSet(q) => q.encode(&mut w)?,
            FmRequest::MccQosBwAllocGet { start, num }
            | FmRequest::MccQosBwLimitGet { start, num } => {
                w.u8(*start)?;
                w.u8(*num)?;
            }
            FmRequest::MccQosBwAllocSet { start, list }
            | FmRequest::MccQosBwLimitSet { start, list } => {
                w.u8(*start)?;
                w.u8(list.len() as u8)?;
                w.bytes(list)?;
            }
            FmRequest::Raw(bytes) => w.bytes(bytes)?,
        }
        Ok(w.written())
    }
}

/// FM API response payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FmResponse {
    /// Zero-length response body (bind, unbind, AER, port control, ...).
    Empty,
    IscIdentify {
        vid: u16,
        did: u16,
        svid: u16,
        ssid: u16,
        sn: u64,
        size: u8,
    },
    IscBos {
        running: bool,
        pcnt: u8,
        opcode: u16,
        rc: u16,
        ext: u16,
    },
    IscMsgLimit {
        limit: u8,
    },
    PscIdentify(SwitchIdentity),
    PscPortState {
        ports: Vec<PortStateBlk>,
    },
    Config {
        data: [u8; 4],
    },
    VscInfo {
        blocks: Vec<VcsInfoBlk>,
    },
    MpcTmc {
        mtype: u8,
        msg: Vec<u8>,
    },
    MpcMem {
        data: Vec<u8>,
    },
    MccInfo {
        memory_size: u64,
        num: u16,
        epc: bool,
        ttr: bool,
    },
    MccAllocGet {
        total: u8,
        granularity: u8,
        start: u8,
        ranges: Vec<LdRange>,
    },
    MccAllocSet {
        start: u8,
        ranges: Vec<LdRange>,
    },
    MccQosCtrl(QosControl),
    MccQosStatus {
        bp_avg_pcnt: u8,
    },
    MccQosBw {
        start: u8,
        list: Vec<u8>,
    },
    Raw(Vec<u8>),
}

impl FmResponse {
    /// Decode the response payload for `op` from `buf`.
    pub fn decode(op: u16, buf: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(buf);
        let rsp = match op {
            opcode::ISC_ID => FmResponse::IscIdentify {
                vid: r.u16()?,
                did: r.u16()?,
                svid: r.u16()?,
                ssid: r.u16()?,
                sn: r.u64()?,
                size: r.u8()?,
            },
            opcode::ISC_BOS => FmResponse::IscBos {
                running: r.u8()? & 0x01 != 0,
                pcnt: r.u8()?,
                opcode: r.u16()?,
                rc: r.u16()?,
                ext: r.u16()?,
            },
            opcode::ISC_MSG_LIMIT_GET | opcode::ISC_MSG_LIMIT_SET => {
                FmResponse::IscMsgLimit { limit: r.u8()? }
            }
            opcode::PSC_ID => FmResponse::PscIdentify(SwitchIdentity::decode(&mut r)?),
            opcode::PSC_PORT => {
                let num = r.u8()?;
                let mut ports = Vec::with_capacity(num as usize);
                for _ in 0..num {
                    ports.push(PortStateBlk::decode(&mut r)?);
                }
                FmResponse::PscPortState { ports }
            }
            opcode::PSC_PORT_CTRL | opcode::VSC_BIND | opcode::VSC_UNBIND | opcode::VSC_AER => {
                FmResponse::Empty
            }
            opcode::PSC_CFG | opcode::MPC_CFG => {
                let mut data = [0u8; 4];
                data.copy_from_slice(r.bytes(4)?);
                FmResponse::Config { data }
            }
            opcode::VSC_INFO => {
                let num = r.u8()?;
                let mut blocks = Vec::with_capacity(num as usize);
                for _ in 0..num {
                    blocks.push(VcsInfoBlk::decode(&mut r)?);
                }
                FmResponse::VscInfo { blocks }
            }
            opcode::MPC_TMC => {
                let mtype = r.u8()?;
                r.skip(1)?;
                let len = r.u16()?;
                FmResponse::MpcTmc {
                    mtype,
                    msg: r.bytes(len as usize)?.to_vec(),
                }
            }
            opcode::MPC_MEM => {
                let len = r.u16()?;
                r.skip(2)?;
                FmResponse::MpcMem {
                    data: r.bytes(len as usize)?.to_vec(),
                }
            }
            opcode::MCC_INFO => FmResponse::MccInfo {
                memory_size: r.u64()?,
                num: r.u16()?,
                epc: r.u8()? != 0,
                ttr: r.u8()? != 0,
            },
            opcode::MCC_ALLOC_GET => {
                let total = r.u8()?;
                let granularity = r.u8()?;
                let start = r.u8()?;
                let num = r.u8()?;
                let mut ranges = Vec::with_capacity(num as usize);
                for _ in 0..num {
                    ranges.push(LdRange {
                        rng1: r.u64()?,
                        rng2: r.u64()?,
                    });
                }
                FmResponse::MccAllocGet {
                    total,
                    granularity,
                    start,
                    ranges,
                }
            }
            opcode::MCC_ALLOC_SET => {
                let num = r.u8()?;
                let start = r.u8()?;
                r.skip(2)?;
                let mut ranges = Vec::with_capacity(num as usize);
                for _ in 0..num {
                    ranges.push(LdRange {
                        rng1: r.u64()?,
                        rng2: r.u64()?,
                    });
                }
                FmResponse::MccAllocSet { start, ranges }
            }
            opcode::MCC_QOS_CTRL_GET | opcode::MCC_QOS_CTRL_SET => {
                FmResponse::MccQosCtrl(QosControl::decode(&mut r)?)
            }
            opcode::MCC_QOS_STAT => FmResponse::MccQosStatus {
                bp_avg_pcnt: r.u8()?,
            },
            opcode::MCC_QOS_BW_ALLOC_GET
            | opcode::MCC_QOS_BW_ALLOC_SET
            | opcode::MCC_QOS_BW_LIMIT_GET
            | opcode::MCC_QOS_BW_LIMIT_SET => {
                let start = r.u8()?;
                let num = r.u8()?;
                FmResponse::MccQosBw {
                    start,
                    list: r.bytes(num as usize)?.to_vec(),
                }
            }
            _ => FmResponse::Raw(buf.to_vec()),
        };
        Ok(rsp)
    }

    /// Encode the response payload into `out`, returning the written length.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        let mut w = Writer::new(out);
        match self {
            FmResponse::Empty => {}
            FmResponse::IscIdentify {
                vid,
                did,
                svid,
                ssid,
                sn,
                size,
            } => {
                w.u16(*vid)?;
                w.u16(*did)?;
                w.u16(*svid)?;
                w.u16(*ssid)?;
                w.u64(*sn)?;
                w.u8(*size)?;
            }
            FmResponse::IscBos {
                running,
                pcnt,
                opcode,
                rc,
                ext,
            } => {
                w.u8(*running as u8)?;
                w.u8(*pcnt)?;
                w.u16(*opcode)?;
                w.u16(*rc)?;
                w.u16(*ext)?;
            }
            FmResponse::IscMsgLimit { limit } => w.u8(*limit)?,
            FmResponse::PscIdentify(id) => id.encode(&mut w)?,
            FmResponse::PscPortState { ports } => {
                w.u8(ports.len() as u8)?;
                for p in ports {
                    p.encode(&mut w)?;
                }
            }
            FmResponse::Config { data } => w.bytes(data)?,
            FmResponse::VscInfo { blocks } => {
                w.u8(blocks.len() as u8)?;
                for b in blocks {
                    b.encode(&mut w)?;
                }
            }
            FmResponse::MpcTmc { mtype, msg } => {
                w.u8(*mtype)?;
                w.zeros(1)?;
                w.u16(msg.len() as u16)?;
                w.bytes(msg)?;
            }
            FmResponse::MpcMem { data } => {
                w.u16(data.len() as u16)?;
                w.zeros(2)?;
                w.bytes(data)?;
            }
            FmResponse::MccInfo {
                memory_size,
                num,
                epc,
                ttr,
            } => {
                w.u64(*memory_size)?;
                w.u16(*num)?;
                w.u8(*epc as u8)?;
                w.u8(*ttr as u8)?;
            }
            FmResponse::MccAllocGet {
                total,
                granularity,
                start,
                ranges,
            } => {
                w.u8(*total)?;
                w.u8(*granularity)?;
                w.u8(*start)?;
                w.u8(ranges.len() as u8)?;
                for rng in ranges {
                    w.u64(rng.rng1)?;
                    w.u64(rng.rng2)?;
                }
            }
            FmResponse::MccAllocSet { start, ranges } => {
                w.u8(ranges.len() as u8)?;
                w.u8(*start)?;
                w.zeros(2)?;
                for rng in ranges {
                    w.u64(rng.rng1)?;
                    w.u64(rng.rng2)?;
                }
            }
            FmResponse::MccQosCtrl(q) => q.encode(&mut w)?,
            FmResponse::MccQosStatus { bp_avg_pcnt } => w.u8(*bp_avg_pcnt)?,
            FmResponse::MccQosBw { start, list } => {
                w.u8(*start)?;
                w.u8(list.len() as u8)?;
                w.bytes(list)?;
            }
            FmResponse::Raw(bytes) => w.bytes(bytes)?,
        }
        Ok(w.written())
    }
}
