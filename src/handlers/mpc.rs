//! MLD Port command set: per-LD config access, LD memory access, and the
//! management-command tunnel into the MLD component behind a port.

use super::{mcc, CmdOutcome};
use crate::backend::{masked_read, masked_write};
use crate::fmapi::payload::CfgOp;
use crate::fmapi::{FmHdr, FmRequest, FmResponse, MsgCategory, ReturnCode, HDR_LEN};
use crate::fmapi::opcode;
use crate::mctp::MT_CXL_CCI;
use crate::state::{Port, SwitchState};
use log::{debug, info, warn};

/// Maximum single LD memory transfer.
const MEM_MAX_LEN: u16 = 4096;

/// Scratch size for encoding tunneled responses.
const INNER_BUF: usize = 8192;

/// LD CXL.io Config (5301h): masked access to one LD's config space.
/// Requires a Type-3 port and a valid LD id.
pub fn config(st: &mut SwitchState, req: &FmRequest) -> CmdOutcome {
    let FmRequest::MpcConfig(c) = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!(
        "CMD: MPC LD CXL.io Config: ppid {} ldid {} reg {:#05x} {:?}",
        c.ppid,
        c.ldid,
        c.reg_offset(),
        c.op
    );
    let Some(port) = st.ports.get_mut(c.ppid as usize) else {
        warn!("ERR: ppid {} out of range", c.ppid);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if !port.dt.is_type3() {
        warn!("ERR: ppid {} is not a Type 3 device", c.ppid);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    if c.ldid >= port.ld {
        warn!("ERR: ldid {} exceeds LD count {} on ppid {}", c.ldid, port.ld, c.ppid);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    let Some(mld) = port.mld.as_deref_mut() else {
        warn!("ERR: ppid {} has no MLD", c.ppid);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    let space = &mut mld.cfgspace[c.ldid as usize];
    let data = match c.op {
        CfgOp::Read => masked_read(space, c.reg_offset(), c.fdbe),
        CfgOp::Write => {
            masked_write(space, c.reg_offset(), c.fdbe, c.data);
            [0u8; 4]
        }
    };
    CmdOutcome::ok(FmResponse::Config { data })
}

/// LD CXL.io Memory (5302h): reads and writes one LD's window of the
/// memory-mapped backing store.
pub fn memory(st: &mut SwitchState, req: &FmRequest) -> CmdOutcome {
    let FmRequest::MpcMem(m) = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!(
        "CMD: MPC LD CXL.io Mem: ppid {} ldid {} offset {:#x} len {} {:?}",
        m.ppid, m.ldid, m.offset, m.len, m.op
    );
    let Some(port) = st.ports.get_mut(m.ppid as usize) else {
        warn!("ERR: ppid {} out of range", m.ppid);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if !port.dt.is_type3() {
        warn!("ERR: ppid {} is not a Type 3 device", m.ppid);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    if m.ldid >= port.ld {
        warn!("ERR: ldid {} exceeds LD count {} on ppid {}", m.ldid, port.ld, m.ppid);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    let Some(mld) = port.mld.as_deref_mut() else {
        warn!("ERR: ppid {} has no MLD", m.ppid);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if mld.memspace.is_none() {
        warn!("ERR: ppid {} has no mapped memory space", m.ppid);
        return CmdOutcome::err(ReturnCode::Unsupported);
    }
    if m.len > MEM_MAX_LEN {
        warn!("ERR: length {} exceeds maximum {MEM_MAX_LEN}", m.len);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    let (base, ld_size) = mld.ld_window(m.ldid);
    // The bound is exclusive of the final byte: offset + len == ld_size is
    // rejected.
    let end = m.offset.checked_add(m.len as u64).unwrap_or(u64::MAX);
    if end >= ld_size {
        warn!(
            "ERR: offset {:#x} + len {} exceeds LD size {:#x}",
            m.offset, m.len, ld_size
        );
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }

    let span = (base + m.offset) as usize..(base + m.offset + m.len as u64) as usize;
    let Some(mem) = mld.memspace.as_mut() else {
        return CmdOutcome::err(ReturnCode::Unsupported);
    };
    if span.end > mem.len() {
        warn!("ERR: LD window extends past the mapped backing store");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    match m.op {
        CfgOp::Read => {
            debug!("ACT: mem read ppid {} ldid {}", m.ppid, m.ldid);
            CmdOutcome::ok(FmResponse::MpcMem {
                data: mem[span].to_vec(),
            })
        }
        CfgOp::Write => {
            debug!("ACT: mem write ppid {} ldid {}", m.ppid, m.ldid);
            mem[span].copy_from_slice(&m.data);
            CmdOutcome::ok(FmResponse::MpcMem { data: Vec::new() })
        }
    }
}

/// Tunnel Management Command (5300h).
///
/// The outer envelope validates the tunneled MCTP type and the target
/// port; the inner FM API message is dispatched to the MLD component
/// command set. Inner failures become well-formed inner responses with a
/// non-success code — the outer response still reports success.
pub fn tunnel(st: &mut SwitchState, req: &FmRequest) -> CmdOutcome {
    let FmRequest::MpcTmc { ppid, mtype, msg } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!("CMD: MPC Tunnel Management Command: ppid {ppid}");
    if *mtype != MT_CXL_CCI {
        warn!("ERR: tunneled MCTP type {mtype:#04x} is not CXL CCI");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    let Some(port) = st.ports.get_mut(*ppid as usize) else {
        warn!("ERR: ppid {ppid} out of range");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if !port.dt.is_type3() {
        warn!("ERR: ppid {ppid} is not a Type 3 device");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }

    let inner = run_inner(port, msg);
    CmdOutcome::ok(FmResponse::MpcTmc {
        mtype: *mtype,
        msg: inner,
    })
}

/// Decode, dispatch, and re-encode one tunneled FM API message against the
/// MLD behind `port`. Always yields a complete inner response image.
fn run_inner(port: &mut Port, bytes: &[u8]) -> Vec<u8> {
    let mut buf = [0u8; INNER_BUF];

    let (hdr, consumed) = match FmHdr::decode(bytes) {
        Ok(v) => v,
        Err(e) => {
            warn!("ERR: tunneled header undecodable: {e}");
            return encode_inner(&mut buf, 0, 0, ReturnCode::InvalidInput, &FmResponse::Empty);
        }
    };
    if hdr.category != MsgCategory::Request {
        warn!("ERR: tunneled message is not a request");
        return encode_inner(
            &mut buf,
            hdr.tag,
            hdr.opcode,
            ReturnCode::InvalidInput,
            &FmResponse::Empty,
        );
    }
    let body = bytes
        .get(consumed..consumed + hdr.len as usize)
        .unwrap_or(&[]);
    let req = match FmRequest::decode(hdr.opcode, body) {
        Ok(r) => r,
        Err(e) => {
            warn!("ERR: tunneled payload undecodable for {:#06x}: {e}", hdr.opcode);
            return encode_inner(
                &mut buf,
                hdr.tag,
                hdr.opcode,
                ReturnCode::InvalidInput,
                &FmResponse::Empty,
            );
        }
    };

    let outcome = match hdr.opcode {
        opcode::MCC_INFO => mcc::info(port),
        opcode::MCC_ALLOC_GET => mcc::get_ld_alloc(port, &req),
        opcode::MCC_ALLOC_SET => mcc::set_ld_alloc(port, &req),
        opcode::MCC_QOS_CTRL_GET => mcc::get_qos_ctrl(port),
        opcode::MCC_QOS_CTRL_SET => mcc::set_qos_ctrl(port, &req),
        opcode::MCC_QOS_STAT => mcc::get_qos_stat(port),
        opcode::MCC_QOS_BW_ALLOC_GET => mcc::get_qos_bw_alloc(port, &req),
        opcode::MCC_QOS_BW_ALLOC_SET => mcc::set_qos_bw_alloc(port, &req),
        opcode::MCC_QOS_BW_LIMIT_GET => mcc::get_qos_bw_limit(port, &req),
        opcode::MCC_QOS_BW_LIMIT_SET => mcc::set_qos_bw_limit(port, &req),
        other => {
            warn!("ERR: tunneled opcode {other:#06x} unsupported");
            CmdOutcome::err(ReturnCode::Unsupported)
        }
    };

    encode_inner(&mut buf, hdr.tag, hdr.opcode, outcome.rc, &outcome.rsp)
}

fn encode_inner(
    buf: &mut [u8],
    tag: u8,
    op: u16,
    rc: ReturnCode,
    rsp: &FmResponse,
) -> Vec<u8> {
    let plen = rsp.encode(&mut buf[HDR_LEN..]).unwrap_or(0);
    let hdr = FmHdr::response(tag, op, rc, plen);
    // The scratch buffer always holds a header.
    let _ = hdr.encode(&mut buf[..HDR_LEN]);
    buf[..HDR_LEN + plen].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmapi::payload::{ConfigReq, MemReq};
    use crate::state::device::Mld;
    use crate::state::pcicfg::CfgSpace;
    use crate::state::{DeviceType, Granularity, SwitchState};

    /// A switch whose port 2 carries a 4-LD pooled device with 1 MiB of
    /// mapped memory per granularity slot scaled down via a tiny mapping.
    fn switch_with_mld(mmap: bool) -> SwitchState {
        let mut st = SwitchState::new(4, 1, 8).unwrap();
        let port = &mut st.ports[2];
        port.dt = DeviceType::Type3Pooled;
        port.ld = 4;
        let mut mld = Mld {
            memory_size: 4 * Granularity::Mb256.bytes(),
            num: 4,
            granularity: Granularity::Mb256,
            ..Default::default()
        };
        for i in 0..4 {
            mld.rng1[i] = i as u64;
            mld.rng2[i] = i as u64;
        }
        mld.cfgspace = (0..4).map(|_| Box::<CfgSpace>::default()).collect();
        if mmap {
            // In-memory stand-in large enough for the offsets the tests
            // touch; mapping-backed in production.
            let map = memmap2::MmapMut::map_anon(4096 * 4).unwrap();
            mld.memspace = Some(map);
            // Shrink the windows so they fit the anonymous mapping.
            mld.granularity = Granularity::Mb256;
        }
        port.mld = Some(Box::new(mld));
        st
    }

    #[test]
    fn config_requires_type3_and_valid_ld() {
        let mut st = switch_with_mld(false);
        let base = ConfigReq {
            ppid: 1,
            ldid: 0,
            reg: 0,
            ext: 0,
            fdbe: 0xF,
            op: CfgOp::Read,
            data: [0; 4],
        };
        // Port 1 has no device.
        let out = config(&mut st, &FmRequest::MpcConfig(base));
        assert_eq!(out.rc, ReturnCode::InvalidInput);
        // LD out of range.
        let out = config(&mut st, &FmRequest::MpcConfig(ConfigReq { ppid: 2, ldid: 9, ..base }));
        assert_eq!(out.rc, ReturnCode::InvalidInput);
    }

    #[test]
    fn config_targets_the_selected_ld() {
        let mut st = switch_with_mld(false);
        let wr = ConfigReq {
            ppid: 2,
            ldid: 1,
            reg: 0x08,
            ext: 0,
            fdbe: 0x1,
            op: CfgOp::Write,
            data: [0x42, 0, 0, 0],
        };
        assert_eq!(config(&mut st, &FmRequest::MpcConfig(wr)).rc, ReturnCode::Success);
        let mld = st.ports[2].mld.as_ref().unwrap();
        assert_eq!(mld.cfgspace[1].as_bytes()[0x08], 0x42);
        assert_eq!(mld.cfgspace[0].as_bytes()[0x08], 0);
    }

    #[test]
    fn memory_without_mapping_is_unsupported() {
        let mut st = switch_with_mld(false);
        let out = memory(
            &mut st,
            &FmRequest::MpcMem(MemReq {
                ppid: 2,
                ldid: 0,
                op: CfgOp::Read,
                offset: 0,
                len: 16,
                data: Vec::new(),
            }),
        );
        assert_eq!(out.rc, ReturnCode::Unsupported);
    }

    #[test]
    fn memory_length_cap() {
        let mut st = switch_with_mld(true);
        let out = memory(
            &mut st,
            &FmRequest::MpcMem(MemReq {
                ppid: 2,
                ldid: 0,
                op: CfgOp::Read,
                offset: 0,
                len: 4097,
                data: Vec::new(),
            }),
        );
        assert_eq!(out.rc, ReturnCode::InvalidInput);
    }

    #[test]
    fn memory_write_then_read_round_trips() {
        let mut st = switch_with_mld(true);
        let wr = MemReq {
            ppid: 2,
            ldid: 0,
            op: CfgOp::Write,
            offset: 0x100,
            len: 4,
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        assert_eq!(memory(&mut st, &FmRequest::MpcMem(wr)).rc, ReturnCode::Success);
        let rd = MemReq {
            ppid: 2,
            ldid: 0,
            op: CfgOp::Read,
            offset: 0x100,
            len: 4,
            data: Vec::new(),
        };
        let out = memory(&mut st, &FmRequest::MpcMem(rd));
        assert_eq!(
            out.rsp,
            FmResponse::MpcMem {
                data: vec![0xDE, 0xAD, 0xBE, 0xEF]
            }
        );
    }

    #[test]
    fn memory_rejects_touching_final_byte() {
        let mut st = switch_with_mld(true);
        let ld_size = Granularity::Mb256.bytes();
        let out = memory(
            &mut st,
            &FmRequest::MpcMem(MemReq {
                ppid: 2,
                ldid: 0,
                op: CfgOp::Read,
                offset: ld_size - 4,
                len: 4,
                data: Vec::new(),
            }),
        );
        // offset + len == ld_size is rejected.
        assert_eq!(out.rc, ReturnCode::InvalidInput);
    }

    #[test]
    fn tunnel_validates_envelope() {
        let mut st = switch_with_mld(false);
        // Wrong MCTP type.
        let out = tunnel(
            &mut st,
            &FmRequest::MpcTmc {
                ppid: 2,
                mtype: 0x7E,
                msg: vec![],
            },
        );
        assert_eq!(out.rc, ReturnCode::InvalidInput);
        // Non-Type-3 port.
        let out = tunnel(
            &mut st,
            &FmRequest::MpcTmc {
                ppid: 0,
                mtype: MT_CXL_CCI,
                msg: vec![],
            },
        );
        assert_eq!(out.rc, ReturnCode::InvalidInput);
    }

    #[test]
    fn tunnel_runs_mcc_info() {
        let mut st = switch_with_mld(false);
        let mut inner = vec![0u8; HDR_LEN];
        FmHdr::request(0x33, opcode::MCC_INFO, 0)
            .encode(&mut inner)
            .unwrap();
        let out = tunnel(
            &mut st,
            &FmRequest::MpcTmc {
                ppid: 2,
                mtype: MT_CXL_CCI,
                msg: inner,
            },
        );
        assert_eq!(out.rc, ReturnCode::Success);
        let FmResponse::MpcTmc { mtype, msg } = out.rsp else {
            panic!("wrong variant");
        };
        assert_eq!(mtype, MT_CXL_CCI);
        let (ihdr, used) = FmHdr::decode(&msg).unwrap();
        assert_eq!(ihdr.tag, 0x33);
        assert_eq!(ihdr.rc, ReturnCode::Success);
        let irsp = FmResponse::decode(ihdr.opcode, &msg[used..]).unwrap();
        assert_eq!(
            irsp,
            FmResponse::MccInfo {
                memory_size: 4 * Granularity::Mb256.bytes(),
                num: 4,
                epc: false,
                ttr: false,
            }
        );
    }

    #[test]
    fn tunnel_wraps_inner_errors() {
        let mut st = switch_with_mld(false);
        // Tunnel a *response*-category inner message.
        let mut inner = vec![0u8; HDR_LEN];
        FmHdr::response(0x01, opcode::MCC_INFO, ReturnCode::Success, 0)
            .encode(&mut inner)
            .unwrap();
        let out = tunnel(
            &mut st,
            &FmRequest::MpcTmc {
                ppid: 2,
                mtype: MT_CXL_CCI,
                msg: inner,
            },
        );
        // Outer envelope succeeds; inner response carries the error.
        assert_eq!(out.rc, ReturnCode::Success);
        let FmResponse::MpcTmc { msg, .. } = out.rsp else {
            panic!("wrong variant");
        };
        let (ihdr, _) = FmHdr::decode(&msg).unwrap();
        assert_eq!(ihdr.rc, ReturnCode::InvalidInput);
    }

    #[test]
    fn tunnel_unknown_inner_opcode_unsupported() {
        let mut st = switch_with_mld(false);
        let mut inner = vec![0u8; HDR_LEN];
        FmHdr::request(0x02, 0x5999, 0).encode(&mut inner).unwrap();
        let out = tunnel(
            &mut st,
            &FmRequest::MpcTmc {
                ppid: 2,
                mtype: MT_CXL_CCI,
                msg: inner,
            },
        );
        assert_eq!(out.rc, ReturnCode::Success);
        let FmResponse::MpcTmc { msg, .. } = out.rsp else {
            panic!("wrong variant");
        };
        let (ihdr, _) = FmHdr::decode(&msg).unwrap();
        assert_eq!(ihdr.rc, ReturnCode::Unsupported);
        assert_eq!(ihdr.opcode, 0x5999);
    }
}
