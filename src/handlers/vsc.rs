//! Virtual Switch command set: VCS info, vPPB bind/unbind, AER injection.

use super::CmdOutcome;
use crate::fmapi::payload::{VcsInfoBlk, VppbStatusBlk, MAX_VCS_PER_RSP};
use crate::fmapi::{FmRequest, FmResponse, ReturnCode};
use crate::state::{BindStatus, PortState, SwitchState};
use log::{debug, info, warn};

/// The sentinel LD id meaning "bind the whole port, not an LD".
pub const LDID_NONE: u16 = 0xFFFF;

/// Get Virtual CXL Switch Info (5200h). Unknown VCS ids are skipped; each
/// block carries the vPPB window `[start, start+limit)` clipped to the
/// VCS's valid count.
pub fn info(st: &SwitchState, req: &FmRequest) -> CmdOutcome {
    let FmRequest::VscInfo { start, limit, vcss } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!("CMD: VSC Get Virtual CXL Switch Info: {} ids", vcss.len());
    let mut blocks = Vec::new();
    for &id in vcss.iter().take(MAX_VCS_PER_RSP) {
        let Some(v) = st.vcss.get(id as usize) else {
            continue;
        };
        let stop = (*start as usize + *limit as usize).min(v.num as usize);
        let vppbs = v
            .vppbs
            .iter()
            .take(stop)
            .skip(*start as usize)
            .map(|b| VppbStatusBlk {
                status: b.bind_status.to_wire(),
                ppid: b.ppid,
                ldid: b.ldid,
            })
            .collect();
        blocks.push(VcsInfoBlk {
            vcsid: v.vcsid,
            state: v.state.to_wire(),
            uspid: v.uspid,
            total: v.num,
            vppbs,
        });
    }
    CmdOutcome::ok(FmResponse::VscInfo { blocks })
}

/// Bind vPPB (5201h).
///
/// Each precondition is checked independently; the effects set the vPPB
/// binding, force the port downstream, and record a completed background
/// operation while returning the background-op-started code — the bind is
/// synchronous but reports as a background operation.
pub fn bind(st: &mut SwitchState, op: u16, req: &FmRequest) -> CmdOutcome {
    let FmRequest::VscBind {
        vcsid,
        vppbid,
        ppid,
        ldid,
    } = req
    else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!("CMD: VSC Bind vPPB: vcs {vcsid} vppb {vppbid} ppid {ppid} ldid {ldid:#06x}");

    let Some(v) = st.vcss.get(*vcsid as usize) else {
        warn!("ERR: vcsid {vcsid} out of range");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if *vppbid >= v.num {
        warn!("ERR: vppbid {vppbid} out of range (vcs has {})", v.num);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    let Some(p) = st.ports.get(*ppid as usize) else {
        warn!("ERR: ppid {ppid} out of range");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if p.state == PortState::Disabled {
        warn!("ERR: ppid {ppid} is disabled");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    if *ldid != LDID_NONE && !p.dt.is_type3() {
        warn!("ERR: LD bind requested but ppid {ppid} is not a Type 3 device");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    if p.ld > 0 && *ldid == LDID_NONE {
        warn!("ERR: cannot bind the physical port of an MLD device");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    if *ldid != LDID_NONE && p.ld == 0 {
        warn!("ERR: ppid {ppid} does not support multiple logical devices");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    if *ldid != LDID_NONE && *ldid >= p.ld {
        warn!("ERR: ldid {ldid} exceeds LD count {} on ppid {ppid}", p.ld);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    let b = &st.vcss[*vcsid as usize].vppbs[*vppbid as usize];
    if b.bind_status != BindStatus::Unbound {
        warn!("ERR: vppb {vppbid} is not available, status {:?}", b.bind_status);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }

    debug!("ACT: binding vcs {vcsid} vppb {vppbid} to ppid {ppid} ldid {ldid:#06x}");
    let b = &mut st.vcss[*vcsid as usize].vppbs[*vppbid as usize];
    if *ldid != LDID_NONE {
        b.bind_status = BindStatus::BoundLd;
        b.ppid = *ppid;
        b.ldid = *ldid;
    } else {
        b.bind_status = BindStatus::BoundPort;
        b.ppid = *ppid;
        b.ldid = 0;
    }
    st.ports[*ppid as usize].state = PortState::Dsp;

    st.bos.running = false;
    st.bos.pcnt = 100;
    st.bos.opcode = op;
    st.bos.rc = ReturnCode::Success.to_wire();
    st.bos.ext = 0;

    CmdOutcome {
        rc: ReturnCode::BackgroundOpStarted,
        rsp: FmResponse::Empty,
    }
}

/// Unbind vPPB (5202h).
pub fn unbind(st: &mut SwitchState, op: u16, req: &FmRequest) -> CmdOutcome {
    let FmRequest::VscUnbind { vcsid, vppbid, .. } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!("CMD: VSC Unbind vPPB: vcs {vcsid} vppb {vppbid}");

    let Some(v) = st.vcss.get_mut(*vcsid as usize) else {
        warn!("ERR: vcsid {vcsid} out of range");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if *vppbid >= v.num {
        warn!("ERR: vppbid {vppbid} out of range (vcs has {})", v.num);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    let b = &mut v.vppbs[*vppbid as usize];
    if matches!(b.bind_status, BindStatus::Unbound | BindStatus::InProgress) {
        warn!("ERR: vppb {vppbid} was not bound");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    let Some(p) = st.ports.get(b.ppid as usize) else {
        warn!("ERR: bound ppid {} out of range", b.ppid);
        b.bind_status = BindStatus::Unbound;
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if !p.state.is_bound() {
        warn!("ERR: ppid {} not in a bound state ({:?})", b.ppid, p.state);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }

    debug!("ACT: unbinding vcs {vcsid} vppb {vppbid}");
    b.bind_status = BindStatus::Unbound;
    b.ppid = 0;
    b.ldid = 0;

    st.bos.running = false;
    st.bos.pcnt = 100;
    st.bos.opcode = op;
    st.bos.rc = ReturnCode::Success.to_wire();
    st.bos.ext = 0;

    CmdOutcome {
        rc: ReturnCode::BackgroundOpStarted,
        rsp: FmResponse::Empty,
    }
}

/// Generate AER (5203h): validates ids and logs the event; the emulation
/// keeps no AER state.
pub fn aer(st: &SwitchState, req: &FmRequest) -> CmdOutcome {
    let FmRequest::VscAer {
        vcsid,
        vppbid,
        error_type,
        ..
    } = req
    else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!("CMD: VSC Generate AER: vcs {vcsid} vppb {vppbid} error {error_type:#010x}");
    let Some(v) = st.vcss.get(*vcsid as usize) else {
        warn!("ERR: vcsid {vcsid} out of range");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if *vppbid >= v.num {
        warn!("ERR: vppbid {vppbid} out of range (vcs has {})", v.num);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    debug!("ACT: AER generated on vcs {vcsid} vppb {vppbid}");
    CmdOutcome::ok(FmResponse::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmapi::opcode;
    use crate::state::{DeviceType, VcsState};

    fn switch() -> SwitchState {
        let mut st = SwitchState::new(8, 2, 16).unwrap();
        for v in &mut st.vcss {
            v.state = VcsState::Enabled;
            v.num = 2;
        }
        st
    }

    fn bind_req(vcsid: u8, vppbid: u8, ppid: u8, ldid: u16) -> FmRequest {
        FmRequest::VscBind {
            vcsid,
            vppbid,
            ppid,
            ldid,
        }
    }

    #[test]
    fn bind_rejects_out_of_range_vcs() {
        let mut st = switch();
        let out = bind(&mut st, opcode::VSC_BIND, &bind_req(5, 0, 3, LDID_NONE));
        assert_eq!(out.rc, ReturnCode::InvalidInput);
        assert_eq!(st.vcss[0].vppbs[0].bind_status, BindStatus::Unbound);
        st.check_invariants().unwrap();
    }

    #[test]
    fn bind_rejects_disabled_port() {
        let mut st = switch();
        st.ports[3].state = PortState::Disabled;
        let out = bind(&mut st, opcode::VSC_BIND, &bind_req(0, 0, 3, LDID_NONE));
        assert_eq!(out.rc, ReturnCode::InvalidInput);
    }

    #[test]
    fn bind_rejects_ld_on_non_type3() {
        let mut st = switch();
        let out = bind(&mut st, opcode::VSC_BIND, &bind_req(0, 0, 3, 0));
        assert_eq!(out.rc, ReturnCode::InvalidInput);
    }

    #[test]
    fn bind_rejects_whole_mld_port() {
        let mut st = switch();
        st.ports[3].dt = DeviceType::Type3Pooled;
        st.ports[3].ld = 4;
        let out = bind(&mut st, opcode::VSC_BIND, &bind_req(0, 0, 3, LDID_NONE));
        assert_eq!(out.rc, ReturnCode::InvalidInput);
    }

    #[test]
    fn bind_rejects_ld_beyond_count() {
        let mut st = switch();
        st.ports[3].dt = DeviceType::Type3Pooled;
        st.ports[3].ld = 4;
        let out = bind(&mut st, opcode::VSC_BIND, &bind_req(0, 0, 3, 9));
        assert_eq!(out.rc, ReturnCode::InvalidInput);
        st.check_invariants().unwrap();
    }

    #[test]
    fn bind_rejects_ld_on_sld() {
        let mut st = switch();
        st.ports[3].dt = DeviceType::Type3;
        let out = bind(&mut st, opcode::VSC_BIND, &bind_req(0, 0, 3, 1));
        assert_eq!(out.rc, ReturnCode::InvalidInput);
    }

    #[test]
    fn bind_rejects_already_bound_vppb() {
        let mut st = switch();
        let out = bind(&mut st, opcode::VSC_BIND, &bind_req(0, 0, 3, LDID_NONE));
        assert_eq!(out.rc, ReturnCode::BackgroundOpStarted);
        let out = bind(&mut st, opcode::VSC_BIND, &bind_req(0, 0, 4, LDID_NONE));
        assert_eq!(out.rc, ReturnCode::InvalidInput);
    }

    #[test]
    fn bind_port_sets_state_and_bos() {
        let mut st = switch();
        let out = bind(&mut st, opcode::VSC_BIND, &bind_req(0, 0, 3, LDID_NONE));
        assert_eq!(out.rc, ReturnCode::BackgroundOpStarted);
        let b = &st.vcss[0].vppbs[0];
        assert_eq!(b.bind_status, BindStatus::BoundPort);
        assert_eq!(b.ppid, 3);
        assert_eq!(b.ldid, 0);
        assert_eq!(st.ports[3].state, PortState::Dsp);
        assert!(!st.bos.running);
        assert_eq!(st.bos.pcnt, 100);
        assert_eq!(st.bos.opcode, opcode::VSC_BIND);
        st.check_invariants().unwrap();
    }

    #[test]
    fn bind_ld_records_ldid() {
        let mut st = switch();
        st.ports[2].dt = DeviceType::Type3Pooled;
        st.ports[2].ld = 4;
        let out = bind(&mut st, opcode::VSC_BIND, &bind_req(0, 1, 2, 2));
        assert_eq!(out.rc, ReturnCode::BackgroundOpStarted);
        let b = &st.vcss[0].vppbs[1];
        assert_eq!(b.bind_status, BindStatus::BoundLd);
        assert_eq!(b.ldid, 2);
        st.check_invariants().unwrap();
    }

    #[test]
    fn unbind_then_bind_is_identity_on_vppb() {
        let mut st = switch();
        bind(&mut st, opcode::VSC_BIND, &bind_req(0, 0, 3, LDID_NONE));
        let out = unbind(
            &mut st,
            opcode::VSC_UNBIND,
            &FmRequest::VscUnbind {
                vcsid: 0,
                vppbid: 0,
                option: 0,
            },
        );
        assert_eq!(out.rc, ReturnCode::BackgroundOpStarted);
        let b = &st.vcss[0].vppbs[0];
        assert_eq!(b.bind_status, BindStatus::Unbound);
        assert_eq!(b.ppid, 0);
        assert_eq!(b.ldid, 0);
        assert_eq!(st.bos.opcode, opcode::VSC_UNBIND);
        st.check_invariants().unwrap();
    }

    #[test]
    fn unbind_rejects_unbound_vppb() {
        let mut st = switch();
        let out = unbind(
            &mut st,
            opcode::VSC_UNBIND,
            &FmRequest::VscUnbind {
                vcsid: 0,
                vppbid: 1,
                option: 0,
            },
        );
        assert_eq!(out.rc, ReturnCode::InvalidInput);
    }

    #[test]
    fn info_clips_vppb_window() {
        let mut st = switch();
        st.vcss[0].num = 4;
        bind(&mut st, opcode::VSC_BIND, &bind_req(0, 0, 3, LDID_NONE));
        let out = info(
            &st,
            &FmRequest::VscInfo {
                start: 0,
                limit: 2,
                vcss: vec![0, 77],
            },
        );
        let FmResponse::VscInfo { blocks } = out.rsp else {
            panic!("wrong variant");
        };
        assert_eq!(blocks.len(), 1); // id 77 skipped
        assert_eq!(blocks[0].total, 4);
        assert_eq!(blocks[0].vppbs.len(), 2); // window clipped by limit
        assert_eq!(blocks[0].vppbs[0].status, BindStatus::BoundPort.to_wire());
        assert_eq!(blocks[0].vppbs[0].ppid, 3);
    }

    #[test]
    fn info_window_start_beyond_num_is_empty() {
        let st = switch();
        let out = info(
            &st,
            &FmRequest::VscInfo {
                start: 5,
                limit: 4,
                vcss: vec![0],
            },
        );
        let FmResponse::VscInfo { blocks } = out.rsp else {
            panic!("wrong variant");
        };
        assert!(blocks[0].vppbs.is_empty());
    }

    #[test]
    fn aer_validates_ids() {
        let st = switch();
        let ok = aer(
            &st,
            &FmRequest::VscAer {
                vcsid: 0,
                vppbid: 1,
                error_type: 0x1,
                header: [0; 32],
            },
        );
        assert_eq!(ok.rc, ReturnCode::Success);
        let bad = aer(
            &st,
            &FmRequest::VscAer {
                vcsid: 0,
                vppbid: 9,
                error_type: 0x1,
                header: [0; 32],
            },
        );
        assert_eq!(bad.rc, ReturnCode::InvalidInput);
    }
}
