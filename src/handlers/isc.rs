//! Information and Status command set.

use super::CmdOutcome;
use crate::fmapi::{FmRequest, FmResponse, ReturnCode};
use crate::state::SwitchState;
use log::{info, warn};

/// Identify (0001h): switch identity and protocol limits.
pub fn identify(st: &SwitchState) -> CmdOutcome {
    info!("CMD: ISC Identify");
    CmdOutcome::ok(FmResponse::IscIdentify {
        vid: st.vid,
        did: st.did,
        svid: st.svid,
        ssid: st.ssid,
        sn: st.sn,
        size: st.max_msg_size_n,
    })
}

/// Background Operation Status (0002h).
pub fn bos(st: &SwitchState) -> CmdOutcome {
    info!("CMD: ISC Background Operation Status");
    CmdOutcome::ok(FmResponse::IscBos {
        running: st.bos.running,
        pcnt: st.bos.pcnt,
        opcode: st.bos.opcode,
        rc: st.bos.rc,
        ext: st.bos.ext,
    })
}

/// Get Response Message Limit (0003h).
pub fn msg_limit_get(st: &SwitchState) -> CmdOutcome {
    info!("CMD: ISC Get Response Message Limit");
    CmdOutcome::ok(FmResponse::IscMsgLimit {
        limit: st.msg_rsp_limit_n,
    })
}

/// Set Response Message Limit (0004h). The limit is a power-of-two
/// exponent constrained to [8, 20].
pub fn msg_limit_set(st: &mut SwitchState, req: &FmRequest) -> CmdOutcome {
    let FmRequest::IscMsgLimitSet { limit } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!("CMD: ISC Set Response Message Limit: {limit}");
    if !(8..=20).contains(limit) {
        warn!("ERR: message limit {limit} outside [8, 20]");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    st.msg_rsp_limit_n = *limit;
    CmdOutcome::ok(FmResponse::IscMsgLimit {
        limit: st.msg_rsp_limit_n,
    })
}
