//! Physical Switch command set.

use super::CmdOutcome;
use crate::backend::{BackendError, ConfigBackend};
use crate::fmapi::payload::CfgOp;
use crate::fmapi::{FmRequest, FmResponse, ReturnCode};
use crate::state::SwitchState;
use log::{debug, info, warn};

/// Identify Switch Device (5100h): static sizing plus live activity maps.
pub fn identify(st: &SwitchState) -> CmdOutcome {
    info!("CMD: PSC Identify Switch Device");
    CmdOutcome::ok(FmResponse::PscIdentify(st.identity()))
}

/// Get Physical Port State (5101h). Invalid port ids in the request are
/// silently skipped; the response `num` reflects what was written.
pub fn port_state(st: &SwitchState, req: &FmRequest) -> CmdOutcome {
    let FmRequest::PscPortState { ports } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!("CMD: PSC Get Physical Port State: {} ids", ports.len());
    let blocks = ports
        .iter()
        .filter_map(|&id| st.ports.get(id as usize))
        .map(|p| p.to_state_blk())
        .collect();
    CmdOutcome::ok(FmResponse::PscPortState { ports: blocks })
}

/// Physical Port Control (5102h): PERST assert/deassert and PPB reset.
pub fn port_control(
    st: &mut SwitchState,
    req: &FmRequest,
    backend: &dyn ConfigBackend,
) -> CmdOutcome {
    let FmRequest::PscPortControl { ppid, op } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!("CMD: PSC Physical Port Control: ppid {ppid} op {op:?}");
    let Some(port) = st.ports.get_mut(*ppid as usize) else {
        warn!("ERR: ppid {ppid} out of range");
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    match backend.port_control(port, *op) {
        Ok(()) => {
            debug!("ACT: port control applied on ppid {ppid}");
            CmdOutcome::ok(FmResponse::Empty)
        }
        Err(e) => {
            warn!("ERR: port control on ppid {ppid}: {e}");
            CmdOutcome::err(backend_rc(e))
        }
    }
}

/// PPB CXL.io Config (5103h): byte-enable masked access to the port's
/// config space through the selected backend.
pub fn config(st: &mut SwitchState, req: &FmRequest, backend: &dyn ConfigBackend) -> CmdOutcome {
    let FmRequest::PscConfig(c) = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!(
        "CMD: PSC CXL.io Config: ppid {} reg {:#05x} fdbe {:#x} {:?}",
        c.ppid,
        c.reg_offset(),
        c.fdbe,
        c.op
    );
    let Some(port) = st.ports.get_mut(c.ppid as usize) else {
        warn!("ERR: ppid {} out of range", c.ppid);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    let result = match c.op {
        CfgOp::Read => backend.cfg_read(port, c.reg_offset(), c.fdbe),
        CfgOp::Write => backend
            .cfg_write(port, c.reg_offset(), c.fdbe, c.data)
            .map(|()| [0u8; 4]),
    };
    match result {
        Ok(data) => CmdOutcome::ok(FmResponse::Config { data }),
        Err(e) => {
            warn!("ERR: config access on ppid {}: {e}", c.ppid);
            CmdOutcome::err(backend_rc(e))
        }
    }
}

fn backend_rc(e: BackendError) -> ReturnCode {
    match e {
        BackendError::InvalidAccess(_) => ReturnCode::InvalidInput,
        BackendError::Unsupported(_) => ReturnCode::Unsupported,
        BackendError::Io(_) => ReturnCode::Unsupported,
    }
}
