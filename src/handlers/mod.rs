//! Opcode dispatch.
//!
//! The uniform handler skeleton lives here, once: check out a response
//! slot, fill the transport header, decode the request header and payload,
//! run the opcode action under the switch lock, serialize the response and
//! push it for transmit. Transport-level failures (slot exhaustion, decode
//! or encode failure, wrong category) take the fail-path: the action is
//! marked and reclaimed without a wire response. Validation failures are
//! ordinary responses with a domain return code.

pub mod emu;
pub mod isc;
pub mod mcc;
pub mod mpc;
pub mod psc;
pub mod vsc;

use crate::backend::ConfigBackend;
use crate::emapi::{self, EmHdr, EmMsgType};
use crate::fmapi::{opcode, FmHdr, FmRequest, FmResponse, MsgCategory, ReturnCode};
use crate::fmapi::HDR_LEN;
use crate::mctp::{self, Action, ActionHandler, MsgPool, Transport};
use crate::state::{Switch, SwitchState};
use crossbeam_channel::Sender;
use log::warn;
use std::sync::Arc;

/// What an opcode action produced: a domain return code and the response
/// payload to serialize.
pub struct CmdOutcome {
    pub rc: ReturnCode,
    pub rsp: FmResponse,
}

impl CmdOutcome {
    pub fn ok(rsp: FmResponse) -> Self {
        CmdOutcome {
            rc: ReturnCode::Success,
            rsp,
        }
    }

    pub fn err(rc: ReturnCode) -> Self {
        CmdOutcome {
            rc,
            rsp: FmResponse::Empty,
        }
    }
}

/// Routes inbound actions to the FM API or Emulator API handler families.
pub struct Dispatcher {
    switch: Arc<Switch>,
    pool: MsgPool,
    tmq: Sender<Action>,
    acq: Sender<Action>,
    backend: Box<dyn ConfigBackend>,
    eid: u8,
}

impl Dispatcher {
    pub fn new(switch: Arc<Switch>, transport: &Transport, backend: Box<dyn ConfigBackend>) -> Self {
        Dispatcher {
            switch,
            pool: transport.pool.clone(),
            tmq: transport.tmq_tx.clone(),
            acq: transport.acq_tx.clone(),
            backend,
            eid: mctp::OWN_EID,
        }
    }

    /// Fail-path: mark the action and hand it to the reclaim queue.
    fn fail(&self, mut action: Action, rsp: Option<mctp::MctpMessage>) {
        action.rsp = rsp;
        action.completion_code = 1;
        let _ = self.acq.send(action);
    }

    /// Accepted-without-response path (Emulator API events).
    fn discard(&self, mut action: Action, rsp: Option<mctp::MctpMessage>) {
        if let Some(r) = rsp {
            self.pool.checkin(r);
        }
        action.completion_code = 0;
        let _ = self.acq.send(action);
    }

    fn fm_action(&self, mut action: Action) {
        let Some(mut rsp) = self.pool.checkout() else {
            warn!("fm: response pool exhausted");
            return self.fail(action, None);
        };
        mctp::fill_rsp_header(&mut rsp, &action.req, self.eid);

        let (hdr, consumed) = match FmHdr::decode(action.req.body()) {
            Ok(v) => v,
            Err(e) => {
                warn!("fm: header decode failed: {e}");
                return self.fail(action, Some(rsp));
            }
        };
        if hdr.category != MsgCategory::Request {
            warn!("fm: dropping non-request message, tag {}", hdr.tag);
            return self.fail(action, Some(rsp));
        }
        let body_end = consumed + hdr.len as usize;
        if action.req.body().len() < body_end {
            warn!("fm: payload length {} exceeds frame", hdr.len);
            return self.fail(action, Some(rsp));
        }
        let req = match FmRequest::decode(hdr.opcode, &action.req.body()[consumed..body_end]) {
            Ok(r) => r,
            Err(e) => {
                warn!("fm: payload decode failed for {:#06x}: {e}", hdr.opcode);
                return self.fail(action, Some(rsp));
            }
        };

        let outcome = {
            let mut st = self.switch.lock();
            self.execute_fm(&mut st, &hdr, &req)
        };

        let plen = match outcome.rsp.encode(&mut rsp.payload[HDR_LEN..]) {
            Ok(l) => l,
            Err(e) => {
                warn!("fm: response encode failed for {:#06x}: {e}", hdr.opcode);
                return self.fail(action, Some(rsp));
            }
        };
        let rhdr = FmHdr::response(hdr.tag, hdr.opcode, outcome.rc, plen);
        if rhdr.encode(&mut rsp.payload[..HDR_LEN]).is_err() {
            return self.fail(action, Some(rsp));
        }
        rsp.len = HDR_LEN + plen;
        action.rsp = Some(rsp);
        let _ = self.tmq.send(action);
    }

    /// The opcode table. Every entry runs with the switch lock held across
    /// validation, action, and response preparation.
    fn execute_fm(&self, st: &mut SwitchState, hdr: &FmHdr, req: &FmRequest) -> CmdOutcome {
        match hdr.opcode {
            opcode::ISC_ID => isc::identify(st),
            opcode::ISC_BOS => isc::bos(st),
            opcode::ISC_MSG_LIMIT_GET => isc::msg_limit_get(st),
            opcode::ISC_MSG_LIMIT_SET => isc::msg_limit_set(st, req),
            opcode::PSC_ID => psc::identify(st),
            opcode::PSC_PORT => psc::port_state(st, req),
            opcode::PSC_PORT_CTRL => psc::port_control(st, req, self.backend.as_ref()),
            opcode::PSC_CFG => psc::config(st, req, self.backend.as_ref()),
            opcode::VSC_INFO => vsc::info(st, req),
            opcode::VSC_BIND => vsc::bind(st, hdr.opcode, req),
            opcode::VSC_UNBIND => vsc::unbind(st, hdr.opcode, req),
            opcode::VSC_AER => vsc::aer(st, req),
            opcode::MPC_TMC => mpc::tunnel(st, req),
            opcode::MPC_CFG => mpc::config(st, req),
            opcode::MPC_MEM => mpc::memory(st, req),
            other => {
                warn!("fm: unsupported opcode {other:#06x}");
                CmdOutcome::err(ReturnCode::Unsupported)
            }
        }
    }

    fn em_action(&self, mut action: Action) {
        let Some(mut rsp) = self.pool.checkout() else {
            warn!("em: response pool exhausted");
            return self.fail(action, None);
        };
        mctp::fill_rsp_header(&mut rsp, &action.req, self.eid);

        let (hdr, _) = match EmHdr::decode(action.req.body()) {
            Ok(v) => v,
            Err(e) => {
                warn!("em: header decode failed: {e}");
                return self.fail(action, Some(rsp));
            }
        };
        if hdr.mtype != EmMsgType::Request {
            // Events are accepted and ignored; anything else is malformed.
            if hdr.mtype == EmMsgType::Event && hdr.opcode == emapi::opcode::EVENT {
                return self.discard(action, Some(rsp));
            }
            warn!("em: dropping non-request message, tag {}", hdr.tag);
            return self.fail(action, Some(rsp));
        }
        if hdr.opcode == emapi::opcode::EVENT {
            return self.discard(action, Some(rsp));
        }

        let (rc, len, count) = {
            let mut st = self.switch.lock();
            let out = &mut rsp.payload[emapi::HDR_LEN..];
            match hdr.opcode {
                emapi::opcode::LIST_DEV => emu::list_devices(&st, hdr.a, hdr.b, out),
                emapi::opcode::CONN_DEV => (emu::connect_device(&mut st, hdr.a, hdr.b), 0, 0),
                emapi::opcode::DISCON_DEV => {
                    (emu::disconnect_device(&mut st, hdr.a, hdr.b != 0), 0, 0)
                }
                other => {
                    warn!("em: unsupported opcode {other:#06x}");
                    (ReturnCode::Unsupported, 0, 0)
                }
            }
        };

        let rhdr = EmHdr::response(hdr.tag, hdr.opcode, rc, len, count);
        if rhdr.encode(&mut rsp.payload[..emapi::HDR_LEN]).is_err() {
            return self.fail(action, Some(rsp));
        }
        rsp.len = emapi::HDR_LEN + len as usize;
        action.rsp = Some(rsp);
        let _ = self.tmq.send(action);
    }
}

impl ActionHandler for Dispatcher {
    fn handle(&self, action: Action) {
        match action.req.mtype {
            mctp::MT_CXL_FMAPI => self.fm_action(action),
            mctp::MT_EMULATOR => self.em_action(action),
            other => {
                warn!("unhandled MCTP message type {other:#04x}");
                self.fail(action, None);
            }
        }
    }
}
