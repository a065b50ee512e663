//! End-to-end command scenarios driven through the dispatcher with
//! in-memory queues, checking wire-level bytes where the behavior is
//! pinned to an exact encoding.

use crossbeam_channel::Receiver;
use cxlsim::backend::EmulatedBackend;
use cxlsim::emapi::{self, EmHdr};
use cxlsim::fmapi::{opcode, FmHdr, FmRequest, FmResponse, MsgCategory, ReturnCode, HDR_LEN};
use cxlsim::handlers::Dispatcher;
use cxlsim::mctp::{
    Action, ActionHandler, MctpMessage, Transport, MT_CXL_CCI, MT_CXL_FMAPI, MT_EMULATOR,
};
use cxlsim::state::device::Mld;
use cxlsim::state::pcicfg::CfgSpace;
use cxlsim::state::{
    BindStatus, DeviceType, Granularity, PortState, Switch, SwitchState, VcsState,
};
use std::sync::Arc;

const FM_EID: u8 = 0x20;

struct Harness {
    switch: Arc<Switch>,
    dispatcher: Dispatcher,
    tmq_rx: Receiver<Action>,
    acq_rx: Receiver<Action>,
    // Keeps the queue senders alive for the dispatcher clones.
    _transport: Transport,
}

impl Harness {
    fn new(state: SwitchState) -> Self {
        let switch = Arc::new(Switch::new(state));
        let transport = Transport::new(8);
        let dispatcher = Dispatcher::new(
            Arc::clone(&switch),
            &transport,
            Box::new(EmulatedBackend),
        );
        let tmq_rx = transport.tmq_rx.clone();
        let acq_rx = transport.acq_rx.clone();
        Harness {
            switch,
            dispatcher,
            tmq_rx,
            acq_rx,
            _transport: transport,
        }
    }

    fn inject(&self, mtype: u8, payload: Vec<u8>) {
        let len = payload.len();
        self.dispatcher.handle(Action::new(MctpMessage {
            dst: 0x10,
            src: FM_EID,
            tag: 0,
            mtype,
            payload,
            len,
        }));
    }

    /// Send an FM API request and return the raw response message.
    fn send_fm(&self, tag: u8, op: u16, req: &FmRequest) -> MctpMessage {
        let mut payload = vec![0u8; 8192];
        let plen = req.encode(&mut payload[HDR_LEN..]).unwrap();
        FmHdr::request(tag, op, plen)
            .encode(&mut payload[..HDR_LEN])
            .unwrap();
        payload.truncate(HDR_LEN + plen);
        self.inject(MT_CXL_FMAPI, payload);
        let mut action = self.tmq_rx.try_recv().expect("response expected");
        action.rsp.take().expect("response message expected")
    }

    /// Send an FM API request and decode the response.
    fn roundtrip_fm(&self, tag: u8, op: u16, req: &FmRequest) -> (FmHdr, FmResponse) {
        let rsp = self.send_fm(tag, op, req);
        let (hdr, used) = FmHdr::decode(rsp.body()).unwrap();
        let payload = FmResponse::decode(hdr.opcode, &rsp.body()[used..]).unwrap();
        (hdr, payload)
    }

    /// Send an Emulator API request and return the decoded header plus
    /// the response payload bytes.
    fn send_em(&self, tag: u8, op: u16, a: u8, b: u8) -> (EmHdr, Vec<u8>) {
        let mut payload = vec![0u8; emapi::HDR_LEN];
        EmHdr::request(tag, op, a, b)
            .encode(&mut payload)
            .unwrap();
        self.inject(MT_EMULATOR, payload);
        let mut action = self.tmq_rx.try_recv().expect("response expected");
        let rsp = action.rsp.take().expect("response message expected");
        let (hdr, used) = EmHdr::decode(rsp.body()).unwrap();
        (hdr, rsp.body()[used..].to_vec())
    }
}

fn identity_switch() -> SwitchState {
    let mut st = SwitchState::new(8, 2, 16).unwrap();
    st.vid = 0xb1b2;
    st.did = 0xc1c2;
    st.svid = 0xd1d2;
    st.ssid = 0xe1e2;
    st.sn = 0xa1a2_a3a4_a5a6_a7a8;
    st.max_msg_size_n = 10;
    for v in &mut st.vcss {
        v.state = VcsState::Enabled;
        v.num = 2;
    }
    st
}

fn pooled_port(st: &mut SwitchState, ppid: usize, num_ld: u16) {
    let port = &mut st.ports[ppid];
    port.dt = DeviceType::Type3Pooled;
    port.ld = num_ld;
    let mut mld = Mld {
        memory_size: num_ld as u64 * Granularity::Mb256.bytes(),
        num: num_ld,
        granularity: Granularity::Mb256,
        ..Default::default()
    };
    for i in 0..num_ld as usize {
        mld.rng1[i] = i as u64;
        mld.rng2[i] = i as u64;
    }
    mld.cfgspace = (0..num_ld).map(|_| Box::<CfgSpace>::default()).collect();
    port.mld = Some(Box::new(mld));
}

#[test]
fn scenario_identify_pinned_bytes() {
    let h = Harness::new(identity_switch());
    let rsp = h.send_fm(1, opcode::ISC_ID, &FmRequest::IscIdentify);
    let (hdr, used) = FmHdr::decode(rsp.body()).unwrap();
    assert_eq!(hdr.category, MsgCategory::Response);
    assert_eq!(hdr.tag, 1);
    assert_eq!(hdr.rc, ReturnCode::Success);
    assert_eq!(
        &rsp.body()[used..used + 17],
        &[
            0xb2, 0xb1, 0xc2, 0xc1, 0xd2, 0xd1, 0xe2, 0xe1, 0xa8, 0xa7, 0xa6, 0xa5, 0xa4, 0xa3,
            0xa2, 0xa1, 0x0a
        ]
    );
}

#[test]
fn scenario_list_devices_empty_catalog() {
    let h = Harness::new(identity_switch());
    let (hdr, payload) = h.send_em(3, emapi::opcode::LIST_DEV, 0, 0);
    assert_eq!(hdr.tag, 3);
    assert_eq!(hdr.count, 0);
    assert_eq!(hdr.len, 0);
    assert!(payload.is_empty());
}

#[test]
fn scenario_bind_rejects_out_of_range() {
    let h = Harness::new(identity_switch());
    let (hdr, _) = h.roundtrip_fm(
        7,
        opcode::VSC_BIND,
        &FmRequest::VscBind {
            vcsid: 5,
            vppbid: 0,
            ppid: 3,
            ldid: 0xFFFF,
        },
    );
    assert_eq!(hdr.rc, ReturnCode::InvalidInput);
    let st = h.switch.lock();
    assert!(st
        .vcss
        .iter()
        .all(|v| v.vppbs.iter().all(|b| b.bind_status == BindStatus::Unbound)));
    st.check_invariants().unwrap();
}

#[test]
fn scenario_bind_port_then_query_vcs() {
    let h = Harness::new(identity_switch());
    let (hdr, _) = h.roundtrip_fm(
        2,
        opcode::VSC_BIND,
        &FmRequest::VscBind {
            vcsid: 0,
            vppbid: 0,
            ppid: 3,
            ldid: 0xFFFF,
        },
    );
    assert_eq!(hdr.rc, ReturnCode::BackgroundOpStarted);

    let (hdr, rsp) = h.roundtrip_fm(
        3,
        opcode::VSC_INFO,
        &FmRequest::VscInfo {
            start: 0,
            limit: 2,
            vcss: vec![0],
        },
    );
    assert_eq!(hdr.rc, ReturnCode::Success);
    let FmResponse::VscInfo { blocks } = rsp else {
        panic!("wrong variant");
    };
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].vppbs[0].status, BindStatus::BoundPort.to_wire());
    assert_eq!(blocks[0].vppbs[0].ppid, 3);
    assert_eq!(blocks[0].vppbs[0].ldid, 0);

    {
        let st = h.switch.lock();
        assert_eq!(st.ports[3].state, PortState::Dsp);
        st.check_invariants().unwrap();
    }

    // The background-operation status reflects the completed bind.
    let (_, rsp) = h.roundtrip_fm(4, opcode::ISC_BOS, &FmRequest::IscBos);
    assert_eq!(
        rsp,
        FmResponse::IscBos {
            running: false,
            pcnt: 100,
            opcode: opcode::VSC_BIND,
            rc: 0,
            ext: 0,
        }
    );
}

#[test]
fn scenario_tunnel_mcc_info() {
    let mut st = identity_switch();
    pooled_port(&mut st, 2, 4);
    let h = Harness::new(st);

    let mut inner = vec![0u8; HDR_LEN];
    FmHdr::request(9, opcode::MCC_INFO, 0)
        .encode(&mut inner)
        .unwrap();
    let (hdr, rsp) = h.roundtrip_fm(
        5,
        opcode::MPC_TMC,
        &FmRequest::MpcTmc {
            ppid: 2,
            mtype: MT_CXL_CCI,
            msg: inner,
        },
    );
    assert_eq!(hdr.rc, ReturnCode::Success);
    let FmResponse::MpcTmc { mtype, msg } = rsp else {
        panic!("wrong variant");
    };
    assert_eq!(mtype, MT_CXL_CCI);
    let (ihdr, used) = FmHdr::decode(&msg).unwrap();
    assert_eq!(ihdr.rc, ReturnCode::Success);
    assert_eq!(ihdr.tag, 9);
    assert_eq!(
        FmResponse::decode(ihdr.opcode, &msg[used..]).unwrap(),
        FmResponse::MccInfo {
            memory_size: 4 * Granularity::Mb256.bytes(),
            num: 4,
            epc: false,
            ttr: false,
        }
    );
}

#[test]
fn scenario_config_write_read_round_trip() {
    let h = Harness::new(identity_switch());
    use cxlsim::fmapi::payload::{CfgOp, ConfigReq};
    let wr = ConfigReq {
        ppid: 1,
        ldid: 0,
        reg: 0x10,
        ext: 0,
        fdbe: 0xF,
        op: CfgOp::Write,
        data: [0xDE, 0xAD, 0xBE, 0xEF],
    };
    let (hdr, _) = h.roundtrip_fm(10, opcode::PSC_CFG, &FmRequest::PscConfig(wr));
    assert_eq!(hdr.rc, ReturnCode::Success);

    let rd = ConfigReq {
        op: CfgOp::Read,
        data: [0; 4],
        ..wr
    };
    let (hdr, rsp) = h.roundtrip_fm(11, opcode::PSC_CFG, &FmRequest::PscConfig(rd));
    assert_eq!(hdr.rc, ReturnCode::Success);
    assert_eq!(
        rsp,
        FmResponse::Config {
            data: [0xDE, 0xAD, 0xBE, 0xEF]
        }
    );
}

#[test]
fn unsupported_opcode_answers_with_tag() {
    let h = Harness::new(identity_switch());
    let (hdr, rsp) = h.roundtrip_fm(0x5A, 0x7F01, &FmRequest::Raw(vec![]));
    assert_eq!(hdr.rc, ReturnCode::Unsupported);
    assert_eq!(hdr.tag, 0x5A);
    assert_eq!(hdr.opcode, 0x7F01);
    assert_eq!(rsp, FmResponse::Raw(vec![]));
}

#[test]
fn wrong_category_is_reclaimed_without_response() {
    let h = Harness::new(identity_switch());
    let mut payload = vec![0u8; HDR_LEN];
    FmHdr::response(1, opcode::ISC_ID, ReturnCode::Success, 0)
        .encode(&mut payload)
        .unwrap();
    h.inject(MT_CXL_FMAPI, payload);

    assert!(h.tmq_rx.try_recv().is_err(), "no wire response expected");
    let action = h.acq_rx.try_recv().expect("action must be reclaimed");
    assert_eq!(action.completion_code, 1);
}

#[test]
fn truncated_header_is_reclaimed() {
    let h = Harness::new(identity_switch());
    h.inject(MT_CXL_FMAPI, vec![0x00, 0x01, 0x02]);
    assert!(h.tmq_rx.try_recv().is_err());
    assert_eq!(h.acq_rx.try_recv().unwrap().completion_code, 1);
}

#[test]
fn pool_exhaustion_takes_fail_path() {
    let h = Harness::new(identity_switch());
    // Drain every response slot.
    let mut held = Vec::new();
    while let Some(msg) = h._transport.pool.checkout() {
        held.push(msg);
    }
    let mut payload = vec![0u8; HDR_LEN];
    FmHdr::request(1, opcode::ISC_ID, 0)
        .encode(&mut payload)
        .unwrap();
    h.inject(MT_CXL_FMAPI, payload);
    assert!(h.tmq_rx.try_recv().is_err());
    assert_eq!(h.acq_rx.try_recv().unwrap().completion_code, 1);
}

#[test]
fn emulator_event_is_ignored() {
    let h = Harness::new(identity_switch());
    let mut payload = vec![0u8; emapi::HDR_LEN];
    EmHdr::request(0, emapi::opcode::EVENT, 0, 0)
        .encode(&mut payload)
        .unwrap();
    h.inject(MT_EMULATOR, payload);
    assert!(h.tmq_rx.try_recv().is_err(), "events get no response");
    // The action is still recycled through the reclaim queue, cleanly.
    assert_eq!(h.acq_rx.try_recv().unwrap().completion_code, 0);
}

#[test]
fn emulator_unknown_opcode_is_unsupported() {
    let h = Harness::new(identity_switch());
    let (hdr, _) = h.send_em(8, 0x0099, 0, 0);
    assert_eq!(hdr.rc, ReturnCode::Unsupported);
    assert_eq!(hdr.tag, 8);
}

#[test]
fn port_state_query_reflects_connected_device() {
    let mut st = identity_switch();
    pooled_port(&mut st, 2, 4);
    st.ports[2].prsnt = true;
    let h = Harness::new(st);

    let (hdr, rsp) = h.roundtrip_fm(
        1,
        opcode::PSC_PORT,
        &FmRequest::PscPortState {
            ports: vec![2, 100],
        },
    );
    assert_eq!(hdr.rc, ReturnCode::Success);
    let FmResponse::PscPortState { ports } = rsp else {
        panic!("wrong variant");
    };
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].ppid, 2);
    assert_eq!(ports[0].dt, DeviceType::Type3Pooled.to_wire());
    assert_eq!(ports[0].ld, 4);
    assert!(ports[0].prsnt);
}

#[test]
fn tunneled_ld_alloc_get_and_set() {
    let mut st = identity_switch();
    pooled_port(&mut st, 2, 4);
    let h = Harness::new(st);

    let send_tunneled = |tag: u8, op: u16, req: &FmRequest| {
        let mut inner = vec![0u8; 8192];
        let plen = req.encode(&mut inner[HDR_LEN..]).unwrap();
        FmHdr::request(tag, op, plen)
            .encode(&mut inner[..HDR_LEN])
            .unwrap();
        inner.truncate(HDR_LEN + plen);
        let (_, rsp) = h.roundtrip_fm(
            tag,
            opcode::MPC_TMC,
            &FmRequest::MpcTmc {
                ppid: 2,
                mtype: MT_CXL_CCI,
                msg: inner,
            },
        );
        let FmResponse::MpcTmc { msg, .. } = rsp else {
            panic!("wrong variant");
        };
        let (ihdr, used) = FmHdr::decode(&msg).unwrap();
        (ihdr, FmResponse::decode(ihdr.opcode, &msg[used..]).unwrap())
    };

    use cxlsim::fmapi::payload::LdRange;
    let (ihdr, _) = send_tunneled(
        1,
        opcode::MCC_ALLOC_SET,
        &FmRequest::MccAllocSet {
            start: 3,
            ranges: vec![LdRange { rng1: 5, rng2: 6 }],
        },
    );
    assert_eq!(ihdr.rc, ReturnCode::Success);

    let (ihdr, rsp) = send_tunneled(
        2,
        opcode::MCC_ALLOC_GET,
        &FmRequest::MccAllocGet { start: 0, limit: 4 },
    );
    assert_eq!(ihdr.rc, ReturnCode::Success);
    let FmResponse::MccAllocGet { total, ranges, .. } = rsp else {
        panic!("wrong variant");
    };
    assert_eq!(total, 4);
    assert_eq!(ranges[3], LdRange { rng1: 5, rng2: 6 });
    h.switch.lock().check_invariants().unwrap();
}
