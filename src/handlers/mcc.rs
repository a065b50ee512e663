//! MLD Component command set. These run only behind the tunnel (MPC TMC)
//! against the MLD owned by the target port.

use super::CmdOutcome;
use crate::fmapi::payload::{LdRange, QosControl};
use crate::fmapi::{FmRequest, FmResponse, ReturnCode};
use crate::state::device::Mld;
use crate::state::Port;
use log::{debug, info, warn};

fn mld_of(port: &mut Port) -> Option<&mut Mld> {
    match port.mld.as_deref_mut() {
        Some(m) => Some(m),
        None => {
            warn!("ERR: ppid {} not connected to an MLD", port.ppid);
            None
        }
    }
}

/// Get LD Info (5400h).
pub fn info(port: &mut Port) -> CmdOutcome {
    info!("CMD: MCC Get LD Info: ppid {}", port.ppid);
    let Some(mld) = mld_of(port) else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    CmdOutcome::ok(FmResponse::MccInfo {
        memory_size: mld.memory_size,
        num: mld.num,
        epc: mld.epc,
        ttr: mld.ttr,
    })
}

/// Get LD Allocations (5401h): the `[start, start+limit)` window of the
/// range table, clipped to the LD count.
pub fn get_ld_alloc(port: &mut Port, req: &FmRequest) -> CmdOutcome {
    let FmRequest::MccAllocGet { start, limit } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!("CMD: MCC Get LD Allocations: ppid {} start {start}", port.ppid);
    let Some(mld) = mld_of(port) else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if *start as u16 > mld.num {
        warn!("ERR: start {start} exceeds LD count {}", mld.num);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    let stop = (*start as usize + *limit as usize).min(mld.num as usize);
    let ranges = (*start as usize..stop)
        .map(|i| LdRange {
            rng1: mld.rng1[i],
            rng2: mld.rng2[i],
        })
        .collect();
    CmdOutcome::ok(FmResponse::MccAllocGet {
        total: mld.num as u8,
        granularity: mld.granularity.to_wire(),
        start: *start,
        ranges,
    })
}

/// Set LD Allocations (5402h): writes `[start, start+num)` of the range
/// table and echoes the resulting window.
pub fn set_ld_alloc(port: &mut Port, req: &FmRequest) -> CmdOutcome {
    let FmRequest::MccAllocSet { start, ranges } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    let ppid = port.ppid;
    info!("CMD: MCC Set LD Allocations: ppid {ppid} start {start}");
    let Some(mld) = mld_of(port) else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    let num = ranges.len() as u16;
    if num > mld.num || *start as u16 > mld.num || *start as u16 + num > mld.num {
        warn!(
            "ERR: window start {start} num {num} exceeds LD count {}",
            mld.num
        );
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    debug!("ACT: setting LD allocations on ppid {ppid}");
    for (i, r) in ranges.iter().enumerate() {
        mld.rng1[*start as usize + i] = r.rng1;
        mld.rng2[*start as usize + i] = r.rng2;
    }
    let echoed = (*start as usize..*start as usize + ranges.len())
        .map(|i| LdRange {
            rng1: mld.rng1[i],
            rng2: mld.rng2[i],
        })
        .collect();
    CmdOutcome::ok(FmResponse::MccAllocSet {
        start: *start,
        ranges: echoed,
    })
}

/// Get QoS Control (5403h).
pub fn get_qos_ctrl(port: &mut Port) -> CmdOutcome {
    info!("CMD: MCC Get QoS Control: ppid {}", port.ppid);
    let Some(mld) = mld_of(port) else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    CmdOutcome::ok(FmResponse::MccQosCtrl(qos_snapshot(mld)))
}

/// Set QoS Control (5404h): struct-copy of the control scalars, echoing
/// the new state.
pub fn set_qos_ctrl(port: &mut Port, req: &FmRequest) -> CmdOutcome {
    let FmRequest::MccQosCtrlSet(q) = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    let ppid = port.ppid;
    info!("CMD: MCC Set QoS Control: ppid {ppid}");
    let Some(mld) = mld_of(port) else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    debug!("ACT: setting QoS control on ppid {ppid}");
    mld.epc_en = q.epc_en != 0;
    mld.ttr_en = q.ttr_en != 0;
    mld.egress_mod_pcnt = q.egress_mod_pcnt;
    mld.egress_sev_pcnt = q.egress_sev_pcnt;
    mld.sample_interval = q.sample_interval;
    mld.rcb = q.rcb;
    mld.comp_interval = q.comp_interval;
    CmdOutcome::ok(FmResponse::MccQosCtrl(qos_snapshot(mld)))
}

fn qos_snapshot(mld: &Mld) -> QosControl {
    QosControl {
        epc_en: mld.epc_en as u8,
        ttr_en: mld.ttr_en as u8,
        egress_mod_pcnt: mld.egress_mod_pcnt,
        egress_sev_pcnt: mld.egress_sev_pcnt,
        sample_interval: mld.sample_interval,
        rcb: mld.rcb,
        comp_interval: mld.comp_interval,
    }
}

/// Get QoS Status (5405h).
pub fn get_qos_stat(port: &mut Port) -> CmdOutcome {
    info!("CMD: MCC Get QoS Status: ppid {}", port.ppid);
    let Some(mld) = mld_of(port) else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    CmdOutcome::ok(FmResponse::MccQosStatus {
        bp_avg_pcnt: mld.bp_avg_pcnt,
    })
}

/// Get QoS Allocated BW (5406h).
pub fn get_qos_bw_alloc(port: &mut Port, req: &FmRequest) -> CmdOutcome {
    let FmRequest::MccQosBwAllocGet { start, num } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!("CMD: MCC Get QoS Allocated BW: ppid {}", port.ppid);
    let Some(mld) = mld_of(port) else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    CmdOutcome::ok(FmResponse::MccQosBw {
        start: *start,
        list: bw_window(&mld.alloc_bw, mld.num, *start, *num),
    })
}

/// Set QoS Allocated BW (5407h).
pub fn set_qos_bw_alloc(port: &mut Port, req: &FmRequest) -> CmdOutcome {
    let FmRequest::MccQosBwAllocSet { start, list } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    let ppid = port.ppid;
    info!("CMD: MCC Set QoS Allocated BW: ppid {ppid}");
    let Some(mld) = mld_of(port) else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if !window_fits(mld.num, *start, list.len()) {
        warn!("ERR: window start {start} num {} exceeds LD count {}", list.len(), mld.num);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    debug!("ACT: setting QoS allocated BW on ppid {ppid}");
    mld.alloc_bw[*start as usize..*start as usize + list.len()].copy_from_slice(list);
    CmdOutcome::ok(FmResponse::MccQosBw {
        start: *start,
        list: list.clone(),
    })
}

/// Get QoS BW Limit (5408h).
pub fn get_qos_bw_limit(port: &mut Port, req: &FmRequest) -> CmdOutcome {
    let FmRequest::MccQosBwLimitGet { start, num } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    info!("CMD: MCC Get QoS BW Limit: ppid {}", port.ppid);
    let Some(mld) = mld_of(port) else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    CmdOutcome::ok(FmResponse::MccQosBw {
        start: *start,
        list: bw_window(&mld.bw_limit, mld.num, *start, *num),
    })
}

/// Set QoS BW Limit (5409h).
pub fn set_qos_bw_limit(port: &mut Port, req: &FmRequest) -> CmdOutcome {
    let FmRequest::MccQosBwLimitSet { start, list } = req else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    let ppid = port.ppid;
    info!("CMD: MCC Set QoS BW Limit: ppid {ppid}");
    let Some(mld) = mld_of(port) else {
        return CmdOutcome::err(ReturnCode::InvalidInput);
    };
    if !window_fits(mld.num, *start, list.len()) {
        warn!("ERR: window start {start} num {} exceeds LD count {}", list.len(), mld.num);
        return CmdOutcome::err(ReturnCode::InvalidInput);
    }
    debug!("ACT: setting QoS BW limit on ppid {ppid}");
    mld.bw_limit[*start as usize..*start as usize + list.len()].copy_from_slice(list);
    CmdOutcome::ok(FmResponse::MccQosBw {
        start: *start,
        list: list.clone(),
    })
}

fn window_fits(total: u16, start: u8, num: usize) -> bool {
    num as u16 <= total && start as u16 + num as u16 <= total
}

/// Clamp a get-window to the valid LD count and copy it out.
fn bw_window(table: &[u8], total: u16, start: u8, num: u8) -> Vec<u8> {
    let avail = (total as usize).saturating_sub(start as usize);
    let take = (num as usize).min(avail);
    table[start as usize..start as usize + take].to_vec()
}
