//! Emulator API command set: the device-catalog operations.

use crate::emapi::{encode_device_list, DeviceRecord};
use crate::fmapi::ReturnCode;
use crate::state::device::{attach, detach};
use crate::state::SwitchState;
use log::{debug, info, warn};

/// List Devices: `num_requested == 0` means "all remaining"; the window is
/// clamped against the catalog size. Returns `(rc, payload_len, count)`.
pub fn list_devices(
    st: &SwitchState,
    num_requested: u8,
    start_num: u8,
    out: &mut [u8],
) -> (ReturnCode, u16, u8) {
    info!("CMD: EM List Devices: start {start_num} num {num_requested}");
    let total = st.devices.len() as u16;
    let mut num = num_requested as u16;
    if num == 0 {
        num = total.saturating_sub(start_num as u16);
    }
    if start_num as u16 >= total {
        warn!("ERR: start {start_num} out of range, catalog holds {total}");
        return (ReturnCode::InvalidInput, 0, 0);
    }
    // The >= keeps tail-exact requests clamped too.
    if start_num as u16 + num >= total {
        num = total - start_num as u16;
    }

    let records: Vec<DeviceRecord> = (0..num)
        .map(|i| {
            let idx = start_num as usize + i as usize;
            DeviceRecord {
                id: idx as u8,
                name: st.devices[idx].name.clone(),
            }
        })
        .collect();
    match encode_device_list(&records, out) {
        Ok(len) => {
            debug!("ACT: responding with {} devices", records.len());
            (ReturnCode::Success, len as u16, records.len() as u8)
        }
        Err(e) => {
            warn!("ERR: device list encode: {e}");
            (ReturnCode::InternalError, 0, 0)
        }
    }
}

/// Connect Device: run the attach engine for catalog entry `devid` onto
/// port `ppid`.
pub fn connect_device(st: &mut SwitchState, ppid: u8, devid: u8) -> ReturnCode {
    info!("CMD: EM Connect Device: ppid {ppid} device {devid}");
    let SwitchState {
        ports,
        devices,
        dir,
        ..
    } = st;
    let Some(port) = ports.get_mut(ppid as usize) else {
        warn!("ERR: ppid {ppid} out of range");
        return ReturnCode::InvalidInput;
    };
    let Some(dev) = devices.get(devid as usize) else {
        warn!("ERR: device id {devid} out of range");
        return ReturnCode::InvalidInput;
    };
    if dev.name.is_empty() {
        warn!("ERR: device slot {devid} is empty");
        return ReturnCode::InvalidInput;
    }
    debug!("ACT: connecting device {devid} to ppid {ppid}");
    match attach(port, dev, dir.as_deref()) {
        Ok(()) => ReturnCode::Success,
        Err(e) => {
            warn!("ERR: attach failed on ppid {ppid}: {e}");
            ReturnCode::Unsupported
        }
    }
}

/// Disconnect Device: detach port `ppid`, or every present port when
/// `all` is set.
pub fn disconnect_device(st: &mut SwitchState, ppid: u8, all: bool) -> ReturnCode {
    info!("CMD: EM Disconnect Device: ppid {ppid} all {all}");
    let range = if all {
        0..st.ports.len()
    } else {
        let p = ppid as usize;
        if p >= st.ports.len() {
            warn!("ERR: ppid {ppid} out of range");
            return ReturnCode::InvalidInput;
        }
        p..p + 1
    };
    for i in range {
        if st.ports[i].prsnt {
            debug!("ACT: disconnecting ppid {i}");
            detach(&mut st.ports[i]);
        }
    }
    ReturnCode::Success
}
