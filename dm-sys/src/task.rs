//! Safe task builder over the raw ioctl wire format, plus the
//! process-wide serialization point for issuing them.
//!
//! Grounded on `devmapper.c`'s `libmp_dm_task_create`/`dm_simplecmd*`/
//! `dm_addmap*` control flow: one task object accumulates a command,
//! optional targets, and flags, then is submitted through a single
//! serialized control-device handle.

use std::mem::{offset_of, size_of};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Mutex, OnceLock};

use rustix::fs::{Mode, OFlags};

use crate::error::{DmError, Result};
use crate::ioctl::{self, DmCmd, DmIoctl, DmTargetSpec};

const CONTROL_PATH: &str = "/dev/mapper/control";

/// Process-wide serialization point for the device-mapper control
/// device. All ioctl issuance takes this lock: the runner keeps
/// internal state (the open control fd) that is not safely re-entrant,
/// matching the single global libdm lock the original serializes
/// through.
struct DmControl {
    fd: Mutex<Option<OwnedFd>>,
}

static CONTROL: OnceLock<DmControl> = OnceLock::new();

fn control() -> &'static DmControl {
    CONTROL.get_or_init(|| DmControl { fd: Mutex::new(None) })
}

/// Run `body` with the control device open and the global lock held.
/// Recovers from a poisoned lock instead of propagating the panic to
/// every subsequent caller — a single panicking caller must not wedge
/// the whole process's device-mapper access.
pub fn with_control<T>(body: impl FnOnce(BorrowedFd<'_>) -> Result<T>) -> Result<T> {
    let control = control();
    let mut guard = match control.fd.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.is_none() {
        let fd = rustix::fs::open(CONTROL_PATH, OFlags::RDWR, Mode::empty()).map_err(|e| {
            crate::logging::dm_log(crate::logging::LOG_ERR, &format!("cannot open {CONTROL_PATH}: {e}"));
            DmError::Io(e.into())
        })?;
        *guard = Some(fd);
    }
    let fd = guard.as_ref().unwrap();
    body(fd.as_fd())
}

/// One target row in a table being loaded.
#[derive(Clone)]
pub struct Target {
    pub start: u64,
    pub length: u64,
    pub target_type: String,
    pub params: String,
}

/// Response to a control ioctl: the parsed header plus the raw trailing
/// data, which callers interpret according to which command was issued.
pub struct Reply {
    pub header: DmIoctl,
    pub data: Vec<u8>,
}

/// Serialize `targets` as a back-to-back run of `dm_target_spec` +
/// NUL-terminated params (padded to an 8-byte boundary), the layout
/// `DM_TABLE_LOAD` expects.
fn encode_targets(targets: &[Target]) -> Vec<u8> {
    let next_offset = offset_of!(DmTargetSpec, next);
    let mut out = Vec::new();
    for t in targets {
        let spec_offset = out.len();
        let spec = DmTargetSpec::new(t.start, t.length, &t.target_type);
        out.extend_from_slice(unsafe {
            std::slice::from_raw_parts(&spec as *const _ as *const u8, size_of::<DmTargetSpec>())
        });
        out.extend_from_slice(t.params.as_bytes());
        out.push(0);
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let next = (out.len() - spec_offset) as u32;
        let field = spec_offset + next_offset;
        out[field..field + 4].copy_from_slice(&next.to_ne_bytes());
    }
    out
}

fn base_buf(name: &str, uuid: Option<&str>, flags: u32, extra: &[u8]) -> Vec<u8> {
    let mut buf = ioctl::new_buf(extra.len());
    {
        let header = ioctl::buf_header_mut(&mut buf);
        header.set_name(name);
        if let Some(u) = uuid {
            header.set_uuid(u);
        }
        header.flags = flags;
    }
    let start = std::mem::size_of::<DmIoctl>();
    buf[start..start + extra.len()].copy_from_slice(extra);
    buf
}

fn send(cmd: DmCmd, buf: &mut Vec<u8>) -> Result<Reply> {
    with_control(|fd| {
        ioctl::run_ioctl(fd, cmd, buf)?;
        let header = *ioctl::buf_header(buf);
        let data_start = header.data_start as usize;
        let data = if data_start > 0 && data_start <= buf.len() {
            buf[data_start..].to_vec()
        } else {
            Vec::new()
        };
        Ok(Reply { header, data })
    })
}

/// `DM_DEV_CREATE`: create the device object only (no table yet).
pub fn dev_create(name: &str, uuid: &str, flags: u32) -> Result<Reply> {
    let mut buf = base_buf(name, Some(uuid), flags, &[]);
    send(DmCmd::DevCreate, &mut buf)
}

/// `DM_TABLE_LOAD`: (re)load an inactive table for an existing device.
pub fn table_load(name: &str, targets: &[Target], flags: u32) -> Result<Reply> {
    let data = encode_targets(targets);
    let mut buf = base_buf(name, None, flags, &data);
    {
        let header = ioctl::buf_header_mut(&mut buf);
        header.target_count = targets.len() as u32;
    }
    send(DmCmd::TableLoad, &mut buf)
}

/// `DM_DEV_SUSPEND` without `DM_SUSPEND_FLAG`: resume (swap in the
/// loaded table and unplug I/O), optionally attaching a udev cookie.
/// `flags` is the structural `dm_ioctl.flags` field; udev flags
/// (`MPATH_UDEV_*`/`DM_UDEV_*`) do not belong there — pack them into
/// `cookie` via `dm_sys::cookie::Cookie::ioctl_value` instead, since
/// both fields use overlapping bit positions for unrelated purposes.
pub fn resume(name: &str, flags: u32, cookie: Option<u32>) -> Result<Reply> {
    let mut buf = base_buf(name, None, flags, &[]);
    if let Some(c) = cookie {
        ioctl::buf_header_mut(&mut buf).event_nr = c;
    }
    send(DmCmd::DevSuspend, &mut buf)
}

/// `DM_DEV_SUSPEND` with `DM_SUSPEND_FLAG`: suspend I/O on the device.
pub fn suspend(name: &str, flags: u32) -> Result<Reply> {
    let mut buf = base_buf(name, None, flags | ioctl::DM_SUSPEND_FLAG, &[]);
    send(DmCmd::DevSuspend, &mut buf)
}

/// `DM_DEV_REMOVE`: tear down the device object.
pub fn remove(name: &str, flags: u32, cookie: Option<u32>) -> Result<Reply> {
    let mut buf = base_buf(name, None, flags, &[]);
    if let Some(c) = cookie {
        ioctl::buf_header_mut(&mut buf).event_nr = c;
    }
    match send(DmCmd::DevRemove, &mut buf) {
        Ok(r) => Ok(r),
        Err(DmError::Ioctl(e)) if e.0 == libc::ENXIO => Err(DmError::NotFound),
        Err(e) => Err(e),
    }
}

/// `DM_DEV_RENAME`: rename a device in place, or (with
/// `DM_UUID_FLAG` set in `flags`) assign a new UUID.
pub fn rename(old_name: &str, new_value: &str, flags: u32) -> Result<Reply> {
    let mut data = new_value.as_bytes().to_vec();
    data.push(0);
    let mut buf = base_buf(old_name, None, flags, &data);
    send(DmCmd::DevRename, &mut buf)
}

/// `DM_DEV_STATUS`: query whether the device exists and its open
/// count/event number/flags, without fetching per-target status.
pub fn info(name: &str) -> Result<Reply> {
    let mut buf = base_buf(name, None, 0, &[]);
    match send(DmCmd::DevStatus, &mut buf) {
        Ok(r) => Ok(r),
        Err(DmError::Ioctl(e)) if e.0 == libc::ENXIO => Err(DmError::NotFound),
        Err(e) => Err(e),
    }
}

/// `DM_TABLE_STATUS`: fetch the active (or inactive, with
/// `DM_QUERY_INACTIVE_TABLE_FLAG`) table's per-target status/params.
pub fn table_status(name: &str, flags: u32) -> Result<Reply> {
    let mut buf = base_buf(name, None, flags, &[]);
    send(DmCmd::TableStatus, &mut buf)
}

/// `DM_TABLE_DEPS`: fetch the active table's backing device
/// dependencies (list of `dev_t`).
pub fn table_deps(name: &str) -> Result<Reply> {
    let mut buf = base_buf(name, None, 0, &[]);
    send(DmCmd::TableDeps, &mut buf)
}

/// `DM_LIST_DEVICES`: enumerate every mapped device.
pub fn list_devices() -> Result<Reply> {
    let mut buf = ioctl::new_buf(4096);
    with_control(|fd| {
        ioctl::run_ioctl(fd, DmCmd::ListDevices, &mut buf)?;
        let header = *ioctl::buf_header(&buf);
        let data_start = header.data_start as usize;
        let data = if data_start > 0 { buf[data_start..].to_vec() } else { Vec::new() };
        Ok(Reply { header, data })
    })
}

/// `DM_TARGET_MSG`: send an in-kernel target message (path group
/// switching, `fail_path`, `@cancel_deferred_remove`, etc).
pub fn target_msg(name: &str, sector: u64, message: &str) -> Result<Reply> {
    let mut data = sector.to_ne_bytes().to_vec();
    data.extend_from_slice(message.as_bytes());
    data.push(0);
    let mut buf = base_buf(name, None, 0, &data);
    send(DmCmd::TargetMsg, &mut buf)
}

/// `DM_DEV_SET_GEOMETRY`: set the legacy CHS geometry + start sector.
pub fn set_geometry(name: &str, cylinders: u32, heads: u32, sectors: u32, start: u64) -> Result<Reply> {
    let geometry = format!("{} {} {} {}", cylinders, heads, sectors, start);
    let mut data = geometry.into_bytes();
    data.push(0);
    let mut buf = base_buf(name, None, 0, &data);
    send(DmCmd::DevSetGeometry, &mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_targets_chains_offsets() {
        let targets = vec![
            Target { start: 0, length: 100, target_type: "multipath".into(), params: "0 1 round-robin".into() },
            Target { start: 100, length: 50, target_type: "linear".into(), params: "8:0 0".into() },
        ];
        let encoded = encode_targets(&targets);
        let spec0 = unsafe { &*(encoded.as_ptr() as *const DmTargetSpec) };
        assert_eq!(spec0.sector_start, 0);
        assert_eq!(spec0.length, 100);
        assert!(spec0.next as usize <= encoded.len());
        assert!(spec0.next > 0);
    }
}
