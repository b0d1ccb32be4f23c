//! Multipath map lifecycle: create, reload+resume, suspend, resume, and
//! recursively tear down a kernel multipath device.
//!
//! Grounded on `devmapper.c`'s `dm_addmap_create`/`dm_addmap_reload`/
//! `build_udev_flags`/`_dm_flush_map`/`dm_flush_maps`.

use std::thread::sleep;
use std::time::Duration;

use dm_sys::cookie::Cookie;
use dm_sys::error::DmError;
use dm_sys::ioctl::{
    DM_NOFLUSH_FLAG, DM_QUERY_INACTIVE_TABLE_FLAG, DM_READONLY_FLAG, DM_SKIP_LOCKFS_FLAG,
    DM_UDEV_DISABLE_LIBRARY_FALLBACK, MPATH_UDEV_NO_KPARTX_FLAG, MPATH_UDEV_NO_PATHS_FLAG,
    MPATH_UDEV_RELOAD_FLAG,
};
use dm_sys::task::{self, Target};
use log::{debug, warn};

use crate::error::{MapError, MapResult};
use crate::partition;

const MPATH_UUID_PREFIX: &str = "mpath-";
const MULTIPATH_TARGET_TYPE: &str = "multipath";

/// Tri-state deferred-remove status, mirroring the kernel's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredRemove {
    Off,
    On,
    InProgress,
}

/// Mutable descriptor for a multipath map, owned by the caller. The
/// lifecycle functions here only ever advance `deferred_remove` and
/// flip `needs_paths_uevent`; everything else is read-only input.
#[derive(Debug, Clone)]
pub struct MapDescriptor {
    pub wwid: String,
    pub alias: String,
    pub size: u64,
    /// The `multipath` target's params string (path groups, selector,
    /// etc); opaque to this crate beyond the substring checks below.
    pub params: String,
    pub force_readonly: bool,
    pub force_udev_reload: bool,
    pub skip_kpartx: bool,
    pub has_active_or_pending_paths: bool,
    /// Non-zero while this map is in its "ghost" delay window (recently
    /// lost all paths but not yet reported so, to absorb a flapping
    /// path without emitting a spurious no-paths uevent); also forces
    /// `NO_PATHS` the same as having zero active/pending paths.
    pub ghost_delay: u32,
    pub deferred_remove: DeferredRemove,
    pub needs_paths_uevent: bool,
    /// Whether create/reload should block until the udev rule
    /// processing the RESUME's uevent has acknowledged it.
    pub need_sync: bool,
}

impl MapDescriptor {
    pub fn uuid(&self) -> String {
        format!("{MPATH_UUID_PREFIX}{}", self.wwid)
    }
}

/// Compose the udev flag mask for a create/reload, per `build_udev_flags`:
/// `NO_KPARTX` if the caller opted out of partition scanning, `NO_PATHS`
/// if there are no active/pending paths right now (or the map is still
/// in its ghost-delay window), `RELOAD` on a reload unless the caller
/// wants a forced re-emit, and `DISABLE_LIBRARY_FALLBACK` always.
fn build_udev_flags(desc: &MapDescriptor, is_reload: bool) -> u32 {
    let mut flags = DM_UDEV_DISABLE_LIBRARY_FALLBACK;
    if desc.skip_kpartx {
        flags |= MPATH_UDEV_NO_KPARTX_FLAG;
    }
    if !desc.has_active_or_pending_paths || desc.ghost_delay != 0 {
        flags |= MPATH_UDEV_NO_PATHS_FLAG;
    }
    if is_reload && !desc.force_udev_reload {
        flags |= MPATH_UDEV_RELOAD_FLAG;
    }
    flags
}

fn multipath_target(desc: &MapDescriptor) -> Target {
    Target {
        start: 0,
        length: desc.size,
        target_type: MULTIPATH_TARGET_TYPE.to_string(),
        params: desc.params.clone(),
    }
}

fn is_erofs(e: &DmError) -> bool {
    matches!(e, DmError::Ioctl(errno) if errno.0 == libc::EROFS)
}

/// Create a new multipath device and load its initial table. Retries
/// once read-only on `EROFS` unless the caller already forced
/// read-only. On any ultimate failure, the empty device object (if
/// `DEV_CREATE` succeeded but `TABLE_LOAD` didn't) is cleaned up with a
/// best-effort remove.
pub fn create(desc: &mut MapDescriptor) -> MapResult<()> {
    if desc.wwid.is_empty() {
        return Err(MapError::EmptyWwid);
    }

    let uuid = desc.uuid();
    let mut readonly = desc.force_readonly;

    let outcome = try_create(desc, &uuid, readonly);
    let outcome = match outcome {
        Err(e) if is_erofs(&e) && !readonly => {
            warn!("{}: EROFS on create, retrying read-only", desc.alias);
            readonly = true;
            try_create(desc, &uuid, readonly)
        }
        other => other,
    };

    if let Err(e) = &outcome {
        warn!("{}: failed to create map: {e}", desc.alias);
        // DEV_CREATE may have succeeded even though TABLE_LOAD/RESUME
        // didn't; clean up the empty map object so a retry doesn't see
        // a half-created device.
        let _ = task::remove(&desc.alias, 0, None);
    } else {
        desc.needs_paths_uevent = true;
    }

    outcome
}

fn try_create(desc: &MapDescriptor, uuid: &str, readonly: bool) -> MapResult<()> {
    let mut flags = DM_SKIP_LOCKFS_FLAG | DM_NOFLUSH_FLAG;
    if readonly {
        flags |= DM_READONLY_FLAG;
    }
    task::dev_create(&desc.alias, uuid, flags).map_err(MapError::Dm)?;

    let target = multipath_target(desc);
    task::table_load(&desc.alias, std::slice::from_ref(&target), flags).map_err(MapError::Dm)?;

    let udev_flags = build_udev_flags(desc, false);
    let cookie = Cookie::new().map_err(MapError::Dm)?;
    task::resume(&desc.alias, 0, Some(cookie.ioctl_value(udev_flags))).map_err(MapError::Dm)?;
    if desc.need_sync {
        cookie.wait().map_err(MapError::Dm)?;
    }
    Ok(())
}

/// Reload the table on an existing map and resume it. `RELOAD` never
/// carries a udev cookie — only the following `RESUME` does. If resume
/// fails while the device is left suspended with the new table loaded,
/// issue a second resume to force the kernel to drop it and restore the
/// previous table.
pub fn reload_and_resume(desc: &MapDescriptor) -> MapResult<()> {
    let mut readonly = desc.force_readonly;
    let target = multipath_target(desc);

    let mut flags = if readonly { DM_READONLY_FLAG } else { 0 };
    let mut reload = task::table_load(&desc.alias, std::slice::from_ref(&target), flags);
    if let Err(e) = &reload {
        if is_erofs(e) && !readonly {
            warn!("{}: EROFS on reload, retrying read-only", desc.alias);
            readonly = true;
            flags |= DM_READONLY_FLAG;
            reload = task::table_load(&desc.alias, std::slice::from_ref(&target), flags);
        }
    }
    reload.map_err(MapError::Dm)?;

    let udev_flags = build_udev_flags(desc, true);
    let cookie = Cookie::new().map_err(MapError::Dm)?;
    let resumed = task::resume(&desc.alias, 0, Some(cookie.ioctl_value(udev_flags)));
    if resumed.is_err() {
        if let Ok(reply) = task::info(&desc.alias) {
            let suspended = reply.header.flags & dm_sys::ioctl::DM_SUSPEND_FLAG != 0;
            if suspended {
                warn!("{}: resume failed while suspended, forcing resume to drop reload", desc.alias);
                let _ = task::resume(&desc.alias, 0, None);
            }
        }
        return resumed.map(|_| ()).map_err(MapError::Dm);
    }
    if desc.need_sync {
        cookie.wait().map_err(MapError::Dm)?;
    }
    Ok(())
}

pub fn suspend(name: &str, no_flush: bool) -> MapResult<()> {
    let flags = if no_flush { DM_NOFLUSH_FLAG } else { 0 };
    task::suspend(name, flags).map(|_| ()).map_err(|e| match e {
        DmError::NotFound => MapError::NotFound(name.to_string()),
        other => MapError::Dm(other),
    })
}

pub fn resume(name: &str, udev_flags: u32, need_sync: bool) -> MapResult<()> {
    let cookie = Cookie::new().map_err(MapError::Dm)?;
    task::resume(name, 0, Some(cookie.ioctl_value(udev_flags))).map_err(|e| match e {
        DmError::NotFound => MapError::NotFound(name.to_string()),
        other => MapError::Dm(other),
    })?;
    if need_sync {
        cookie.wait().map_err(MapError::Dm)?;
    }
    Ok(())
}

pub fn rename(old_name: &str, new_name: &str) -> MapResult<()> {
    task::rename(old_name, new_name, 0).map(|_| ()).map_err(|e| match e {
        DmError::NotFound => MapError::NotFound(old_name.to_string()),
        other => MapError::Dm(other),
    })
}

/// Outcome of tearing down a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Removed,
    Deferred,
    /// The map no longer existed as a multipath target (already removed
    /// externally); treated as success.
    AlreadyGone,
}

fn table_contains_queue_if_no_path(name: &str) -> bool {
    match task::table_status(name, DM_QUERY_INACTIVE_TABLE_FLAG) {
        Ok(reply) => {
            String::from_utf8_lossy(&reply.data).contains("queue_if_no_path")
        }
        Err(_) => false,
    }
}

/// Recursively tear down a multipath map: remove partition children
/// first, clear `queue_if_no_path` so a stuck remove actually errors
/// instead of hanging, then remove the map itself, retrying transient
/// failures.
///
/// `deferred` requests the kernel defer removal until the last opener
/// closes, and skips the "is any partition in use" refusal. `skip_kpartx`
/// mirrors the descriptor field of the same name. `need_sync` requests
/// blocking until the udev rule has acknowledged the `REMOVE` uevent,
/// once removal actually completes.
pub fn flush_map(
    name: &str,
    deferred: bool,
    skip_kpartx: bool,
    retries: u32,
    need_sync: bool,
) -> MapResult<FlushOutcome> {
    match task::info(name) {
        Ok(_) => {}
        Err(DmError::NotFound) => return Ok(FlushOutcome::AlreadyGone),
        Err(e) => return Err(MapError::Dm(e)),
    }
    if partition::first_target_type(name).as_deref() != Some(MULTIPATH_TARGET_TYPE) {
        return Ok(FlushOutcome::AlreadyGone);
    }

    if !deferred {
        match partition::any_partition_in_use(name) {
            Ok(true) => return Err(MapError::InUse(name.to_string())),
            Ok(false) => {}
            Err(e) => return Err(e),
        }
    }

    // No partitions, or kpartx already disabled for this map, means
    // kpartx has nothing to rescan on this remove; skip the probe and
    // set the flag directly.
    let has_partitions = !partition::partitions_of(name).unwrap_or_default().is_empty();
    let remove_udev_flags = if !has_partitions || skip_kpartx { MPATH_UDEV_NO_KPARTX_FLAG } else { 0 };

    let had_queue_if_no_path = table_contains_queue_if_no_path(name);
    let mut cleared = false;
    if had_queue_if_no_path {
        if task::target_msg(name, 0, "queue_if_no_path 0").is_ok() {
            cleared = true;
        }
    }

    partition::remove_all_partitions(name, deferred)?;

    let flags = if deferred { dm_sys::ioctl::DM_DEFERRED_REMOVE } else { 0 };
    let mut attempt = 0;
    loop {
        let cookie = Cookie::new().map_err(MapError::Dm)?;
        match task::remove(name, flags, Some(cookie.ioctl_value(remove_udev_flags))) {
            Ok(reply) => {
                if deferred && reply.header.flags & dm_sys::ioctl::DM_DEFERRED_REMOVE != 0 {
                    return Ok(FlushOutcome::Deferred);
                }
                if need_sync {
                    cookie.wait().map_err(MapError::Dm)?;
                }
                return Ok(FlushOutcome::Removed);
            }
            Err(DmError::NotFound) => return Ok(FlushOutcome::AlreadyGone),
            Err(e) => {
                match task::info(name) {
                    Err(DmError::NotFound) => return Ok(FlushOutcome::AlreadyGone),
                    Ok(_) if partition::first_target_type(name).as_deref() != Some(MULTIPATH_TARGET_TYPE) => {
                        return Ok(FlushOutcome::AlreadyGone);
                    }
                    _ => {}
                }
                if attempt >= retries {
                    if cleared {
                        warn!("{name}: restoring queue_if_no_path after failed remove");
                        let _ = task::target_msg(name, 0, "queue_if_no_path 1");
                    }
                    return Err(MapError::Dm(e));
                }
                debug!("{name}: remove attempt {attempt} failed, retrying: {e}");
                attempt += 1;
                sleep(Duration::from_secs(1));
            }
        }
    }
}
