//! Partition sweeper: enumerate, remove, rename, and cancel deferred
//! removal for the partition-map children of a multipath device.
//!
//! Grounded on `devmapper.c`'s `do_foreach_partmaps`/`remove_partmap`/
//! `rename_partmap`/`cancel_remove_partmap`. The original detects a
//! partition by `strstr`-ing the parent UUID anywhere in the child's
//! UUID; this crate instead requires a strict `part<N>-<parent_uuid>`
//! prefix match (see `DESIGN.md`, Open question 2), reusing the same
//! strict-parse approach already used elsewhere in this codebase for
//! multipath UUID detection.

use std::mem;

use dm_sys::error::DmError;
use dm_sys::ioctl::DmNameList;
use dm_sys::task;
use log::{debug, warn};

use crate::error::MapError;

const LINEAR_TARGET_TYPE: &str = "linear";

/// If `child_uuid` is a partition of `parent_uuid` (i.e.
/// `part<N>-<parent_uuid>`), return the partition number `N`.
fn partition_number_of(child_uuid: &str, parent_uuid: &str) -> Option<u32> {
    let rest = child_uuid.strip_prefix("part")?;
    let digits_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits_len == 0 {
        return None;
    }
    let (digits, rest) = rest.split_at(digits_len);
    let rest = rest.strip_prefix('-')?;
    if rest != parent_uuid {
        return None;
    }
    digits.parse().ok()
}

fn major_minor(dev: u64) -> (u32, u32) {
    let major = unsafe { libc::major(dev as libc::dev_t) };
    let minor = unsafe { libc::minor(dev as libc::dev_t) };
    (major as u32, minor as u32)
}

fn list_device_names() -> Result<Vec<(String, u64)>, DmError> {
    let reply = task::list_devices()?;
    let mut out = Vec::new();
    let data = &reply.data;
    let mut offset = 0usize;
    loop {
        if offset + mem::size_of::<DmNameList>() > data.len() {
            break;
        }
        let entry = unsafe { &*(data[offset..].as_ptr() as *const DmNameList) };
        let name_start = offset + mem::size_of::<DmNameList>();
        let name_end = data[name_start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| name_start + p)
            .unwrap_or(data.len());
        let name = String::from_utf8_lossy(&data[name_start..name_end]).into_owned();
        out.push((name, entry.dev));
        if entry.next == 0 {
            break;
        }
        offset += entry.next as usize;
    }
    Ok(out)
}

pub(crate) fn first_target_type(name: &str) -> Option<String> {
    let reply = task::table_status(name, 0).ok()?;
    if reply.header.target_count == 0 {
        return None;
    }
    let spec = unsafe { &*(reply.data.as_ptr() as *const dm_sys::ioctl::DmTargetSpec) };
    let end = spec.target_type.iter().position(|&b| b == 0).unwrap_or(spec.target_type.len());
    Some(String::from_utf8_lossy(&spec.target_type[..end]).into_owned())
}

fn depends_on(child_name: &str, parent_major: u32, parent_minor: u32) -> bool {
    let Ok(reply) = task::table_deps(child_name) else { return false };
    let needle = format!("{parent_major}:{parent_minor}");
    let text = String::from_utf8_lossy(&reply.data);
    if let Some(pos) = text.find(&needle) {
        let after = pos + needle.len();
        return text.as_bytes().get(after).map_or(true, |b| !b.is_ascii_digit());
    }
    false
}

/// Enumerate every partition-map child of `parent_name`: devices whose
/// UUID is `part<N>-<parent_uuid>`, whose target type is `linear`, and
/// whose table depends on the parent's `major:minor`.
pub fn partitions_of(parent_name: &str) -> Result<Vec<String>, MapError> {
    let parent_info = task::info(parent_name).map_err(MapError::Dm)?;
    let parent_uuid = parent_info.header.uuid();
    let (parent_major, parent_minor) = major_minor(parent_info.header.dev);

    let devices = list_device_names().map_err(MapError::Dm)?;
    let mut partitions = Vec::new();
    for (name, _dev) in devices {
        if name == parent_name {
            continue;
        }
        let Ok(info) = task::info(&name) else { continue };
        let uuid = info.header.uuid();
        if partition_number_of(&uuid, &parent_uuid).is_none() {
            continue;
        }
        if first_target_type(&name).as_deref() != Some(LINEAR_TARGET_TYPE) {
            continue;
        }
        if !depends_on(&name, parent_major, parent_minor) {
            continue;
        }
        partitions.push(name);
    }
    Ok(partitions)
}

pub fn any_partition_in_use(parent_name: &str) -> Result<bool, MapError> {
    for child in partitions_of(parent_name)? {
        let info = task::info(&child).map_err(MapError::Dm)?;
        if info.header.open_count > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Recursively remove every partition of `parent_name` (partitions of
/// partitions are possible), then return. Does not remove `parent_name`
/// itself.
pub fn remove_all_partitions(parent_name: &str, deferred: bool) -> Result<(), MapError> {
    for child in partitions_of(parent_name)? {
        remove_all_partitions(&child, deferred)?;
        let flags = if deferred { dm_sys::ioctl::DM_DEFERRED_REMOVE } else { 0 };
        match task::remove(&child, flags, None) {
            Ok(_) | Err(DmError::NotFound) => {}
            Err(e) => {
                if !deferred {
                    let info = task::info(&child).map_err(MapError::Dm)?;
                    if info.header.open_count > 0 {
                        return Err(MapError::InUse(child));
                    }
                }
                return Err(MapError::Dm(e));
            }
        }
        debug!("removed partition map {child}");
    }
    Ok(())
}

/// Rename every partition of `old_name` to the corresponding suffix
/// under `new_name`. `delim` defaults to `"p"` when `new_name` ends in a
/// digit (so e.g. `mpath0` + partition `1` becomes `mpath0p1`, avoiding
/// ambiguity with `mpath01`), and `""` otherwise.
pub fn rename_all_partitions(old_name: &str, new_name: &str, delim: Option<&str>) -> Result<(), MapError> {
    let delim = delim.unwrap_or_else(|| {
        if new_name.chars().last().is_some_and(|c| c.is_ascii_digit()) {
            "p"
        } else {
            ""
        }
    });
    for child in partitions_of(old_name)? {
        let Some(suffix) = digit_suffix_after(&child, old_name) else {
            warn!("partition {child} has no digit suffix after parent {old_name}, skipping rename");
            continue;
        };
        let new_child = format!("{new_name}{delim}{suffix}");
        task::rename(&child, &new_child, 0).map_err(MapError::Dm)?;
        debug!("renamed partition map {child} -> {new_child}");
    }
    Ok(())
}

/// The partition-number suffix of `child`, starting at the first digit
/// after `old_name` rather than at whatever immediately follows it
/// (which may be an existing delimiter, e.g. `"p"` in `"mpath0p1"`).
/// Returns `None` if `child` doesn't start with `old_name`, or has no
/// digit after it.
fn digit_suffix_after<'a>(child: &'a str, old_name: &str) -> Option<&'a str> {
    let after_old = child.strip_prefix(old_name)?;
    let digit_start = after_old.find(|c: char| c.is_ascii_digit())?;
    Some(&after_old[digit_start..])
}

/// Recursively cancel a deferred remove on every partition, then on the
/// parent itself, via the `@cancel_deferred_remove` target message.
pub fn cancel_deferred_remove_all(parent_name: &str) -> Result<(), MapError> {
    for child in partitions_of(parent_name)? {
        cancel_deferred_remove_all(&child)?;
    }
    task::target_msg(parent_name, 0, "@cancel_deferred_remove").map_err(MapError::Dm)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_number_matches_simple_case() {
        assert_eq!(partition_number_of("part1-mpath-abc", "mpath-abc"), Some(1));
        assert_eq!(partition_number_of("part12-mpath-abc", "mpath-abc"), Some(12));
    }

    #[test]
    fn partition_number_rejects_non_matches() {
        assert_eq!(partition_number_of("mpath-abc", "mpath-abc"), None);
        assert_eq!(partition_number_of("part1-mpath-xyz", "mpath-abc"), None);
        assert_eq!(partition_number_of("part-mpath-abc", "mpath-abc"), None);
        assert_eq!(partition_number_of("part1mpath-abc", "mpath-abc"), None);
    }

    #[test]
    fn partition_number_does_not_substring_match() {
        // A parent uuid occurring only as a substring (not immediately
        // after "partN-") must not match; this is the behavior change
        // from the original's strstr-based check.
        assert_eq!(
            partition_number_of("part1-other-mpath-abc", "mpath-abc"),
            None
        );
    }

    #[test]
    fn digit_suffix_skips_existing_delimiter() {
        // "mpath0" + partition "1" -> child "mpath0p1"; the suffix must
        // be "1", not "p1" (which would double up the new delimiter).
        assert_eq!(digit_suffix_after("mpath0p1", "mpath0"), Some("1"));
        assert_eq!(digit_suffix_after("mpath0p12", "mpath0"), Some("12"));
    }

    #[test]
    fn digit_suffix_rejects_non_matches() {
        assert_eq!(digit_suffix_after("other0p1", "mpath0"), None);
        assert_eq!(digit_suffix_after("mpath0p", "mpath0"), None);
    }
}
