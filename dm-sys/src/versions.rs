//! One-shot version discovery and compatibility floors.
//!
//! Grounded on `devmapper.c`'s `_init_versions`/`dm_prereq`/
//! `dm_tgt_prereq`: the kernel driver version and the registered
//! `multipath` target version are each queried once per process and
//! cached, with a hard floor on the target version below which the
//! subsystem refuses to operate.

use std::os::unix::io::BorrowedFd;
use std::sync::OnceLock;

use crate::error::{DmError, Result};
use crate::ioctl::{self, DmCmd};

/// Lowest `multipath` target version this crate will operate against.
pub const MULTIPATH_TARGET_FLOOR: (u32, u32, u32) = (1, 0, 3);

/// Lowest kernel device-mapper driver version this crate's wire format
/// speaks. Below this, the ABI this crate hand-writes (see `ioctl.rs`)
/// is not guaranteed to be understood by the kernel.
pub const DRIVER_VERSION_FLOOR: (u32, u32, u32) = (4, 0, 0);

static DRIVER_VERSION: OnceLock<(u32, u32, u32)> = OnceLock::new();
static MULTIPATH_TARGET_VERSION: OnceLock<Option<(u32, u32, u32)>> = OnceLock::new();

pub fn driver_version(fd: BorrowedFd<'_>) -> Result<(u32, u32, u32)> {
    if let Some(v) = DRIVER_VERSION.get() {
        return Ok(*v);
    }
    let mut buf = ioctl::new_buf(0);
    ioctl::run_ioctl(fd, DmCmd::Version, &mut buf)?;
    let header = ioctl::buf_header(&buf);
    let v = (header.version[0], header.version[1], header.version[2]);
    Ok(*DRIVER_VERSION.get_or_init(|| v))
}

/// Refuse to proceed if the running kernel driver is older than the
/// compile-time floor this crate's wire format requires.
pub fn check_driver_floor(found: (u32, u32, u32)) -> Result<(u32, u32, u32)> {
    if found < DRIVER_VERSION_FLOOR {
        Err(DmError::VersionTooOld { found, required: DRIVER_VERSION_FLOOR })
    } else {
        Ok(found)
    }
}

/// Enumerate registered targets via `DM_LIST_VERSIONS` and return the
/// cached `multipath` target version, if the target is registered.
pub fn multipath_target_version(fd: BorrowedFd<'_>) -> Result<Option<(u32, u32, u32)>> {
    if let Some(v) = MULTIPATH_TARGET_VERSION.get() {
        return Ok(*v);
    }
    let mut buf = ioctl::new_buf(4096);
    ioctl::run_ioctl(fd, DmCmd::ListVersions, &mut buf)?;
    let found = parse_target_versions(&buf)?;
    Ok(*MULTIPATH_TARGET_VERSION.get_or_init(|| found))
}

fn parse_target_versions(buf: &[u8]) -> Result<Option<(u32, u32, u32)>> {
    let header = ioctl::buf_header(buf);
    let data_start = header.data_start as usize;
    if header.data_size == 0 || data_start == 0 {
        return Ok(None);
    }
    let mut offset = data_start;
    loop {
        if offset + 16 > buf.len() {
            return Err(DmError::Protocol("truncated dm_target_versions entry"));
        }
        let next = u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap());
        let version = [
            u32::from_ne_bytes(buf[offset + 4..offset + 8].try_into().unwrap()),
            u32::from_ne_bytes(buf[offset + 8..offset + 12].try_into().unwrap()),
            u32::from_ne_bytes(buf[offset + 12..offset + 16].try_into().unwrap()),
        ];
        let name_start = offset + 16;
        let name_end = buf[name_start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| name_start + p)
            .ok_or(DmError::Protocol("unterminated target name"))?;
        let name = String::from_utf8_lossy(&buf[name_start..name_end]);
        if name == "multipath" {
            return Ok(Some((version[0], version[1], version[2])));
        }
        if next == 0 {
            return Ok(None);
        }
        offset += next as usize;
    }
}

/// Refuse to proceed if the running multipath target is older than the
/// floor this crate supports.
pub fn check_target_floor(found: Option<(u32, u32, u32)>) -> Result<(u32, u32, u32)> {
    match found {
        None => Err(DmError::TargetMissing),
        Some(v) if v < MULTIPATH_TARGET_FLOOR => Err(DmError::VersionTooOld {
            found: v,
            required: MULTIPATH_TARGET_FLOOR,
        }),
        Some(v) => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_rejects_older_patch() {
        let err = check_target_floor(Some((1, 0, 2))).unwrap_err();
        assert!(matches!(err, DmError::VersionTooOld { .. }));
    }

    #[test]
    fn floor_accepts_equal_version() {
        assert_eq!(check_target_floor(Some((1, 0, 3))).unwrap(), (1, 0, 3));
    }

    #[test]
    fn floor_rejects_missing_target() {
        assert!(matches!(check_target_floor(None), Err(DmError::TargetMissing)));
    }

    #[test]
    fn driver_floor_rejects_older_major() {
        let err = check_driver_floor((3, 9, 9)).unwrap_err();
        assert!(matches!(err, DmError::VersionTooOld { .. }));
    }

    #[test]
    fn driver_floor_accepts_equal_version() {
        assert_eq!(check_driver_floor(DRIVER_VERSION_FLOOR).unwrap(), DRIVER_VERSION_FLOOR);
    }
}
