//! Udev cookie: a happens-before primitive so a caller can block until
//! the uevent generated by a just-issued kernel transition has been
//! processed by userspace.
//!
//! This is a simplified stand-in for libdevmapper's cookie protocol,
//! which is itself just a thin wrapper over a SysV semaphore shared
//! with udev rules that decrement it once the uevent has been handled.
//! This crate owns only the allocate/wait/release side; the
//! decrementing side lives in an external udev rule, out of scope here
//! (see `DESIGN.md`, Open question 3).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{DmError, Result};

const SEM_UNDO_SEMOP: libc::c_short = libc::SEM_UNDO as libc::c_short;

/// The bit position at which udev flags are packed above the cookie's
/// own low 16 bits when both travel together in `event_nr`.
pub const DM_UDEV_FLAGS_SHIFT: u32 = 16;

/// An allocated udev synchronization point: occupies the low 16 bits of
/// the `event_nr` the kernel carries on `RESUME`/`REMOVE`. Udev flags
/// (`MPATH_UDEV_*`) occupy the high 16 bits and travel alongside it, see
/// [`Cookie::ioctl_value`].
pub struct Cookie {
    semid: i32,
    base: u32,
}

static NEXT_BASE: AtomicU32 = AtomicU32::new(1);

impl Cookie {
    /// Allocate a fresh one-member semaphore set, initialized to zero
    /// (no outstanding uevents).
    pub fn new() -> Result<Self> {
        let semid = unsafe { libc::semget(libc::IPC_PRIVATE, 1, 0o600 | libc::IPC_CREAT) };
        if semid < 0 {
            return Err(DmError::Io(std::io::Error::last_os_error()));
        }
        let base = NEXT_BASE.fetch_add(1, Ordering::Relaxed) & 0xffff;
        Ok(Cookie { semid, base })
    }

    /// The bare cookie value, with no udev flags attached.
    pub fn value(&self) -> u32 {
        self.base
    }

    /// The value to pass to the kernel as `event_nr`, combining this
    /// cookie's id with a set of `MPATH_UDEV_*`/`DM_UDEV_*` flags in the
    /// high bits, so the flags never alias the unrelated bits of
    /// `dm_ioctl.flags`.
    pub fn ioctl_value(&self, udev_flags: u32) -> u32 {
        self.base | (udev_flags << DM_UDEV_FLAGS_SHIFT)
    }

    /// Signal one outstanding uevent (called by the udev-rule side; kept
    /// here only to exercise the allocate/wait pair in tests, since this
    /// crate does not install the real udev rule).
    pub fn signal(&self) -> Result<()> {
        self.semop(1)
    }

    /// Block until the semaphore returns to zero, i.e. until every
    /// outstanding uevent tied to this cookie has been acknowledged.
    pub fn wait(&self) -> Result<()> {
        let op = libc::sembuf {
            sem_num: 0,
            sem_op: 0,
            sem_flg: 0,
        };
        let ret = unsafe { libc::semop(self.semid, &op as *const _ as *mut _, 1) };
        if ret < 0 {
            return Err(DmError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn semop(&self, delta: libc::c_short) -> Result<()> {
        let op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: SEM_UNDO_SEMOP,
        };
        let ret = unsafe { libc::semop(self.semid, &op as *const _ as *mut _, 1) };
        if ret < 0 {
            return Err(DmError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Cookie {
    fn drop(&mut self) {
        unsafe {
            libc::semctl(self.semid, 0, libc::IPC_RMID);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn signal_then_wait_returns() {
        let cookie = Cookie::new().unwrap();
        cookie.signal().unwrap();
        cookie.wait().unwrap();
    }

    #[test]
    fn wait_blocks_until_signaled() {
        let cookie = Cookie::new().unwrap();
        cookie.signal().unwrap();
        let semid = cookie.semid;
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let op = libc::sembuf { sem_num: 0, sem_op: -1, sem_flg: 0 };
            unsafe { libc::semop(semid, &op as *const _ as *mut _, 1) };
        });
        cookie.wait().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn distinct_cookies_get_distinct_values() {
        let a = Cookie::new().unwrap();
        let b = Cookie::new().unwrap();
        assert_ne!(a.value(), b.value());
    }
}
