//! Log-level mapping and verbosity filter, standing in for
//! libdevmapper's log-callback registration.
//!
//! Grounded on `devmapper.c`'s `dm_write_log`/`dm_init`: libdm's
//! syslog-style levels are capped at `LOG_DEBUG`, dropped entirely above
//! a configured verbosity floor, and otherwise routed onto the host's
//! logging facility (`condlog` there, the `log` crate here).

use std::sync::atomic::{AtomicI32, Ordering};

pub const LOG_ERR: i32 = 3;
pub const LOG_WARNING: i32 = 4;
pub const LOG_NOTICE: i32 = 5;
pub const LOG_DEBUG: i32 = 7;

static VERBOSITY: AtomicI32 = AtomicI32::new(LOG_WARNING);

/// Set the verbosity floor for `dm_log`; levels numerically above it are
/// dropped. Mirrors `dm_init`'s `dm_conf_verbosity = v + 2` offset from
/// the caller's own verbosity knob.
pub fn set_verbosity(v: i32) {
    VERBOSITY.store(v + 2, Ordering::Relaxed);
}

/// Route one ioctl-runner log line onto the host's `log` crate, capping
/// the level at `LOG_DEBUG` and dropping it entirely above the
/// configured verbosity, the way `dm_write_log` does before handing off
/// to `condlog`.
pub fn dm_log(level: i32, message: &str) {
    let level = level.min(LOG_DEBUG);
    if level > VERBOSITY.load(Ordering::Relaxed) {
        return;
    }
    if level <= LOG_ERR {
        log::error!("{message}");
    } else if level == LOG_WARNING {
        log::warn!("{message}");
    } else if level == LOG_NOTICE {
        log::info!("{message}");
    } else {
        log::debug!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_above_debug_is_capped() {
        set_verbosity(100);
        dm_log(99, "capped to debug, not dropped");
    }

    #[test]
    fn level_above_verbosity_is_dropped() {
        set_verbosity(LOG_WARNING - 2);
        dm_log(LOG_NOTICE, "should be dropped, not visible in captured output");
    }
}
