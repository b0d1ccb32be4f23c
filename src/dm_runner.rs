//! One-shot device-mapper subsystem initialization.
//!
//! Grounded on `devmapper.c`'s `dm_init`/`libmp_dm_init`/`init_versions`/
//! `dm_write_log`: query kernel driver and target versions exactly once
//! per process, refuse to proceed if either is too old, and configure
//! the `dm_sys::logging` level-mapping/verbosity filter that stands in
//! for libdevmapper's log-callback registration (`dm_log_init`).

use std::sync::OnceLock;

use dm_sys::task::with_control;
use dm_sys::versions::{
    check_driver_floor, check_target_floor, driver_version, multipath_target_version,
    DRIVER_VERSION_FLOOR, MULTIPATH_TARGET_FLOOR,
};
use dm_sys::DmError;
use log::info;

static INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Run one-shot version discovery and floor checks, at the given
/// caller-side verbosity (passed through to `dm_sys::logging`, offset
/// the same way `dm_init`'s `dm_conf_verbosity = v + 2` offsets it from
/// the host program's own verbosity knob). Safe to call from every
/// entry point; the actual work runs at most once per process.
/// Callers that have already verified a compatible kernel out-of-band
/// (e.g. a long-lived daemon calling in from multiple subsystems) may
/// skip this by calling map-lifecycle functions directly — this is not
/// a hard gate, just the one-time self-check this crate performs on its
/// own behalf.
pub fn ensure_init(verbosity: i32) -> Result<(), DmError> {
    let result = INIT.get_or_init(|| {
        dm_sys::logging::set_verbosity(verbosity);
        let outcome = with_control(|fd| {
            let driver = driver_version(fd)?;
            let driver = check_driver_floor(driver)?;
            let target = multipath_target_version(fd)?;
            let target = check_target_floor(target)?;
            info!(
                "device-mapper driver version {}.{}.{} (floor {}.{}.{}), multipath target version {}.{}.{} (floor {}.{}.{})",
                driver.0, driver.1, driver.2,
                DRIVER_VERSION_FLOOR.0, DRIVER_VERSION_FLOOR.1, DRIVER_VERSION_FLOOR.2,
                target.0, target.1, target.2,
                MULTIPATH_TARGET_FLOOR.0, MULTIPATH_TARGET_FLOOR.1, MULTIPATH_TARGET_FLOOR.2,
            );
            Ok(())
        });
        outcome.map_err(|e: DmError| e.to_string())
    });
    result.clone().map_err(|_| {
        // Re-derive a live error rather than stashing a `DmError` (which
        // isn't `Clone`) in the cache.
        DmError::Protocol("device-mapper subsystem failed one-shot initialization")
    })
}
