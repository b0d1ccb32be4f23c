//! Alias binding and device-mapper control core for multipath storage
//! management.
//!
//! Two subsystems live here: the [`bindings`]/[`alias`]/[`consistency`]
//! modules maintain a persistent, conflict-free mapping between WWIDs
//! and short aliases; [`dm_runner`]/[`map_lifecycle`]/[`partition`]/
//! [`reassign`] drive the kernel device-mapper control surface that
//! turns those aliases into live multipath devices.

pub mod alias;
pub mod bindings;
pub mod consistency;
pub mod dm_runner;
pub mod error;
pub mod map_lifecycle;
pub mod partition;
pub mod reassign;

pub use error::{BindingsError, BindingsResult, MapError, MapResult};
