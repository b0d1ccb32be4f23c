use thiserror::Error;

/// Errors from the bindings store and name allocator.
#[derive(Debug, Error)]
pub enum BindingsError {
    #[error("I/O error on bindings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("alias {alias:?} is already bound to a different WWID")]
    Conflict { alias: String },

    #[error("no more available aliases (id space exhausted)")]
    IdSpaceExhausted,

    #[error("bindings file is read-only, cannot allocate new binding")]
    ReadOnly,

    #[error("alias {0:?} contains '/'")]
    InvalidAlias(String),

    #[error("preferred alias {alias:?} is already bound to WWID {other_wwid:?}")]
    PreferredAliasTaken { alias: String, other_wwid: String },

    #[error("bindings file has unresolved conflicts and cannot be rewritten")]
    UnresolvedConflicts,
}

pub type BindingsResult<T> = std::result::Result<T, BindingsError>;

/// Errors from the device-mapper control surface. Wraps `dm_sys::DmError`
/// with a handful of map-lifecycle-specific variants.
#[derive(Debug, Error)]
pub enum MapError {
    #[error(transparent)]
    Dm(#[from] dm_sys::DmError),

    #[error("WWID must not be empty")]
    EmptyWwid,

    #[error("map {0:?} not found")]
    NotFound(String),

    #[error("map {0:?} is in use")]
    InUse(String),

    #[error("target params or type missing while enumerating table for {0:?}")]
    MalformedTable(String),
}

pub type MapResult<T> = std::result::Result<T, MapError>;
