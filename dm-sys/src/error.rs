use thiserror::Error;

/// Error surface for the device-mapper control plane.
///
/// Mirrors the DMP_OK / DMP_ERR / DMP_NOT_FOUND taxonomy the kernel
/// control path distinguishes, plus the protocol-level failures this
/// crate can detect before ever issuing an ioctl.
#[derive(Debug, Error)]
pub enum DmError {
    #[error("device-mapper ioctl failed: {0}")]
    Ioctl(#[from] errno::Errno),

    #[error("device not found")]
    NotFound,

    #[error("device-mapper control device unavailable: {0}")]
    Io(#[from] std::io::Error),

    #[error("device-mapper kernel driver version {found:?} is older than the required {required:?}")]
    VersionTooOld {
        found: (u32, u32, u32),
        required: (u32, u32, u32),
    },

    #[error("multipath target not registered with the running kernel")]
    TargetMissing,

    #[error("device is in use")]
    MapInUse,

    #[error("device removal deferred until last opener closes")]
    Deferred,

    #[error("malformed kernel reply: {0}")]
    Protocol(&'static str),

    #[error("name {0:?} exceeds DM_NAME_LEN")]
    NameTooLong(String),
}

pub type Result<T> = std::result::Result<T, DmError>;
