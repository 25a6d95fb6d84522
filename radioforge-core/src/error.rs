//! Error taxonomy for the engine.
//!
//! Transport-level command failures are captured into [`crate::transport::CommandOutcome`]
//! values rather than surfaced here; `CoreError` covers the structured
//! failures callers are expected to branch on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// No device responded on the requested transport.
    #[error("no device found")]
    DeviceNotFound,

    /// More than one device is attached and no device id was supplied.
    /// Acting on an arbitrary device during a destructive operation is a
    /// safety defect, so this is always an error.
    #[error("{0} devices attached and no device id given; specify one")]
    DeviceAmbiguous(usize),

    /// The underlying command execution failed outright.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A downloaded artifact did not match its declared digest.
    #[error("checksum mismatch ({algorithm}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: &'static str,
        expected: String,
        actual: String,
    },

    /// The current firmware could not be backed up, typically for lack of
    /// elevated access. Non-fatal unless the caller required a backup.
    #[error("backup unavailable: {0}")]
    BackupUnavailable(String),

    /// The compatibility evaluator rejected the requested image.
    #[error("incompatible firmware: {0}")]
    IncompatibleFirmware(String),

    /// A non-terminal flash session already exists for the device.
    #[error("a flash session is already active for device {0}")]
    SessionAlreadyActive(String),

    /// A required parameter is missing or malformed. Rejected before any
    /// device interaction.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A network fetch failed after its bounded retries.
    #[error("download failed: {0}")]
    Download(String),

    /// The post-flash confirmation read did not report the expected version.
    #[error("flash not confirmed: {0}")]
    ConfirmFailed(String),

    /// A flash stage exceeded its timeout and the session was terminated.
    #[error("{0} stage timed out")]
    StageTimeout(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
