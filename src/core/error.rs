use crate::core::device::InstallStatus;
use thiserror::Error;

/// Failures while indexing or reading a package archive.
///
/// Always fatal to the current deployment attempt.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive too short: {len} bytes (minimum 22)")]
    TooShort { len: u64 },

    #[error("End of central directory not found within {scanned} bytes of the tail")]
    EndOfDirectoryNotFound { scanned: usize },

    #[error("Invalid central directory signature at offset {offset}")]
    InvalidCentralDirectory { offset: u64 },

    #[error("Read of {len} bytes at offset {offset} is out of bounds (archive is {size} bytes)")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Invalid local header for entry '{0}'")]
    InvalidLocalHeader(String),

    #[error("Duplicate entry name in central directory: {0}")]
    DuplicateEntry(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Unsupported compression method {method} for entry '{entry}'")]
    UnsupportedCompression { entry: String, method: u16 },

    #[error("CRC mismatch for entry '{entry}': directory {expected:08x}, data {actual:08x}")]
    CrcMismatch {
        entry: String,
        expected: u32,
        actual: u32,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cache storage failures. Never fatal: the cache reports a miss instead.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache record encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// Transport-level device failures, distinct from package-manager outcomes.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device bridge rejected request '{request}': {reason}")]
    Rejected { request: String, reason: String },

    #[error("Device operation timed out: {0}")]
    Timeout(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl DeviceError {
    /// Map I/O timeouts onto the dedicated variant.
    pub(crate) fn from_io(op: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                DeviceError::Timeout(format!("{}: {}", op, err))
            }
            _ => DeviceError::Io(err),
        }
    }
}

/// Live redefinition failures. The target process is left untouched.
#[derive(Error, Debug)]
pub enum RedefineError {
    #[error("Timed out attaching to {endpoint} after {timeout_ms}ms")]
    AttachTimeout { endpoint: String, timeout_ms: u64 },

    #[error("Failed to attach to {endpoint}: {reason}")]
    Attach { endpoint: String, reason: String },

    #[error("Stale agent resident: recorded checksum {recorded:08x}, current agent {current:08x}")]
    StaleAgent { recorded: u32, current: u32 },

    #[error("Unit '{0}' is not loaded in the target process")]
    UnresolvedUnit(String),

    #[error("Redefinition rejected by target: {0}")]
    Rejected(String),

    #[error("Debugger transport error: {0}")]
    Transport(String),
}

/// Umbrella error for deployment attempts.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Redefine error: {0}")]
    Redefine(#[from] RedefineError),

    #[error("Install failed with {status:?}: {message}")]
    Install {
        status: InstallStatus,
        message: String,
    },

    #[error("Failed to split entry '{entry}': {reason}")]
    Split { entry: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Task error: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, DeployError>;
