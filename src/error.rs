use thiserror::Error;

/// Error taxonomy for the storage core.
///
/// Outer layers (query planning, transactions, the remote protocol) define
/// their own error kinds such as `KEY_NOT_FOUND` or `DUPLICATE_KEY`; those
/// never originate here and are not modeled by this enum.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("advisory lock would block")]
    WouldBlock,

    #[error("limits reached: requested size {requested} exceeds limit {limit}")]
    LimitsReached { requested: u64, limit: u64 },

    #[error("operation not implemented for this device variant")]
    NotImplemented,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
