use thiserror::Error;

#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Security check failed")]
    InvalidToken,

    #[error("A bulk offload run is already in progress")]
    AlreadyRunning,

    #[error("Storage error for {key}: {message}")]
    Storage { key: String, message: String },

    #[error("Catalog error: {0}")]
    Catalog(String),
}

impl From<serde_cbor::Error> for OffloadError {
    fn from(e: serde_cbor::Error) -> Self {
        OffloadError::Codec(e.to_string())
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, OffloadError>;
