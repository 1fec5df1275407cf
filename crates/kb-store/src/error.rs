use kb_core::KbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Core(#[from] KbError),

    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The cartridge is degraded after a storage failure.
    #[error("cartridge '{name}' unavailable: {reason}")]
    Unavailable { name: String, reason: String },
}

impl StoreError {
    /// Disk or database failures, as opposed to bad input.
    pub fn is_storage(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Sqlite(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
