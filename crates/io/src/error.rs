use cellbook_engine::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("The password is missing or incorrect")]
    WrongPassword,

    #[error("Corrupt file: {0}")]
    CorruptFile(String),

    #[error("Export cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to write file: {0}")]
    Encode(String),
}

impl IoError {
    pub(crate) fn corrupt(reason: impl std::fmt::Display) -> Self {
        IoError::CorruptFile(reason.to_string())
    }

    pub(crate) fn encode(reason: impl std::fmt::Display) -> Self {
        IoError::Encode(reason.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IoError>;
