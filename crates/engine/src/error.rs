use cellbook_core::AddressError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),

    #[error("Sheet not found: {0}")]
    SheetNotFound(String),

    #[error("A sheet named '{0}' already exists")]
    DuplicateSheetName(String),

    #[error("Invalid sheet name '{name}': {reason}")]
    InvalidSheetName { name: String, reason: String },

    #[error("Merge {requested} overlaps existing merged region {existing}")]
    MergeOverlap { existing: String, requested: String },

    #[error("Cell ({row}, {col}) is outside the grid")]
    OutOfBounds { row: usize, col: usize },

    #[error("Invalid formula '{formula}': {reason}")]
    InvalidFormula { formula: String, reason: String },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("{0}")]
    Precondition(String),

    #[error("Workbook structure is protected: {0}")]
    Protected(String),

    #[error("Incorrect password")]
    WrongPassword,
}

pub type Result<T> = std::result::Result<T, EngineError>;
