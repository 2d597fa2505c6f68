//! Error types for the extraction engine.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Errors raised while opening, reading or writing gridded data.
///
/// Optional pipeline features (time slicing, band filtering) never surface
/// here; they report through [`crate::extract::StageOutcome`] instead.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The dataset could not be opened.
    #[error("failed to open dataset '{path}': {message}")]
    Open { path: PathBuf, message: String },

    /// Reading array data failed.
    #[error("failed to read variable '{variable}': {message}")]
    Read { variable: String, message: String },

    /// A variable referenced by name does not exist.
    #[error("variable '{0}' not found in dataset")]
    MissingVariable(String),

    /// The variable's element type cannot be converted to numbers.
    #[error("variable '{variable}' has unsupported dtype '{dtype}'")]
    UnsupportedDtype { variable: String, dtype: String },

    /// Latitude and longitude arrays cannot be paired.
    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    /// A time variable's `units` attribute is not of the form `<unit> since <date>`.
    #[error("invalid time units '{0}'")]
    InvalidTimeUnits(String),

    /// A caller-supplied parameter is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Writing the spreadsheet output failed.
    #[error("spreadsheet write failed: {0}")]
    Spreadsheet(#[from] rust_xlsxwriter::XlsxError),

    /// Writing delimited text failed.
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),

    /// A batch is already running on this runner.
    #[error("an extraction batch is already running")]
    BatchActive,

    /// The background batch task panicked or was aborted.
    #[error("batch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    pub fn open(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Open {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn read(variable: impl Into<String>, message: impl ToString) -> Self {
        Self::Read {
            variable: variable.into(),
            message: message.to_string(),
        }
    }
}
