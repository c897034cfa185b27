//! Error types for Tessera

use thiserror::Error;

use crate::dtype::DType;

/// Result type alias using Tessera's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classes used to decide how a process terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Static configuration problem, detected before any device work.
    Configuration,
    /// Unsupported precision combination or invalid scale factor.
    Precision,
    /// Failure while executing work on a device.
    DeviceExecution,
    /// A collective or point-to-point transfer failed.
    Communication,
    /// Host-side I/O or parsing failure.
    Io,
}

/// Main error type for Tessera operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing tensor: '{0}'")]
    MissingKey(String),

    #[error("Dtype mismatch for '{key}': expected {expected}, got {got}")]
    TypeMismatch {
        key: String,
        expected: DType,
        got: DType,
    },

    #[error("Shape mismatch for '{key}': expected {expected}, got {got:?}")]
    ShapeMismatch {
        key: String,
        expected: String,
        got: Vec<usize>,
    },

    #[error("Conflicting decode mode: {0}")]
    ConflictingDecodeMode(String),

    #[error("total_output_len ({total}) should be <= max_seq_len ({max_seq_len})")]
    SequenceTooLong { total: usize, max_seq_len: usize },

    #[error("Weight layout error: {0}")]
    LayoutState(String),

    #[error("Precision error: {0}")]
    Precision(String),

    #[error("Device execution error: {0}")]
    DeviceExecution(String),

    #[error("Communication error: {0}")]
    Comm(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify this error according to the failure taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTopology(_)
            | Self::InvalidConfig(_)
            | Self::MissingKey(_)
            | Self::TypeMismatch { .. }
            | Self::ShapeMismatch { .. }
            | Self::ConflictingDecodeMode(_)
            | Self::SequenceTooLong { .. }
            | Self::LayoutState(_) => ErrorKind::Configuration,
            Self::Precision(_) => ErrorKind::Precision,
            Self::DeviceExecution(_) => ErrorKind::DeviceExecution,
            Self::Comm(_) => ErrorKind::Communication,
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
        }
    }

    /// Nonzero process exit status for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Configuration => 2,
            ErrorKind::Precision => 3,
            ErrorKind::DeviceExecution => 4,
            ErrorKind::Communication => 5,
            ErrorKind::Io => 1,
        }
    }

    /// Whether this error was raised by static validation.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}
