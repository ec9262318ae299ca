//! Error types for deckbridge.

use thiserror::Error;

use crate::modes::DisplayModeId;

/// Failure reported by the hardware collaborator for a single call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("device is busy or in use by another application")]
    Busy,

    #[error("display mode {0} is not supported")]
    UnsupportedMode(DisplayModeId),

    #[error("operation is invalid in the current device state: {0}")]
    InvalidState(&'static str),

    #[error("failed to allocate a video frame")]
    OutOfMemory,

    #[error("device error: {0}")]
    Other(String),
}

/// Result of a single hardware call.
pub type HardwareResult<T = ()> = std::result::Result<T, HardwareError>;

/// Main error type for deckbridge operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to obtain a video input interface for device `{0}`")]
    NoInputInterface(String),

    #[error("unable to obtain a video output interface for device `{0}`")]
    NoOutputInterface(String),

    #[error("hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("pixel conversion error: {0}")]
    Conversion(String),

    #[error("invalid display mode index {index} (catalog holds {len} modes)")]
    InvalidModeIndex { index: i64, len: usize },

    #[error("display mode {0} not found")]
    ModeNotFound(DisplayModeId),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type alias for deckbridge operations.
pub type Result<T> = std::result::Result<T, Error>;
