//! Error types for the Floodgate engine.

use thiserror::Error;

use crate::plugin::PluginError;
use crate::store::StoreError;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Plugin construction or registry errors
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
