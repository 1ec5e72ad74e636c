//! Error types for EmberKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using EmberError
pub type Result<T> = std::result::Result<T, EmberError>;

/// Unified error type for EmberKV operations
#[derive(Debug, Error)]
pub enum EmberError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Persistence Errors
    // -------------------------------------------------------------------------
    #[error("AOF rewrite failed: {0}")]
    Rewrite(String),

    #[error("Snapshot preamble error: {0}")]
    Snapshot(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("Network error: {0}")]
    Network(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EmberError {
    /// True for decode failures that leave the underlying stream usable
    pub fn is_protocol(&self) -> bool {
        matches!(self, EmberError::Protocol(_))
    }
}
