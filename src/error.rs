// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-intervene.

/// Errors that can occur while installing or running interventions.
#[derive(Debug, thiserror::Error)]
pub enum InterveneError {
    /// Tensor operation failure inside a transform or forward pass (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// The model does not expose the expected layer/sub-component shape.
    #[error("structural mismatch: {0}")]
    StructuralMismatch(String),

    /// Malformed hook payload.
    #[error("hook error: {0}")]
    Hook(String),

    /// Session lifecycle misuse (e.g. entering an already active session).
    #[error("session error: {0}")]
    Session(String),

    /// Intervention configuration parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-intervene operations.
pub type Result<T> = std::result::Result<T, InterveneError>;
