//! Dispatch error types

use lattice_types::CommandHandle;
use thiserror::Error;

/// Failure reported by a command transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The command may succeed if sent again
    #[error("Transient transport failure: {0}")]
    Transient(String),

    /// The transport is gone; the engine cannot dispatch at all
    #[error("Transport unavailable: {0}")]
    Fatal(String),
}

/// Dispatcher errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown command handle: {0}")]
    UnknownHandle(CommandHandle),

    #[error("Command transport failed: {0}")]
    Transport(#[from] SinkError),
}

impl DispatchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Transport(SinkError::Fatal(_)))
    }
}

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;
