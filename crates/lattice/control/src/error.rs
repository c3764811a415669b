//! Error types for the reconciliation engine

use lattice_dispatch::DispatchError;
use lattice_manifest::ManifestError;
use lattice_types::{AppName, LatticeId, ValidationError};
use thiserror::Error;

/// Coordinator error type
#[derive(Debug, Error)]
pub enum ControlError {
    /// Manifest store error, including validation and lookups
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Command dispatch error
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// The application belongs to another engine's partition
    #[error("Application {app} is not assigned to engine {engine}")]
    NotAssigned { app: AppName, engine: String },

    /// The application is already deployed to a different lattice
    #[error("Application {app} is already deployed to lattice {lattice}")]
    AlreadyDeployed { app: AppName, lattice: LatticeId },

    #[error("Application {0} is not deployed")]
    NotDeployed(AppName),

    /// The engine stopped acting after a fatal condition
    #[error("Engine unhealthy: {0}")]
    Unhealthy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

impl From<ValidationError> for ControlError {
    fn from(err: ValidationError) -> Self {
        ControlError::Manifest(ManifestError::Validation(err))
    }
}

impl From<config::ConfigError> for ControlError {
    fn from(err: config::ConfigError) -> Self {
        ControlError::Config(err.to_string())
    }
}

impl ControlError {
    /// Conditions that make the engine stop acting until recovered
    pub fn is_fatal(&self) -> bool {
        match self {
            ControlError::Manifest(e) => e.is_fatal(),
            ControlError::Dispatch(e) => e.is_fatal(),
            ControlError::Unhealthy(_) => true,
            _ => false,
        }
    }

    /// The first structural problem, when the error is a rejected manifest
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            ControlError::Manifest(ManifestError::Validation(e)) => Some(e),
            _ => None,
        }
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, ControlError>;
