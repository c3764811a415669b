//! Manifest store error types

use lattice_types::{AppName, ValidationError};
use thiserror::Error;

/// Manifest store errors
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Application not found: {0}")]
    NotFound(AppName),

    #[error("Version {version} not found for application {app}")]
    VersionNotFound { app: AppName, version: String },

    #[error("Version {version} already exists for application {app}")]
    DuplicateVersion { app: AppName, version: String },

    #[error("Invalid manifest: {0}")]
    Validation(#[from] ValidationError),

    #[error("Manifest store unavailable: {0}")]
    Unavailable(String),
}

impl ManifestError {
    /// Store unavailability cannot be retried away by the core
    pub fn is_fatal(&self) -> bool {
        matches!(self, ManifestError::Unavailable(_))
    }
}

/// Result type for manifest store operations
pub type Result<T> = std::result::Result<T, ManifestError>;
