//! Manifest validation errors

use thiserror::Error;

/// First structural problem found in a submitted manifest
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Malformed manifest: {0}")]
    Malformed(String),

    #[error("Application name must not be empty")]
    EmptyName,

    #[error("Manifest is for {found}, expected {expected}")]
    NameMismatch { expected: String, found: String },

    #[error("Component name must not be empty")]
    EmptyComponentName,

    #[error("Duplicate component name: {0}")]
    DuplicateComponent(String),

    #[error("Component {0} does not reference an image")]
    MissingImage(String),

    #[error("Component {0} declares more than one spread scaler")]
    DuplicateScaler(String),

    #[error("Component {component} links to undeclared component {target}")]
    UndeclaredLinkTarget { component: String, target: String },

    #[error("Component {component} declares link {link} more than once")]
    DuplicateLink { component: String, link: String },
}
