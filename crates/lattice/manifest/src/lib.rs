//! Versioned storage of desired-state manifests
//!
//! One history per application. `put` always appends a new version and marks
//! it current; `rollback` only repoints the current pointer. Concurrent
//! writers to the same application name are last-write-wins: each operation
//! is atomic on its own, but nothing orders a `put` against a racing
//! `delete`. Whichever commits last determines the final state.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod store;

pub use error::{ManifestError, Result};
pub use store::{
    DeploymentPhase, DeploymentRecord, InMemoryManifestStore, ManifestStore, VersionInfo,
};
