//! Core types for the lattice reconciliation engine
//!
//! This crate defines the vocabulary shared by every other lattice crate:
//! - Strongly-typed identifiers for lattices, hosts, applications and instances
//! - The desired-state [`Manifest`] model with its structural validation
//! - Observed lifecycle events ([`LatticeEvent`]) folded by the projector
//! - [`RequiredAction`]s derived by the scaler and the [`Command`]s that carry them
//! - Control plane observability events

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod action;
pub mod command;
pub mod error;
pub mod events;
pub mod ids;
pub mod lattice;
pub mod manifest;

pub use action::{ActionKind, RequiredAction};
pub use command::{AckResult, Command, CommandAck, FailureReport};
pub use error::ValidationError;
pub use events::{ControlEvent, ControlEventEnvelope, EventSeverity, EventSource};
pub use ids::{AppName, CommandHandle, ComponentId, HostId, IdempotencyKey, InstanceId, LatticeId};
pub use lattice::{
    ActiveLink, InstanceStatus, LatticeEvent, LatticeEventKind, LinkKey, MANAGED_BY_ANNOTATION,
};
pub use manifest::{
    Component, ComponentKind, LinkDefinition, LinkTarget, Manifest, ManifestSummary, SpreadScaler,
    Trait, WeightedTarget,
};

/// Label requirements or annotations, ordered for deterministic output
pub type Labels = std::collections::BTreeMap<String, String>;
