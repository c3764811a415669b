//! # Lattice Control
//!
//! The reconciliation control loop of a declarative lattice control plane.
//!
//! ## Overview
//!
//! Operators submit versioned manifests and deploy them to a lattice. The
//! [`Coordinator`] keeps one actor per deployed (lattice, application) pair.
//! Each actor evaluates the current manifest against the projected observed
//! state whenever it is triggered, and hands the resulting actions to the
//! command dispatcher:
//!
//! ```text
//! manifest mutation -> store -> actor wake-up -> scaler -> dispatcher -> commands
//!        ^                                                                  |
//!        +---- actor wake-up <- projector <- lattice events <- hosts act <--+
//! ```
//!
//! ## Key Components
//!
//! - [`Coordinator`]: operations, event ingestion and acknowledgement routing
//! - [`CoordinatorBuilder`]: wiring of store, projector, sink and partition
//! - [`PartitionStrategy`]: which applications this engine may evaluate
//! - [`EventAggregator`]: asynchronous outcomes for monitoring
//! - [`ControlConfig`]: layered configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lattice_control::{ControlConfig, Coordinator};
//! use lattice_dispatch::RecordingSink;
//! use lattice_types::{Component, ComponentKind, LatticeId, Manifest, SpreadScaler, Trait};
//!
//! # async fn example() -> lattice_control::Result<()> {
//! let coordinator = Arc::new(
//!     Coordinator::builder(ControlConfig::default())
//!         .with_sink(Arc::new(RecordingSink::new()))
//!         .build()?,
//! );
//! coordinator.start().await?;
//!
//! let manifest = Manifest::new("shop", "").with_component(
//!     Component::new("api", ComponentKind::Component, "registry/api:1")
//!         .with_trait(Trait::SpreadScaler(SpreadScaler::new(3))),
//! );
//! let version = coordinator.submit_manifest(manifest).await?;
//! coordinator
//!     .deploy(&"shop".into(), Some(version.as_str()), &LatticeId::new("default"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod actor;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod partition;
pub mod status;
pub mod telemetry;

pub use actor::{ActorPhase, ActorStatus, UndeployMode};
pub use config::{
    ControlConfig, DispatchConfig, EngineConfig, LoggingConfig, PartitionConfig, PartitionMode,
    ProjectorConfig, ReconcileConfig,
};
pub use context::EngineHealth;
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use error::{ControlError, Result};
pub use events::EventAggregator;
pub use partition::{
    ConsistentHashPartitioner, PartitionStrategy, SingleInstance, StaticAssignment,
};
pub use status::{AppPhase, ComponentStatus, StatusReport};
pub use telemetry::init_tracing;
