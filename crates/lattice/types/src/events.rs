//! Control plane observability events
//!
//! Asynchronous outcomes (dispatch failures, fatal conditions, completed
//! reconciliation rounds) are surfaced here rather than returned to the
//! request that triggered them.

use crate::{AppName, HostId, IdempotencyKey, LatticeId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all control plane events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Event source
    pub source: EventSource,

    /// Event severity
    pub severity: EventSeverity,

    /// Engine instance that emitted the event
    pub engine: String,

    /// Correlation ID for tracing
    pub correlation_id: Option<String>,

    /// The actual event
    pub event: ControlEvent,
}

/// Event sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    /// Manifest store mutations
    Manifest,
    /// Lattice state projection
    Projector,
    /// Per-application reconciliation
    Reconciler,
    /// Command dispatch
    Dispatcher,
    /// Coordinator and partitioning
    Coordinator,
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Control plane events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlEvent {
    ManifestSubmitted {
        app: AppName,
        version: String,
    },
    DeployRequested {
        app: AppName,
        lattice: LatticeId,
        version: String,
    },
    RolledBack {
        app: AppName,
        version: String,
    },
    UndeployRequested {
        app: AppName,
        lattice: LatticeId,
        force: bool,
    },
    ApplicationDeleted {
        app: AppName,
    },
    ReconcileCompleted {
        app: AppName,
        lattice: LatticeId,
        actions: usize,
        sent: usize,
    },
    CommandRetried {
        key: IdempotencyKey,
        attempt: u32,
        reason: String,
    },
    CommandFailed {
        key: IdempotencyKey,
        attempts: u32,
        reason: String,
    },
    HostExpired {
        lattice: LatticeId,
        host: HostId,
    },
    PartitionChanged {
        owned: usize,
    },
    EngineUnhealthy {
        reason: String,
    },
    EngineRecovered,
}

impl ControlEvent {
    /// Severity an event is emitted with unless overridden
    pub fn severity(&self) -> EventSeverity {
        match self {
            ControlEvent::ReconcileCompleted { .. } => EventSeverity::Debug,
            ControlEvent::CommandRetried { .. } | ControlEvent::HostExpired { .. } => {
                EventSeverity::Warning
            }
            ControlEvent::CommandFailed { .. } => EventSeverity::Error,
            ControlEvent::EngineUnhealthy { .. } => EventSeverity::Critical,
            _ => EventSeverity::Info,
        }
    }

    pub fn source(&self) -> EventSource {
        match self {
            ControlEvent::ManifestSubmitted { .. }
            | ControlEvent::RolledBack { .. }
            | ControlEvent::ApplicationDeleted { .. } => EventSource::Manifest,
            ControlEvent::DeployRequested { .. }
            | ControlEvent::UndeployRequested { .. }
            | ControlEvent::ReconcileCompleted { .. } => EventSource::Reconciler,
            ControlEvent::CommandRetried { .. } | ControlEvent::CommandFailed { .. } => {
                EventSource::Dispatcher
            }
            ControlEvent::HostExpired { .. } => EventSource::Projector,
            ControlEvent::PartitionChanged { .. }
            | ControlEvent::EngineUnhealthy { .. }
            | ControlEvent::EngineRecovered => EventSource::Coordinator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_inference() {
        let failed = ControlEvent::CommandFailed {
            key: IdempotencyKey::derive(
                &LatticeId::new("default"),
                &"shop-api".into(),
                "stop",
                "host-a",
            ),
            attempts: 5,
            reason: "ack timeout".into(),
        };
        assert_eq!(failed.severity(), EventSeverity::Error);
        assert_eq!(failed.source(), EventSource::Dispatcher);
        assert!(
            ControlEvent::EngineUnhealthy {
                reason: "event stream closed".into()
            }
            .severity()
                > EventSeverity::Error
        );
    }
}
