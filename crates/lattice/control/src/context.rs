//! State shared by the coordinator and every application actor

use crate::config::ReconcileConfig;
use crate::events::EventAggregator;
use crate::partition::PartitionStrategy;
use chrono::{DateTime, Utc};
use lattice_dispatch::CommandDispatcher;
use lattice_manifest::ManifestStore;
use lattice_state::LatticeProjector;
use lattice_types::{AppName, ControlEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};

/// Whether the engine may act on the lattice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineHealth {
    Healthy,
    /// A fatal condition was reported; nothing is evaluated until recovery
    Unhealthy {
        reason: String,
        since: DateTime<Utc>,
    },
}

impl EngineHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, EngineHealth::Healthy)
    }
}

pub(crate) struct EngineContext {
    pub engine_id: String,
    pub store: Arc<dyn ManifestStore>,
    pub projector: Arc<LatticeProjector>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub events: EventAggregator,
    pub reconcile: ReconcileConfig,
    partition: RwLock<Arc<dyn PartitionStrategy>>,
    health: watch::Sender<EngineHealth>,
}

impl EngineContext {
    pub fn new(
        engine_id: String,
        store: Arc<dyn ManifestStore>,
        projector: Arc<LatticeProjector>,
        dispatcher: Arc<CommandDispatcher>,
        partition: Arc<dyn PartitionStrategy>,
        reconcile: ReconcileConfig,
    ) -> Self {
        let (health, _) = watch::channel(EngineHealth::Healthy);
        Self {
            events: EventAggregator::new(engine_id.clone()),
            engine_id,
            store,
            projector,
            dispatcher,
            reconcile,
            partition: RwLock::new(partition),
            health,
        }
    }

    pub async fn owns(&self, app: &AppName) -> bool {
        self.partition.read().await.owns(app)
    }

    pub async fn partition(&self) -> Arc<dyn PartitionStrategy> {
        self.partition.read().await.clone()
    }

    pub async fn set_partition(&self, strategy: Arc<dyn PartitionStrategy>) {
        *self.partition.write().await = strategy;
    }

    pub fn health(&self) -> EngineHealth {
        self.health.borrow().clone()
    }

    pub fn watch_health(&self) -> watch::Receiver<EngineHealth> {
        self.health.subscribe()
    }

    /// Mark the engine unhealthy; returns false if it already was
    pub fn report_fatal(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.health.send_if_modified(|health| {
            if health.is_healthy() {
                *health = EngineHealth::Unhealthy {
                    reason: reason.clone(),
                    since: Utc::now(),
                };
                true
            } else {
                false
            }
        });

        if changed {
            error!(engine = %self.engine_id, reason = %reason, "Engine unhealthy, reconciliation suspended");
            self.events.publish(ControlEvent::EngineUnhealthy { reason });
        }
        changed
    }

    /// Clear a fatal condition; returns false if the engine was healthy
    pub fn recover(&self) -> bool {
        let changed = self.health.send_if_modified(|health| {
            if health.is_healthy() {
                false
            } else {
                *health = EngineHealth::Healthy;
                true
            }
        });

        if changed {
            info!(engine = %self.engine_id, "Engine recovered");
            self.events.publish(ControlEvent::EngineRecovered);
        }
        changed
    }
}
