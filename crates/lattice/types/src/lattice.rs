//! Lifecycle events observed from lattice hosts
//!
//! Hosts stamp every event with a per-host sequence counter. The projector
//! relies on that counter for per-host ordering and duplicate detection.

use crate::{AppName, ComponentId, ComponentKind, HostId, InstanceId, Labels, LatticeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Annotation placed on every instance the engine starts, naming its application
pub const MANAGED_BY_ANNOTATION: &str = "lattice.app";

/// A lifecycle event reported by one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatticeEvent {
    pub lattice: LatticeId,
    pub host: HostId,
    /// Per-host sequence number
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    pub kind: LatticeEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LatticeEventKind {
    HostStarted {
        #[serde(default)]
        labels: Labels,
        /// Increases on every host process start; a higher value marks a restart
        #[serde(default, skip_serializing_if = "Option::is_none")]
        boot_epoch: Option<u64>,
    },
    HostHeartbeat {
        #[serde(default)]
        labels: Labels,
    },
    HostStopped,
    InstanceStarted {
        component: ComponentId,
        component_kind: ComponentKind,
        image_ref: String,
        instance: InstanceId,
        #[serde(default)]
        annotations: Labels,
    },
    InstanceStopped {
        component: ComponentId,
        instance: InstanceId,
    },
    /// Health of a provider's instances on the reporting host
    ProviderHealth {
        component: ComponentId,
        healthy: bool,
    },
    LinkSet {
        link: ActiveLink,
    },
    LinkDeleted {
        key: LinkKey,
    },
}

impl LatticeEvent {
    pub fn new(
        lattice: impl Into<LatticeId>,
        host: impl Into<HostId>,
        sequence: u64,
        kind: LatticeEventKind,
    ) -> Self {
        Self {
            lattice: lattice.into(),
            host: host.into(),
            sequence,
            occurred_at: Utc::now(),
            kind,
        }
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            LatticeEventKind::HostStarted { .. } => "host_started",
            LatticeEventKind::HostHeartbeat { .. } => "host_heartbeat",
            LatticeEventKind::HostStopped => "host_stopped",
            LatticeEventKind::InstanceStarted { .. } => "instance_started",
            LatticeEventKind::InstanceStopped { .. } => "instance_stopped",
            LatticeEventKind::ProviderHealth { .. } => "provider_health",
            LatticeEventKind::LinkSet { .. } => "link_set",
            LatticeEventKind::LinkDeleted { .. } => "link_deleted",
        }
    }
}

/// Run state of an observed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Provider started but not yet reported healthy
    Pending,
    Running,
    Failed,
}

/// Identity of a link within a lattice
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkKey {
    pub source: ComponentId,
    pub name: String,
    pub namespace: String,
    pub package: String,
}

impl std::fmt::Display for LinkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}/{}",
            self.source, self.name, self.namespace, self.package
        )
    }
}

/// A link as established in the lattice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveLink {
    pub key: LinkKey,
    pub target: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub source_config: Labels,
    /// Application that put the link, if it was put by the engine
    #[serde(default)]
    pub owner: Option<AppName>,
}

impl ActiveLink {
    /// Whether two links carry the same wiring, ignoring ownership
    pub fn same_wiring(&self, other: &ActiveLink) -> bool {
        self.key == other.key
            && self.target == other.target
            && self.interfaces == other.interfaces
            && self.source_config == other.source_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_start_boot_epoch_is_optional() {
        let kind: LatticeEventKind =
            serde_json::from_str(r#"{"type":"host_started","labels":{"zone":"east"}}"#).unwrap();
        assert!(matches!(
            kind,
            LatticeEventKind::HostStarted {
                boot_epoch: None,
                ..
            }
        ));

        let restarted = LatticeEventKind::HostStarted {
            labels: Labels::new(),
            boot_epoch: Some(2),
        };
        let json = serde_json::to_string(&restarted).unwrap();
        assert!(json.contains(r#""boot_epoch":2"#));
    }
}
