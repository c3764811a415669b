//! Ownership of applications across cooperating engines
//!
//! Each engine evaluates only the applications its strategy assigns to it.
//! Strategies must agree across peers: given the same membership every
//! engine computes the same owner, so partitions are disjoint.

use crate::config::{PartitionConfig, PartitionMode};
use crate::error::{ControlError, Result};
use dashmap::DashSet;
use lattice_types::AppName;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Decides which applications this engine owns
pub trait PartitionStrategy: Send + Sync + fmt::Debug {
    fn owns(&self, app: &AppName) -> bool;
}

/// Owns everything; the single-engine deployment
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleInstance;

impl PartitionStrategy for SingleInstance {
    fn owns(&self, _app: &AppName) -> bool {
        true
    }
}

/// Hash ring with virtual nodes
#[derive(Debug, Clone)]
pub struct ConsistentHashPartitioner {
    local: String,
    ring: BTreeMap<u64, String>,
}

impl ConsistentHashPartitioner {
    /// `peers` lists every engine, `local` included
    pub fn new(local: impl Into<String>, peers: &[String], vnodes: u32) -> Result<Self> {
        let local = local.into();
        if !peers.contains(&local) {
            return Err(ControlError::Config(format!(
                "engine {} is not among the partition peers",
                local
            )));
        }

        let mut ring = BTreeMap::new();
        for peer in peers {
            for vnode in 0..vnodes.max(1) {
                ring.insert(ring_hash(&format!("{}#{}", peer, vnode)), peer.clone());
            }
        }

        Ok(Self { local, ring })
    }

    /// Engine responsible for an application
    pub fn owner(&self, app: &AppName) -> &str {
        let point = ring_hash(app.as_str());
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, peer)| peer.as_str())
            .unwrap_or(self.local.as_str())
    }
}

impl PartitionStrategy for ConsistentHashPartitioner {
    fn owns(&self, app: &AppName) -> bool {
        self.owner(app) == self.local
    }
}

fn ring_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Ownership pushed in by an external assignment signal
#[derive(Debug, Default)]
pub struct StaticAssignment {
    owned: DashSet<AppName>,
}

impl StaticAssignment {
    pub fn new(apps: impl IntoIterator<Item = AppName>) -> Self {
        Self {
            owned: apps.into_iter().collect(),
        }
    }

    pub fn assign(&self, app: AppName) {
        self.owned.insert(app);
    }

    pub fn revoke(&self, app: &AppName) {
        self.owned.remove(app);
    }

    /// Replace the whole assignment
    pub fn replace(&self, apps: impl IntoIterator<Item = AppName>) {
        self.owned.clear();
        for app in apps {
            self.owned.insert(app);
        }
    }

    pub fn len(&self) -> usize {
        self.owned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }
}

impl PartitionStrategy for StaticAssignment {
    fn owns(&self, app: &AppName) -> bool {
        self.owned.contains(app)
    }
}

impl PartitionConfig {
    /// Build the configured strategy for engine `instance_id`
    pub fn build(&self, instance_id: &str) -> Result<Arc<dyn PartitionStrategy>> {
        Ok(match self.mode {
            PartitionMode::Single => Arc::new(SingleInstance),
            PartitionMode::ConsistentHash => Arc::new(ConsistentHashPartitioner::new(
                instance_id,
                &self.peers,
                self.vnodes,
            )?),
            PartitionMode::Static => Arc::new(StaticAssignment::new(
                self.owned.iter().map(|app| AppName::new(app.as_str())),
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<String> {
        vec!["engine-a".into(), "engine-b".into(), "engine-c".into()]
    }

    fn apps() -> Vec<AppName> {
        (0..200).map(|i| AppName::new(format!("app-{}", i))).collect()
    }

    #[test]
    fn test_ring_partitions_are_disjoint_and_complete() {
        let engines: Vec<_> = peers()
            .iter()
            .map(|id| ConsistentHashPartitioner::new(id.as_str(), &peers(), 64).unwrap())
            .collect();

        for app in apps() {
            let owners = engines.iter().filter(|e| e.owns(&app)).count();
            assert_eq!(owners, 1, "{} must have exactly one owner", app);
        }
        for engine in &engines {
            assert!(apps().iter().any(|app| engine.owns(app)));
        }
    }

    #[test]
    fn test_ring_is_stable_when_a_peer_leaves() {
        let before = ConsistentHashPartitioner::new("engine-a", &peers(), 64).unwrap();
        let after =
            ConsistentHashPartitioner::new("engine-a", &peers()[..2].to_vec(), 64).unwrap();

        for app in apps() {
            // Apps engine-a owned keep their owner; only engine-c's move.
            if before.owner(&app) == "engine-a" {
                assert_eq!(after.owner(&app), "engine-a");
            }
        }
    }

    #[test]
    fn test_local_must_be_a_peer() {
        let err = ConsistentHashPartitioner::new("engine-z", &peers(), 8).unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }

    #[test]
    fn test_static_assignment() {
        let assignment = StaticAssignment::new([AppName::new("shop")]);
        assert!(assignment.owns(&AppName::new("shop")));
        assert!(!assignment.owns(&AppName::new("blog")));

        assignment.assign(AppName::new("blog"));
        assignment.revoke(&AppName::new("shop"));
        assert!(assignment.owns(&AppName::new("blog")));
        assert!(!assignment.owns(&AppName::new("shop")));

        assignment.replace([AppName::new("wiki")]);
        assert_eq!(assignment.len(), 1);
    }

    #[test]
    fn test_build_from_config() {
        let config = PartitionConfig {
            mode: PartitionMode::Static,
            owned: vec!["shop".into()],
            ..Default::default()
        };
        let strategy = config.build("engine-0").unwrap();
        assert!(strategy.owns(&AppName::new("shop")));
        assert!(!strategy.owns(&AppName::new("blog")));

        let strategy = PartitionConfig::default().build("engine-0").unwrap();
        assert!(strategy.owns(&AppName::new("anything")));
    }
}
