//! Per-lattice event logs and shared snapshots

use crate::{Applied, ChangeScope, ObservedState};
use dashmap::DashMap;
use lattice_types::{HostId, LatticeEvent, LatticeId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Channel capacity for state change notifications
const CHANGE_CHANNEL_CAPACITY: usize = 4096;

/// Default number of events kept verbatim before older ones are folded into the base
pub const DEFAULT_LOG_LIMIT: usize = 10_000;

/// A change to observed state that may require reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub lattice: LatticeId,
    pub host: HostId,
    pub scope: ChangeScope,
}

struct LatticeLog {
    /// Fold of every event compacted out of `tail`
    base: ObservedState,
    tail: Vec<LatticeEvent>,
    current: Arc<ObservedState>,
}

impl LatticeLog {
    fn new(lattice: LatticeId) -> Self {
        Self {
            base: ObservedState::new(lattice.clone()),
            tail: Vec::new(),
            current: Arc::new(ObservedState::new(lattice)),
        }
    }

    fn compact(&mut self, limit: usize) {
        if self.tail.len() <= limit {
            return;
        }
        let drained = self.tail.len() - limit / 2;
        for event in self.tail.drain(..drained) {
            self.base.apply(&event);
        }
        // Tombstones that expired before every retained event cannot block any of them.
        if let Some(oldest) = self.tail.iter().map(|e| e.occurred_at).min() {
            let pruned = self.base.prune_retired(oldest);
            if pruned > 0 {
                Arc::make_mut(&mut self.current).prune_retired(oldest);
                debug!(lattice = %self.base.lattice, pruned, "Pruned expired host tombstones");
            }
        }
    }
}

/// Sole writer of observed state for every lattice
pub struct LatticeProjector {
    lattices: DashMap<LatticeId, LatticeLog>,
    changes: broadcast::Sender<StateChange>,
    log_limit: usize,
}

impl LatticeProjector {
    pub fn new() -> Self {
        Self::with_log_limit(DEFAULT_LOG_LIMIT)
    }

    pub fn with_log_limit(log_limit: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            lattices: DashMap::new(),
            changes,
            log_limit: log_limit.max(2),
        }
    }

    /// Append an event to its lattice's log and fold it into the snapshot
    pub fn apply(&self, event: LatticeEvent) -> Applied {
        let lattice = event.lattice.clone();
        let host = event.host.clone();

        let applied = {
            let mut log = self
                .lattices
                .entry(lattice.clone())
                .or_insert_with(|| LatticeLog::new(lattice.clone()));
            let applied = Arc::make_mut(&mut log.current).apply(&event);
            log.tail.push(event);
            let limit = self.log_limit;
            log.compact(limit);
            applied
        };

        match &applied {
            Applied::Changed(scope) => {
                debug!(lattice = %lattice, host = %host, ?scope, "Observed state changed");
                let _ = self.changes.send(StateChange {
                    lattice,
                    host,
                    scope: scope.clone(),
                });
            }
            Applied::Skipped => trace!(lattice = %lattice, host = %host, "Skipped stale event"),
            Applied::Recorded => {}
        }
        applied
    }

    /// Point-in-time snapshot; empty for a lattice never heard from
    pub fn snapshot(&self, lattice: &LatticeId) -> Arc<ObservedState> {
        self.lattices
            .get(lattice)
            .map(|log| log.current.clone())
            .unwrap_or_else(|| Arc::new(ObservedState::new(lattice.clone())))
    }

    /// Rebuild a lattice's snapshot from its compacted base and event log
    pub fn rebuild(&self, lattice: &LatticeId) -> ObservedState {
        match self.lattices.get(lattice) {
            Some(log) => {
                let mut state = log.base.clone();
                for event in &log.tail {
                    state.apply(event);
                }
                state
            }
            None => ObservedState::new(lattice.clone()),
        }
    }

    pub fn lattices(&self) -> Vec<LatticeId> {
        let mut lattices: Vec<_> = self.lattices.iter().map(|e| e.key().clone()).collect();
        lattices.sort();
        lattices
    }

    /// Events currently held verbatim for a lattice
    pub fn log_len(&self, lattice: &LatticeId) -> usize {
        self.lattices.get(lattice).map(|log| log.tail.len()).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

impl Default for LatticeProjector {
    fn default() -> Self {
        Self::new()
    }
}
