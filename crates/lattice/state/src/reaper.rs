//! Expiry of hosts that stopped heartbeating
//!
//! Hosts are removed by appending a synthetic `HostStopped` event, so the
//! removal is part of the log and survives a replay.

use crate::{Applied, LatticeProjector, ObservedState};
use chrono::{DateTime, Utc};
use lattice_types::{HostId, LatticeEvent, LatticeEventKind, LatticeId};
use std::time::Duration;
use tracing::info;

/// Removes hosts not seen for `expiry_intervals` heartbeat intervals
#[derive(Debug, Clone)]
pub struct HostReaper {
    max_age: chrono::Duration,
}

impl HostReaper {
    pub fn new(interval: Duration, expiry_intervals: u32) -> Self {
        let age = interval.saturating_mul(expiry_intervals.max(1));
        Self {
            max_age: chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::max_value()),
        }
    }

    /// Hosts whose last event is older than the expiry window
    pub fn expired(&self, state: &ObservedState, now: DateTime<Utc>) -> Vec<HostId> {
        state
            .hosts()
            .iter()
            .filter(|(_, host)| now.signed_duration_since(host.last_seen) > self.max_age)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Expire stale hosts across every lattice the projector knows
    pub fn reap(
        &self,
        projector: &LatticeProjector,
        now: DateTime<Utc>,
    ) -> Vec<(LatticeId, HostId)> {
        let mut reaped = Vec::new();
        for lattice in projector.lattices() {
            let snapshot = projector.snapshot(&lattice);
            for host in self.expired(&snapshot, now) {
                let Some(sequence) = snapshot.host(&host).map(|h| h.high_water + 1) else {
                    continue;
                };
                let event = LatticeEvent::new(
                    lattice.clone(),
                    host.clone(),
                    sequence,
                    LatticeEventKind::HostStopped,
                )
                .at(now);
                // A heartbeat that raced in first makes this stop stale.
                if let Applied::Changed(_) = projector.apply(event) {
                    info!(lattice = %lattice, host = %host, "Reaped unresponsive host");
                    reaped.push((lattice.clone(), host));
                }
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_types::Labels;

    fn host_started(host: &str, sequence: u64, at: DateTime<Utc>) -> LatticeEvent {
        LatticeEvent::new(
            "prod",
            host,
            sequence,
            LatticeEventKind::HostStarted {
                labels: Labels::new(),
                boot_epoch: None,
            },
        )
        .at(at)
    }

    #[test]
    fn test_reaps_after_two_intervals() {
        let projector = LatticeProjector::new();
        let start = Utc::now();
        projector.apply(host_started("host-a", 1, start));
        projector.apply(host_started("host-b", 1, start + chrono::Duration::seconds(50)));

        let reaper = HostReaper::new(Duration::from_secs(30), 2);

        assert!(reaper
            .reap(&projector, start + chrono::Duration::seconds(59))
            .is_empty());

        let reaped = reaper.reap(&projector, start + chrono::Duration::seconds(61));
        assert_eq!(reaped, vec![(LatticeId::new("prod"), HostId::new("host-a"))]);

        let snapshot = projector.snapshot(&"prod".into());
        assert!(snapshot.host(&"host-a".into()).is_none());
        assert!(snapshot.host(&"host-b".into()).is_some());
        assert_eq!(projector.rebuild(&"prod".into()), *snapshot);
    }

    #[test]
    fn test_heartbeat_keeps_host_alive() {
        let projector = LatticeProjector::new();
        let start = Utc::now();
        projector.apply(host_started("host-a", 1, start));
        projector.apply(
            LatticeEvent::new(
                "prod",
                "host-a",
                2,
                LatticeEventKind::HostHeartbeat {
                    labels: Labels::new(),
                },
            )
            .at(start + chrono::Duration::seconds(45)),
        );

        let reaper = HostReaper::new(Duration::from_secs(30), 2);
        assert!(reaper
            .reap(&projector, start + chrono::Duration::seconds(90))
            .is_empty());
    }
}
