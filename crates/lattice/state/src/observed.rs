//! Observed lattice state as a pure fold over lifecycle events

use chrono::{DateTime, Utc};
use lattice_types::{
    ActiveLink, AppName, ComponentId, ComponentKind, HostId, InstanceId, InstanceStatus, Labels,
    LatticeEvent, LatticeEventKind, LatticeId, LinkKey, MANAGED_BY_ANNOTATION,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// How long a stopped host's events stay blocked unless it announces a later boot
pub const TOMBSTONE_RETENTION_SECS: i64 = 3600;

/// Point-in-time view of one lattice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedState {
    pub lattice: LatticeId,
    hosts: BTreeMap<HostId, HostState>,
    /// Hosts that stopped or were reaped
    retired: BTreeMap<HostId, Tombstone>,
    links: BTreeMap<LinkKey, ActiveLink>,
}

/// One execution host and what runs on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostState {
    pub labels: Labels,
    /// Boot epoch announced by the host's latest start, if any
    pub boot_epoch: Option<u64>,
    pub instances: BTreeMap<InstanceId, InstanceRecord>,
    /// Highest sequence number applied from this host
    pub high_water: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Tombstone {
    high_water: u64,
    boot_epoch: Option<u64>,
    retired_at: DateTime<Utc>,
}

impl Tombstone {
    fn expires_at(&self) -> DateTime<Utc> {
        self.retired_at
            .checked_add_signed(chrono::Duration::seconds(TOMBSTONE_RETENTION_SECS))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn blocks(&self, event: &LatticeEvent) -> bool {
        event.occurred_at <= self.expires_at()
    }
}

/// One running instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRecord {
    pub component: ComponentId,
    pub component_kind: ComponentKind,
    pub image_ref: String,
    pub annotations: Labels,
    pub started_at: DateTime<Utc>,
    pub started_sequence: u64,
    pub status: InstanceStatus,
}

impl InstanceRecord {
    /// Application that started this instance, if the engine did
    pub fn managed_by(&self) -> Option<&str> {
        self.annotations
            .get(MANAGED_BY_ANNOTATION)
            .map(String::as_str)
    }

    pub fn is_managed_by(&self, app: &AppName) -> bool {
        self.managed_by() == Some(app.as_str())
    }
}

/// Outcome of applying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Duplicate, stale, or addressed to another lattice
    Skipped,
    /// Accepted without changing anything placement depends on
    Recorded,
    /// Instances, hosts, labels or links changed
    Changed(ChangeScope),
}

/// Which applications a change may affect
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeScope {
    /// Every application deployed to the lattice
    Lattice,
    App(AppName),
}

impl ChangeScope {
    fn of_annotations(annotations: &Labels) -> Self {
        match annotations.get(MANAGED_BY_ANNOTATION) {
            Some(app) => ChangeScope::App(AppName::new(app.as_str())),
            None => ChangeScope::Lattice,
        }
    }

    fn of_link(link: &ActiveLink) -> Self {
        match &link.owner {
            Some(app) => ChangeScope::App(app.clone()),
            None => ChangeScope::Lattice,
        }
    }
}

impl ObservedState {
    pub fn new(lattice: LatticeId) -> Self {
        Self {
            lattice,
            hosts: BTreeMap::new(),
            retired: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }

    /// Rebuild a snapshot from an event log
    pub fn replay<'a>(
        lattice: LatticeId,
        events: impl IntoIterator<Item = &'a LatticeEvent>,
    ) -> Self {
        let mut state = Self::new(lattice);
        for event in events {
            state.apply(event);
        }
        state
    }

    /// Fold one event into the snapshot
    pub fn apply(&mut self, event: &LatticeEvent) -> Applied {
        if event.lattice != self.lattice || self.is_stale(event) {
            return Applied::Skipped;
        }

        match &event.kind {
            LatticeEventKind::HostStarted { labels, boot_epoch } => {
                if self.is_restart(event) {
                    self.hosts.remove(&event.host);
                }
                let is_new = !self.hosts.contains_key(&event.host);
                let host = self.touch_host(event);
                if boot_epoch.is_some() {
                    host.boot_epoch = *boot_epoch;
                }
                if is_new || &host.labels != labels {
                    host.labels = labels.clone();
                    Applied::Changed(ChangeScope::Lattice)
                } else {
                    Applied::Recorded
                }
            }
            LatticeEventKind::HostHeartbeat { labels } => {
                let is_new = !self.hosts.contains_key(&event.host);
                let host = self.touch_host(event);
                if is_new || &host.labels != labels {
                    host.labels = labels.clone();
                    Applied::Changed(ChangeScope::Lattice)
                } else {
                    Applied::Recorded
                }
            }
            LatticeEventKind::HostStopped => match self.hosts.remove(&event.host) {
                Some(host) => {
                    self.retired.insert(
                        event.host.clone(),
                        Tombstone {
                            high_water: host.high_water.max(event.sequence),
                            boot_epoch: host.boot_epoch,
                            retired_at: event.occurred_at,
                        },
                    );
                    Applied::Changed(ChangeScope::Lattice)
                }
                None => Applied::Recorded,
            },
            LatticeEventKind::InstanceStarted {
                component,
                component_kind,
                image_ref,
                instance,
                annotations,
            } => {
                let host = self.touch_host(event);
                if host.instances.contains_key(instance) {
                    return Applied::Recorded;
                }
                let status = match component_kind {
                    ComponentKind::Component => InstanceStatus::Running,
                    ComponentKind::Provider => InstanceStatus::Pending,
                };
                host.instances.insert(
                    instance.clone(),
                    InstanceRecord {
                        component: component.clone(),
                        component_kind: *component_kind,
                        image_ref: image_ref.clone(),
                        annotations: annotations.clone(),
                        started_at: event.occurred_at,
                        started_sequence: event.sequence,
                        status,
                    },
                );
                Applied::Changed(ChangeScope::of_annotations(annotations))
            }
            LatticeEventKind::InstanceStopped { instance, .. } => {
                let Some(host) = self.hosts.get_mut(&event.host) else {
                    return Applied::Recorded;
                };
                advance(host, event);
                match host.instances.remove(instance) {
                    Some(record) => {
                        Applied::Changed(ChangeScope::of_annotations(&record.annotations))
                    }
                    None => Applied::Recorded,
                }
            }
            LatticeEventKind::ProviderHealth { component, healthy } => {
                let host = self.touch_host(event);
                let status = if *healthy {
                    InstanceStatus::Running
                } else {
                    InstanceStatus::Failed
                };
                for record in host.instances.values_mut().filter(|r| {
                    &r.component == component && r.component_kind == ComponentKind::Provider
                }) {
                    record.status = status;
                }
                Applied::Recorded
            }
            LatticeEventKind::LinkSet { link } => {
                self.touch_host(event);
                if self.links.get(&link.key) == Some(link) {
                    return Applied::Recorded;
                }
                self.links.insert(link.key.clone(), link.clone());
                Applied::Changed(ChangeScope::of_link(link))
            }
            LatticeEventKind::LinkDeleted { key } => {
                self.touch_host(event);
                match self.links.remove(key) {
                    Some(link) => Applied::Changed(ChangeScope::of_link(&link)),
                    None => Applied::Recorded,
                }
            }
        }
    }

    /// Redelivered or out-of-date for its host
    fn is_stale(&self, event: &LatticeEvent) -> bool {
        if self.is_restart(event) {
            return false;
        }
        if let Some(host) = self.hosts.get(&event.host) {
            return event.sequence <= host.high_water;
        }
        // A retired host comes back only through a later start.
        match self.retired.get(&event.host) {
            Some(tombstone) if tombstone.blocks(event) => match event.kind {
                LatticeEventKind::HostStarted { .. } => event.sequence <= tombstone.high_water,
                _ => true,
            },
            _ => false,
        }
    }

    /// A start announcing a later boot than the last one seen from its host
    fn is_restart(&self, event: &LatticeEvent) -> bool {
        let LatticeEventKind::HostStarted {
            boot_epoch: Some(epoch),
            ..
        } = event.kind
        else {
            return false;
        };
        let last = match self.hosts.get(&event.host) {
            Some(host) => host.boot_epoch,
            None => match self.retired.get(&event.host) {
                Some(tombstone) => tombstone.boot_epoch,
                None => return false,
            },
        };
        last.map_or(true, |last| epoch > last)
    }

    /// Forget hosts whose retention ended before `before`; returns how many
    pub fn prune_retired(&mut self, before: DateTime<Utc>) -> usize {
        let len = self.retired.len();
        self.retired.retain(|_, tombstone| tombstone.expires_at() >= before);
        len - self.retired.len()
    }

    /// Hosts still remembered as stopped
    pub fn retired_hosts(&self) -> impl Iterator<Item = &HostId> {
        self.retired.keys()
    }

    fn touch_host(&mut self, event: &LatticeEvent) -> &mut HostState {
        self.retired.remove(&event.host);
        let host = self
            .hosts
            .entry(event.host.clone())
            .or_insert_with(|| HostState {
                labels: Labels::new(),
                boot_epoch: None,
                instances: BTreeMap::new(),
                high_water: 0,
                last_seen: event.occurred_at,
            });
        advance(host, event);
        host
    }

    pub fn hosts(&self) -> &BTreeMap<HostId, HostState> {
        &self.hosts
    }

    pub fn host(&self, id: &HostId) -> Option<&HostState> {
        self.hosts.get(id)
    }

    pub fn links(&self) -> impl Iterator<Item = &ActiveLink> {
        self.links.values()
    }

    pub fn link(&self, key: &LinkKey) -> Option<&ActiveLink> {
        self.links.get(key)
    }

    /// Links put on behalf of `app`
    pub fn links_owned_by<'a>(&'a self, app: &'a AppName) -> impl Iterator<Item = &'a ActiveLink> {
        self.links
            .values()
            .filter(move |l| l.owner.as_ref() == Some(app))
    }

    /// Instances started on behalf of `app`, in host order
    pub fn managed_instances<'a>(
        &'a self,
        app: &'a AppName,
    ) -> impl Iterator<Item = (&'a HostId, &'a InstanceId, &'a InstanceRecord)> {
        self.hosts.iter().flat_map(move |(host_id, host)| {
            host.instances
                .iter()
                .filter(move |(_, r)| r.is_managed_by(app))
                .map(move |(id, r)| (host_id, id, r))
        })
    }

    /// Managed instance count of one component
    pub fn instance_count(&self, app: &AppName, component: &ComponentId) -> usize {
        self.managed_instances(app)
            .filter(|(_, _, r)| &r.component == component)
            .count()
    }

    /// Whether nothing managed by `app` remains in the lattice
    pub fn is_clear_of(&self, app: &AppName) -> bool {
        self.managed_instances(app).next().is_none() && self.links_owned_by(app).next().is_none()
    }
}

fn advance(host: &mut HostState, event: &LatticeEvent) {
    host.high_water = host.high_water.max(event.sequence);
    if event.occurred_at > host.last_seen {
        host.last_seen = event.occurred_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn event(host: &str, sequence: u64, kind: LatticeEventKind) -> LatticeEvent {
        LatticeEvent::new("default", host, sequence, kind)
    }

    fn started(host: &str, sequence: u64, instance: &str) -> LatticeEvent {
        event(
            host,
            sequence,
            LatticeEventKind::InstanceStarted {
                component: "shop-api".into(),
                component_kind: ComponentKind::Component,
                image_ref: "registry/api:1".into(),
                instance: instance.into(),
                annotations: labels(&[(MANAGED_BY_ANNOTATION, "shop")]),
            },
        )
    }

    fn stopped(host: &str, sequence: u64, instance: &str) -> LatticeEvent {
        event(
            host,
            sequence,
            LatticeEventKind::InstanceStopped {
                component: "shop-api".into(),
                instance: instance.into(),
            },
        )
    }

    fn state() -> ObservedState {
        ObservedState::new("default".into())
    }

    #[test]
    fn test_duplicate_start_is_idempotent() {
        let e = started("host-a", 1, "i-1");
        let mut once = state();
        once.apply(&e);

        let mut twice = state();
        assert!(matches!(twice.apply(&e), Applied::Changed(ChangeScope::App(_))));
        assert_eq!(twice.apply(&e), Applied::Skipped);

        assert_eq!(once, twice);
        assert_eq!(twice.instance_count(&"shop".into(), &"shop-api".into()), 1);
    }

    #[test]
    fn test_start_of_known_instance_with_new_sequence_is_noop() {
        let mut s = state();
        s.apply(&started("host-a", 1, "i-1"));
        let before = s.host(&"host-a".into()).unwrap().instances.clone();
        assert_eq!(s.apply(&started("host-a", 2, "i-1")), Applied::Recorded);
        assert_eq!(s.host(&"host-a".into()).unwrap().instances, before);
    }

    #[test]
    fn test_stop_of_unknown_instance_is_noop() {
        let mut s = state();
        s.apply(&started("host-a", 1, "i-1"));
        assert_eq!(s.apply(&stopped("host-a", 2, "i-9")), Applied::Recorded);
        assert_eq!(s.apply(&stopped("host-b", 1, "i-1")), Applied::Recorded);
        assert_eq!(s.instance_count(&"shop".into(), &"shop-api".into()), 1);
    }

    #[test]
    fn test_redelivered_start_after_stop_is_skipped() {
        let mut s = state();
        s.apply(&started("host-a", 1, "i-1"));
        s.apply(&stopped("host-a", 2, "i-1"));
        assert_eq!(s.apply(&started("host-a", 1, "i-1")), Applied::Skipped);
        assert!(s.is_clear_of(&"shop".into()));
    }

    #[test]
    fn test_hosts_are_ordered_independently() {
        let mut s = state();
        s.apply(&started("host-b", 7, "i-2"));
        s.apply(&started("host-a", 1, "i-1"));
        assert_eq!(s.instance_count(&"shop".into(), &"shop-api".into()), 2);
    }

    fn host_started(host: &str, sequence: u64, boot_epoch: Option<u64>) -> LatticeEvent {
        event(
            host,
            sequence,
            LatticeEventKind::HostStarted {
                labels: labels(&[("zone", "east")]),
                boot_epoch,
            },
        )
    }

    fn heartbeat(host: &str, sequence: u64) -> LatticeEvent {
        event(
            host,
            sequence,
            LatticeEventKind::HostHeartbeat {
                labels: labels(&[("zone", "east")]),
            },
        )
    }

    #[test]
    fn test_host_stop_drops_instances_and_blocks_stale_events() {
        let mut s = state();
        s.apply(&host_started("host-a", 1, Some(1)));
        s.apply(&started("host-a", 2, "i-1"));
        assert_eq!(
            s.apply(&event("host-a", 3, LatticeEventKind::HostStopped)),
            Applied::Changed(ChangeScope::Lattice)
        );
        assert!(s.host(&"host-a".into()).is_none());

        assert_eq!(s.apply(&started("host-a", 2, "i-1")), Applied::Skipped);
        assert_eq!(s.apply(&host_started("host-a", 1, Some(1))), Applied::Skipped);

        // A later boot may rejoin with a reset counter.
        assert_eq!(
            s.apply(&host_started("host-a", 1, Some(2))),
            Applied::Changed(ChangeScope::Lattice)
        );
        assert!(s.host(&"host-a".into()).unwrap().instances.is_empty());
        assert!(matches!(
            s.apply(&started("host-a", 2, "i-5")),
            Applied::Changed(_)
        ));
        assert_eq!(s.retired_hosts().count(), 0);
    }

    #[test]
    fn test_redelivered_heartbeat_after_stop_is_skipped() {
        let events = vec![
            host_started("host-a", 1, None),
            heartbeat("host-a", 2),
            started("host-a", 3, "i-1"),
            event("host-a", 4, LatticeEventKind::HostStopped),
        ];
        let once = ObservedState::replay("default".into(), &events);
        let mut twice = once.clone();

        assert_eq!(twice.apply(&heartbeat("host-a", 2)), Applied::Skipped);
        assert_eq!(twice.apply(&host_started("host-a", 1, None)), Applied::Skipped);
        assert_eq!(once, twice);
        assert!(twice.hosts().is_empty());
    }

    #[test]
    fn test_retired_host_returns_only_through_a_start() {
        let mut s = state();
        s.apply(&host_started("host-a", 1, None));
        s.apply(&event("host-a", 2, LatticeEventKind::HostStopped));

        assert_eq!(s.apply(&heartbeat("host-a", 3)), Applied::Skipped);
        assert_eq!(s.apply(&started("host-a", 4, "i-1")), Applied::Skipped);
        assert!(s.hosts().is_empty());

        assert_eq!(
            s.apply(&host_started("host-a", 5, None)),
            Applied::Changed(ChangeScope::Lattice)
        );
        assert_eq!(s.apply(&heartbeat("host-a", 6)), Applied::Recorded);
    }

    #[test]
    fn test_restart_without_stop_resets_instances() {
        let mut s = state();
        s.apply(&host_started("host-a", 1, Some(7)));
        s.apply(&started("host-a", 2, "i-1"));

        assert_eq!(
            s.apply(&host_started("host-a", 1, Some(8))),
            Applied::Changed(ChangeScope::Lattice)
        );
        assert!(s.host(&"host-a".into()).unwrap().instances.is_empty());

        // The previous boot's start arriving late changes nothing.
        assert_eq!(s.apply(&host_started("host-a", 1, Some(7))), Applied::Skipped);
        assert_eq!(s.host(&"host-a".into()).unwrap().boot_epoch, Some(8));
    }

    #[test]
    fn test_expired_tombstones_are_pruned() {
        let stopped_at = Utc::now();
        let mut s = state();
        s.apply(&host_started("host-a", 1, None).at(stopped_at));
        s.apply(&event("host-a", 2, LatticeEventKind::HostStopped).at(stopped_at));

        assert_eq!(s.prune_retired(stopped_at), 0);
        assert_eq!(s.retired_hosts().count(), 1);

        let after = stopped_at + chrono::Duration::seconds(TOMBSTONE_RETENTION_SECS + 1);
        assert_eq!(s.prune_retired(after), 1);
        assert_eq!(s.retired_hosts().count(), 0);
    }

    #[test]
    fn test_tombstone_stops_blocking_after_retention() {
        let stopped_at = Utc::now();
        let mut s = state();
        s.apply(&host_started("host-a", 1, None).at(stopped_at));
        s.apply(&event("host-a", 2, LatticeEventKind::HostStopped).at(stopped_at));

        let later = stopped_at + chrono::Duration::seconds(TOMBSTONE_RETENTION_SECS + 1);
        assert_eq!(
            s.apply(&heartbeat("host-a", 1).at(later)),
            Applied::Changed(ChangeScope::Lattice)
        );
        assert!(s.host(&"host-a".into()).is_some());
    }

    #[test]
    fn test_heartbeat_updates_labels() {
        let mut s = state();
        s.apply(&event(
            "host-a",
            1,
            LatticeEventKind::HostStarted {
                labels: labels(&[("zone", "east")]),
                boot_epoch: None,
            },
        ));
        assert_eq!(
            s.apply(&event(
                "host-a",
                2,
                LatticeEventKind::HostHeartbeat {
                    labels: labels(&[("zone", "east")]),
                },
            )),
            Applied::Recorded
        );
        assert_eq!(
            s.apply(&event(
                "host-a",
                3,
                LatticeEventKind::HostHeartbeat {
                    labels: labels(&[("zone", "west")]),
                },
            )),
            Applied::Changed(ChangeScope::Lattice)
        );
        assert_eq!(s.host(&"host-a".into()).unwrap().labels["zone"], "west");
    }

    #[test]
    fn test_provider_health_transitions() {
        let mut s = state();
        s.apply(&event(
            "host-a",
            1,
            LatticeEventKind::InstanceStarted {
                component: "shop-kv".into(),
                component_kind: ComponentKind::Provider,
                image_ref: "registry/kv:1".into(),
                instance: "p-1".into(),
                annotations: Labels::new(),
            },
        ));
        let status = |s: &ObservedState| {
            s.host(&"host-a".into()).unwrap().instances[&InstanceId::new("p-1")].status
        };
        assert_eq!(status(&s), InstanceStatus::Pending);

        s.apply(&event(
            "host-a",
            2,
            LatticeEventKind::ProviderHealth {
                component: "shop-kv".into(),
                healthy: true,
            },
        ));
        assert_eq!(status(&s), InstanceStatus::Running);

        s.apply(&event(
            "host-a",
            3,
            LatticeEventKind::ProviderHealth {
                component: "shop-kv".into(),
                healthy: false,
            },
        ));
        assert_eq!(status(&s), InstanceStatus::Failed);
    }

    #[test]
    fn test_links_fold() {
        let key = LinkKey {
            source: "shop-api".into(),
            name: "default".into(),
            namespace: "wasi".into(),
            package: "keyvalue".into(),
        };
        let link = ActiveLink {
            key: key.clone(),
            target: "shop-kv".into(),
            interfaces: vec!["store".into()],
            source_config: Labels::new(),
            owner: Some("shop".into()),
        };

        let mut s = state();
        assert_eq!(
            s.apply(&event("host-a", 1, LatticeEventKind::LinkSet { link: link.clone() })),
            Applied::Changed(ChangeScope::App("shop".into()))
        );
        assert_eq!(
            s.apply(&event("host-b", 1, LatticeEventKind::LinkSet { link })),
            Applied::Recorded
        );
        assert_eq!(s.links_owned_by(&"shop".into()).count(), 1);

        s.apply(&event("host-a", 2, LatticeEventKind::LinkDeleted { key }));
        assert!(s.is_clear_of(&"shop".into()));
    }

    #[test]
    fn test_replay_matches_incremental_fold() {
        let events = vec![
            started("host-a", 1, "i-1"),
            started("host-b", 1, "i-2"),
            started("host-a", 1, "i-1"),
            stopped("host-a", 2, "i-1"),
            started("host-a", 3, "i-3"),
        ];
        let mut incremental = state();
        for e in &events {
            incremental.apply(e);
        }
        assert_eq!(ObservedState::replay("default".into(), &events), incremental);
    }

    #[test]
    fn test_events_for_other_lattice_are_skipped() {
        let mut s = state();
        let mut e = started("host-a", 1, "i-1");
        e.lattice = "staging".into();
        assert_eq!(s.apply(&e), Applied::Skipped);
    }
}
