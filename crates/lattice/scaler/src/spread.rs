//! Spread scaler evaluation
//!
//! Existing instances are claimed target by target in declared order, newest
//! first, so surplus is always the oldest. Deficits are placed one instance
//! at a time on the matching host carrying the fewest instances of the
//! component, ties broken by host id.

use crate::allocation::largest_remainder;
use lattice_state::{InstanceRecord, ObservedState};
use lattice_types::{
    AppName, Component, ComponentId, HostId, InstanceId, Labels, RequiredAction, SpreadScaler,
    WeightedTarget,
};
use std::collections::BTreeMap;

struct Candidate<'a> {
    host: &'a HostId,
    instance: &'a InstanceId,
    record: &'a InstanceRecord,
}

/// Actions converging one component's managed instances on its spread scaler
pub(crate) fn evaluate(
    app: &AppName,
    component_id: &ComponentId,
    component: &Component,
    scaler: &SpreadScaler,
    observed: &ObservedState,
) -> Vec<RequiredAction> {
    let implicit = WeightedTarget::new("", 1);
    let targets: Vec<&WeightedTarget> = if scaler.spread.is_empty() {
        vec![&implicit]
    } else {
        scaler.spread.iter().collect()
    };

    let matching: Vec<Vec<&HostId>> = targets
        .iter()
        .map(|target| {
            observed
                .hosts()
                .iter()
                .filter(|(_, host)| target.matches(&host.labels))
                .map(|(id, _)| id)
                .collect()
        })
        .collect();

    let allocation = allocate(scaler.instances, &targets, &matching);

    let mut pool: Vec<Candidate> = observed
        .managed_instances(app)
        .filter(|(_, _, record)| &record.component == component_id)
        .map(|(host, instance, record)| Candidate {
            host,
            instance,
            record,
        })
        .collect();
    pool.sort_by_key(|c| {
        (
            c.record.started_at,
            c.record.started_sequence,
            c.host,
            c.instance,
        )
    });

    // Instances of an outdated image are never claimed, so they are replaced.
    let mut claimed: Vec<bool> = pool
        .iter()
        .map(|c| c.record.image_ref != component.image_ref)
        .collect();
    let outdated = claimed.clone();

    let mut load: BTreeMap<&HostId, u32> = BTreeMap::new();
    let mut starts: BTreeMap<&HostId, (&Labels, u32)> = BTreeMap::new();

    for (index, target) in targets.iter().enumerate() {
        let wanted = allocation[index] as usize;
        let available: Vec<usize> = (0..pool.len())
            .filter(|&i| !claimed[i] && matching[index].contains(&pool[i].host))
            .collect();

        let keep = wanted.min(available.len());
        for &i in &available[available.len() - keep..] {
            claimed[i] = true;
            *load.entry(pool[i].host).or_default() += 1;
        }

        for _ in keep..wanted {
            let Some(host) = least_loaded(&matching[index], &load) else {
                break;
            };
            *load.entry(host).or_default() += 1;
            starts.entry(host).or_insert((&target.requirements, 0)).1 += 1;
        }
    }

    let mut stops: BTreeMap<&HostId, Vec<InstanceId>> = BTreeMap::new();
    for (i, candidate) in pool.iter().enumerate() {
        if !claimed[i] || outdated[i] {
            stops
                .entry(candidate.host)
                .or_default()
                .push(candidate.instance.clone());
        }
    }

    let mut actions = Vec::with_capacity(starts.len() + stops.len());
    actions.extend(
        starts
            .into_iter()
            .map(|(host, (selector, count))| RequiredAction::StartInstances {
                component: component_id.clone(),
                component_kind: component.kind,
                image_ref: component.image_ref.clone(),
                host: host.clone(),
                selector: selector.clone(),
                count,
            }),
    );
    actions.extend(
        stops
            .into_iter()
            .map(|(host, instances)| RequiredAction::StopInstances {
                component: component_id.clone(),
                host: host.clone(),
                instances,
            }),
    );
    actions
}

/// Per-target allocation; targets matching no host get zero and their share
/// is redistributed across the rest
fn allocate(total: u32, targets: &[&WeightedTarget], matching: &[Vec<&HostId>]) -> Vec<u32> {
    let eligible: Vec<usize> = (0..targets.len())
        .filter(|&i| !matching[i].is_empty())
        .collect();
    let weights: Vec<u32> = eligible.iter().map(|&i| targets[i].weight).collect();

    let mut allocation = vec![0; targets.len()];
    for (share, &i) in largest_remainder(total, &weights).into_iter().zip(&eligible) {
        allocation[i] = share;
    }
    allocation
}

fn least_loaded<'a>(hosts: &[&'a HostId], load: &BTreeMap<&HostId, u32>) -> Option<&'a HostId> {
    hosts
        .iter()
        .copied()
        .min_by(|a, b| {
            let la = load.get(a).copied().unwrap_or(0);
            let lb = load.get(b).copied().unwrap_or(0);
            la.cmp(&lb).then_with(|| a.cmp(b))
        })
}
