//! # Lattice Scaler
//!
//! Pure, deterministic evaluation of a manifest against an observed-state
//! snapshot. [`evaluate`] returns the compensating actions needed to close
//! the gap; calling it again with the same inputs returns the same list in
//! the same order.
//!
//! Per component:
//! - A spread scaler manages the instance count; without one the count is
//!   left alone
//! - Link traits are converged against the links the application owns
//!
//! Managed instances of components the manifest no longer declares are
//! stopped.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod allocation;
mod link;
mod spread;

use lattice_state::ObservedState;
use lattice_types::{AppName, ComponentId, HostId, InstanceId, Manifest, RequiredAction, Trait};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

pub use allocation::largest_remainder;

/// Actions converging `observed` on `manifest`
pub fn evaluate(manifest: &Manifest, observed: &ObservedState) -> Vec<RequiredAction> {
    let app = &manifest.name;
    let mut actions = Vec::new();
    let mut declared = BTreeSet::new();
    let mut desired_links = BTreeMap::new();

    for component in &manifest.components {
        let component_id = manifest.component_id(component);
        for component_trait in &component.traits {
            match component_trait {
                Trait::SpreadScaler(scaler) => actions.extend(spread::evaluate(
                    app,
                    &component_id,
                    component,
                    scaler,
                    observed,
                )),
                Trait::Link(definition) => {
                    let link = link::resolve(app, &component_id, definition);
                    desired_links.insert(link.key.clone(), link);
                }
            }
        }
        declared.insert(component_id);
    }

    actions.extend(stop_orphans(app, &declared, observed));
    actions.extend(link::converge(app, desired_links, observed));

    trace!(app = %app, version = %manifest.version, actions = actions.len(), "Evaluated manifest");
    actions
}

/// Actions removing everything `app` manages: all instances and owned links
pub fn evaluate_teardown(app: &AppName, observed: &ObservedState) -> Vec<RequiredAction> {
    evaluate(&Manifest::new(app.clone(), ""), observed)
}

fn stop_orphans(
    app: &AppName,
    declared: &BTreeSet<ComponentId>,
    observed: &ObservedState,
) -> Vec<RequiredAction> {
    let mut orphans: BTreeMap<(&ComponentId, &HostId), Vec<(_, &InstanceId)>> = BTreeMap::new();
    for (host, instance, record) in observed.managed_instances(app) {
        if !declared.contains(&record.component) {
            orphans
                .entry((&record.component, host))
                .or_default()
                .push(((record.started_at, record.started_sequence), instance));
        }
    }

    orphans
        .into_iter()
        .map(|((component, host), mut instances)| {
            instances.sort();
            RequiredAction::StopInstances {
                component: component.clone(),
                host: host.clone(),
                instances: instances.into_iter().map(|(_, id)| id.clone()).collect(),
            }
        })
        .collect()
}
