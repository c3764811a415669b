//! Link convergence
//!
//! Only links the application put itself are compared, so links owned by
//! other applications or created out of band are never removed.

use lattice_state::ObservedState;
use lattice_types::{
    ActiveLink, AppName, ComponentId, LinkDefinition, LinkKey, LinkTarget, RequiredAction,
};
use std::collections::BTreeMap;

/// The link a definition should produce in the lattice
pub(crate) fn resolve(app: &AppName, source: &ComponentId, link: &LinkDefinition) -> ActiveLink {
    let target = match &link.target {
        LinkTarget::Component(name) => ComponentId::scoped(app, name).to_string(),
        LinkTarget::External(id) => id.clone(),
    };
    ActiveLink {
        key: LinkKey {
            source: source.clone(),
            name: link.name.clone(),
            namespace: link.namespace.clone(),
            package: link.package.clone(),
        },
        target,
        interfaces: link.interfaces.clone(),
        source_config: link.source_config.clone(),
        owner: Some(app.clone()),
    }
}

/// Add missing or drifted links, remove owned links no longer declared
pub(crate) fn converge(
    app: &AppName,
    desired: BTreeMap<LinkKey, ActiveLink>,
    observed: &ObservedState,
) -> Vec<RequiredAction> {
    let mut actions = Vec::new();

    for (key, link) in &desired {
        match observed.link(key) {
            Some(current) if current.same_wiring(link) => {}
            _ => actions.push(RequiredAction::AddLink(link.clone())),
        }
    }

    actions.extend(
        observed
            .links_owned_by(app)
            .filter(|link| !desired.contains_key(&link.key))
            .map(|link| RequiredAction::RemoveLink(link.key.clone())),
    );

    actions
}
