//! Required actions derived by the scaler

use crate::{
    ActiveLink, ComponentId, ComponentKind, HostId, IdempotencyKey, InstanceId, Labels, LatticeId,
    LinkKey,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An ephemeral compensating action; never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RequiredAction {
    StartInstances {
        component: ComponentId,
        component_kind: ComponentKind,
        image_ref: String,
        host: HostId,
        /// Requirements of the placement target that chose `host`
        selector: Labels,
        count: u32,
    },
    StopInstances {
        component: ComponentId,
        host: HostId,
        /// Oldest first
        instances: Vec<InstanceId>,
    },
    AddLink(ActiveLink),
    RemoveLink(LinkKey),
}

/// Discriminant used in idempotency keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Start,
    Stop,
    AddLink,
    RemoveLink,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Start => "start",
            ActionKind::Stop => "stop",
            ActionKind::AddLink => "add_link",
            ActionKind::RemoveLink => "remove_link",
        }
    }

    /// Stops and link removals cannot be undone by a later convergence round
    pub fn is_destructive(&self) -> bool {
        matches!(self, ActionKind::Stop | ActionKind::RemoveLink)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RequiredAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            RequiredAction::StartInstances { .. } => ActionKind::Start,
            RequiredAction::StopInstances { .. } => ActionKind::Stop,
            RequiredAction::AddLink(_) => ActionKind::AddLink,
            RequiredAction::RemoveLink(_) => ActionKind::RemoveLink,
        }
    }

    pub fn component(&self) -> &ComponentId {
        match self {
            RequiredAction::StartInstances { component, .. }
            | RequiredAction::StopInstances { component, .. } => component,
            RequiredAction::AddLink(link) => &link.key.source,
            RequiredAction::RemoveLink(key) => &key.source,
        }
    }

    /// Target part of the idempotency key: the host, or the link identity
    pub fn target(&self) -> String {
        match self {
            RequiredAction::StartInstances { host, .. }
            | RequiredAction::StopInstances { host, .. } => host.to_string(),
            RequiredAction::AddLink(link) => link_target(&link.key),
            RequiredAction::RemoveLink(key) => link_target(key),
        }
    }

    pub fn idempotency_key(&self, lattice: &LatticeId) -> IdempotencyKey {
        IdempotencyKey::derive(lattice, self.component(), self.kind().as_str(), &self.target())
    }

    /// Number of instances started or stopped, zero for link actions
    pub fn instance_delta(&self) -> u32 {
        match self {
            RequiredAction::StartInstances { count, .. } => *count,
            RequiredAction::StopInstances { instances, .. } => instances.len() as u32,
            RequiredAction::AddLink(_) | RequiredAction::RemoveLink(_) => 0,
        }
    }
}

fn link_target(key: &LinkKey) -> String {
    format!("{}:{}/{}", key.name, key.namespace, key.package)
}
