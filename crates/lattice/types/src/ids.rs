//! Strongly-typed identifiers for lattice entities
//!
//! Names supplied by operators and hosts are string newtypes; handles minted
//! by the engine itself are UUID-based.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! name_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

name_id!(
    /// Identifier of a lattice (an isolated set of hosts)
    LatticeId
);
name_id!(
    /// Identifier advertised by an execution host
    HostId
);
name_id!(
    /// Stable identity of an application across manifest versions
    AppName
);
name_id!(
    /// Lattice-unique identity of a component or provider
    ComponentId
);
name_id!(
    /// Identifier of one running instance on a host
    InstanceId
);

impl ComponentId {
    /// Scope a manifest-local component name to its application
    pub fn scoped(app: &AppName, component: &str) -> Self {
        Self(format!("{}-{}", app, component))
    }
}

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Handle to a tracked outbound command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandHandle(Uuid);

impl CommandHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd:{}", self.0)
    }
}

/// Deterministic key collapsing retries and duplicate triggers onto one command
///
/// Derived from (lattice, component, action kind, target) so that the same
/// compensating action always maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(lattice: &LatticeId, component: &ComponentId, kind: &str, target: &str) -> Self {
        Self(format!("{}/{}/{}/{}", lattice, component, kind, target))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
