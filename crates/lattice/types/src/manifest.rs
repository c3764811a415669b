//! Desired-state manifest model
//!
//! A [`Manifest`] is immutable once stored: submitting changes produces a new
//! version. Traits form a closed sum type so the scaler can match on them
//! exhaustively.

use crate::{AppName, ComponentId, Labels, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Desired state of one application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Application name (stable identity)
    pub name: AppName,

    /// Version label, assigned by the store when empty
    #[serde(default)]
    pub version: String,

    /// Free-form annotations
    #[serde(default)]
    pub annotations: Labels,

    /// Ordered components
    #[serde(default)]
    pub components: Vec<Component>,
}

/// A named workload unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub kind: ComponentKind,
    pub image_ref: String,
    #[serde(default)]
    pub traits: Vec<Trait>,
}

/// Component variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Executable unit
    Component,
    /// Host-side capability provider
    #[serde(alias = "capability")]
    Provider,
}

/// Declarative behavior attached to a component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trait {
    SpreadScaler(SpreadScaler),
    Link(LinkDefinition),
}

/// Desired instance count and its weighted placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadScaler {
    pub instances: u32,
    #[serde(default)]
    pub spread: Vec<WeightedTarget>,
}

/// Placement constraint for a share of a spread scaler's instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedTarget {
    #[serde(default)]
    pub name: String,

    /// Labels a host must advertise (all must match)
    #[serde(default)]
    pub requirements: Labels,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl WeightedTarget {
    /// Check a host's labels against this target's requirements
    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

fn default_weight() -> u32 {
    100
}

/// Named interface link from the owning component to a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDefinition {
    #[serde(default = "default_link_name")]
    pub name: String,
    pub namespace: String,
    pub package: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    pub target: LinkTarget,
    #[serde(default)]
    pub source_config: Labels,
}

fn default_link_name() -> String {
    "default".to_string()
}

/// Link target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkTarget {
    /// A component declared in the same manifest
    Component(String),
    /// An externally addressable identity, used verbatim
    External(String),
}

impl Manifest {
    pub fn new(name: impl Into<AppName>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            annotations: Labels::new(),
            components: Vec::new(),
        }
    }

    pub fn with_component(mut self, component: Component) -> Self {
        self.components.push(component);
        self
    }

    /// Parse and validate a JSON manifest document
    pub fn from_json_str(document: &str) -> Result<Self, ValidationError> {
        let manifest: Manifest = serde_json::from_str(document)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Lattice-unique id of one of this manifest's components
    pub fn component_id(&self, component: &Component) -> ComponentId {
        ComponentId::scoped(&self.name, &component.name)
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Return the first structural problem, if any
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }

        let mut names = HashSet::new();
        for component in &self.components {
            if component.name.trim().is_empty() {
                return Err(ValidationError::EmptyComponentName);
            }
            if !names.insert(component.name.as_str()) {
                return Err(ValidationError::DuplicateComponent(component.name.clone()));
            }
            if component.image_ref.trim().is_empty() {
                return Err(ValidationError::MissingImage(component.name.clone()));
            }
        }

        for component in &self.components {
            let scalers = component
                .traits
                .iter()
                .filter(|t| matches!(t, Trait::SpreadScaler(_)))
                .count();
            if scalers > 1 {
                return Err(ValidationError::DuplicateScaler(component.name.clone()));
            }

            let mut links = HashSet::new();
            for link in component.links() {
                if let LinkTarget::Component(target) = &link.target {
                    if !names.contains(target.as_str()) {
                        return Err(ValidationError::UndeclaredLinkTarget {
                            component: component.name.clone(),
                            target: target.clone(),
                        });
                    }
                }
                if !links.insert((&link.name, &link.namespace, &link.package)) {
                    return Err(ValidationError::DuplicateLink {
                        component: component.name.clone(),
                        link: format!("{}:{}/{}", link.namespace, link.package, link.name),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            name: self.name.clone(),
            version: self.version.clone(),
            components: self
                .components
                .iter()
                .map(|c| ComponentSummary {
                    name: c.name.clone(),
                    kind: c.kind,
                    image_ref: c.image_ref.clone(),
                    desired_instances: c.spread_scaler().map(|s| s.instances),
                    links: c.links().count(),
                })
                .collect(),
        }
    }
}

impl Component {
    pub fn new(name: impl Into<String>, kind: ComponentKind, image_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            image_ref: image_ref.into(),
            traits: Vec::new(),
        }
    }

    pub fn with_trait(mut self, component_trait: Trait) -> Self {
        self.traits.push(component_trait);
        self
    }

    /// The component's spread scaler; `None` means its instance count is unmanaged
    pub fn spread_scaler(&self) -> Option<&SpreadScaler> {
        self.traits.iter().find_map(|t| match t {
            Trait::SpreadScaler(scaler) => Some(scaler),
            Trait::Link(_) => None,
        })
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkDefinition> {
        self.traits.iter().filter_map(|t| match t {
            Trait::Link(link) => Some(link),
            Trait::SpreadScaler(_) => None,
        })
    }
}

impl SpreadScaler {
    pub fn new(instances: u32) -> Self {
        Self {
            instances,
            spread: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: WeightedTarget) -> Self {
        self.spread.push(target);
        self
    }
}

impl WeightedTarget {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            requirements: Labels::new(),
            weight,
        }
    }

    pub fn require(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }
}

impl LinkDefinition {
    pub fn new(
        namespace: impl Into<String>,
        package: impl Into<String>,
        target: LinkTarget,
    ) -> Self {
        Self {
            name: default_link_name(),
            namespace: namespace.into(),
            package: package.into(),
            interfaces: Vec::new(),
            target,
            source_config: Labels::new(),
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }
}

/// Condensed view of a manifest for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub name: AppName,
    pub version: String,
    pub components: Vec<ComponentSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSummary {
    pub name: String,
    pub kind: ComponentKind,
    pub image_ref: String,
    pub desired_instances: Option<u32>,
    pub links: usize,
}
