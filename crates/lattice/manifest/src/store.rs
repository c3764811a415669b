//! Manifest store contract and in-memory implementation

use crate::{ManifestError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lattice_types::{AppName, LatticeId, Manifest, ValidationError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Versioned manifest storage
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Store a new version and mark it current, returning its label
    async fn put(&self, app: &AppName, manifest: Manifest) -> Result<String>;

    /// Get the current version
    async fn get_current(&self, app: &AppName) -> Result<Manifest>;

    /// Get a specific version
    async fn get_version(&self, app: &AppName, version: &str) -> Result<Manifest>;

    /// Repoint current to an existing version without creating a new one
    async fn rollback(&self, app: &AppName, version: &str) -> Result<Manifest>;

    /// Delete an application with its whole history; returns whether it existed
    async fn delete(&self, app: &AppName) -> Result<bool>;

    /// Version history, oldest first
    async fn list_versions(&self, app: &AppName) -> Result<Vec<VersionInfo>>;

    /// All stored applications, sorted by name
    async fn list_applications(&self) -> Result<Vec<AppName>>;

    /// Drop the oldest non-current versions so at most `keep` remain
    async fn prune(&self, app: &AppName, keep: usize) -> Result<usize>;

    /// Record (or clear) where an application is deployed
    async fn set_deployment(
        &self,
        app: &AppName,
        deployment: Option<DeploymentRecord>,
    ) -> Result<()>;

    /// Where an application is deployed, if anywhere
    async fn deployment(&self, app: &AppName) -> Result<Option<DeploymentRecord>>;

    /// All deployed applications
    async fn list_deployments(&self) -> Result<Vec<(AppName, DeploymentRecord)>>;
}

/// Deployment target of an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub lattice: LatticeId,
    pub phase: DeploymentPhase,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn active(lattice: LatticeId) -> Self {
        Self {
            lattice,
            phase: DeploymentPhase::Active,
            updated_at: Utc::now(),
        }
    }

    pub fn undeploying(lattice: LatticeId) -> Self {
        Self {
            lattice,
            phase: DeploymentPhase::Undeploying,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Active,
    /// Tearing down; the application is deleted once nothing it manages is observed
    Undeploying,
}

/// Metadata about one stored version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub current: bool,
}

struct StoredVersion {
    manifest: Manifest,
    created_at: DateTime<Utc>,
}

struct AppRecord {
    versions: Vec<StoredVersion>,
    current: usize,
    deployment: Option<DeploymentRecord>,
}

impl AppRecord {
    fn find(&self, version: &str) -> Option<usize> {
        self.versions
            .iter()
            .position(|v| v.manifest.version == version)
    }

    fn next_label(&self) -> String {
        let mut n = self.versions.len() + 1;
        loop {
            let label = format!("v{}", n);
            if self.find(&label).is_none() {
                return label;
            }
            n += 1;
        }
    }
}

/// In-memory implementation for development and tests
pub struct InMemoryManifestStore {
    apps: DashMap<AppName, AppRecord>,
}

impl InMemoryManifestStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            apps: DashMap::new(),
        }
    }
}

impl Default for InMemoryManifestStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn put(&self, app: &AppName, mut manifest: Manifest) -> Result<String> {
        if &manifest.name != app {
            return Err(ValidationError::NameMismatch {
                expected: app.to_string(),
                found: manifest.name.to_string(),
            }
            .into());
        }
        manifest.validate()?;

        let mut record = self.apps.entry(app.clone()).or_insert_with(|| AppRecord {
            versions: Vec::new(),
            current: 0,
            deployment: None,
        });

        if manifest.version.is_empty() {
            manifest.version = record.next_label();
        } else if record.find(&manifest.version).is_some() {
            return Err(ManifestError::DuplicateVersion {
                app: app.clone(),
                version: manifest.version,
            });
        }

        let version = manifest.version.clone();
        record.versions.push(StoredVersion {
            manifest,
            created_at: Utc::now(),
        });
        record.current = record.versions.len() - 1;

        debug!(app = %app, version = %version, "Stored manifest version");
        Ok(version)
    }

    async fn get_current(&self, app: &AppName) -> Result<Manifest> {
        let record = self
            .apps
            .get(app)
            .ok_or_else(|| ManifestError::NotFound(app.clone()))?;
        record
            .versions
            .get(record.current)
            .map(|v| v.manifest.clone())
            .ok_or_else(|| ManifestError::NotFound(app.clone()))
    }

    async fn get_version(&self, app: &AppName, version: &str) -> Result<Manifest> {
        let record = self
            .apps
            .get(app)
            .ok_or_else(|| ManifestError::NotFound(app.clone()))?;
        record
            .find(version)
            .map(|i| record.versions[i].manifest.clone())
            .ok_or_else(|| ManifestError::VersionNotFound {
                app: app.clone(),
                version: version.to_string(),
            })
    }

    async fn rollback(&self, app: &AppName, version: &str) -> Result<Manifest> {
        let mut record = self
            .apps
            .get_mut(app)
            .ok_or_else(|| ManifestError::NotFound(app.clone()))?;
        let index = record
            .find(version)
            .ok_or_else(|| ManifestError::VersionNotFound {
                app: app.clone(),
                version: version.to_string(),
            })?;
        record.current = index;

        debug!(app = %app, version = %version, "Repointed current manifest version");
        Ok(record.versions[index].manifest.clone())
    }

    async fn delete(&self, app: &AppName) -> Result<bool> {
        let existed = self.apps.remove(app).is_some();
        if existed {
            debug!(app = %app, "Deleted application");
        }
        Ok(existed)
    }

    async fn list_versions(&self, app: &AppName) -> Result<Vec<VersionInfo>> {
        let record = self
            .apps
            .get(app)
            .ok_or_else(|| ManifestError::NotFound(app.clone()))?;
        Ok(record
            .versions
            .iter()
            .enumerate()
            .map(|(i, v)| VersionInfo {
                version: v.manifest.version.clone(),
                created_at: v.created_at,
                current: i == record.current,
            })
            .collect())
    }

    async fn list_applications(&self) -> Result<Vec<AppName>> {
        let mut apps: Vec<AppName> = self.apps.iter().map(|e| e.key().clone()).collect();
        apps.sort();
        Ok(apps)
    }

    async fn prune(&self, app: &AppName, keep: usize) -> Result<usize> {
        let mut record = self
            .apps
            .get_mut(app)
            .ok_or_else(|| ManifestError::NotFound(app.clone()))?;

        let excess = record.versions.len().saturating_sub(keep.max(1));
        let mut removed = 0;
        let mut index = 0;
        while removed < excess && index < record.versions.len() {
            if index == record.current {
                index += 1;
                continue;
            }
            record.versions.remove(index);
            if index < record.current {
                record.current -= 1;
            }
            removed += 1;
        }

        debug!(app = %app, removed, "Pruned manifest history");
        Ok(removed)
    }

    async fn set_deployment(
        &self,
        app: &AppName,
        deployment: Option<DeploymentRecord>,
    ) -> Result<()> {
        let mut record = self
            .apps
            .get_mut(app)
            .ok_or_else(|| ManifestError::NotFound(app.clone()))?;
        record.deployment = deployment;
        Ok(())
    }

    async fn deployment(&self, app: &AppName) -> Result<Option<DeploymentRecord>> {
        Ok(self.apps.get(app).and_then(|r| r.deployment.clone()))
    }

    async fn list_deployments(&self) -> Result<Vec<(AppName, DeploymentRecord)>> {
        let mut deployments: Vec<_> = self
            .apps
            .iter()
            .filter_map(|e| e.deployment.clone().map(|d| (e.key().clone(), d)))
            .collect();
        deployments.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(deployments)
    }
}
