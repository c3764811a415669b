//! Per-application status reporting

use crate::actor::{ActorPhase, ActorStatus};
use crate::context::EngineHealth;
use chrono::{DateTime, Utc};
use lattice_manifest::{DeploymentPhase, DeploymentRecord};
use lattice_state::ObservedState;
use lattice_types::{
    AppName, ComponentId, ComponentKind, FailureReport, InstanceStatus, LatticeId, Manifest,
    ManifestSummary,
};
use serde::{Deserialize, Serialize};

/// Where an application stands relative to its desired state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum AppPhase {
    /// Stored but not deployed anywhere
    Undeployed,
    /// Actions are outstanding
    Reconciling,
    /// The last evaluation found nothing to do
    Deployed,
    /// Tearing down before deletion
    Undeploying,
    /// Some command ran out of attempts; retried on the next trigger
    Failed { reason: String },
}

impl AppPhase {
    pub(crate) fn derive(
        deployment: Option<&DeploymentRecord>,
        failures: &[FailureReport],
        in_flight: usize,
        actor: Option<&ActorStatus>,
    ) -> Self {
        let Some(deployment) = deployment else {
            return AppPhase::Undeployed;
        };
        if deployment.phase == DeploymentPhase::Undeploying {
            return AppPhase::Undeploying;
        }
        if let Some(failure) = failures.first() {
            return AppPhase::Failed {
                reason: failure.reason.clone(),
            };
        }

        let settled = actor.is_some_and(|a| {
            a.cycles > 0 && a.phase == ActorPhase::Idle && a.last_actions == 0
        });
        if in_flight == 0 && settled {
            AppPhase::Deployed
        } else {
            AppPhase::Reconciling
        }
    }
}

/// Desired and observed instance counts of one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub id: ComponentId,
    pub name: String,
    pub kind: ComponentKind,
    /// `None` when no scaler manages the count
    pub desired: Option<u32>,
    pub observed: usize,
    pub running: usize,
    pub pending: usize,
    pub failed: usize,
}

impl ComponentStatus {
    pub(crate) fn collect(
        app: &AppName,
        manifest: &Manifest,
        observed: Option<&ObservedState>,
    ) -> Vec<Self> {
        manifest
            .components
            .iter()
            .map(|component| {
                let id = manifest.component_id(component);
                let mut status = ComponentStatus {
                    id: id.clone(),
                    name: component.name.clone(),
                    kind: component.kind,
                    desired: component.spread_scaler().map(|s| s.instances),
                    observed: 0,
                    running: 0,
                    pending: 0,
                    failed: 0,
                };
                let instances = observed
                    .into_iter()
                    .flat_map(|state| state.managed_instances(app))
                    .filter(|(_, _, record)| record.component == id);
                for (_, _, record) in instances {
                    status.observed += 1;
                    match record.status {
                        InstanceStatus::Running => status.running += 1,
                        InstanceStatus::Pending => status.pending += 1,
                        InstanceStatus::Failed => status.failed += 1,
                    }
                }
                status
            })
            .collect()
    }
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub app: AppName,
    pub phase: AppPhase,
    pub lattice: Option<LatticeId>,
    /// Summary of the current version, absent after a forced undeploy
    pub desired: Option<ManifestSummary>,
    pub components: Vec<ComponentStatus>,
    /// Commands awaiting acknowledgement or retry
    pub in_flight: usize,
    /// Commands that exhausted their attempts
    pub failures: Vec<FailureReport>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub engine: EngineHealth,
}

impl StatusReport {
    pub fn version(&self) -> Option<&str> {
        self.desired.as_ref().map(|d| d.version.as_str())
    }

    pub fn component(&self, name: &str) -> Option<&ComponentStatus> {
        self.components.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_types::IdempotencyKey;

    fn idle(cycles: u64, last_actions: usize) -> ActorStatus {
        ActorStatus {
            phase: ActorPhase::Idle,
            cycles,
            last_actions,
            last_reconciled_at: None,
            dormant: false,
        }
    }

    #[test]
    fn test_phase_derivation() {
        let active = DeploymentRecord::active(LatticeId::new("default"));
        let undeploying = DeploymentRecord::undeploying(LatticeId::new("default"));

        assert_eq!(AppPhase::derive(None, &[], 0, None), AppPhase::Undeployed);
        assert_eq!(
            AppPhase::derive(Some(&undeploying), &[], 3, None),
            AppPhase::Undeploying
        );
        assert_eq!(
            AppPhase::derive(Some(&active), &[], 0, None),
            AppPhase::Reconciling
        );
        assert_eq!(
            AppPhase::derive(Some(&active), &[], 0, Some(&idle(1, 2))),
            AppPhase::Reconciling
        );
        assert_eq!(
            AppPhase::derive(Some(&active), &[], 1, Some(&idle(1, 0))),
            AppPhase::Reconciling
        );
        assert_eq!(
            AppPhase::derive(Some(&active), &[], 0, Some(&idle(4, 0))),
            AppPhase::Deployed
        );

        let failure = FailureReport {
            key: IdempotencyKey::derive(
                &LatticeId::new("default"),
                &"shop-api".into(),
                "start",
                "host-a",
            ),
            component: "shop-api".into(),
            attempts: 5,
            reason: "acknowledgement timed out".into(),
            failed_at: Utc::now(),
        };
        assert_eq!(
            AppPhase::derive(Some(&active), &[failure], 0, Some(&idle(4, 0))),
            AppPhase::Failed {
                reason: "acknowledgement timed out".into()
            }
        );
    }
}
