//! Per-application reconciliation actors
//!
//! Each deployed (lattice, application) pair gets one task that owns its
//! control loop:
//!
//! ```text
//! Idle --trigger--> Evaluating --actions--> Dispatching --> Idle
//! ```
//!
//! Triggers arriving mid-cycle queue in the actor's channel and are folded
//! into the next cycle, which evaluates against the then-current snapshot.
//! Observed-state triggers are debounced so a burst of events costs one
//! evaluation.

use crate::context::EngineContext;
use chrono::{DateTime, Utc};
use lattice_manifest::{DeploymentPhase, ManifestError};
use lattice_types::{AppName, ControlEvent, LatticeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How an application is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndeployMode {
    /// Tear down, then delete once nothing managed remains
    Graceful,
    /// Delete immediately, tearing down afterwards
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Deploy,
    Rollback,
    Undeploy(UndeployMode),
    Observed,
    Resync,
    Shutdown,
}

impl Trigger {
    fn is_background(&self) -> bool {
        matches!(self, Trigger::Observed | Trigger::Resync)
    }
}

/// What the actor is driving the application towards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Intent {
    Converge,
    Teardown(UndeployMode),
    /// Teardown finished; waits for a redeploy
    Dormant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorPhase {
    Idle,
    Evaluating,
    Dispatching,
}

/// Progress of one application actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorStatus {
    pub phase: ActorPhase,
    /// Completed evaluation cycles
    pub cycles: u64,
    /// Actions produced by the last cycle
    pub last_actions: usize,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    /// Teardown completed
    pub dormant: bool,
}

impl Default for ActorStatus {
    fn default() -> Self {
        Self {
            phase: ActorPhase::Idle,
            cycles: 0,
            last_actions: 0,
            last_reconciled_at: None,
            dormant: false,
        }
    }
}

/// Coordinator side of an actor
pub(crate) struct ActorHandle {
    tx: mpsc::Sender<Trigger>,
    status: watch::Receiver<ActorStatus>,
    task: JoinHandle<()>,
}

impl ActorHandle {
    pub fn spawn(ctx: Arc<EngineContext>, lattice: LatticeId, app: AppName, intent: Intent) -> Self {
        let (tx, rx) = mpsc::channel(ctx.reconcile.actor_channel_capacity.max(1));
        let (status_tx, status) = watch::channel(ActorStatus::default());
        let actor = AppActor {
            ctx,
            lattice,
            app,
            intent,
            shutdown: false,
            rx,
            status: status_tx,
        };
        let task = tokio::spawn(actor.run());
        Self { tx, status, task }
    }

    pub fn sender(&self) -> mpsc::Sender<Trigger> {
        self.tx.clone()
    }

    /// Queue a background trigger; a full queue already holds one
    pub fn nudge(&self, trigger: Trigger) {
        let _ = self.tx.try_send(trigger);
    }

    pub fn status(&self) -> ActorStatus {
        self.status.borrow().clone()
    }

    /// Ask the actor to stop after its current cycle and wait for it
    pub async fn stop(self) {
        let _ = self.tx.send(Trigger::Shutdown).await;
        let _ = self.task.await;
    }
}

struct AppActor {
    ctx: Arc<EngineContext>,
    lattice: LatticeId,
    app: AppName,
    intent: Intent,
    shutdown: bool,
    rx: mpsc::Receiver<Trigger>,
    status: watch::Sender<ActorStatus>,
}

impl AppActor {
    async fn run(mut self) {
        debug!(lattice = %self.lattice, app = %self.app, "Application actor started");

        while let Some(trigger) = self.rx.recv().await {
            let debounce = trigger == Trigger::Observed;
            self.absorb(trigger);
            if debounce && !self.shutdown {
                self.debounce().await;
            }
            self.drain();
            if self.shutdown {
                break;
            }
            self.cycle().await;
        }

        debug!(lattice = %self.lattice, app = %self.app, "Application actor stopped");
    }

    fn absorb(&mut self, trigger: Trigger) {
        let was_dormant = self.intent == Intent::Dormant;
        match trigger {
            Trigger::Deploy | Trigger::Rollback => self.intent = Intent::Converge,
            Trigger::Undeploy(mode) => {
                self.intent = match self.intent {
                    Intent::Teardown(UndeployMode::Force) => Intent::Teardown(UndeployMode::Force),
                    _ => Intent::Teardown(mode),
                };
            }
            Trigger::Observed | Trigger::Resync => {}
            Trigger::Shutdown => self.shutdown = true,
        }
        if was_dormant && self.intent != Intent::Dormant {
            self.status.send_modify(|s| s.dormant = false);
        }
    }

    /// Wait out the quiet period, returning early for explicit operator triggers
    async fn debounce(&mut self) {
        let window = self.ctx.reconcile.debounce();
        if window.is_zero() {
            return;
        }

        let sleep = tokio::time::sleep(window);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                next = self.rx.recv() => match next {
                    Some(trigger) => {
                        let urgent = !trigger.is_background();
                        self.absorb(trigger);
                        if urgent {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    fn drain(&mut self) {
        for _ in 0..self.ctx.reconcile.max_batch.max(1) {
            match self.rx.try_recv() {
                Ok(trigger) => self.absorb(trigger),
                Err(_) => break,
            }
        }
    }

    async fn cycle(&mut self) {
        if self.intent == Intent::Dormant {
            return;
        }
        if let crate::EngineHealth::Unhealthy { reason, .. } = self.ctx.health() {
            debug!(app = %self.app, reason = %reason, "Engine unhealthy, skipping reconciliation");
            return;
        }
        if !self.ctx.owns(&self.app).await {
            debug!(app = %self.app, "Application not assigned to this engine, skipping");
            return;
        }

        self.status.send_modify(|s| s.phase = ActorPhase::Evaluating);
        let observed = self.ctx.projector.snapshot(&self.lattice);
        let actions = match self.intent {
            Intent::Converge => match self.ctx.store.get_current(&self.app).await {
                Ok(manifest) => lattice_scaler::evaluate(&manifest, &observed),
                Err(ManifestError::NotFound(_)) => {
                    debug!(app = %self.app, "No current manifest, nothing to converge");
                    Vec::new()
                }
                Err(e) => {
                    self.store_failed(e);
                    return;
                }
            },
            Intent::Teardown(_) => lattice_scaler::evaluate_teardown(&self.app, &observed),
            Intent::Dormant => Vec::new(),
        };

        self.status.send_modify(|s| s.phase = ActorPhase::Dispatching);
        let total = actions.len();
        let mut sent = 0;
        for action in actions {
            match self.ctx.dispatcher.dispatch(&self.lattice, &self.app, action).await {
                Ok(outcome) if outcome.is_sent() => sent += 1,
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    self.ctx.report_fatal(e.to_string());
                    break;
                }
                Err(e) => warn!(app = %self.app, error = %e, "Dispatch failed"),
            }
        }

        if total > 0 {
            info!(
                lattice = %self.lattice,
                app = %self.app,
                actions = total,
                sent,
                "Reconciliation cycle dispatched actions"
            );
        }
        self.ctx.events.publish(ControlEvent::ReconcileCompleted {
            app: self.app.clone(),
            lattice: self.lattice.clone(),
            actions: total,
            sent,
        });
        self.status.send_modify(|s| {
            s.phase = ActorPhase::Idle;
            s.cycles += 1;
            s.last_actions = total;
            s.last_reconciled_at = Some(Utc::now());
        });

        if let Intent::Teardown(mode) = self.intent {
            let idle = self.ctx.dispatcher.in_flight_for(&self.lattice, &self.app) == 0;
            if total == 0 && idle {
                self.finish_teardown(mode).await;
            }
        }
    }

    async fn finish_teardown(&mut self, mode: UndeployMode) {
        if mode == UndeployMode::Graceful {
            match self.ctx.store.deployment(&self.app).await {
                Ok(Some(record))
                    if record.phase == DeploymentPhase::Undeploying
                        && record.lattice == self.lattice =>
                {
                    match self.ctx.store.delete(&self.app).await {
                        Ok(_) => {
                            info!(app = %self.app, "Application deleted after undeploy");
                            self.ctx.events.publish(ControlEvent::ApplicationDeleted {
                                app: self.app.clone(),
                            });
                        }
                        Err(e) => {
                            self.store_failed(e);
                            return;
                        }
                    }
                }
                // Redeployed or deleted while tearing down
                Ok(_) => {}
                Err(e) => {
                    self.store_failed(e);
                    return;
                }
            }
        }

        info!(lattice = %self.lattice, app = %self.app, "Teardown complete");
        self.intent = Intent::Dormant;
        self.status.send_modify(|s| s.dormant = true);
    }

    fn store_failed(&self, error: ManifestError) {
        self.status.send_modify(|s| s.phase = ActorPhase::Idle);
        if error.is_fatal() {
            self.ctx.report_fatal(error.to_string());
        } else {
            warn!(app = %self.app, error = %error, "Manifest store error during reconciliation");
        }
    }
}
