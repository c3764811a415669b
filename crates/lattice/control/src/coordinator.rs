//! Reconciliation coordinator
//!
//! The single entry point of the engine. It accepts manifest and deployment
//! operations, ingests lattice events, routes acknowledgements, and wakes the
//! per-application actors that do the actual evaluation.

use crate::actor::{ActorHandle, ActorStatus, Intent, Trigger, UndeployMode};
use crate::config::ControlConfig;
use crate::context::{EngineContext, EngineHealth};
use crate::error::{ControlError, Result};
use crate::partition::PartitionStrategy;
use crate::status::{AppPhase, ComponentStatus, StatusReport};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use lattice_dispatch::{AckOutcome, CommandDispatcher, CommandSink, RetryPolicy};
use lattice_manifest::{
    DeploymentPhase, DeploymentRecord, InMemoryManifestStore, ManifestError, ManifestStore,
    VersionInfo,
};
use lattice_state::{Applied, ChangeScope, HostReaper, LatticeProjector};
use lattice_types::{
    AckResult, AppName, CommandAck, ControlEvent, ControlEventEnvelope, LatticeEvent,
    LatticeEventKind, LatticeId, Manifest,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

type ActorKey = (LatticeId, AppName);

/// Builder for a [`Coordinator`]
pub struct CoordinatorBuilder {
    config: ControlConfig,
    store: Option<Arc<dyn ManifestStore>>,
    projector: Option<Arc<LatticeProjector>>,
    sink: Option<Arc<dyn CommandSink>>,
    partition: Option<Arc<dyn PartitionStrategy>>,
}

impl CoordinatorBuilder {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            store: None,
            projector: None,
            sink: None,
            partition: None,
        }
    }

    /// Manifest store; defaults to an in-memory store
    pub fn with_store(mut self, store: Arc<dyn ManifestStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Projector; defaults to one sized by the projector config
    pub fn with_projector(mut self, projector: Arc<LatticeProjector>) -> Self {
        self.projector = Some(projector);
        self
    }

    /// Transport for outbound commands (required)
    pub fn with_sink(mut self, sink: Arc<dyn CommandSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Partition strategy; defaults to the one the engine config describes
    pub fn with_partition(mut self, partition: Arc<dyn PartitionStrategy>) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        let config = self.config;
        let sink = self
            .sink
            .ok_or_else(|| ControlError::Config("a command sink is required".to_string()))?;
        let partition = match self.partition {
            Some(partition) => partition,
            None => config.engine.partition.build(&config.engine.instance_id)?,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryManifestStore::new()));
        let projector = self.projector.unwrap_or_else(|| {
            Arc::new(LatticeProjector::with_log_limit(
                config.projector.event_log_limit,
            ))
        });
        let dispatcher = Arc::new(CommandDispatcher::new(
            sink,
            RetryPolicy::from(&config.dispatch),
        ));

        let ctx = Arc::new(EngineContext::new(
            config.engine.instance_id.clone(),
            store,
            projector,
            dispatcher,
            partition,
            config.reconcile.clone(),
        ));
        let reaper = HostReaper::new(
            config.projector.host_interval(),
            config.projector.host_expiry_intervals,
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Coordinator {
            ctx,
            actors: DashMap::new(),
            reaper,
            config,
            shutdown,
            maintenance: Mutex::new(None),
        })
    }
}

/// The reconciliation control loop
pub struct Coordinator {
    ctx: Arc<EngineContext>,
    actors: DashMap<ActorKey, ActorHandle>,
    reaper: HostReaper,
    config: ControlConfig,
    shutdown: watch::Sender<bool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn builder(config: ControlConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub fn engine_id(&self) -> &str {
        &self.ctx.engine_id
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn projector(&self) -> &Arc<LatticeProjector> {
        &self.ctx.projector
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.ctx.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn ManifestStore> {
        &self.ctx.store
    }

    /// Subscribe to control events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ControlEventEnvelope> {
        self.ctx.events.subscribe()
    }

    // Manifest operations

    /// Store a new version and make it current; a deployed application
    /// reconciles towards it immediately
    #[instrument(skip(self, manifest), fields(app = %manifest.name))]
    pub async fn submit_manifest(&self, manifest: Manifest) -> Result<String> {
        self.ensure_healthy()?;
        self.ensure_owned(&manifest.name).await?;

        let app = manifest.name.clone();
        let version = self.check(self.ctx.store.put(&app, manifest).await)?;
        info!(app = %app, version = %version, "Manifest submitted");
        self.ctx.events.publish(ControlEvent::ManifestSubmitted {
            app: app.clone(),
            version: version.clone(),
        });

        if let Some(record) = self.active_deployment(&app).await? {
            self.trigger(&record.lattice, &app, Intent::Converge, Trigger::Deploy)
                .await;
        }
        Ok(version)
    }

    /// Repoint the current version and reconcile towards it
    #[instrument(skip(self))]
    pub async fn rollback(&self, app: &AppName, version: &str) -> Result<String> {
        self.ensure_healthy()?;
        self.ensure_owned(app).await?;

        let manifest = self.check(self.ctx.store.rollback(app, version).await)?;
        info!(app = %app, version = %manifest.version, "Rolled back");
        self.ctx.events.publish(ControlEvent::RolledBack {
            app: app.clone(),
            version: manifest.version.clone(),
        });

        if let Some(record) = self.active_deployment(app).await? {
            self.trigger(&record.lattice, app, Intent::Converge, Trigger::Rollback)
                .await;
        }
        Ok(manifest.version)
    }

    pub async fn list_applications(&self) -> Result<Vec<AppName>> {
        self.check(self.ctx.store.list_applications().await)
    }

    pub async fn list_versions(&self, app: &AppName) -> Result<Vec<VersionInfo>> {
        self.check(self.ctx.store.list_versions(app).await)
    }

    /// Drop old versions, keeping at most `keep` plus the current one
    pub async fn prune(&self, app: &AppName, keep: usize) -> Result<usize> {
        self.ensure_owned(app).await?;
        self.check(self.ctx.store.prune(app, keep).await)
    }

    // Deployment operations

    /// Deploy the current version, or `version` if given, to `lattice`
    ///
    /// Returns the deployed version once reconciliation has been triggered.
    #[instrument(skip(self))]
    pub async fn deploy(
        &self,
        app: &AppName,
        version: Option<&str>,
        lattice: &LatticeId,
    ) -> Result<String> {
        self.ensure_healthy()?;
        self.ensure_owned(app).await?;

        if let Some(record) = self.check(self.ctx.store.deployment(app).await)? {
            if &record.lattice != lattice {
                return Err(ControlError::AlreadyDeployed {
                    app: app.clone(),
                    lattice: record.lattice,
                });
            }
        }

        let current = self.check(self.ctx.store.get_current(app).await)?;
        let manifest = match version {
            Some(version) if version != current.version => {
                self.check(self.ctx.store.rollback(app, version).await)?
            }
            _ => current,
        };

        self.check(
            self.ctx
                .store
                .set_deployment(app, Some(DeploymentRecord::active(lattice.clone())))
                .await,
        )?;
        self.trigger(lattice, app, Intent::Converge, Trigger::Deploy)
            .await;

        info!(app = %app, lattice = %lattice, version = %manifest.version, "Deploy requested");
        self.ctx.events.publish(ControlEvent::DeployRequested {
            app: app.clone(),
            lattice: lattice.clone(),
            version: manifest.version.clone(),
        });
        Ok(manifest.version)
    }

    /// Remove everything the application manages from its lattice
    ///
    /// `Graceful` deletes the application once nothing it manages is
    /// observed; `Force` deletes it now and tears down afterwards.
    #[instrument(skip(self))]
    pub async fn undeploy(&self, app: &AppName, mode: UndeployMode) -> Result<()> {
        self.ensure_healthy()?;
        self.ensure_owned(app).await?;

        let record = self
            .check(self.ctx.store.deployment(app).await)?
            .ok_or_else(|| ControlError::NotDeployed(app.clone()))?;

        match mode {
            UndeployMode::Graceful => {
                self.check(
                    self.ctx
                        .store
                        .set_deployment(
                            app,
                            Some(DeploymentRecord::undeploying(record.lattice.clone())),
                        )
                        .await,
                )?;
            }
            UndeployMode::Force => {
                self.check(self.ctx.store.delete(app).await)?;
                self.ctx.events.publish(ControlEvent::ApplicationDeleted { app: app.clone() });
            }
        }

        self.trigger(
            &record.lattice,
            app,
            Intent::Teardown(mode),
            Trigger::Undeploy(mode),
        )
        .await;

        info!(app = %app, lattice = %record.lattice, ?mode, "Undeploy requested");
        self.ctx.events.publish(ControlEvent::UndeployRequested {
            app: app.clone(),
            lattice: record.lattice,
            force: mode == UndeployMode::Force,
        });
        Ok(())
    }

    /// Delete an application with its history; a deployed one is force-undeployed
    pub async fn delete_application(&self, app: &AppName) -> Result<bool> {
        self.ensure_healthy()?;
        self.ensure_owned(app).await?;

        if self.check(self.ctx.store.deployment(app).await)?.is_some() {
            self.undeploy(app, UndeployMode::Force).await?;
            return Ok(true);
        }

        let existed = self.check(self.ctx.store.delete(app).await)?;
        if existed {
            info!(app = %app, "Application deleted");
            self.ctx.events.publish(ControlEvent::ApplicationDeleted { app: app.clone() });
        }
        Ok(existed)
    }

    /// Desired summary, observed counts and outstanding work of an application
    pub async fn status(&self, app: &AppName) -> Result<StatusReport> {
        let deployment = self.check(self.ctx.store.deployment(app).await)?;
        let manifest = match self.check(self.ctx.store.get_current(app).await) {
            Ok(manifest) => Some(manifest),
            Err(ControlError::Manifest(ManifestError::NotFound(_))) => None,
            Err(e) => return Err(e),
        };
        if manifest.is_none() && deployment.is_none() {
            return Err(ManifestError::NotFound(app.clone()).into());
        }

        let lattice = deployment.as_ref().map(|d| d.lattice.clone());
        let observed = lattice.as_ref().map(|l| self.ctx.projector.snapshot(l));
        let (in_flight, failures, actor) = match &lattice {
            Some(lattice) => (
                self.ctx.dispatcher.in_flight_for(lattice, app),
                self.ctx.dispatcher.failures_for(lattice, app),
                self.actor_status(lattice, app),
            ),
            None => (0, Vec::new(), None),
        };

        Ok(StatusReport {
            app: app.clone(),
            phase: AppPhase::derive(deployment.as_ref(), &failures, in_flight, actor.as_ref()),
            lattice,
            components: manifest
                .as_ref()
                .map(|m| ComponentStatus::collect(app, m, observed.as_deref()))
                .unwrap_or_default(),
            desired: manifest.as_ref().map(Manifest::summary),
            in_flight,
            failures,
            last_reconciled_at: actor.and_then(|a| a.last_reconciled_at),
            engine: self.ctx.health(),
        })
    }

    // Lattice inputs

    /// Fold one lattice event and wake the actors it concerns
    pub fn ingest(&self, event: LatticeEvent) -> Applied {
        let lattice = event.lattice.clone();
        let target = match &event.kind {
            LatticeEventKind::InstanceStarted { component, .. }
            | LatticeEventKind::InstanceStopped { component, .. } => {
                Some((component.clone(), Some(event.host.clone())))
            }
            LatticeEventKind::LinkSet { link } => Some((link.key.source.clone(), None)),
            LatticeEventKind::LinkDeleted { key } => Some((key.source.clone(), None)),
            _ => None,
        };

        let applied = self.ctx.projector.apply(event);
        if let Applied::Changed(scope) = &applied {
            if let Some((component, host)) = target {
                self.ctx
                    .dispatcher
                    .observe(&lattice, &component, host.as_ref());
            }
            self.notify(&lattice, scope);
        }
        applied
    }

    /// Ingest until the stream ends; losing the stream is fatal
    pub async fn ingest_stream<S>(&self, mut events: S) -> Result<()>
    where
        S: Stream<Item = LatticeEvent> + Unpin,
    {
        while let Some(event) = events.next().await {
            self.ingest(event);
        }

        let reason = "lattice event stream ended".to_string();
        self.ctx.report_fatal(reason.clone());
        Err(ControlError::Unhealthy(reason))
    }

    /// Route an acknowledgement to the dispatcher
    pub fn handle_ack(&self, ack: CommandAck) -> Result<AckOutcome> {
        let origin = self
            .ctx
            .dispatcher
            .command(&ack.handle)
            .map(|c| (c.lattice, c.app));
        let key = ack.key.clone();
        let reason = match &ack.result {
            AckResult::Failure { reason, .. } => Some(reason.clone()),
            AckResult::Success => None,
        };

        let outcome = self.ctx.dispatcher.on_ack(ack)?;
        match &outcome {
            AckOutcome::Retrying { attempt, .. } => {
                self.ctx.events.publish(ControlEvent::CommandRetried {
                    key,
                    attempt: *attempt,
                    reason: reason.unwrap_or_default(),
                });
            }
            AckOutcome::Failed(report) => {
                self.ctx.events.publish(ControlEvent::CommandFailed {
                    key: report.key.clone(),
                    attempts: report.attempts,
                    reason: report.reason.clone(),
                });
            }
            AckOutcome::Settled | AckOutcome::Stale => {}
        }

        // A failure waits for the next natural trigger.
        if outcome == AckOutcome::Settled {
            if let Some((lattice, app)) = origin {
                if let Some(actor) = self.actors.get(&(lattice, app)) {
                    actor.nudge(Trigger::Observed);
                }
            }
        }
        Ok(outcome)
    }

    // Health

    pub fn health(&self) -> EngineHealth {
        self.ctx.health()
    }

    pub fn watch_health(&self) -> watch::Receiver<EngineHealth> {
        self.ctx.watch_health()
    }

    /// Stop acting until [`Coordinator::recover`] is called
    pub fn report_fatal(&self, reason: impl Into<String>) {
        self.ctx.report_fatal(reason);
    }

    /// Resume after a fatal condition was resolved and re-evaluate everything
    pub fn recover(&self) {
        if self.ctx.recover() {
            for actor in self.actors.iter() {
                actor.nudge(Trigger::Resync);
            }
        }
    }

    // Partitioning

    /// Swap the partition strategy and adopt or release applications
    pub async fn set_partition(&self, strategy: Arc<dyn PartitionStrategy>) -> Result<usize> {
        self.ctx.set_partition(strategy).await;
        self.rebalance().await
    }

    /// Start actors for owned deployments and stop those for lost ones
    ///
    /// Returns the number of deployed applications this engine owns.
    pub async fn rebalance(&self) -> Result<usize> {
        let deployments = self.check(self.ctx.store.list_deployments().await)?;
        let partition = self.ctx.partition().await;

        let mut owned = 0;
        let mut changed = false;
        for (app, record) in deployments {
            if !partition.owns(&app) {
                continue;
            }
            owned += 1;
            let intent = match record.phase {
                DeploymentPhase::Active => Intent::Converge,
                DeploymentPhase::Undeploying => Intent::Teardown(UndeployMode::Graceful),
            };
            let (tx, created) = self.ensure_actor(&record.lattice, &app, intent);
            if created {
                changed = true;
                let _ = tx.try_send(Trigger::Resync);
            }
        }

        let lost: Vec<ActorKey> = self
            .actors
            .iter()
            .filter(|actor| !partition.owns(&actor.key().1))
            .map(|actor| actor.key().clone())
            .collect();
        for key in lost {
            if let Some((_, actor)) = self.actors.remove(&key) {
                changed = true;
                info!(lattice = %key.0, app = %key.1, "Released application");
                actor.stop().await;
            }
        }

        if changed {
            info!(engine = %self.ctx.engine_id, owned, "Partition changed");
            self.ctx.events.publish(ControlEvent::PartitionChanged { owned });
        }
        Ok(owned)
    }

    // Maintenance

    /// Fail overdue commands and resend those whose backoff elapsed
    pub async fn reap_commands(&self) -> Result<()> {
        let report = match self.ctx.dispatcher.reap_timeouts().await {
            Ok(report) => report,
            Err(e) => {
                if e.is_fatal() {
                    self.ctx.report_fatal(e.to_string());
                }
                return Err(e.into());
            }
        };

        for (key, attempt) in report.retried {
            self.ctx.events.publish(ControlEvent::CommandRetried {
                key,
                attempt,
                reason: "resent after backoff".to_string(),
            });
        }
        for failure in report.failed {
            self.ctx.events.publish(ControlEvent::CommandFailed {
                key: failure.key,
                attempts: failure.attempts,
                reason: failure.reason,
            });
        }
        if report.expired > 0 {
            debug!(expired = report.expired, "Dropped expired command entries");
        }
        Ok(())
    }

    /// Expire hosts that stopped heartbeating as of `now`
    pub fn reap_hosts_at(&self, now: DateTime<Utc>) -> usize {
        let reaped = self.reaper.reap(&self.ctx.projector, now);
        for (lattice, host) in &reaped {
            self.notify(lattice, &ChangeScope::Lattice);
            self.ctx.events.publish(ControlEvent::HostExpired {
                lattice: lattice.clone(),
                host: host.clone(),
            });
        }
        reaped.len()
    }

    pub fn reap_hosts(&self) -> usize {
        self.reap_hosts_at(Utc::now())
    }

    /// Adopt newly owned deployments and re-evaluate every actor
    pub async fn resync(&self) -> Result<()> {
        self.rebalance().await?;
        for actor in self.actors.iter() {
            actor.nudge(Trigger::Resync);
        }
        Ok(())
    }

    /// Adopt existing deployments and start the maintenance loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let owned = self.rebalance().await?;
        info!(engine = %self.ctx.engine_id, owned, "Coordinator started");

        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut commands = interval(this.config.dispatch.reap_interval());
            let mut hosts = interval(this.config.projector.host_interval());
            let mut resync = interval(this.config.reconcile.resync_interval());
            for timer in [&mut commands, &mut hosts, &mut resync] {
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }

            loop {
                tokio::select! {
                    _ = commands.tick() => {
                        if let Err(e) = this.reap_commands().await {
                            warn!(error = %e, "Command sweep failed");
                        }
                    }
                    _ = hosts.tick() => {
                        this.reap_hosts();
                    }
                    _ = resync.tick() => {
                        if let Err(e) = this.resync().await {
                            warn!(error = %e, "Resync failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Maintenance loop stopped");
        });

        *self.maintenance.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the maintenance loop and every actor, letting in-progress cycles finish
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.maintenance.lock().await.take() {
            let _ = handle.await;
        }

        let keys: Vec<ActorKey> = self.actors.iter().map(|a| a.key().clone()).collect();
        for key in keys {
            if let Some((_, actor)) = self.actors.remove(&key) {
                actor.stop().await;
            }
        }
        info!(engine = %self.ctx.engine_id, "Coordinator stopped");
    }

    /// Progress of the actor for a deployed application
    pub fn actor_status(&self, lattice: &LatticeId, app: &AppName) -> Option<ActorStatus> {
        self.actors
            .get(&(lattice.clone(), app.clone()))
            .map(|actor| actor.status())
    }

    /// Number of application actors currently running
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    // Internals

    fn ensure_healthy(&self) -> Result<()> {
        match self.ctx.health() {
            EngineHealth::Healthy => Ok(()),
            EngineHealth::Unhealthy { reason, .. } => Err(ControlError::Unhealthy(reason)),
        }
    }

    async fn ensure_owned(&self, app: &AppName) -> Result<()> {
        if self.ctx.owns(app).await {
            Ok(())
        } else {
            Err(ControlError::NotAssigned {
                app: app.clone(),
                engine: self.ctx.engine_id.clone(),
            })
        }
    }

    /// Pass store results through, reporting unavailability as fatal
    fn check<T>(&self, result: std::result::Result<T, ManifestError>) -> Result<T> {
        result.map_err(|e| {
            if e.is_fatal() {
                self.ctx.report_fatal(e.to_string());
            }
            ControlError::from(e)
        })
    }

    async fn active_deployment(&self, app: &AppName) -> Result<Option<DeploymentRecord>> {
        Ok(self
            .check(self.ctx.store.deployment(app).await)?
            .filter(|record| record.phase == DeploymentPhase::Active))
    }

    fn ensure_actor(
        &self,
        lattice: &LatticeId,
        app: &AppName,
        intent: Intent,
    ) -> (mpsc::Sender<Trigger>, bool) {
        match self.actors.entry((lattice.clone(), app.clone())) {
            Entry::Occupied(actor) => (actor.get().sender(), false),
            Entry::Vacant(vacant) => {
                debug!(lattice = %lattice, app = %app, "Starting application actor");
                let actor =
                    ActorHandle::spawn(self.ctx.clone(), lattice.clone(), app.clone(), intent);
                let tx = actor.sender();
                vacant.insert(actor);
                (tx, true)
            }
        }
    }

    async fn trigger(&self, lattice: &LatticeId, app: &AppName, intent: Intent, trigger: Trigger) {
        let (tx, _) = self.ensure_actor(lattice, app, intent);
        if tx.send(trigger).await.is_err() {
            warn!(lattice = %lattice, app = %app, "Application actor is gone");
        }
    }

    fn notify(&self, lattice: &LatticeId, scope: &ChangeScope) {
        match scope {
            ChangeScope::App(app) => {
                if let Some(actor) = self.actors.get(&(lattice.clone(), app.clone())) {
                    actor.nudge(Trigger::Observed);
                }
            }
            ChangeScope::Lattice => {
                for actor in self.actors.iter().filter(|a| &a.key().0 == lattice) {
                    actor.nudge(Trigger::Observed);
                }
            }
        }
    }
}
