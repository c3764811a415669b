//! In-flight command tracking
//!
//! Every command lives in the table under its idempotency key:
//!
//! ```text
//! AwaitingAck --timeout/nack--> Backoff --due--> AwaitingAck
//!      |                           |
//!      +--ack--> Settled           +--exhausted--> Failed
//! ```
//!
//! While a key is awaiting acknowledgement or backing off, new actions with
//! the same key are merged into it. A settled entry suppresses repeats of
//! what it already did until lattice events show its effect, or its TTL
//! expires. A failed entry stays visible until it expires, its effect is
//! observed, or the next dispatch for its key replaces it.
//!
//! Observed events are authoritative: once [`CommandDispatcher::observe`]
//! reports activity for a command's component, a late acknowledgement or a
//! timeout retires the entry instead of retrying it.

use crate::{CommandSink, DispatchError, Result, RetryPolicy, SinkError};
use chrono::Utc;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use lattice_types::{
    AckResult, AppName, Command, CommandAck, CommandHandle, ComponentId, FailureReport, HostId,
    IdempotencyKey, LatticeId, RequiredAction,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Result of dispatching an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A new command was sent
    Sent(CommandHandle),
    /// An in-flight command already covers this key
    Merged(CommandHandle),
    /// A recently acknowledged command already did this
    Suppressed(CommandHandle),
}

impl DispatchOutcome {
    pub fn handle(&self) -> CommandHandle {
        match self {
            DispatchOutcome::Sent(h) | DispatchOutcome::Merged(h) | DispatchOutcome::Suppressed(h) => *h,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, DispatchOutcome::Sent(_))
    }
}

/// What a failure or acknowledgement did to its entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Settled,
    Retrying { attempt: u32, retry_in: Duration },
    Failed(FailureReport),
    /// The ack refers to a replaced command or a finished entry
    Stale,
}

/// Work done by one [`CommandDispatcher::reap_timeouts`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Commands resent, with their new attempt number
    pub retried: Vec<(IdempotencyKey, u32)>,
    /// Commands that ran out of attempts
    pub failed: Vec<FailureReport>,
    /// Settled or failed entries dropped after their TTL
    pub expired: usize,
    /// Unacknowledged commands retired because their effect was observed
    pub observed: usize,
}

#[derive(Debug)]
enum EntryState {
    AwaitingAck { deadline: Instant },
    Backoff { retry_at: Instant },
    Settled { expires_at: Instant },
    Failed { expires_at: Instant, report: FailureReport },
}

impl EntryState {
    fn in_flight(&self) -> bool {
        matches!(self, EntryState::AwaitingAck { .. } | EntryState::Backoff { .. })
    }
}

#[derive(Debug)]
struct Tracked {
    command: Command,
    state: EntryState,
    /// Lattice events for the command's target arrived
    observed: bool,
}

impl Tracked {
    fn sent(command: Command, deadline: Instant) -> Self {
        Self {
            command,
            state: EntryState::AwaitingAck { deadline },
            observed: false,
        }
    }

    fn concerns(&self, lattice: &LatticeId, component: &ComponentId, host: Option<&HostId>) -> bool {
        if &self.command.lattice != lattice || self.command.component() != component {
            return false;
        }
        match (host, action_host(&self.command.action)) {
            (Some(host), Some(target)) => host == target,
            _ => true,
        }
    }
}

/// Dispatches actions as commands and tracks them until they settle
pub struct CommandDispatcher {
    sink: Arc<dyn CommandSink>,
    policy: RetryPolicy,
    entries: DashMap<IdempotencyKey, Tracked>,
    handles: DashMap<CommandHandle, IdempotencyKey>,
}

impl CommandDispatcher {
    pub fn new(sink: Arc<dyn CommandSink>, policy: RetryPolicy) -> Self {
        Self {
            sink,
            policy,
            entries: DashMap::new(),
            handles: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `action` unless a command with the same key already covers it
    #[instrument(skip_all, fields(lattice = %lattice, app = %app, kind = %action.kind()))]
    pub async fn dispatch(
        &self,
        lattice: &LatticeId,
        app: &AppName,
        action: RequiredAction,
    ) -> Result<DispatchOutcome> {
        let now = Instant::now();
        let key = action.idempotency_key(lattice);

        let command = match self.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let tracked = occupied.get();
                let handle = tracked.command.handle;
                match &tracked.state {
                    state if state.in_flight() => {
                        debug!(key = %key, "Merged into in-flight command");
                        return Ok(DispatchOutcome::Merged(handle));
                    }
                    EntryState::Settled { expires_at }
                        if *expires_at > now && covers(&tracked.command.action, &action) =>
                    {
                        debug!(key = %key, "Suppressed repeat of settled command");
                        return Ok(DispatchOutcome::Suppressed(handle));
                    }
                    _ => {}
                }
                self.handles.remove(&handle);
                let command = Command::new(lattice.clone(), app.clone(), action);
                occupied.insert(Tracked::sent(
                    command.clone(),
                    now + self.policy.ack_timeout,
                ));
                command
            }
            MapEntry::Vacant(vacant) => {
                let command = Command::new(lattice.clone(), app.clone(), action);
                vacant.insert(Tracked::sent(
                    command.clone(),
                    now + self.policy.ack_timeout,
                ));
                command
            }
        };

        self.handles.insert(command.handle, key);
        self.send(&command).await?;
        Ok(DispatchOutcome::Sent(command.handle))
    }

    /// Apply an acknowledgement from the lattice
    pub fn on_ack(&self, ack: CommandAck) -> Result<AckOutcome> {
        let key = self
            .handles
            .get(&ack.handle)
            .map(|k| k.clone())
            .ok_or(DispatchError::UnknownHandle(ack.handle))?;

        match ack.result {
            AckResult::Success => {
                let retire = {
                    let Some(mut tracked) = self.entries.get_mut(&key) else {
                        return Ok(AckOutcome::Stale);
                    };
                    if tracked.command.handle != ack.handle {
                        return Ok(AckOutcome::Stale);
                    }
                    info!(key = %key, attempt = tracked.command.attempt, "Command acknowledged");
                    if !tracked.observed {
                        tracked.state = EntryState::Settled {
                            expires_at: Instant::now() + self.policy.entry_ttl,
                        };
                    }
                    tracked.observed
                };
                if retire {
                    self.retire(&key, ack.handle);
                }
                Ok(AckOutcome::Settled)
            }
            AckResult::Failure { retryable, reason } => {
                Ok(self.record_failure(&key, ack.handle, reason, retryable))
            }
        }
    }

    /// Fail overdue commands, resend those whose backoff elapsed, and drop expired entries
    pub async fn reap_timeouts(&self) -> Result<ReapReport> {
        let now = Instant::now();
        let mut report = ReapReport::default();
        let mut timed_out = Vec::new();
        let mut due = Vec::new();
        let mut expired = Vec::new();
        let mut retired = Vec::new();

        for tracked in self.entries.iter() {
            let key = tracked.key().clone();
            let handle = tracked.command.handle;
            match &tracked.state {
                EntryState::AwaitingAck { deadline } if *deadline <= now => {
                    if tracked.observed {
                        retired.push((key, handle));
                    } else {
                        timed_out.push((key, handle));
                    }
                }
                EntryState::Backoff { retry_at } if *retry_at <= now => {
                    if tracked.observed {
                        retired.push((key, handle));
                    } else {
                        due.push(key);
                    }
                }
                EntryState::Settled { expires_at } | EntryState::Failed { expires_at, .. }
                    if *expires_at <= now =>
                {
                    expired.push(key);
                }
                _ => {}
            }
        }

        for (key, handle) in retired {
            if self.retire(&key, handle) {
                debug!(key = %key, "Command effect observed, retiring");
                report.observed += 1;
            }
        }

        for (key, handle) in timed_out {
            let outcome =
                self.record_failure(&key, handle, "acknowledgement timed out".to_string(), true);
            if let AckOutcome::Failed(failure) = outcome {
                report.failed.push(failure);
            }
        }

        for key in expired {
            let removed = self.entries.remove_if(&key, |_, tracked| match &tracked.state {
                EntryState::Settled { expires_at } | EntryState::Failed { expires_at, .. } => {
                    *expires_at <= now
                }
                _ => false,
            });
            if let Some((_, tracked)) = removed {
                self.handles.remove(&tracked.command.handle);
                report.expired += 1;
            }
        }

        for key in due {
            let command = {
                let Some(mut tracked) = self.entries.get_mut(&key) else {
                    continue;
                };
                if !matches!(tracked.state, EntryState::Backoff { retry_at } if retry_at <= now) {
                    continue;
                }
                tracked.command.attempt += 1;
                tracked.command.issued_at = Utc::now();
                tracked.state = EntryState::AwaitingAck {
                    deadline: now + self.policy.ack_timeout,
                };
                tracked.command.clone()
            };

            report.retried.push((key, command.attempt));
            if let Some(AckOutcome::Failed(failure)) = self.send(&command).await? {
                report.failed.push(failure);
            }
        }

        Ok(report)
    }

    /// Record lattice activity for `component`, optionally on one host
    ///
    /// Settled and failed entries for it stop suppressing new work; in-flight
    /// ones are retired at their acknowledgement or timeout instead of being
    /// retried. Returns the number of entries dropped.
    pub fn observe(&self, lattice: &LatticeId, component: &ComponentId, host: Option<&HostId>) -> usize {
        let mut settled = Vec::new();
        for mut tracked in self.entries.iter_mut() {
            if !tracked.concerns(lattice, component, host) {
                continue;
            }
            if matches!(tracked.state, EntryState::Settled { .. } | EntryState::Failed { .. }) {
                settled.push((tracked.key().clone(), tracked.command.handle));
            } else if tracked.state.in_flight() {
                tracked.observed = true;
            }
        }

        settled
            .into_iter()
            .filter(|(key, handle)| self.retire(key, *handle))
            .count()
    }

    /// Drop an entry unless it was replaced meanwhile
    fn retire(&self, key: &IdempotencyKey, handle: CommandHandle) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, tracked| tracked.command.handle == handle)
            .is_some();
        if removed {
            self.handles.remove(&handle);
        }
        removed
    }

    async fn send(&self, command: &Command) -> Result<Option<AckOutcome>> {
        match self.sink.send(command).await {
            Ok(()) => {
                debug!(key = %command.key, attempt = command.attempt, "Command sent");
                Ok(None)
            }
            Err(SinkError::Transient(reason)) => Ok(Some(self.record_failure(
                &command.key,
                command.handle,
                reason,
                true,
            ))),
            Err(fatal @ SinkError::Fatal(_)) => {
                error!(key = %command.key, error = %fatal, "Command transport unavailable");
                self.record_failure(&command.key, command.handle, fatal.to_string(), false);
                Err(fatal.into())
            }
        }
    }

    fn record_failure(
        &self,
        key: &IdempotencyKey,
        handle: CommandHandle,
        reason: String,
        retryable: bool,
    ) -> AckOutcome {
        let Some(mut tracked) = self.entries.get_mut(key) else {
            return AckOutcome::Stale;
        };
        if tracked.command.handle != handle || !tracked.state.in_flight() {
            return AckOutcome::Stale;
        }

        let now = Instant::now();
        let attempt = tracked.command.attempt;
        if retryable && !self.policy.exhausted(attempt) {
            let retry_in = self.policy.backoff(attempt);
            tracked.state = EntryState::Backoff {
                retry_at: now + retry_in,
            };
            warn!(key = %key, attempt, ?retry_in, reason = %reason, "Command failed, will retry");
            return AckOutcome::Retrying { attempt, retry_in };
        }

        let failure = FailureReport {
            key: key.clone(),
            component: tracked.command.component().clone(),
            attempts: attempt,
            reason,
            failed_at: Utc::now(),
        };
        error!(key = %key, attempts = attempt, reason = %failure.reason, "Command failed");
        tracked.state = EntryState::Failed {
            expires_at: now + self.policy.entry_ttl,
            report: failure.clone(),
        };
        AckOutcome::Failed(failure)
    }

    /// Commands awaiting acknowledgement or retry
    pub fn in_flight_count(&self) -> usize {
        self.entries.iter().filter(|t| t.state.in_flight()).count()
    }

    pub fn in_flight_for(&self, lattice: &LatticeId, app: &AppName) -> usize {
        self.entries
            .iter()
            .filter(|t| t.state.in_flight() && &t.command.lattice == lattice && &t.command.app == app)
            .count()
    }

    /// Terminal failures still on record for an application
    pub fn failures_for(&self, lattice: &LatticeId, app: &AppName) -> Vec<FailureReport> {
        let mut failures: Vec<_> = self
            .entries
            .iter()
            .filter(|t| &t.command.lattice == lattice && &t.command.app == app)
            .filter_map(|t| match &t.state {
                EntryState::Failed { report, .. } => Some(report.clone()),
                _ => None,
            })
            .collect();
        failures.sort_by(|a, b| a.key.cmp(&b.key));
        failures
    }

    pub fn is_in_flight(&self, key: &IdempotencyKey) -> bool {
        self.entries
            .get(key)
            .map(|t| t.state.in_flight())
            .unwrap_or(false)
    }

    /// The command currently tracked under a handle
    pub fn command(&self, handle: &CommandHandle) -> Option<Command> {
        let key = self.handles.get(handle).map(|k| k.clone())?;
        self.entries.get(&key).map(|t| t.command.clone())
    }
}

fn action_host(action: &RequiredAction) -> Option<&HostId> {
    match action {
        RequiredAction::StartInstances { host, .. } | RequiredAction::StopInstances { host, .. } => {
            Some(host)
        }
        RequiredAction::AddLink(_) | RequiredAction::RemoveLink(_) => None,
    }
}

/// Whether a settled command already did what `next` asks for.
/// A stop naming instances the settled stop did not is new work.
fn covers(settled: &RequiredAction, next: &RequiredAction) -> bool {
    match (settled, next) {
        (
            RequiredAction::StopInstances { instances: done, .. },
            RequiredAction::StopInstances { instances, .. },
        ) => instances.iter().all(|i| done.contains(i)),
        _ => true,
    }
}
