//! Outbound commands and their acknowledgements

use crate::{
    AppName, CommandHandle, ComponentId, IdempotencyKey, Labels, LatticeId, RequiredAction,
    MANAGED_BY_ANNOTATION,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A required action addressed to the lattice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub handle: CommandHandle,
    pub key: IdempotencyKey,
    pub lattice: LatticeId,
    pub app: AppName,
    /// 1 for the first send, incremented on every retry
    pub attempt: u32,
    pub issued_at: DateTime<Utc>,
    /// Annotations the host attaches to instances it starts
    pub annotations: Labels,
    pub action: RequiredAction,
}

impl Command {
    pub fn new(lattice: LatticeId, app: AppName, action: RequiredAction) -> Self {
        let mut annotations = Labels::new();
        annotations.insert(MANAGED_BY_ANNOTATION.to_string(), app.to_string());

        Self {
            handle: CommandHandle::generate(),
            key: action.idempotency_key(&lattice),
            lattice,
            app,
            attempt: 1,
            issued_at: Utc::now(),
            annotations,
            action,
        }
    }

    pub fn component(&self) -> &ComponentId {
        self.action.component()
    }
}

/// Outcome reported by the lattice for a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AckResult {
    Success,
    Failure { retryable: bool, reason: String },
}

/// Asynchronous acknowledgement referencing a dispatched command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub handle: CommandHandle,
    pub key: IdempotencyKey,
    pub result: AckResult,
}

impl CommandAck {
    pub fn success(command: &Command) -> Self {
        Self {
            handle: command.handle,
            key: command.key.clone(),
            result: AckResult::Success,
        }
    }

    pub fn failure(command: &Command, retryable: bool, reason: impl Into<String>) -> Self {
        Self {
            handle: command.handle,
            key: command.key.clone(),
            result: AckResult::Failure {
                retryable,
                reason: reason.into(),
            },
        }
    }
}

/// A command that failed terminally, kept visible until retried or expired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub key: IdempotencyKey,
    pub component: ComponentId,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}
