//! Command transport seam

use crate::SinkError;
use async_trait::async_trait;
use lattice_types::Command;
use std::sync::Mutex;

/// Delivers commands to the lattice; acknowledgements arrive separately
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send(&self, command: &Command) -> Result<(), SinkError>;
}

/// Sink that records every command, for tests and dry runs
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Command>>,
    failure: Mutex<Option<SinkError>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send with `error` until cleared with `None`
    pub fn fail_with(&self, error: Option<SinkError>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = error;
        }
    }

    /// Every command sent so far, retries included
    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Remove and return the commands sent so far
    pub fn drain(&self) -> Vec<Command> {
        self.sent
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandSink for RecordingSink {
    async fn send(&self, command: &Command) -> Result<(), SinkError> {
        if let Some(error) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(error);
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.clone());
        }
        Ok(())
    }
}
