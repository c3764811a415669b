//! Observability channel for asynchronous outcomes
//!
//! Dispatch failures, exhausted retries and fatal conditions never reach the
//! caller that triggered them. They are published here instead, alongside
//! lifecycle events for deploys, rollbacks and undeploys.

use lattice_types::{ControlEvent, ControlEventEnvelope, EventSeverity};
use tokio::sync::broadcast;
use tracing::trace;

/// Channel capacity for the event stream
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Broadcasts control events to any number of subscribers
#[derive(Clone)]
pub struct EventAggregator {
    engine: String,
    tx: broadcast::Sender<ControlEventEnvelope>,
}

impl EventAggregator {
    pub fn new(engine: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            engine: engine.into(),
            tx,
        }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Emit an event with its default severity
    pub fn publish(&self, event: ControlEvent) {
        let severity = event.severity();
        self.emit(event, severity, None);
    }

    /// Emit an event with explicit severity and correlation
    pub fn emit(&self, event: ControlEvent, severity: EventSeverity, correlation_id: Option<String>) {
        let envelope = ControlEventEnvelope {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            source: event.source(),
            severity,
            engine: self.engine.clone(),
            correlation_id,
            event,
        };
        trace!(source = ?envelope.source, severity = ?envelope.severity, "Publishing control event");
        // No subscribers is fine
        let _ = self.tx.send(envelope);
    }

    pub fn emit_info(&self, event: ControlEvent) {
        self.emit(event, EventSeverity::Info, None);
    }

    pub fn emit_warning(&self, event: ControlEvent) {
        self.emit(event, EventSeverity::Warning, None);
    }

    pub fn emit_error(&self, event: ControlEvent) {
        self.emit(event, EventSeverity::Error, None);
    }

    pub fn emit_critical(&self, event: ControlEvent) {
        self.emit(event, EventSeverity::Critical, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_types::{AppName, EventSource};

    #[tokio::test]
    async fn test_envelope_carries_engine_and_source() {
        let events = EventAggregator::new("engine-1");
        let mut rx = events.subscribe();
        assert_eq!(events.subscriber_count(), 1);

        events.publish(ControlEvent::ApplicationDeleted {
            app: AppName::new("shop"),
        });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.engine, "engine-1");
        assert_eq!(envelope.source, EventSource::Manifest);
        assert_eq!(envelope.severity, EventSeverity::Info);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let events = EventAggregator::new("engine-1");
        events.emit_critical(ControlEvent::EngineUnhealthy {
            reason: "event stream closed".into(),
        });
    }
}
