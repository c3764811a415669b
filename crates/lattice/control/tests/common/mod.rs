//! A simulated lattice that executes dispatched commands like real hosts

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use lattice_control::{ControlConfig, Coordinator};
use lattice_dispatch::RecordingSink;
use lattice_types::{
    Command, CommandAck, ComponentId, HostId, InstanceId, Labels, LatticeEvent, LatticeEventKind, LatticeId,
    RequiredAction,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub fn test_config() -> ControlConfig {
    let mut config = ControlConfig::development();
    config.reconcile.debounce_ms = 20;
    config
}

pub fn coordinator(sink: Arc<RecordingSink>) -> Coordinator {
    Coordinator::builder(test_config())
        .with_sink(sink)
        .build()
        .unwrap()
}

/// Let actors drain their queues; time is paused in these tests
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

pub struct SimLattice {
    pub id: LatticeId,
    pub sink: Arc<RecordingSink>,
    sequences: HashMap<HostId, u64>,
    next_instance: u64,
    /// Host that reports link events
    link_host: Option<HostId>,
    /// Commands the simulated hosts refuse to act on, by host
    down: Vec<HostId>,
}

impl SimLattice {
    pub fn new(id: &str, sink: Arc<RecordingSink>) -> Self {
        Self {
            id: LatticeId::new(id),
            sink,
            sequences: HashMap::new(),
            next_instance: 0,
            link_host: None,
            down: Vec::new(),
        }
    }

    fn event(&mut self, host: &HostId, kind: LatticeEventKind) -> LatticeEvent {
        let sequence = self.sequences.entry(host.clone()).or_insert(0);
        *sequence += 1;
        LatticeEvent::new(self.id.clone(), host.clone(), *sequence, kind)
    }

    pub fn start_host(&mut self, coordinator: &Coordinator, host: &str, labels: &[(&str, &str)]) {
        let host = HostId::new(host);
        let labels: Labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if self.link_host.is_none() {
            self.link_host = Some(host.clone());
        }
        let event = self.event(
            &host,
            LatticeEventKind::HostStarted {
                labels,
                boot_epoch: None,
            },
        );
        coordinator.ingest(event);
    }

    /// Heartbeat stamped with an explicit time
    pub fn heartbeat_at(
        &mut self,
        coordinator: &Coordinator,
        host: &str,
        labels: &[(&str, &str)],
        at: DateTime<Utc>,
    ) {
        let host = HostId::new(host);
        let labels: Labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let event = self.event(&host, LatticeEventKind::HostHeartbeat { labels }).at(at);
        coordinator.ingest(event);
    }

    pub fn provider_health(
        &mut self,
        coordinator: &Coordinator,
        host: &str,
        component: &str,
        healthy: bool,
    ) {
        let host = HostId::new(host);
        let event = self.event(
            &host,
            LatticeEventKind::ProviderHealth {
                component: ComponentId::new(component),
                healthy,
            },
        );
        coordinator.ingest(event);
    }

    pub fn stop_host(&mut self, coordinator: &Coordinator, host: &str) {
        let host = HostId::new(host);
        let event = self.event(&host, LatticeEventKind::HostStopped);
        coordinator.ingest(event);
    }

    /// Commands to this host are acknowledged but never carried out
    pub fn break_host(&mut self, host: &str) {
        self.down.push(HostId::new(host));
    }

    /// Carry out and acknowledge every command sent so far
    pub fn execute(&mut self, coordinator: &Coordinator) -> Vec<Command> {
        let commands = self.sink.drain();
        for command in &commands {
            self.apply(coordinator, command);
            coordinator
                .handle_ack(CommandAck::success(command))
                .unwrap();
        }
        commands
    }

    fn apply(&mut self, coordinator: &Coordinator, command: &Command) {
        match &command.action {
            RequiredAction::StartInstances {
                component,
                component_kind,
                image_ref,
                host,
                count,
                ..
            } => {
                if self.down.contains(host) {
                    return;
                }
                for _ in 0..*count {
                    self.next_instance += 1;
                    let instance = InstanceId::new(format!("inst-{}", self.next_instance));
                    let event = self.event(
                        host,
                        LatticeEventKind::InstanceStarted {
                            component: component.clone(),
                            component_kind: *component_kind,
                            image_ref: image_ref.clone(),
                            instance,
                            annotations: command.annotations.clone(),
                        },
                    );
                    coordinator.ingest(event);
                }
            }
            RequiredAction::StopInstances {
                component,
                host,
                instances,
            } => {
                if self.down.contains(host) {
                    return;
                }
                for instance in instances {
                    let event = self.event(
                        host,
                        LatticeEventKind::InstanceStopped {
                            component: component.clone(),
                            instance: instance.clone(),
                        },
                    );
                    coordinator.ingest(event);
                }
            }
            RequiredAction::AddLink(link) => {
                if let Some(host) = self.link_host.clone() {
                    let event = self.event(&host, LatticeEventKind::LinkSet { link: link.clone() });
                    coordinator.ingest(event);
                }
            }
            RequiredAction::RemoveLink(key) => {
                if let Some(host) = self.link_host.clone() {
                    let event = self.event(&host, LatticeEventKind::LinkDeleted { key: key.clone() });
                    coordinator.ingest(event);
                }
            }
        }
    }

    /// Alternate settling and executing until no more commands are sent
    pub async fn converge(&mut self, coordinator: &Coordinator) -> Vec<Command> {
        let mut executed = Vec::new();
        for _ in 0..20 {
            settle().await;
            let commands = self.execute(coordinator);
            if commands.is_empty() {
                return executed;
            }
            executed.extend(commands);
        }
        panic!("lattice did not converge");
    }
}
