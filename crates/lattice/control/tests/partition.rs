//! Multiple engines sharing one store, each acting on its own partition

mod common;

use common::{settle, test_config, SimLattice};
use lattice_control::{
    ConsistentHashPartitioner, ControlConfig, ControlError, Coordinator, PartitionMode,
    StaticAssignment,
};
use lattice_dispatch::RecordingSink;
use lattice_manifest::InMemoryManifestStore;
use lattice_state::LatticeProjector;
use lattice_types::{
    AppName, Component, ComponentKind, ControlEvent, LatticeId, Manifest, SpreadScaler, Trait,
};
use std::sync::Arc;

const PEERS: [&str; 2] = ["engine-0", "engine-1"];

fn manifest(app: &AppName, version: &str, instances: u32) -> Manifest {
    Manifest::new(app.clone(), version).with_component(
        Component::new("api", ComponentKind::Component, "registry/api:1")
            .with_trait(Trait::SpreadScaler(SpreadScaler::new(instances))),
    )
}

fn hash_config(engine: &str) -> ControlConfig {
    let mut config = test_config();
    config.engine.instance_id = engine.to_string();
    config.engine.partition.mode = PartitionMode::ConsistentHash;
    config.engine.partition.peers = PEERS.iter().map(|p| p.to_string()).collect();
    config
}

fn first_owned_by(ring: &ConsistentHashPartitioner, engine: &str) -> AppName {
    (0..)
        .map(|i| AppName::new(format!("app-{}", i)))
        .find(|app| ring.owner(app) == engine)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_hash_partitioned_engines_act_only_on_their_apps() {
    let store = Arc::new(InMemoryManifestStore::new());
    let projector = Arc::new(LatticeProjector::new());
    let sinks = [Arc::new(RecordingSink::new()), Arc::new(RecordingSink::new())];
    let engines: Vec<Coordinator> = PEERS
        .iter()
        .zip(&sinks)
        .map(|(engine, sink)| {
            Coordinator::builder(hash_config(engine))
                .with_store(store.clone())
                .with_projector(projector.clone())
                .with_sink(sink.clone())
                .build()
                .unwrap()
        })
        .collect();

    let peers: Vec<String> = PEERS.iter().map(|p| p.to_string()).collect();
    let ring = ConsistentHashPartitioner::new("engine-0", &peers, 64).unwrap();
    let first = first_owned_by(&ring, "engine-0");
    let second = first_owned_by(&ring, "engine-1");

    let mut lattice = SimLattice::new("default", sinks[0].clone());
    lattice.start_host(&engines[0], "host-a", &[]);

    let err = engines[1]
        .submit_manifest(manifest(&first, "v1", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotAssigned { .. }));

    for (engine, app) in engines.iter().zip([&first, &second]) {
        engine.submit_manifest(manifest(app, "v1", 1)).await.unwrap();
        engine
            .deploy(app, None, &LatticeId::new("default"))
            .await
            .unwrap();
    }
    settle().await;

    for (sink, app) in sinks.iter().zip([&first, &second]) {
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].app, app);
    }

    // Queries are answered by any engine.
    assert_eq!(engines[1].list_applications().await.unwrap().len(), 2);
    assert_eq!(engines[1].status(&first).await.unwrap().in_flight, 0);
    assert_eq!(engines[0].status(&first).await.unwrap().in_flight, 1);
    assert_eq!(engines[0].actor_count(), 1);
    assert_eq!(engines[1].actor_count(), 1);
}

#[test]
fn test_hash_partition_requires_local_peer() {
    let result = Coordinator::builder(hash_config("engine-9"))
        .with_sink(Arc::new(RecordingSink::new()))
        .build();
    assert!(matches!(result, Err(ControlError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn test_static_assignment_hands_over_an_application() {
    let store = Arc::new(InMemoryManifestStore::new());
    let projector = Arc::new(LatticeProjector::new());
    let app = AppName::new("shop");
    let sinks = [Arc::new(RecordingSink::new()), Arc::new(RecordingSink::new())];
    let assignments = [
        Arc::new(StaticAssignment::new([app.clone()])),
        Arc::new(StaticAssignment::new(Vec::new())),
    ];
    let engines: Vec<Coordinator> = PEERS
        .iter()
        .zip(sinks.iter().zip(&assignments))
        .map(|(engine, (sink, assignment))| {
            let mut config = test_config();
            config.engine.instance_id = engine.to_string();
            Coordinator::builder(config)
                .with_store(store.clone())
                .with_projector(projector.clone())
                .with_sink(sink.clone())
                .with_partition(assignment.clone())
                .build()
                .unwrap()
        })
        .collect();

    let mut lattice = SimLattice::new("default", sinks[0].clone());
    lattice.start_host(&engines[0], "host-a", &[]);
    engines[0].submit_manifest(manifest(&app, "v1", 2)).await.unwrap();
    engines[0].deploy(&app, None, &lattice.id).await.unwrap();
    lattice.converge(&engines[0]).await;

    let mut events = engines[0].subscribe_events();
    assignments[0].revoke(&app);
    assert_eq!(engines[0].rebalance().await.unwrap(), 0);
    assert_eq!(engines[0].actor_count(), 0);
    let mut released = false;
    while let Ok(envelope) = events.try_recv() {
        if let ControlEvent::PartitionChanged { owned } = envelope.event {
            assert_eq!(owned, 0);
            released = true;
        }
    }
    assert!(released);
    assert!(matches!(
        engines[0].submit_manifest(manifest(&app, "v2", 3)).await,
        Err(ControlError::NotAssigned { .. })
    ));

    assignments[1].assign(app.clone());
    assert_eq!(engines[1].rebalance().await.unwrap(), 1);
    settle().await;
    assert!(sinks[1].sent().is_empty(), "adopted application is already converged");

    // The new owner carries on from the shared observed state.
    engines[1].submit_manifest(manifest(&app, "v2", 3)).await.unwrap();
    lattice.sink = sinks[1].clone();
    let executed = lattice.converge(&engines[1]).await;
    assert_eq!(executed.len(), 1);
    assert!(sinks[0].sent().is_empty());
    assert_eq!(
        projector
            .snapshot(&lattice.id)
            .instance_count(&app, &"shop-api".into()),
        3
    );
}
