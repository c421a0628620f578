
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;

use fleet_dispatch::error::FleetError;
use fleet_dispatch::scheduler::{QueueDepth, WorkerRegistry};
use test_harness::capabilities;

/// Queue lengths set directly by the test
#[derive(Default)]
struct FixedDepth(Mutex<HashMap<String, usize>>);

impl FixedDepth {
    fn set(&self, worker_id: &str, length: usize) {
        self.0.lock().unwrap().insert(worker_id.to_string(), length);
    }
}

impl QueueDepth for FixedDepth {
    fn queue_length(&self, identity: &str) -> Option<usize> {
        self.0.lock().unwrap().get(identity).copied()
    }
}

async fn register(registry: &WorkerRegistry, worker_id: &str, types: &[&str]) {
    registry
        .register(worker_id, capabilities(types), Default::default(), Default::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_capability_index_tracks_registration_and_removal() {
    let registry = WorkerRegistry::new();
    register(&registry, "w1", &["text", "image"]).await;
    register(&registry, "w2", &["text"]).await;

    assert_eq!(registry.capable_workers("text").await, vec!["w1", "w2"]);
    assert_eq!(registry.capable_workers("image").await, vec!["w1"]);

    registry.unregister("w1").await.unwrap();
    assert_eq!(registry.capable_workers("text").await, vec!["w2"]);
    assert!(registry.capable_workers("image").await.is_empty());
    assert!(!registry.capability_index().await.contains_key("image"));
    assert!(registry.get("w1").await.is_none());
}

#[tokio::test]
async fn test_disabled_capability_is_not_indexed() {
    let registry = WorkerRegistry::new();
    let mut caps = capabilities(&["text"]);
    caps.insert("audio".to_string(), false);
    registry
        .register("w1", caps, Default::default(), Default::default())
        .await
        .unwrap();

    assert!(registry.capable_workers("audio").await.is_empty());
    assert!(registry.find_first_capable("audio").await.is_none());
}

#[tokio::test]
async fn test_blank_identity_rejected() {
    let registry = WorkerRegistry::new();
    for identity in ["", "   ", "has space"] {
        let err = registry
            .register(identity, capabilities(&["text"]), Default::default(), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidIdentity(_)));
    }
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_duplicate_registration_leaves_live_record() {
    let registry = WorkerRegistry::new();
    register(&registry, "w1", &["text"]).await;
    let live = registry.get("w1").await.unwrap();

    let err = registry
        .register("w1", capabilities(&["image"]), Default::default(), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::DuplicateWorker(ref id) if id == "w1"));
    assert!(!live.is_terminating());
    assert!(Arc::ptr_eq(&registry.get("w1").await.unwrap(), &live));
    assert_eq!(registry.capable_workers("text").await, vec!["w1"]);
    assert!(registry.capable_workers("image").await.is_empty());

    // The identity is free again once the live record is unregistered.
    registry.unregister_record(&live).await;
    register(&registry, "w1", &["text"]).await;
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn test_unregister_record_ignores_replaced_record() {
    let registry = WorkerRegistry::new();
    register(&registry, "w1", &["text"]).await;
    let old = registry.unregister("w1").await.unwrap();
    register(&registry, "w1", &["text"]).await;

    assert!(!registry.unregister_record(&old).await);
    assert!(registry.get("w1").await.is_some());
}

#[tokio::test]
async fn test_find_first_capable_uses_registration_order() {
    let registry = WorkerRegistry::new();
    register(&registry, "w2", &["text"]).await;
    register(&registry, "w1", &["text"]).await;

    let first = registry.find_first_capable("text").await.unwrap();
    assert_eq!(first.identity, "w2");
    assert!(registry.find_first_capable("video").await.is_none());
}

#[tokio::test]
async fn test_fewest_queued_ties_keep_earliest() {
    let registry = WorkerRegistry::new();
    let depth = FixedDepth::default();
    for id in ["w1", "w2", "w3"] {
        register(&registry, id, &["text"]).await;
        depth.set(id, 2);
    }
    depth.set("w3", 1);

    let picked = registry.find_fewest_queued("text", None, &depth).await.unwrap();
    assert_eq!(picked.identity, "w3");

    depth.set("w3", 2);
    let picked = registry.find_fewest_queued("text", None, &depth).await.unwrap();
    assert_eq!(picked.identity, "w1");
}

#[tokio::test]
async fn test_fewest_queued_matches_minimum_randomized() {
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let registry = WorkerRegistry::new();
        let depth = FixedDepth::default();
        let count = rng.gen_range(1..8);
        let mut lengths = Vec::new();
        for i in 0..count {
            let id = format!("w{}", i);
            register(&registry, &id, &["text"]).await;
            let length = rng.gen_range(0..5);
            depth.set(&id, length);
            lengths.push(length);
        }

        let min = *lengths.iter().min().unwrap();
        let expected = lengths.iter().position(|&l| l == min).unwrap();
        let picked = registry.find_fewest_queued("text", None, &depth).await.unwrap();
        assert_eq!(picked.identity, format!("w{}", expected));
    }
}

#[tokio::test]
async fn test_fewest_queued_honours_exclusion() {
    let registry = WorkerRegistry::new();
    let depth = FixedDepth::default();
    register(&registry, "w1", &["text"]).await;
    register(&registry, "w2", &["text"]).await;
    depth.set("w1", 0);
    depth.set("w2", 5);

    let picked = registry
        .find_fewest_queued("text", Some("w1"), &depth)
        .await
        .unwrap();
    assert_eq!(picked.identity, "w2");

    registry.unregister("w2").await;
    assert!(registry
        .find_fewest_queued("text", Some("w1"), &depth)
        .await
        .is_none());
}

#[tokio::test]
async fn test_find_idle_requires_empty_queue() {
    let registry = WorkerRegistry::new();
    let depth = FixedDepth::default();
    register(&registry, "w1", &["text"]).await;
    register(&registry, "w2", &["text"]).await;
    depth.set("w1", 1);
    depth.set("w2", 1);

    assert!(registry.find_idle("text", None, &depth).await.is_none());

    depth.set("w2", 0);
    let idle = registry.find_idle("text", None, &depth).await.unwrap();
    assert_eq!(idle.identity, "w2");
    assert!(registry.find_idle("text", Some("w2"), &depth).await.is_none());
}

#[tokio::test]
async fn test_terminating_worker_is_never_selected() {
    let registry = WorkerRegistry::new();
    let depth = FixedDepth::default();
    register(&registry, "w1", &["text"]).await;
    register(&registry, "w2", &["text"]).await;
    depth.set("w1", 0);
    depth.set("w2", 3);

    registry.get("w1").await.unwrap().terminate();

    let picked = registry.find_fewest_queued("text", None, &depth).await.unwrap();
    assert_eq!(picked.identity, "w2");
    assert_eq!(registry.find_first_capable("text").await.unwrap().identity, "w2");
    assert!(registry.find_idle("text", None, &depth).await.is_none());
}

#[tokio::test]
async fn test_worker_without_queue_is_skipped() {
    let registry = WorkerRegistry::new();
    let depth = FixedDepth::default();
    register(&registry, "w1", &["text"]).await;
    register(&registry, "w2", &["text"]).await;
    depth.set("w2", 4);

    let picked = registry.find_fewest_queued("text", None, &depth).await.unwrap();
    assert_eq!(picked.identity, "w2");
}
