
use std::time::Duration;

use serde_json::json;

use fleet_dispatch::config::ProcessorConfig;
use fleet_dispatch::error::FleetError;
use fleet_dispatch::scheduler::{JobSpec, ProcessorState};
use fleet_dispatch::worker::JobProcessor;
use test_harness::{
    assert_eventually, capabilities, register_payload, test_coordinator, FakeConnection, JobEvent,
    TEST_TOKEN,
};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_registered_worker_receives_submitted_job() {
    let (coordinator, _observer) = test_coordinator();
    let conn = FakeConnection::new();
    let record = coordinator
        .register_worker(register_payload("w1", &["text"]), Some(conn.handle.clone()))
        .await
        .unwrap();
    assert_eq!(record.host_label, "w1.local");

    let spec = JobSpec::new("text", "alice")
        .with_command("chat", "reply")
        .with_params(json!({ "prompt": "hi" }));
    let assignment = coordinator.submit_job(spec).await.unwrap();
    assert_eq!(assignment.worker_id, "w1");

    assert_eventually(
        || async { conn.executed() == vec![assignment.job_id] },
        WAIT,
        "job should be written to the worker",
    )
    .await;

    let frame = conn
        .frames()
        .into_iter()
        .find(|f| f["command"] == "execute_job")
        .unwrap();
    assert_eq!(frame["payload"]["job_type"], "text");
    assert_eq!(frame["payload"]["requester"], "alice");
    assert_eq!(frame["payload"]["module"], "chat");
    assert_eq!(frame["payload"]["params"]["prompt"], "hi");

    assert_eq!(record.assigned_ids(), vec![assignment.job_id]);
    assert_eq!(coordinator.queue_length_for("w1"), Some(1));
}

#[tokio::test]
async fn test_same_type_jobs_run_one_at_a_time() {
    let (coordinator, observer) = test_coordinator();
    let conn = FakeConnection::new();
    let record = coordinator
        .register_worker(register_payload("w1", &["text"]), Some(conn.handle.clone()))
        .await
        .unwrap();

    let first = coordinator.submit_job(JobSpec::new("text", "alice")).await.unwrap();
    let second = coordinator.submit_job(JobSpec::new("text", "bob")).await.unwrap();

    assert_eventually(
        || async { conn.executed() == vec![first.job_id] },
        WAIT,
        "first job should be dispatched",
    )
    .await;
    assert_eventually(
        || async { record.state() == ProcessorState::Assigning },
        WAIT,
        "processor should wait for the text slot",
    )
    .await;
    assert_eq!(conn.executed(), vec![first.job_id]);

    coordinator.complete_job("w1", &first.job_id).await.unwrap();
    assert_eventually(
        || async { conn.executed() == vec![first.job_id, second.job_id] },
        WAIT,
        "second job should follow completion",
    )
    .await;
    assert_eq!(observer.completed(), vec![first.job_id]);
}

#[tokio::test]
async fn test_acknowledge_and_result_reach_observer() {
    let (coordinator, observer) = test_coordinator();
    let conn = FakeConnection::new();
    let record = coordinator
        .register_worker(register_payload("w1", &["text"]), Some(conn.handle.clone()))
        .await
        .unwrap();
    let assignment = coordinator.submit_job(JobSpec::new("text", "alice")).await.unwrap();
    assert_eventually(
        || async { !conn.executed().is_empty() },
        WAIT,
        "job should be dispatched",
    )
    .await;

    coordinator.acknowledge_job("w1", &assignment.job_id).await.unwrap();
    assert!(record.assigned_job(&assignment.job_id).unwrap().is_acknowledged());

    let result = json!({ "text": "done" });
    coordinator
        .record_result("w1", &assignment.job_id, &result)
        .await
        .unwrap();
    assert!(observer
        .events()
        .contains(&JobEvent::Result(assignment.job_id, result)));
    // Still in flight until completion.
    assert!(record.is_busy("text"));

    let unknown = uuid::Uuid::new_v4();
    let err = coordinator.acknowledge_job("w1", &unknown).await.unwrap_err();
    assert!(matches!(err, FleetError::JobNotFound(_)));
    let err = coordinator.complete_job("ghost", &unknown).await.unwrap_err();
    assert!(matches!(err, FleetError::WorkerNotFound(_)));
}

#[tokio::test]
async fn test_failed_delivery_reports_and_drops_job() {
    let (coordinator, observer) = test_coordinator();
    let record = coordinator
        .register_worker(register_payload("w1", &["text"]), None)
        .await
        .unwrap();

    let assignment = coordinator.submit_job(JobSpec::new("text", "alice")).await.unwrap();
    assert_eventually(
        || async {
            observer
                .events()
                .contains(&JobEvent::DeliveryFailed(assignment.job_id))
        },
        WAIT,
        "delivery failure should be reported",
    )
    .await;
    assert!(!record.is_busy("text"));
    assert!(!coordinator.dispatcher().is_live(&assignment.job_id));
}

#[tokio::test]
async fn test_remove_worker_migrates_queue_and_loses_in_flight() {
    let (coordinator, observer) = test_coordinator();
    let conn1 = FakeConnection::new();
    let w1 = coordinator
        .register_worker(register_payload("w1", &["text"]), Some(conn1.handle.clone()))
        .await
        .unwrap();

    let running = coordinator.submit_job(JobSpec::new("text", "alice")).await.unwrap();
    let waiting = coordinator.submit_job(JobSpec::new("text", "bob")).await.unwrap();
    assert_eventually(
        || async { conn1.executed() == vec![running.job_id] },
        WAIT,
        "first job should be dispatched",
    )
    .await;

    let conn2 = FakeConnection::new();
    coordinator
        .register_worker(register_payload("w2", &["text"]), Some(conn2.handle.clone()))
        .await
        .unwrap();

    assert!(coordinator.remove_worker(&w1).await);
    assert!(!coordinator.remove_worker(&w1).await);

    assert_eventually(
        || async { conn2.executed() == vec![waiting.job_id] },
        WAIT,
        "waiting job should run on the peer",
    )
    .await;
    assert_eq!(observer.lost(), vec![running.job_id]);
    assert!(coordinator.registry().get("w1").await.is_none());
    assert_eq!(coordinator.queue_length_for("w1"), None);
}

#[tokio::test]
async fn test_remove_last_worker_loses_queued_jobs() {
    let (coordinator, observer) = test_coordinator();
    let conn = FakeConnection::new();
    let w1 = coordinator
        .register_worker(register_payload("w1", &["image"]), Some(conn.handle.clone()))
        .await
        .unwrap();
    let first = coordinator.submit_job(JobSpec::new("image", "alice")).await.unwrap();
    let second = coordinator.submit_job(JobSpec::new("image", "bob")).await.unwrap();
    assert_eventually(
        || async { w1.state() == ProcessorState::Assigning },
        WAIT,
        "second job should wait for the slot",
    )
    .await;

    coordinator.remove_worker_by_id("w1").await;

    assert_eventually(
        || async {
            let lost = observer.lost();
            lost.contains(&first.job_id) && lost.contains(&second.job_id)
        },
        WAIT,
        "both jobs should be lost",
    )
    .await;
    assert!(coordinator.list_workers().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_registration_evicts_then_rejects() {
    let (coordinator, _observer) = test_coordinator();
    let old_conn = FakeConnection::new();
    let old = coordinator
        .register_worker(register_payload("w1", &["text"]), Some(old_conn.handle.clone()))
        .await
        .unwrap();

    let new_conn = FakeConnection::new();
    let err = coordinator
        .register_worker(register_payload("w1", &["text"]), Some(new_conn.handle.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::DuplicateWorker(_)));
    assert!(old.is_terminating());
    assert!(old.connection().is_none());
    assert!(coordinator.registry().get("w1").await.is_none());

    let fresh = coordinator
        .register_worker(register_payload("w1", &["text"]), Some(new_conn.handle.clone()))
        .await
        .unwrap();
    assert!(!fresh.is_terminating());
}

#[tokio::test]
async fn test_job_held_by_removed_worker_moves_to_peer() {
    let (coordinator, observer) = test_coordinator();
    // w1 has a queue but no processing loop, so the test plays its part.
    let w1 = coordinator
        .registry()
        .register("w1", capabilities(&["text"]), Default::default(), Default::default())
        .await
        .unwrap();
    coordinator.dispatcher().create_queue(&w1);
    let assignment = coordinator.submit_job(JobSpec::new("text", "alice")).await.unwrap();
    assert_eq!(assignment.worker_id, "w1");

    let conn = FakeConnection::new();
    coordinator
        .register_worker(register_payload("w2", &["text"]), Some(conn.handle.clone()))
        .await
        .unwrap();

    let held = coordinator.dispatcher().dequeue(&w1).await.unwrap();
    assert!(coordinator.remove_worker(&w1).await);

    let processor = JobProcessor::new(
        coordinator.dispatcher().clone(),
        w1.clone(),
        ProcessorConfig::default(),
    );
    assert!(!processor.assign_when_free(held).await);
    assert_eq!(w1.assigned_count(), 0);

    assert_eventually(
        || async { conn.executed() == vec![assignment.job_id] },
        WAIT,
        "held job should run on the peer",
    )
    .await;
    assert!(observer.lost().is_empty());
}

#[tokio::test]
async fn test_concurrent_duplicate_registrations_orphan_nothing() {
    let (coordinator, observer) = test_coordinator();
    let first_conn = FakeConnection::new();
    let second_conn = FakeConnection::new();

    let (first, second) = tokio::join!(
        coordinator.register_worker(register_payload("w1", &["text"]), Some(first_conn.handle.clone())),
        coordinator.register_worker(register_payload("w1", &["text"]), Some(second_conn.handle.clone())),
    );
    // Whichever ran second evicted the first and was rejected.
    assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let survivor = first.or(second).unwrap();
    assert!(survivor.is_terminating());
    assert!(coordinator.registry().get("w1").await.is_none());
    assert!(!coordinator.dispatcher().has_queue("w1"));

    // A fresh registration gets a clean queue and receives new work.
    let conn = FakeConnection::new();
    coordinator
        .register_worker(register_payload("w1", &["text"]), Some(conn.handle.clone()))
        .await
        .unwrap();
    let assignment = coordinator.submit_job(JobSpec::new("text", "alice")).await.unwrap();
    assert_eventually(
        || async { conn.executed() == vec![assignment.job_id] },
        WAIT,
        "job should reach the re-registered worker",
    )
    .await;
    assert!(observer.lost().is_empty());
}

#[tokio::test]
async fn test_registry_duplicate_keeps_queue_reachable() {
    let (coordinator, _observer) = test_coordinator();
    let conn = FakeConnection::new();
    let record = coordinator
        .register_worker(register_payload("w1", &["image"]), Some(conn.handle.clone()))
        .await
        .unwrap();

    let err = coordinator
        .registry()
        .register("w1", capabilities(&["image"]), Default::default(), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::DuplicateWorker(_)));
    assert!(!record.is_terminating());
    assert!(coordinator.dispatcher().has_queue("w1"));

    let assignment = coordinator.submit_job(JobSpec::new("image", "alice")).await.unwrap();
    assert_eq!(assignment.worker_id, "w1");
    assert_eventually(
        || async { conn.executed() == vec![assignment.job_id] },
        WAIT,
        "live worker should keep receiving jobs",
    )
    .await;
}

#[tokio::test]
async fn test_invalid_identity_rejected() {
    let (coordinator, _observer) = test_coordinator();
    let err = coordinator
        .register_worker(register_payload("  ", &["text"]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidIdentity(_)));
    assert!(coordinator.list_workers().await.is_empty());
}

#[tokio::test]
async fn test_list_workers_reports_summary() {
    let (coordinator, _observer) = test_coordinator();
    let conn = FakeConnection::new();
    coordinator
        .register_worker(register_payload("w2", &["text", "image"]), Some(conn.handle.clone()))
        .await
        .unwrap();
    coordinator
        .register_worker(register_payload("w1", &["text"]), None)
        .await
        .unwrap();

    let workers = coordinator.list_workers().await;
    let ids: Vec<_> = workers.iter().map(|w| w.worker_id.as_str()).collect();
    assert_eq!(ids, vec!["w1", "w2"]);
    assert_eq!(workers[1].capabilities, vec!["image", "text"]);
    assert_eq!(workers[1].host, "w2.local");
    assert_eq!(workers[1].queue_length, 0);
    assert!(!workers[1].terminating);
}

#[tokio::test]
async fn test_authorize_rejects_missing_or_wrong_token() {
    let (coordinator, _observer) = test_coordinator();
    assert!(coordinator.authorize(Some(TEST_TOKEN)).is_ok());
    assert!(matches!(coordinator.authorize(None), Err(FleetError::Unauthorized)));
    assert!(matches!(
        coordinator.authorize(Some("nope")),
        Err(FleetError::Unauthorized)
    ));
}
