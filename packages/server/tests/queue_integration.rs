//! End-to-end queue scenarios against a real Redis container.
//!
//! These run through the service layer exactly as the HTTP handlers do.
//! They need a local Docker daemon, so they are `#[ignore]`d by default:
//!
//! ```text
//! cargo test --test queue_integration -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use codeq_core::common::QueueError;
use codeq_core::config::Config;
use codeq_core::kernel::kv::Kv;
use codeq_core::kernel::queue::task::TaskStatus;
use codeq_core::kernel::results_service::SubmitResult;
use codeq_core::kernel::scheduler::{ClaimOptions, CreateTask};
use codeq_core::server::app::AppState;
use serde_json::json;
use testcontainers_modules::redis::Redis;
use testcontainers_modules::testcontainers::runners::AsyncRunner;
use testcontainers_modules::testcontainers::ContainerAsync;

const TENANT: &str = "acme";

async fn harness() -> (ContainerAsync<Redis>, AppState) {
    let container = Redis::default().start().await.expect("redis container");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("mapped port");

    let config = Arc::new(Config {
        kv_url: format!("redis://127.0.0.1:{port}"),
        dev_auth_secret: Some("test-secret".to_string()),
        webhooks_enabled: false,
        default_max_attempts: 3,
        ..Config::default()
    });

    let kv = Kv::connect(&config.kv_url).await.expect("kv connect");
    let state = AppState::build(kv, config).expect("app state");
    (container, state)
}

fn create(command: &str) -> CreateTask {
    CreateTask {
        command: command.to_string(),
        payload: json!({"jobId": "j1"}),
        priority: Some(5),
        webhook: None,
        max_attempts: None,
        idempotency_key: None,
        run_at: None,
        delay_seconds: None,
    }
}

fn claim(commands: &[&str]) -> ClaimOptions {
    ClaimOptions {
        commands: commands.iter().map(|c| c.to_string()).collect(),
        lease_seconds: Some(60),
        wait_seconds: None,
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn happy_path_create_claim_heartbeat_result() {
    let (_container, state) = harness().await;

    let task = state
        .scheduler
        .create_task(TENANT, create("GENERATE_MASTER"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);

    let claimed = state
        .scheduler
        .claim(TENANT, "worker-1", claim(&["GENERATE_MASTER"]))
        .await
        .unwrap()
        .expect("task should be claimable");
    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));

    let lease_until = state
        .scheduler
        .heartbeat(TENANT, &task.id, "worker-1", 30)
        .await
        .unwrap();
    assert!(lease_until > chrono::Utc::now());

    let record = state
        .results
        .submit(
            TENANT,
            &task.id,
            "worker-1",
            SubmitResult {
                status: TaskStatus::Completed,
                result: json!({"ok": true}).as_object().cloned(),
                error: None,
                artifacts: Vec::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(record.status, TaskStatus::Completed);

    let fetched = state.results.get_result(TENANT, &task.id).await.unwrap();
    assert_eq!(fetched.task_id, task.id);
    assert_eq!(fetched.result.get("ok"), Some(&json!(true)));

    let stored = state.scheduler.get_task(TENANT, &task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.result_key.is_some());

    let stats = state
        .scheduler
        .queue_stats("GENERATE_MASTER", TENANT)
        .await
        .unwrap();
    assert_eq!(stats.in_progress, 0);
    assert_eq!(stats.ready, 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn idempotent_enqueue_returns_prior_task() {
    let (_container, state) = harness().await;

    let mut first = create("GENERATE_MASTER");
    first.idempotency_key = Some("k1".to_string());
    let mut second = create("GENERATE_MASTER");
    second.idempotency_key = Some("k1".to_string());

    let a = state.scheduler.create_task(TENANT, first).await.unwrap();
    let b = state.scheduler.create_task(TENANT, second).await.unwrap();
    assert_eq!(a.id, b.id);

    let stats = state
        .scheduler
        .queue_stats("GENERATE_MASTER", TENANT)
        .await
        .unwrap();
    assert_eq!(stats.ready, 1, "exactly one queue insertion");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn expired_lease_is_reclaimed_on_next_claim() {
    let (_container, state) = harness().await;

    let task = state
        .scheduler
        .create_task(TENANT, create("GENERATE_MASTER"))
        .await
        .unwrap();

    let options = ClaimOptions {
        lease_seconds: Some(1),
        ..claim(&["GENERATE_MASTER"])
    };
    let first = state
        .scheduler
        .claim(TENANT, "worker-1", options)
        .await
        .unwrap()
        .expect("first claim");
    assert_eq!(first.attempts, 1);

    // No heartbeat; let the lease lapse.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let second = state
        .scheduler
        .claim(TENANT, "worker-2", claim(&["GENERATE_MASTER"]))
        .await
        .unwrap()
        .expect("repair should requeue the task");
    assert_eq!(second.id, task.id);
    assert_eq!(second.attempts, 2);
    assert_eq!(second.worker_id.as_deref(), Some("worker-2"));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn exhausted_attempts_dead_letter() {
    let (_container, state) = harness().await;

    let mut input = create("GENERATE_MASTER");
    input.max_attempts = Some(2);
    let task = state.scheduler.create_task(TENANT, input).await.unwrap();

    // Attempt 1: claim + voluntary release (immediate requeue).
    state
        .scheduler
        .claim(TENANT, "worker-1", claim(&["GENERATE_MASTER"]))
        .await
        .unwrap()
        .expect("first claim");
    let released = state
        .scheduler
        .abandon(TENANT, &task.id, "worker-1")
        .await
        .unwrap();
    assert!(!released.moved_to_dlq);

    // Attempt 2: claim + release exhausts maxAttempts.
    state
        .scheduler
        .claim(TENANT, "worker-1", claim(&["GENERATE_MASTER"]))
        .await
        .unwrap()
        .expect("second claim");
    let exhausted = state
        .scheduler
        .abandon(TENANT, &task.id, "worker-1")
        .await
        .unwrap();
    assert!(exhausted.moved_to_dlq);

    let stats = state
        .scheduler
        .queue_stats("GENERATE_MASTER", TENANT)
        .await
        .unwrap();
    assert_eq!(stats.dlq, 1);
    assert_eq!(stats.ready, 0);

    let stored = state.scheduler.get_task(TENANT, &task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn delayed_task_becomes_visible_after_promotion() {
    let (_container, state) = harness().await;

    let mut input = create("GENERATE_MASTER");
    input.delay_seconds = Some(2);
    let task = state.scheduler.create_task(TENANT, input).await.unwrap();

    // Not visible yet.
    let early = state
        .scheduler
        .claim(TENANT, "worker-1", claim(&["GENERATE_MASTER"]))
        .await
        .unwrap();
    assert!(early.is_none());

    tokio::time::sleep(Duration::from_secs(3)).await;
    let moved = state
        .repo
        .move_due_delayed("GENERATE_MASTER", TENANT, 100)
        .await
        .unwrap();
    assert_eq!(moved, 1);

    let claimed = state
        .scheduler
        .claim(TENANT, "worker-1", claim(&["GENERATE_MASTER"]))
        .await
        .unwrap()
        .expect("promoted task should be claimable");
    assert_eq!(claimed.id, task.id);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn high_priority_is_claimed_first() {
    let (_container, state) = harness().await;

    let mut low = create("GENERATE_MASTER");
    low.priority = Some(0);
    let mut high = create("GENERATE_MASTER");
    high.priority = Some(9);

    state.scheduler.create_task(TENANT, low).await.unwrap();
    let high_task = state.scheduler.create_task(TENANT, high).await.unwrap();

    let first = state
        .scheduler
        .claim(TENANT, "worker-1", claim(&["GENERATE_MASTER"]))
        .await
        .unwrap()
        .expect("claim");
    assert_eq!(first.id, high_task.id);
    assert_eq!(first.priority, 9);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn ownership_is_enforced() {
    let (_container, state) = harness().await;

    let task = state
        .scheduler
        .create_task(TENANT, create("GENERATE_MASTER"))
        .await
        .unwrap();
    state
        .scheduler
        .claim(TENANT, "worker-1", claim(&["GENERATE_MASTER"]))
        .await
        .unwrap()
        .expect("claim");

    let heartbeat = state
        .scheduler
        .heartbeat(TENANT, &task.id, "intruder", 30)
        .await;
    assert!(matches!(heartbeat, Err(QueueError::NotOwner)));

    let result = state
        .results
        .submit(
            TENANT,
            &task.id,
            "intruder",
            SubmitResult {
                status: TaskStatus::Completed,
                result: None,
                error: None,
                artifacts: Vec::new(),
            },
        )
        .await;
    assert!(matches!(result, Err(QueueError::NotOwner)));

    // The rightful owner is unaffected.
    let stored = state.scheduler.get_task(TENANT, &task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::InProgress);
    assert_eq!(stored.worker_id.as_deref(), Some("worker-1"));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn second_result_submission_is_rejected() {
    let (_container, state) = harness().await;

    let task = state
        .scheduler
        .create_task(TENANT, create("GENERATE_MASTER"))
        .await
        .unwrap();
    state
        .scheduler
        .claim(TENANT, "worker-1", claim(&["GENERATE_MASTER"]))
        .await
        .unwrap()
        .expect("claim");

    let submit = |status| SubmitResult {
        status,
        result: None,
        error: None,
        artifacts: Vec::new(),
    };
    state
        .results
        .submit(TENANT, &task.id, "worker-1", submit(TaskStatus::Completed))
        .await
        .unwrap();

    let again = state
        .results
        .submit(TENANT, &task.id, "worker-1", submit(TaskStatus::Failed))
        .await;
    assert!(matches!(again, Err(QueueError::NotInProgress)));

    // The original record is intact.
    let record = state.results.get_result(TENANT, &task.id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn cleanup_removes_tasks_and_claims_skip_them() {
    let (_container, state) = harness().await;

    state
        .scheduler
        .create_task(TENANT, create("GENERATE_MASTER"))
        .await
        .unwrap();

    // Purge everything the ttl-index knows about, well past any expiry.
    let deleted = state
        .scheduler
        .cleanup(100, chrono::Utc::now() + chrono::Duration::days(30))
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let claimed = state
        .scheduler
        .claim(TENANT, "worker-1", claim(&["GENERATE_MASTER"]))
        .await
        .unwrap();
    assert!(claimed.is_none());

    let stats = state
        .scheduler
        .queue_stats("GENERATE_MASTER", TENANT)
        .await
        .unwrap();
    assert_eq!(stats.ready, 0);
    assert_eq!(stats.in_progress, 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn tenants_are_isolated() {
    let (_container, state) = harness().await;

    let task = state
        .scheduler
        .create_task("acme", create("GENERATE_MASTER"))
        .await
        .unwrap();

    let other_tenant = state.scheduler.get_task("globex", &task.id).await;
    assert!(matches!(other_tenant, Err(QueueError::NotFound(_))));

    let stolen = state
        .scheduler
        .claim("globex", "worker-1", claim(&["GENERATE_MASTER"]))
        .await
        .unwrap();
    assert!(stolen.is_none(), "claims must not cross tenants");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn long_poll_waits_for_late_enqueue() {
    let (_container, state) = harness().await;

    let scheduler = Arc::clone(&state.scheduler);
    let waiter = tokio::spawn(async move {
        scheduler
            .claim(
                TENANT,
                "worker-1",
                ClaimOptions {
                    commands: vec!["GENERATE_MASTER".to_string()],
                    lease_seconds: Some(60),
                    wait_seconds: Some(5),
                },
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    let task = state
        .scheduler
        .create_task(TENANT, create("GENERATE_MASTER"))
        .await
        .unwrap();

    let claimed = waiter.await.unwrap().unwrap();
    assert_eq!(claimed.map(|t| t.id), Some(task.id));
}
