//! Queue protocol tests: lifecycle, dependency release, ordering,
//! cancellation, backpressure, and concurrent workers.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};

use super::*;

// =============================================================================
// Test helpers
// =============================================================================

fn open_queue() -> (tempfile::TempDir, JobQueue) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let queue = JobQueue::open(dir.path()).expect("open queue");
    (dir, queue)
}

/// Dequeues with a fresh token and a one-second guard against hangs.
async fn dequeue_one(queue: &JobQueue, job_types: &[&str]) -> (Uuid, Value) {
    let cancel = CancellationToken::new();
    timeout(Duration::from_secs(1), queue.dequeue(&cancel, job_types))
        .await
        .expect("dequeue timed out")
        .expect("dequeue failed")
}

/// Dequeues with a token that fires after `millis`, expecting cancellation.
async fn dequeue_expect_cancelled(queue: &JobQueue, job_types: &[&str], millis: u64) {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(millis)).await;
        trigger.cancel();
    });

    let err = queue
        .dequeue::<Value>(&cancel, job_types)
        .await
        .expect_err("dequeue should have been cancelled");
    assert!(matches!(err, QueueError::Cancelled));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn enqueue_then_dequeue_returns_args() {
    let (_dir, queue) = open_queue();
    let args = json!({ "distro": "fedora-38", "arch": "x86_64" });

    let id = queue.enqueue("osbuild", &args, &[]).await.unwrap();
    let (got_id, got_args) = dequeue_one(&queue, &["osbuild"]).await;

    assert_eq!(got_id, id);
    assert_eq!(got_args, args);
}

#[tokio::test]
async fn typed_args_round_trip() {
    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct BuildArgs {
        distro: String,
        packages: Vec<String>,
    }

    let (_dir, queue) = open_queue();
    let args = BuildArgs {
        distro: "rhel-8.2".to_owned(),
        packages: vec!["httpd".to_owned(), "mod_ssl".to_owned()],
    };

    let id = queue.enqueue("osbuild", &args, &[]).await.unwrap();

    let cancel = CancellationToken::new();
    let (got_id, got_args): (Uuid, BuildArgs) =
        queue.dequeue(&cancel, &["osbuild"]).await.unwrap();
    assert_eq!(got_id, id);
    assert_eq!(got_args, args);
}

#[tokio::test]
async fn status_tracks_the_full_lifecycle() {
    let (_dir, queue) = open_queue();
    let id = queue.enqueue("osbuild", &json!({}), &[]).await.unwrap();

    let status: JobStatus<Value> = queue.status(id).unwrap();
    assert!(status.started_at.is_none());
    assert!(status.finished_at.is_none());
    assert!(status.result.is_none());

    dequeue_one(&queue, &["osbuild"]).await;
    let status: JobStatus<Value> = queue.status(id).unwrap();
    let started = status.started_at.expect("started");
    assert!(status.queued_at <= started);
    assert!(status.finished_at.is_none());

    queue.finish(id, &json!({ "ok": true })).await.unwrap();
    let status: JobStatus<Value> = queue.status(id).unwrap();
    let finished = status.finished_at.expect("finished");
    assert!(started <= finished);
    assert_eq!(status.result, Some(json!({ "ok": true })));
}

#[tokio::test]
async fn status_of_unknown_job_fails() {
    let (_dir, queue) = open_queue();
    let err = queue.status::<Value>(Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, QueueError::UnknownJob { .. }));
}

// =============================================================================
// Dependencies
// =============================================================================

#[tokio::test]
async fn chained_dependency_release() {
    let (_dir, queue) = open_queue();

    let build = queue.enqueue("build", &json!({}), &[]).await.unwrap();
    let ship = queue.enqueue("ship", &json!({}), &[build]).await.unwrap();

    let (id, _) = dequeue_one(&queue, &["build"]).await;
    assert_eq!(id, build);

    // The ship job must stay invisible until its dependency finishes.
    dequeue_expect_cancelled(&queue, &["ship"], 50).await;

    queue.finish(build, &json!({ "ok": true })).await.unwrap();

    let (id, _) = dequeue_one(&queue, &["ship"]).await;
    assert_eq!(id, ship);
}

#[tokio::test]
async fn duplicate_dependencies_coalesce() {
    let (_dir, queue) = open_queue();

    let a = queue.enqueue("build", &json!({}), &[]).await.unwrap();
    let b = queue.enqueue("ship", &json!({}), &[a, a, a]).await.unwrap();

    let record = read_record(&queue.store, b).unwrap();
    assert_eq!(record.dependencies, vec![a]);

    // One finish of the single coalesced dependency releases the job.
    dequeue_one(&queue, &["build"]).await;
    queue.finish(a, &json!({})).await.unwrap();

    let (id, _) = dequeue_one(&queue, &["ship"]).await;
    assert_eq!(id, b);
}

#[tokio::test]
async fn job_with_two_dependencies_waits_for_both() {
    let (_dir, queue) = open_queue();

    let a = queue.enqueue("build", &json!({}), &[]).await.unwrap();
    let b = queue.enqueue("build", &json!({}), &[]).await.unwrap();
    let c = queue.enqueue("ship", &json!({}), &[a, b]).await.unwrap();

    dequeue_one(&queue, &["build"]).await;
    dequeue_one(&queue, &["build"]).await;

    queue.finish(a, &json!({})).await.unwrap();
    dequeue_expect_cancelled(&queue, &["ship"], 50).await;

    queue.finish(b, &json!({})).await.unwrap();
    let (id, _) = dequeue_one(&queue, &["ship"]).await;
    assert_eq!(id, c);
}

#[tokio::test]
async fn dependency_finished_before_enqueue_is_already_satisfied() {
    let (_dir, queue) = open_queue();

    let a = queue.enqueue("build", &json!({}), &[]).await.unwrap();
    dequeue_one(&queue, &["build"]).await;
    queue.finish(a, &json!({})).await.unwrap();

    let b = queue.enqueue("ship", &json!({}), &[a]).await.unwrap();
    let (id, _) = dequeue_one(&queue, &["ship"]).await;
    assert_eq!(id, b);
}

#[tokio::test]
async fn unknown_dependency_is_rejected_without_a_record() {
    let (_dir, queue) = open_queue();

    let err = queue
        .enqueue("build", &json!({}), &[Uuid::nil()])
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::UnknownDependency { id } if id == Uuid::nil()));

    // Nothing may be persisted for the rejected job.
    assert!(queue.store.list().unwrap().is_empty());
}

// =============================================================================
// Finish preconditions
// =============================================================================

#[tokio::test]
async fn finish_requires_a_running_job() {
    let (_dir, queue) = open_queue();
    let id = queue.enqueue("build", &json!({}), &[]).await.unwrap();

    // Not yet dequeued.
    let err = queue.finish(id, &json!({})).await.unwrap_err();
    assert!(matches!(err, QueueError::NotRunning { .. }));

    dequeue_one(&queue, &["build"]).await;
    queue.finish(id, &json!({})).await.unwrap();

    // Already finished.
    let err = queue.finish(id, &json!({})).await.unwrap_err();
    assert!(matches!(err, QueueError::NotRunning { .. }));
}

#[tokio::test]
async fn finish_of_unknown_job_fails() {
    let (_dir, queue) = open_queue();
    let err = queue.finish(Uuid::new_v4(), &json!({})).await.unwrap_err();
    assert!(matches!(err, QueueError::UnknownJob { .. }));
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn dequeue_is_fifo_within_a_type() {
    let (_dir, queue) = open_queue();

    let mut enqueued = Vec::new();
    for i in 0..5 {
        enqueued.push(
            queue
                .enqueue("build", &json!({ "seq": i }), &[])
                .await
                .unwrap(),
        );
    }

    for expected in enqueued {
        let (id, _) = dequeue_one(&queue, &["build"]).await;
        assert_eq!(id, expected);
    }
}

#[tokio::test]
async fn dequeue_accepts_multiple_types() {
    let (_dir, queue) = open_queue();

    let a = queue.enqueue("build", &json!({}), &[]).await.unwrap();
    let b = queue.enqueue("ship", &json!({}), &[]).await.unwrap();

    let (first, _) = dequeue_one(&queue, &["build", "ship"]).await;
    let (second, _) = dequeue_one(&queue, &["build", "ship"]).await;

    let mut got = [first, second];
    got.sort();
    let mut want = [a, b];
    want.sort();
    assert_eq!(got, want);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn pre_cancelled_dequeue_fails_immediately() {
    let (_dir, queue) = open_queue();
    queue.enqueue("build", &json!({}), &[]).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = queue.dequeue::<Value>(&cancel, &["build"]).await.unwrap_err();
    assert!(matches!(err, QueueError::Cancelled));
}

#[tokio::test]
async fn cancelled_dequeue_has_no_side_effects() {
    let (_dir, queue) = open_queue();
    let id = queue.enqueue("build", &json!({}), &[]).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    queue
        .dequeue::<Value>(&cancel, &["build"])
        .await
        .unwrap_err();

    // The record is untouched and the job still pending.
    let status: JobStatus<Value> = queue.status(id).unwrap();
    assert!(status.started_at.is_none());

    let (got, _) = dequeue_one(&queue, &["build"]).await;
    assert_eq!(got, id);
}

#[tokio::test]
async fn dequeue_with_no_accepted_types_only_cancels() {
    let (_dir, queue) = open_queue();
    queue.enqueue("build", &json!({}), &[]).await.unwrap();

    dequeue_expect_cancelled(&queue, &[], 20).await;
}

// =============================================================================
// Payload errors
// =============================================================================

#[tokio::test]
async fn unserializable_args_are_rejected() {
    use std::collections::HashMap;

    let (_dir, queue) = open_queue();

    // serde_json cannot encode maps with non-string keys.
    let bad: HashMap<(u32, u32), u32> = HashMap::from([((1, 2), 3)]);
    let err = queue.enqueue("build", &bad, &[]).await.unwrap_err();
    assert!(matches!(err, QueueError::BadArguments(_)));
    assert!(queue.store.list().unwrap().is_empty());
}

#[tokio::test]
async fn unserializable_result_is_rejected() {
    use std::collections::HashMap;

    let (_dir, queue) = open_queue();
    let id = queue.enqueue("build", &json!({}), &[]).await.unwrap();
    dequeue_one(&queue, &["build"]).await;

    let bad: HashMap<(u32, u32), u32> = HashMap::from([((1, 2), 3)]);
    let err = queue.finish(id, &bad).await.unwrap_err();
    assert!(matches!(err, QueueError::BadResult(_)));

    // The failed finish must leave the job running.
    let status: JobStatus<Value> = queue.status(id).unwrap();
    assert!(status.finished_at.is_none());
}

#[tokio::test]
async fn args_that_do_not_fit_the_callers_type_are_corrupt() {
    let (_dir, queue) = open_queue();
    queue
        .enqueue("build", &json!("not a number"), &[])
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let err = queue.dequeue::<u64>(&cancel, &["build"]).await.unwrap_err();
    assert!(matches!(err, QueueError::Corrupt { .. }));
}

// =============================================================================
// Blocking behavior
// =============================================================================

#[tokio::test]
async fn dequeue_blocks_until_a_job_arrives() {
    let (_dir, queue) = open_queue();

    let (got, id) = tokio::join!(dequeue_one(&queue, &["build"]), async {
        sleep(Duration::from_millis(50)).await;
        queue.enqueue("build", &json!({}), &[]).await.unwrap()
    });
    assert_eq!(got.0, id);
}

#[tokio::test]
async fn enqueue_blocks_once_a_type_is_at_capacity() {
    let (_dir, queue) = open_queue();

    for _ in 0..PENDING_CHANNEL_CAPACITY {
        queue.enqueue("build", &json!({}), &[]).await.unwrap();
    }

    // The channel is full; the next publish must block until drained.
    let blocked = timeout(
        Duration::from_millis(100),
        queue.enqueue("build", &json!({}), &[]),
    )
    .await;
    assert!(blocked.is_err(), "enqueue should block at capacity");
}

// =============================================================================
// Concurrent workers
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_drain_distinct_jobs() {
    const WORKERS: usize = 4;

    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(JobQueue::open(dir.path()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..WORKERS {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            dequeue_one(&queue, &["build"]).await.0
        }));
    }

    let mut enqueued = Vec::new();
    for i in 0..WORKERS {
        enqueued.push(
            queue
                .enqueue("build", &json!({ "seq": i }), &[])
                .await
                .unwrap(),
        );
    }

    let mut got = Vec::new();
    for handle in handles {
        got.push(handle.await.unwrap());
    }

    // Every worker received a distinct job, and nothing was lost.
    got.sort();
    enqueued.sort();
    assert_eq!(got, enqueued);
}
