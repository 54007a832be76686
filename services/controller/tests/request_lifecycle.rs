//! Integration tests for the request state machine.
//!
//! These drive `reconcile` directly with the mock cluster, feeding each
//! written status back in as the next observed object, the way the watch
//! stream would.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;

use kore_api::{RebalancePhase, RebalanceRequest, RebalanceRequestSpec};
use kore_controller::engine::Engine;
use kore_controller::reconciler::{error_policy, reconcile, Context, STATUS_RETRY_DELAY};
use kore_controller::MockCluster;

fn context(cluster: Arc<MockCluster>) -> Arc<Context> {
    Arc::new(Context {
        engine: Engine::new(cluster.clone()),
        cluster,
        shutdown: CancellationToken::new(),
    })
}

fn request(interval_seconds: Option<i32>) -> RebalanceRequest {
    let mut request = RebalanceRequest::new(
        "lifecycle",
        RebalanceRequestSpec {
            interval_seconds,
            ..Default::default()
        },
    );
    request.metadata.namespace = Some("default".to_string());
    request
}

/// Re-observe the request with the most recently written status attached.
async fn with_latest_status(
    cluster: &MockCluster,
    mut request: RebalanceRequest,
) -> RebalanceRequest {
    let writes = cluster.status_writes().await;
    let (_, status) = writes.last().cloned().expect("no status written yet");
    request.status = Some(status);
    request
}

#[tokio::test]
async fn test_one_shot_runs_once_and_completes() {
    let cluster = Arc::new(MockCluster::new());
    let ctx = context(cluster.clone());

    // First reconcile initializes the status and requeues immediately.
    let action = reconcile(Arc::new(request(None)), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::ZERO));

    let writes = cluster.status_writes().await;
    assert_eq!(writes.len(), 1);
    let status = &writes[0].1;
    assert_eq!(status.phase, RebalancePhase::Running);
    assert_eq!(status.message, "Rebalancer active");
    assert!(status.start_time.is_some());
    assert_eq!(status.run_count, 0);

    // Second reconcile runs the engine. The mock has no nodes, so the run
    // ends with the too-few-nodes message, but the request still completes.
    let observed = with_latest_status(&cluster, request(None)).await;
    let action = reconcile(Arc::new(observed), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::await_change());

    let writes = cluster.status_writes().await;
    assert_eq!(writes.len(), 2);
    let status = &writes[1].1;
    assert_eq!(status.phase, RebalancePhase::Completed);
    assert_eq!(
        status.message,
        "Not enough nodes for rebalancing (need at least 2)"
    );
    assert_eq!(status.run_count, 1);
    assert!(status.completion_time.is_some());
    assert!(status.next_run_time.is_none());

    // A terminal request is left alone; no further status writes.
    let observed = with_latest_status(&cluster, request(None)).await;
    let action = reconcile(Arc::new(observed), ctx).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(cluster.status_writes().await.len(), 2);
}

#[tokio::test]
async fn test_interval_request_schedules_next_run() {
    let cluster = Arc::new(MockCluster::new());
    let ctx = context(cluster.clone());

    let action = reconcile(Arc::new(request(Some(60))), ctx.clone())
        .await
        .unwrap();
    assert_eq!(action, Action::requeue(Duration::ZERO));
    assert_eq!(
        cluster.status_writes().await[0].1.phase,
        RebalancePhase::Active
    );

    // The due tick runs and schedules the next one an interval out.
    let observed = with_latest_status(&cluster, request(Some(60))).await;
    let action = reconcile(Arc::new(observed), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));

    let writes = cluster.status_writes().await;
    let status = &writes[1].1;
    assert_eq!(status.phase, RebalancePhase::Active);
    assert_eq!(status.run_count, 1);
    assert!(status.message.starts_with("Run 1:"));
    assert!(status.next_run_time.is_some());
    assert!(status.completion_time.is_none());

    // Reconciled again before the next run is due: wait, no engine run, no
    // status write.
    let observed = with_latest_status(&cluster, request(Some(60))).await;
    let action = reconcile(Arc::new(observed), ctx.clone()).await.unwrap();
    assert_ne!(action, Action::await_change());
    assert_eq!(cluster.status_writes().await.len(), 2);

    // Once the next run time has passed, the engine runs again.
    let mut observed = with_latest_status(&cluster, request(Some(60))).await;
    if let Some(status) = observed.status.as_mut() {
        let due = status.next_run_time.clone().unwrap();
        status.next_run_time = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            due.0 - chrono::Duration::seconds(61),
        ));
    }
    let action = reconcile(Arc::new(observed), ctx).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    assert_eq!(cluster.status_writes().await[2].1.run_count, 2);
}

#[tokio::test]
async fn test_status_write_failure_requeues_shortly() {
    let cluster = Arc::new(MockCluster::new());
    cluster.fail_status_writes(true).await;
    let ctx = context(cluster.clone());

    let target = Arc::new(request(None));
    let error = reconcile(target.clone(), ctx.clone()).await.unwrap_err();

    let action = error_policy(target, &error, ctx);
    assert_eq!(action, Action::requeue(STATUS_RETRY_DELAY));
}

#[tokio::test]
async fn test_counters_accumulate_across_runs() {
    let cluster = Arc::new(MockCluster::new());
    let ctx = context(cluster.clone());

    // Initialize, then force three due runs back to back.
    reconcile(Arc::new(request(Some(60))), ctx.clone())
        .await
        .unwrap();

    for expected_run in 1..=3 {
        let mut observed = with_latest_status(&cluster, request(Some(60))).await;
        if let Some(status) = observed.status.as_mut() {
            status.next_run_time = None;
        }
        reconcile(Arc::new(observed), ctx.clone()).await.unwrap();

        let writes = cluster.status_writes().await;
        let status = &writes.last().unwrap().1;
        assert_eq!(status.run_count, expected_run);
        assert_eq!(status.phase, RebalancePhase::Active);
    }
}
