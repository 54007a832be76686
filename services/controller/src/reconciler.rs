//! Per-request state machine.
//!
//! Each `RebalanceRequest` is reconciled independently; the controller
//! runtime serializes reconciles per request. One-shot requests run once and
//! end Completed or Failed; interval requests stay Active and are requeued at
//! `nextRunTime` forever.
//!
//! The tick decision (`plan_tick`) and the status fold (`settle`) are pure so
//! the state machine is testable without a cluster.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kore_api::{RebalancePhase, RebalanceRequest, RebalanceRequestStatus};

use crate::cluster::Cluster;
use crate::engine::{Engine, RebalanceOutcome};

/// Requeue delay after a failed status write.
pub const STATUS_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to update status of {name}: {source}")]
    StatusWrite {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Shared state handed to every reconcile.
pub struct Context {
    pub cluster: Arc<dyn Cluster>,
    pub engine: Engine,
    pub shutdown: CancellationToken,
}

/// What a reconcile pass should do for a request in its current state.
#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    /// First observation: stamp the start time and leave Pending.
    Initialize(RebalancePhase),
    /// Terminal one-shot request.
    Ignore,
    /// Interval request whose next run is still in the future.
    Wait(Duration),
    /// A run is due now.
    Run,
}

pub fn plan_tick(request: &RebalanceRequest, now: DateTime<Utc>) -> Tick {
    let status = request.status.clone().unwrap_or_default();

    match status.phase {
        RebalancePhase::Completed | RebalancePhase::Failed => Tick::Ignore,
        RebalancePhase::Pending => {
            let phase = if request.spec.is_one_shot() {
                RebalancePhase::Running
            } else {
                RebalancePhase::Active
            };
            Tick::Initialize(phase)
        }
        RebalancePhase::Running | RebalancePhase::Active => {
            if let Some(next_run) = &status.next_run_time {
                if next_run.0 > now {
                    let wait = (next_run.0 - now).to_std().unwrap_or_default();
                    return Tick::Wait(wait);
                }
            }
            Tick::Run
        }
    }
}

/// Fold a run outcome into the request status. Returns the requeue delay, or
/// `None` when the request is now terminal.
pub fn settle(
    status: &mut RebalanceRequestStatus,
    interval: Option<Duration>,
    outcome: &RebalanceOutcome,
    now: DateTime<Utc>,
) -> Option<Duration> {
    status.pods_evicted_last = outcome.evicted;
    status.pods_evicted_total += outcome.evicted;
    status.total_candidates = outcome.total_candidates;
    status.run_count += 1;
    status.last_run_time = Some(Time(now));

    if let Some(interval) = interval {
        let next_run = now + chrono::Duration::seconds(interval.as_secs() as i64);
        status.next_run_time = Some(Time(next_run));
        status.message = match &outcome.error {
            Some(error) => format!("Run {} error: {}", status.run_count, error),
            None => format!("Run {}: {}", status.run_count, outcome.message),
        };
        return Some(interval);
    }

    status.completion_time = Some(Time(now));
    match &outcome.error {
        Some(error) => {
            status.phase = RebalancePhase::Failed;
            status.message = error.to_string();
        }
        None => {
            status.phase = RebalancePhase::Completed;
            status.message = outcome.message.clone();
        }
    }
    None
}

pub async fn reconcile(
    request: Arc<RebalanceRequest>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = request.name_any();
    let namespace = request.namespace().unwrap_or_default();

    match plan_tick(&request, Utc::now()) {
        Tick::Ignore => Ok(Action::await_change()),
        Tick::Wait(delay) => Ok(Action::requeue(delay)),
        Tick::Initialize(phase) => {
            let mut updated = (*request).clone();
            let status = updated.status.get_or_insert_with(Default::default);
            status.phase = phase;
            status.start_time = Some(Time(Utc::now()));
            status.message = "Rebalancer active".to_string();
            write_status(&ctx, &updated).await?;
            Ok(Action::requeue(Duration::ZERO))
        }
        Tick::Run => {
            let run = request.status.as_ref().map(|s| s.run_count).unwrap_or(0) + 1;
            info!(request = %name, namespace = %namespace, run, "Running rebalance check");

            let outcome = ctx.engine.execute(&request, &ctx.shutdown).await;

            let mut updated = (*request).clone();
            let interval = updated.spec.interval();
            let status = updated.status.get_or_insert_with(Default::default);
            let requeue = settle(status, interval, &outcome, Utc::now());

            match &outcome.error {
                Some(error) => {
                    warn!(request = %name, error = %error, "Rebalance check failed")
                }
                None if outcome.evicted > 0 => {
                    info!(
                        request = %name,
                        evicted = outcome.evicted,
                        total_evicted = status.pods_evicted_total,
                        "Rebalance check completed"
                    );
                }
                None => {}
            }

            write_status(&ctx, &updated).await?;

            match requeue {
                Some(delay) => Ok(Action::requeue(delay)),
                None => Ok(Action::await_change()),
            }
        }
    }
}

async fn write_status(ctx: &Context, request: &RebalanceRequest) -> Result<(), Error> {
    ctx.cluster
        .update_rebalance_status(request)
        .await
        .map_err(|source| Error::StatusWrite {
            name: request.name_any(),
            source,
        })
}

pub fn error_policy(_request: Arc<RebalanceRequest>, error: &Error, _ctx: Arc<Context>) -> Action {
    match error {
        // The write is retried shortly; the framework adds backoff on
        // repeated failures.
        Error::StatusWrite { .. } => Action::requeue(STATUS_RETRY_DELAY),
    }
}

/// Run the controller until shutdown.
pub async fn run(client: Client, ctx: Arc<Context>) -> anyhow::Result<()> {
    let requests: Api<RebalanceRequest> = Api::all(client);

    Controller::new(requests, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((request, _)) => debug!(request = %request, "Reconciled rebalance request"),
                Err(error) => warn!(error = %error, "Reconcile failed"),
            }
        })
        .await;

    Ok(())
}
