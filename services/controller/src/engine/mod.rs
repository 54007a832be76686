//! The rebalance engine.
//!
//! One run works in three stages:
//! 1. Snapshot: list ready schedulable nodes and collect candidate pods.
//! 2. Plan: pick which pods to evict (see `plan`).
//! 3. Execute: evict the plan in batches, pausing between batches.

pub mod plan;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::core::Selector;
use kube::core::SelectorExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kore_api::RebalanceRequest;

use crate::cluster::Cluster;
use crate::predicates;
use plan::{build_plan, NodeSnapshot, PodCandidate, PodRef};

/// Errors that abort a rebalance run.
///
/// Per-pod eviction failures are not run errors; they are logged and skipped.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to get nodes: {0}")]
    ListNodes(#[source] anyhow::Error),

    #[error("failed to get candidate pods: {0}")]
    ListPods(#[source] anyhow::Error),

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("context canceled")]
    Interrupted,
}

/// What one run did.
#[derive(Debug)]
pub struct RebalanceOutcome {
    /// Pods evicted (or counted, under dry run).
    pub evicted: i32,

    /// Candidate pods seen by the snapshot.
    pub total_candidates: i32,

    /// Human-readable summary, recorded on the request status.
    pub message: String,

    /// Set when the run aborted.
    pub error: Option<EngineError>,
}

impl RebalanceOutcome {
    fn message(message: impl Into<String>) -> Self {
        Self {
            evicted: 0,
            total_candidates: 0,
            message: message.into(),
            error: None,
        }
    }

    fn error(error: EngineError) -> Self {
        match error {
            EngineError::Interrupted => Self::interrupted(0, 0),
            error => Self {
                evicted: 0,
                total_candidates: 0,
                message: String::new(),
                error: Some(error),
            },
        }
    }

    fn interrupted(evicted: i32, total_candidates: i32) -> Self {
        Self {
            evicted,
            total_candidates,
            message: "Rebalance interrupted".to_string(),
            error: Some(EngineError::Interrupted),
        }
    }
}

/// Await a call, giving up as soon as the run is canceled. Cancellation must
/// reach in-flight cluster requests, not just the inter-batch wait.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    call: impl std::future::Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        result = call => Some(result),
    }
}

/// Executes rebalance runs against a cluster.
pub struct Engine {
    cluster: Arc<dyn Cluster>,
}

impl Engine {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    /// Run one rebalance pass for a request.
    pub async fn execute(
        &self,
        request: &RebalanceRequest,
        cancel: &CancellationToken,
    ) -> RebalanceOutcome {
        let nodes = match self.ready_nodes(cancel).await {
            Ok(nodes) => nodes,
            Err(error) => return RebalanceOutcome::error(error),
        };

        if nodes.len() < 2 {
            return RebalanceOutcome::message("Not enough nodes for rebalancing (need at least 2)");
        }

        let candidates = match self.candidate_pods(request, cancel).await {
            Ok(candidates) => candidates,
            Err(error) => return RebalanceOutcome::error(error),
        };

        if candidates.is_empty() {
            return RebalanceOutcome::message("No pods found matching criteria");
        }

        let total_candidates = candidates.len() as i32;
        let eviction_plan = build_plan(&nodes, &candidates, &request.spec.node_targets);

        if eviction_plan.is_empty() {
            return RebalanceOutcome {
                evicted: 0,
                total_candidates,
                message: "Cluster is already balanced".to_string(),
                error: None,
            };
        }

        info!(
            total_candidates,
            pods_to_evict = eviction_plan.len(),
            dry_run = request.spec.dry_run,
            "Starting rebalance operation"
        );

        self.execute_plan(request, &eviction_plan, total_candidates, cancel)
            .await
    }

    /// Nodes that are Ready and not cordoned.
    async fn ready_nodes(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<NodeSnapshot>, EngineError> {
        let nodes = until_cancelled(cancel, self.cluster.list_nodes())
            .await
            .ok_or(EngineError::Interrupted)?
            .map_err(EngineError::ListNodes)?;

        let mut ready = Vec::new();
        for node in nodes {
            if !predicates::node_is_ready(&node) || !predicates::node_is_schedulable(&node) {
                continue;
            }
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            ready.push(NodeSnapshot {
                name,
                labels: node.metadata.labels.clone().unwrap_or_default(),
            });
        }
        Ok(ready)
    }

    /// Candidate pods across the in-scope namespaces.
    async fn candidate_pods(
        &self,
        request: &RebalanceRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<PodCandidate>, EngineError> {
        let selector = match &request.spec.selector {
            Some(raw) => Some(
                Selector::try_from(raw.clone())
                    .map_err(|error| EngineError::InvalidSelector(error.to_string()))?,
            ),
            None => None,
        };

        let namespaces = if request.spec.namespaces.is_empty() {
            until_cancelled(cancel, self.cluster.list_namespaces())
                .await
                .ok_or(EngineError::Interrupted)?
                .map_err(EngineError::ListPods)?
        } else {
            request.spec.namespaces.clone()
        };

        let mut candidates = Vec::new();
        for namespace in &namespaces {
            if predicates::is_system_namespace(namespace) {
                continue;
            }

            let pods = until_cancelled(cancel, self.cluster.list_pods(namespace))
                .await
                .ok_or(EngineError::Interrupted)?
                .map_err(EngineError::ListPods)?;

            for pod in pods {
                if let Some(check) = predicates::first_failed_check(&pod) {
                    debug!(
                        pod = pod.metadata.name.as_deref().unwrap_or_default(),
                        namespace = %namespace,
                        check,
                        "Pod excluded from rebalancing"
                    );
                    continue;
                }
                if let Some(selector) = &selector {
                    let labels = pod.metadata.labels.clone().unwrap_or_default();
                    if !selector.matches(&labels) {
                        continue;
                    }
                }

                let Some(name) = pod.metadata.name.clone() else {
                    continue;
                };
                let Some(node_name) = pod.spec.as_ref().and_then(|spec| spec.node_name.clone())
                else {
                    continue;
                };
                let created = pod
                    .metadata
                    .creation_timestamp
                    .as_ref()
                    .map(|time| time.0)
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

                candidates.push(PodCandidate {
                    name,
                    namespace: namespace.clone(),
                    node_name,
                    created,
                });
            }
        }

        Ok(candidates)
    }

    /// Walk the plan batch by batch, sleeping between batches.
    async fn execute_plan(
        &self,
        request: &RebalanceRequest,
        eviction_plan: &[PodRef],
        total_candidates: i32,
        cancel: &CancellationToken,
    ) -> RebalanceOutcome {
        let batch_size = request.spec.batch_size();
        let batch_interval = request.spec.batch_interval();

        let mut evicted = 0;
        for (index, batch) in eviction_plan.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                return RebalanceOutcome::interrupted(evicted, total_candidates);
            }

            for pod in batch {
                if request.spec.dry_run {
                    info!(
                        pod = %pod.name,
                        namespace = %pod.namespace,
                        node = %pod.node_name,
                        "Dry run: would evict pod"
                    );
                    evicted += 1;
                    continue;
                }

                let eviction =
                    until_cancelled(cancel, self.cluster.evict_pod(&pod.namespace, &pod.name))
                        .await;
                let Some(result) = eviction else {
                    return RebalanceOutcome::interrupted(evicted, total_candidates);
                };

                match result {
                    Ok(()) => {
                        evicted += 1;
                        info!(
                            pod = %pod.name,
                            namespace = %pod.namespace,
                            node = %pod.node_name,
                            "Evicted pod"
                        );
                    }
                    Err(error) => {
                        warn!(
                            pod = %pod.name,
                            namespace = %pod.namespace,
                            error = %error,
                            "Failed to evict pod"
                        );
                    }
                }
            }

            let more_batches = (index + 1) * batch_size < eviction_plan.len();
            if more_batches {
                debug!(
                    interval_secs = batch_interval.as_secs(),
                    "Waiting between eviction batches"
                );
                if until_cancelled(cancel, tokio::time::sleep(batch_interval))
                    .await
                    .is_none()
                {
                    return RebalanceOutcome::interrupted(evicted, total_candidates);
                }
            }
        }

        RebalanceOutcome {
            evicted,
            total_candidates,
            message: format!("Successfully evicted {evicted} pods"),
            error: None,
        }
    }
}
