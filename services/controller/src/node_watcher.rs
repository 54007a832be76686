//! Auto-trigger node watcher.
//!
//! Watches the node collection and creates a one-shot rebalance request when
//! a ready node joins or a known node leaves, gated by a cooldown. All events
//! arrive on a single task, so the state needs no locks.

use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kore_api::{
    RebalanceRequest, RebalanceRequestSpec, AUTO_TRIGGERED_LABEL, DEFAULT_BATCH_INTERVAL_SECONDS,
    DEFAULT_BATCH_SIZE, TRIGGER_NODE_LABEL, TRIGGER_REASON_LABEL,
};

use crate::cluster::Cluster;
use crate::predicates::node_is_ready;

/// Namespace auto-triggered requests are created in.
pub const AUTO_REQUEST_NAMESPACE: &str = "kube-system";

/// Why an automatic rebalance was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    NodeAdded,
    NodeRemoved,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::NodeAdded => "node-added",
            TriggerReason::NodeRemoved => "node-removed",
        }
    }
}

/// Process-local view of the node inventory.
///
/// `known` maps node names to their last observed readiness. A node that has
/// never been seen ready stays out of the map, so its first readiness flip
/// counts as an add.
#[derive(Debug, Default)]
pub struct WatcherState {
    known: HashMap<String, bool>,
    last_trigger: Option<Instant>,
}

impl WatcherState {
    /// Seed the inventory from a node list without triggering anything.
    pub fn bootstrap(&mut self, nodes: &[Node]) {
        for node in nodes {
            if let Some(name) = node.metadata.name.clone() {
                self.known.insert(name, node_is_ready(node));
            }
        }
    }

    /// Record an observed node, returning the trigger this event calls for.
    pub fn observe_apply(&mut self, node: &Node) -> Option<TriggerReason> {
        let name = node.metadata.name.clone()?;
        let ready = node_is_ready(node);

        match self.known.get_mut(&name) {
            Some(known_ready) => {
                *known_ready = ready;
                None
            }
            None if ready => {
                self.known.insert(name, true);
                Some(TriggerReason::NodeAdded)
            }
            None => None,
        }
    }

    /// Record a node deletion, returning the trigger this event calls for.
    pub fn observe_delete(&mut self, name: &str) -> Option<TriggerReason> {
        self.known
            .remove(name)
            .map(|_| TriggerReason::NodeRemoved)
    }

    /// Time left before another trigger is allowed, if any.
    pub fn cooldown_remaining(&self, now: Instant, cooldown: Duration) -> Option<Duration> {
        let last = self.last_trigger?;
        let elapsed = now.duration_since(last);
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    /// Record a successful trigger.
    pub fn record_trigger(&mut self, now: Instant) {
        self.last_trigger = Some(now);
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }
}

/// Watches nodes and creates cooldown-gated auto rebalance requests.
pub struct NodeWatcher {
    cluster: Arc<dyn Cluster>,
    cooldown: Duration,
    state: WatcherState,
}

impl NodeWatcher {
    pub fn new(cluster: Arc<dyn Cluster>, cooldown: Duration) -> Self {
        Self {
            cluster,
            cooldown,
            state: WatcherState::default(),
        }
    }

    /// Run the watcher until shutdown.
    pub async fn run(mut self, client: Client, shutdown: CancellationToken) -> Result<()> {
        let nodes = self.cluster.list_nodes().await?;
        self.state.bootstrap(&nodes);
        info!(
            known_nodes = self.state.known_count(),
            cooldown_secs = self.cooldown.as_secs(),
            "Starting node watcher"
        );

        let api: Api<Node> = Api::all(client);
        let mut events = pin!(watcher(api, watcher::Config::default()).default_backoff());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Node watcher shutting down");
                    return Ok(());
                }
                event = events.next() => {
                    match event {
                        Some(Ok(event)) => self.handle_event(event).await,
                        Some(Err(error)) => warn!(error = %error, "Node watch error"),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Process one watch event.
    pub async fn handle_event(&mut self, event: watcher::Event<Node>) {
        match event {
            watcher::Event::Init | watcher::Event::InitDone => {}
            watcher::Event::InitApply(node) | watcher::Event::Apply(node) => {
                let node_name = node.name_any();
                if let Some(reason) = self.state.observe_apply(&node) {
                    info!(node = %node_name, "New node joined cluster and is ready");
                    self.trigger(reason, &node_name).await;
                }
            }
            watcher::Event::Delete(node) => {
                let node_name = node.name_any();
                if let Some(reason) = self.state.observe_delete(&node_name) {
                    info!(node = %node_name, "Node removed from cluster");
                    self.trigger(reason, &node_name).await;
                }
            }
        }
    }

    async fn trigger(&mut self, reason: TriggerReason, node_name: &str) {
        let now = Instant::now();
        if let Some(remaining) = self.state.cooldown_remaining(now, self.cooldown) {
            info!(
                reason = reason.as_str(),
                node = %node_name,
                cooldown_remaining_secs = remaining.as_secs(),
                "Skipping auto-rebalance due to cooldown"
            );
            return;
        }

        let request = auto_request(reason, node_name);
        match self.cluster.create_rebalance_request(&request).await {
            Ok(created) => {
                self.state.record_trigger(now);
                info!(
                    request = %created.name_any(),
                    reason = reason.as_str(),
                    node = %node_name,
                    "Created auto rebalance request"
                );
            }
            Err(error) => {
                warn!(
                    reason = reason.as_str(),
                    node = %node_name,
                    error = %error,
                    "Failed to create auto rebalance request"
                );
            }
        }
    }
}

/// A one-shot request recording what triggered it.
pub fn auto_request(reason: TriggerReason, node_name: &str) -> RebalanceRequest {
    let labels = BTreeMap::from([
        (AUTO_TRIGGERED_LABEL.to_string(), "true".to_string()),
        (
            TRIGGER_REASON_LABEL.to_string(),
            reason.as_str().to_string(),
        ),
        (TRIGGER_NODE_LABEL.to_string(), node_name.to_string()),
    ]);

    let mut request = RebalanceRequest::new(
        "",
        RebalanceRequestSpec {
            batch_size: Some(DEFAULT_BATCH_SIZE),
            batch_interval_seconds: Some(DEFAULT_BATCH_INTERVAL_SECONDS),
            dry_run: false,
            ..Default::default()
        },
    );
    request.metadata.name = None;
    request.metadata.generate_name = Some("auto-rebalance-".to_string());
    request.metadata.namespace = Some(AUTO_REQUEST_NAMESPACE.to_string());
    request.metadata.labels = Some(labels);
    request
}
