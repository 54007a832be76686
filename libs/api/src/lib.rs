//! `RebalanceRequest` custom-resource types.
//!
//! A `RebalanceRequest` declares a rebalancing intent: which pods to consider,
//! how many of them each node may carry, and how aggressively to evict. The
//! controller owns the status sub-resource and records run accounting there.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for all kore resources.
pub const GROUP: &str = "kore.boring.io";

/// Pods must carry this label with value `"true"` to be considered for
/// rebalancing at all.
pub const REBALANCE_ENABLED_LABEL: &str = "kore.boring.io/rebalance";

/// Opts a pod in for eviction even though it mounts host-path or empty-dir
/// volumes.
pub const ALLOW_LOCAL_STORAGE_LABEL: &str = "kore.boring.io/allow-local-storage-eviction";

/// Marks requests created by the node watcher rather than a user.
pub const AUTO_TRIGGERED_LABEL: &str = "kore.boring.io/auto-triggered";

/// Records why an auto-triggered request was created (`node-added` or
/// `node-removed`).
pub const TRIGGER_REASON_LABEL: &str = "kore.boring.io/trigger-reason";

/// Records which node's event created an auto-triggered request.
pub const TRIGGER_NODE_LABEL: &str = "kore.boring.io/trigger-node";

/// Pods evicted per batch when the spec does not say otherwise.
pub const DEFAULT_BATCH_SIZE: i32 = 5;

/// Seconds between eviction batches when the spec does not say otherwise.
pub const DEFAULT_BATCH_INTERVAL_SECONDS: i32 = 30;

/// A per-node pod ceiling for nodes matching a label selector.
///
/// Rules are evaluated in order and the first match wins. Nodes matched by no
/// rule get a ceiling of zero, which drains every candidate pod from them —
/// leave an empty-selector catch-all rule last if that is not what you want.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeTarget {
    /// Label equalities a node must satisfy. An empty selector matches every
    /// node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Maximum number of candidate pods allowed on each matching node.
    pub max_pods_per_node: i32,
}

/// Desired state of a `RebalanceRequest`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "RebalanceRequest",
    group = "kore.boring.io",
    version = "v1alpha1",
    namespaced,
    status = "RebalanceRequestStatus",
    shortname = "rr",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Interval","type":"integer","jsonPath":".spec.intervalSeconds"}"#,
    printcolumn = r#"{"name":"Runs","type":"integer","jsonPath":".status.runCount"}"#,
    printcolumn = r#"{"name":"Evicted","type":"integer","jsonPath":".status.podsEvictedTotal"}"#,
    printcolumn = r#"{"name":"LastRun","type":"date","jsonPath":".status.lastRunTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceRequestSpec {
    /// Additional pod label selector, ANDed with the mandatory
    /// `kore.boring.io/rebalance=true` label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Namespaces to search for candidate pods. Empty means every namespace.
    /// System namespaces are always excluded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    /// Per-node pod ceilings, first match wins. When empty, pods are spread
    /// evenly across all ready nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_targets: Vec<NodeTarget>,

    /// How often to re-check balance, in seconds. Zero or absent makes the
    /// request one-shot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<i32>,

    /// Number of pods to evict per batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<i32>,

    /// Seconds to wait between eviction batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_interval_seconds: Option<i32>,

    /// Log what would be evicted without evicting anything.
    #[serde(default)]
    pub dry_run: bool,
}

impl RebalanceRequestSpec {
    /// Pods per eviction batch, never less than one.
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1) as usize
    }

    /// Pause between eviction batches.
    pub fn batch_interval(&self) -> Duration {
        let secs = self
            .batch_interval_seconds
            .unwrap_or(DEFAULT_BATCH_INTERVAL_SECONDS)
            .max(0);
        Duration::from_secs(secs as u64)
    }

    /// The rebalance interval, or `None` for one-shot requests.
    pub fn interval(&self) -> Option<Duration> {
        match self.interval_seconds {
            Some(secs) if secs > 0 => Some(Duration::from_secs(secs as u64)),
            _ => None,
        }
    }

    /// True when the request runs once and terminates.
    pub fn is_one_shot(&self) -> bool {
        self.interval().is_none()
    }
}

/// Lifecycle phase of a `RebalanceRequest`.
///
/// One-shot requests move Pending → Running → Completed/Failed. Interval
/// requests move Pending → Active and stay there until deleted.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RebalancePhase {
    #[default]
    Pending,
    Running,
    Active,
    Completed,
    Failed,
}

impl RebalancePhase {
    /// True for phases no reconcile will ever leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RebalancePhase::Completed | RebalancePhase::Failed)
    }
}

impl fmt::Display for RebalancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            RebalancePhase::Pending => "Pending",
            RebalancePhase::Running => "Running",
            RebalancePhase::Active => "Active",
            RebalancePhase::Completed => "Completed",
            RebalancePhase::Failed => "Failed",
        };
        f.write_str(phase)
    }
}

/// Observed state of a `RebalanceRequest`, written by the controller in one
/// update per tick.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceRequestStatus {
    /// Current lifecycle phase.
    #[serde(default)]
    pub phase: RebalancePhase,

    /// Pods evicted by the most recent run.
    #[serde(default)]
    pub pods_evicted_last: i32,

    /// Pods evicted across all runs.
    #[serde(default)]
    pub pods_evicted_total: i32,

    /// Candidate pods seen by the most recent run.
    #[serde(default)]
    pub total_candidates: i32,

    /// Number of completed runs.
    #[serde(default)]
    pub run_count: i32,

    /// When the request left Pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    /// When the most recent run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<Time>,

    /// When the next run is due. Only set for interval requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<Time>,

    /// When a one-shot request reached a terminal phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    /// Human-readable summary of the most recent run.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Structured observations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
