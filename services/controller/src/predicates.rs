//! Node and pod eligibility checks.
//!
//! The candidate checks are a named table rather than one opaque predicate so
//! that new exclusions (for example a critical-priority-class check) slot in
//! without touching the engine.

use k8s_openapi::api::core::v1::{Node, Pod};

use kore_api::{ALLOW_LOCAL_STORAGE_LABEL, REBALANCE_ENABLED_LABEL};

/// Namespaces never touched by rebalancing, regardless of the request spec.
pub const SYSTEM_NAMESPACES: [&str; 3] = ["kube-system", "kube-public", "kube-node-lease"];

pub fn is_system_namespace(namespace: &str) -> bool {
    SYSTEM_NAMESPACES.contains(&namespace)
}

/// A node with condition `Ready == True`.
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

/// A node that is not cordoned.
pub fn node_is_schedulable(node: &Node) -> bool {
    !node
        .spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

fn pod_label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

fn has_rebalance_label(pod: &Pod) -> bool {
    pod_label(pod, REBALANCE_ENABLED_LABEL) == Some("true")
}

fn pod_is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

fn pod_is_scheduled(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .is_some_and(|node| !node.is_empty())
}

fn not_daemon_set_owned(pod: &Pod) -> bool {
    !pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|owner| owner.kind == "DaemonSet"))
}

/// Pods mounting host-path or empty-dir volumes would lose data on eviction,
/// so they are excluded unless they opt in via label.
fn local_storage_evictable(pod: &Pod) -> bool {
    let uses_local_storage = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| {
            volumes
                .iter()
                .any(|volume| volume.empty_dir.is_some() || volume.host_path.is_some())
        });

    !uses_local_storage || pod_label(pod, ALLOW_LOCAL_STORAGE_LABEL) == Some("true")
}

/// One named eligibility check on a pod.
pub struct CandidateCheck {
    pub name: &'static str,
    pub eligible: fn(&Pod) -> bool,
}

/// Checks a pod must pass, in the order they are applied. The per-request
/// label selector is applied separately by the engine.
pub static CANDIDATE_CHECKS: &[CandidateCheck] = &[
    CandidateCheck {
        name: "rebalance-enabled",
        eligible: has_rebalance_label,
    },
    CandidateCheck {
        name: "running",
        eligible: pod_is_running,
    },
    CandidateCheck {
        name: "scheduled",
        eligible: pod_is_scheduled,
    },
    CandidateCheck {
        name: "not-daemonset-owned",
        eligible: not_daemon_set_owned,
    },
    CandidateCheck {
        name: "local-storage",
        eligible: local_storage_evictable,
    },
];

/// Name of the first check a pod fails, if any.
pub fn first_failed_check(pod: &Pod) -> Option<&'static str> {
    CANDIDATE_CHECKS
        .iter()
        .find(|check| !(check.eligible)(pod))
        .map(|check| check.name)
}

/// True when a pod passes every candidate check.
pub fn is_candidate(pod: &Pod) -> bool {
    first_failed_check(pod).is_none()
}
