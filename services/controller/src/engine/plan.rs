//! Pure eviction planning.
//!
//! Given a snapshot of ready nodes, candidate pods, and node-target rules,
//! produce the ordered list of pods to evict this run. No I/O happens here;
//! the executor in the parent module walks the plan.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use kore_api::NodeTarget;

/// A node may sit this many pods over its ceiling without being touched.
/// Without the tolerance, a freshly evicted pod rescheduled onto the same
/// node would be evicted again on the next run.
pub const EVICTION_TOLERANCE: i32 = 1;

/// A ready, schedulable node as seen by one run.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// A pod that passed every candidate check.
#[derive(Debug, Clone)]
pub struct PodCandidate {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
    pub created: DateTime<Utc>,
}

/// A pod selected for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
}

/// Computes the eviction plan for one run.
///
/// Most-overloaded nodes contribute first; within a node the newest pods go
/// first, so long-lived pods are retained preferentially.
pub fn build_plan(
    nodes: &[NodeSnapshot],
    pods: &[PodCandidate],
    targets: &[NodeTarget],
) -> Vec<PodRef> {
    if nodes.is_empty() {
        return Vec::new();
    }

    // With no target rules every node gets the snapshot average.
    let fallback_cap = (pods.len() / nodes.len()) as i32;

    let mut by_node: BTreeMap<&str, Vec<&PodCandidate>> = nodes
        .iter()
        .map(|node| (node.name.as_str(), Vec::new()))
        .collect();
    for pod in pods {
        if let Some(on_node) = by_node.get_mut(pod.node_name.as_str()) {
            on_node.push(pod);
        }
    }

    struct NodeLoad<'a> {
        cap: i32,
        pods: Vec<&'a PodCandidate>,
    }

    let mut loads: Vec<NodeLoad> = nodes
        .iter()
        .map(|node| NodeLoad {
            cap: cap_for_node(node, targets, fallback_cap),
            pods: by_node.remove(node.name.as_str()).unwrap_or_default(),
        })
        .collect();

    // Most-overloaded nodes first.
    loads.sort_by_key(|load| load.cap - load.pods.len() as i32);

    let mut plan = Vec::new();
    for load in &mut loads {
        let count = load.pods.len() as i32;
        let excess = count - load.cap - EVICTION_TOLERANCE;
        if excess <= 0 {
            continue;
        }

        load.pods.sort_by(|a, b| b.created.cmp(&a.created));
        for pod in load.pods.iter().take(excess.min(count) as usize) {
            plan.push(PodRef {
                name: pod.name.clone(),
                namespace: pod.namespace.clone(),
                node_name: pod.node_name.clone(),
            });
        }
    }

    plan
}

/// Resolves a node's pod ceiling. First matching rule wins; a node matched by
/// no rule gets zero and is drained.
fn cap_for_node(node: &NodeSnapshot, targets: &[NodeTarget], fallback_cap: i32) -> i32 {
    if targets.is_empty() {
        return fallback_cap;
    }

    targets
        .iter()
        .find(|target| matches_node_selector(&node.labels, &target.node_selector))
        .map(|target| target.max_pods_per_node)
        .unwrap_or(0)
}

/// An empty selector matches every node.
fn matches_node_selector(
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn node(name: &str, labels: &[(&str, &str)]) -> NodeSnapshot {
        NodeSnapshot {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Pods created later have a larger `age_rank`.
    fn pod(name: &str, node: &str, age_rank: i64) -> PodCandidate {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        PodCandidate {
            name: name.to_string(),
            namespace: "default".to_string(),
            node_name: node.to_string(),
            created: base + chrono::Duration::seconds(age_rank),
        }
    }

    fn target(selector: &[(&str, &str)], max_pods: i32) -> NodeTarget {
        NodeTarget {
            node_selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            max_pods_per_node: max_pods,
        }
    }

    fn spread(counts: &[(&str, usize)]) -> Vec<PodCandidate> {
        let mut pods = Vec::new();
        for (node, count) in counts {
            for i in 0..*count {
                pods.push(pod(
                    &format!("{node}-pod-{i}"),
                    node,
                    (pods.len() + 1) as i64,
                ));
            }
        }
        pods
    }

    #[test]
    fn test_homogeneous_three_node_spread() {
        let nodes = vec![node("a", &[]), node("b", &[]), node("c", &[])];
        let pods = spread(&[("a", 10), ("b", 3), ("c", 2)]);

        let plan = build_plan(&nodes, &pods, &[]);

        // Average cap is 5, so node a sheds 10 - 5 - 1 = 4 pods.
        assert_eq!(plan.len(), 4);
        assert!(plan.iter().all(|p| p.node_name == "a"));
        // The four newest pods on a are a-pod-9..a-pod-6.
        let names: Vec<&str> = plan.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a-pod-9", "a-pod-8", "a-pod-7", "a-pod-6"]);
    }

    #[test]
    fn test_tolerance_leaves_slightly_over_cap_nodes_alone() {
        let nodes = vec![
            node("a", &[("hw", "x")]),
            node("b", &[("hw", "y")]),
            node("c", &[("hw", "x")]),
        ];
        let pods = spread(&[("a", 5), ("b", 2), ("c", 4)]);
        let targets = vec![target(&[("hw", "x")], 3), target(&[("hw", "y")], 5)];

        // a is one over its cap of 3, c is one over with the tolerance, so
        // nothing moves.
        let plan = build_plan(&nodes, &pods, &targets);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_unmatched_node_drains() {
        let nodes = vec![node("a", &[("hw", "x")]), node("b", &[("hw", "y")])];
        let pods = spread(&[("a", 5), ("b", 4)]);
        let targets = vec![target(&[("hw", "x")], 10)];

        let plan = build_plan(&nodes, &pods, &targets);

        // b matches no rule, so its cap is 0 and 4 - 0 - 1 = 3 pods go.
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|p| p.node_name == "b"));
    }

    #[test]
    fn test_empty_selector_matches_every_node() {
        let nodes = vec![node("a", &[("hw", "x")]), node("b", &[])];
        let pods = spread(&[("a", 4), ("b", 4)]);
        let targets = vec![target(&[], 1)];

        let plan = build_plan(&nodes, &pods, &targets);
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let nodes = vec![node("a", &[("hw", "x"), ("zone", "eu")])];
        // Both rules match node a; the first one (cap 0) applies.
        let targets = vec![target(&[("hw", "x")], 0), target(&[("zone", "eu")], 10)];
        let pods = spread(&[("a", 3)]);

        let plan = build_plan(&nodes, &pods, &targets);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_balanced_snapshot_produces_empty_plan() {
        let nodes = vec![node("a", &[]), node("b", &[]), node("c", &[])];
        // Cap is 3; every node is at most cap + 1.
        let pods = spread(&[("a", 4), ("b", 3), ("c", 2)]);

        assert!(build_plan(&nodes, &pods, &[]).is_empty());
    }

    #[test]
    fn test_cap_fallback_is_floor_of_average() {
        let nodes = vec![node("a", &[]), node("b", &[]), node("c", &[])];
        // 11 pods over 3 nodes floors to cap 3; a sheds 8 - 3 - 1 = 4.
        let pods = spread(&[("a", 8), ("b", 2), ("c", 1)]);

        let plan = build_plan(&nodes, &pods, &[]);
        assert_eq!(plan.len(), 4);
        assert!(plan.iter().all(|p| p.node_name == "a"));
    }

    #[test]
    fn test_most_overloaded_node_goes_first() {
        let nodes = vec![node("a", &[]), node("b", &[])];
        let pods = spread(&[("a", 4), ("b", 8)]);
        let targets = vec![target(&[], 1)];

        let plan = build_plan(&nodes, &pods, &targets);

        // b is 7 over its cap, a is 3 over; b's pods lead the plan.
        assert_eq!(plan.len(), 8);
        assert!(plan[..6].iter().all(|p| p.node_name == "b"));
        assert!(plan[6..].iter().all(|p| p.node_name == "a"));
    }

    #[test]
    fn test_each_pod_marked_at_most_once() {
        let nodes = vec![node("a", &[]), node("b", &[])];
        let pods = spread(&[("a", 9), ("b", 1)]);

        let plan = build_plan(&nodes, &pods, &[]);

        let mut names: Vec<&str> = plan.iter().map(|p| p.name.as_str()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_pods_on_unknown_nodes_are_ignored() {
        let nodes = vec![node("a", &[]), node("b", &[])];
        // Pods on a cordoned or vanished node are not part of any plan.
        let mut pods = spread(&[("a", 2)]);
        pods.extend(spread(&[("ghost", 10)]));

        let plan = build_plan(&nodes, &pods, &[]);
        assert!(plan.iter().all(|p| p.node_name != "ghost"));
    }

    #[test]
    fn test_no_nodes_means_no_plan() {
        let pods = spread(&[("a", 5)]);
        assert!(build_plan(&[], &pods, &[]).is_empty());
    }
}
