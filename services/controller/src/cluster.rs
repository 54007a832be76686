//! Cluster capability surface.
//!
//! The engine, reconciler, and node watcher only depend on the `Cluster`
//! trait. `KubeCluster` backs it with the real API server; `MockCluster` is
//! an in-memory implementation for tests and development.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tokio::sync::Mutex;

use kore_api::{RebalanceRequest, RebalanceRequestStatus};

/// Cluster operations the controller core needs.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// List every node in the cluster, ready or not.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// List every namespace name.
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// List pods in one namespace.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    /// Create an eviction sub-resource for a pod. Disruption-budget
    /// rejections surface here as errors.
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a rebalance request.
    async fn create_rebalance_request(&self, request: &RebalanceRequest)
        -> Result<RebalanceRequest>;

    /// Write a request's status sub-resource.
    async fn update_rebalance_status(&self, request: &RebalanceRequest) -> Result<()>;
}

/// `Cluster` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .context("listing nodes")?;
        Ok(list.items)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let list = namespaces
            .list(&ListParams::default())
            .await
            .context("listing namespaces")?;
        Ok(list.items.iter().map(|ns| ns.name_any()).collect())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing pods in {namespace}"))?;
        Ok(list.items)
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.evict(name, &EvictParams::default())
            .await
            .with_context(|| format!("evicting {namespace}/{name}"))?;
        Ok(())
    }

    async fn create_rebalance_request(
        &self,
        request: &RebalanceRequest,
    ) -> Result<RebalanceRequest> {
        let namespace = request
            .namespace()
            .context("rebalance request has no namespace")?;
        let requests: Api<RebalanceRequest> = Api::namespaced(self.client.clone(), &namespace);
        let created = requests
            .create(&PostParams::default(), request)
            .await
            .context("creating rebalance request")?;
        Ok(created)
    }

    async fn update_rebalance_status(&self, request: &RebalanceRequest) -> Result<()> {
        let namespace = request
            .namespace()
            .context("rebalance request has no namespace")?;
        let name = request.name_any();
        let requests: Api<RebalanceRequest> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({ "status": request.status });
        requests
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("updating status of {namespace}/{name}"))?;
        Ok(())
    }
}

#[derive(Default)]
struct MockState {
    nodes: Vec<Node>,
    namespaces: Vec<String>,
    pods: HashMap<String, Vec<Pod>>,
    evicted: Vec<String>,
    created_requests: Vec<RebalanceRequest>,
    status_writes: Vec<(String, RebalanceRequestStatus)>,
    failing_evictions: HashSet<String>,
    fail_status_writes: bool,
}

/// In-memory `Cluster` for tests and development.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_node(&self, node: Node) {
        self.state.lock().await.nodes.push(node);
    }

    /// Registers the pod under its namespace, adding the namespace to the
    /// listing if it is new.
    pub async fn add_pod(&self, pod: Pod) {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let mut state = self.state.lock().await;
        if !state.namespaces.contains(&namespace) {
            state.namespaces.push(namespace.clone());
        }
        state.pods.entry(namespace).or_default().push(pod);
    }

    /// Make evictions of `namespace/name` fail.
    pub async fn fail_eviction_of(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .await
            .failing_evictions
            .insert(format!("{namespace}/{name}"));
    }

    pub async fn fail_status_writes(&self, fail: bool) {
        self.state.lock().await.fail_status_writes = fail;
    }

    /// Evicted pods as `namespace/name`, in eviction order.
    pub async fn evicted(&self) -> Vec<String> {
        self.state.lock().await.evicted.clone()
    }

    pub async fn created_requests(&self) -> Vec<RebalanceRequest> {
        self.state.lock().await.created_requests.clone()
    }

    /// Status writes as `(name, status)`, in write order.
    pub async fn status_writes(&self) -> Vec<(String, RebalanceRequestStatus)> {
        self.state.lock().await.status_writes.clone()
    }
}

#[async_trait]
impl Cluster for MockCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.lock().await.nodes.clone())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().await.namespaces.clone())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .await
            .pods
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let key = format!("{namespace}/{name}");
        let mut state = self.state.lock().await;
        if state.failing_evictions.contains(&key) {
            bail!("eviction of {key} rejected");
        }
        state.evicted.push(key);
        Ok(())
    }

    async fn create_rebalance_request(
        &self,
        request: &RebalanceRequest,
    ) -> Result<RebalanceRequest> {
        let mut state = self.state.lock().await;
        let mut created = request.clone();
        if created.metadata.name.is_none() {
            let prefix = created.metadata.generate_name.clone().unwrap_or_default();
            created.metadata.name = Some(format!("{}{:05}", prefix, state.created_requests.len()));
        }
        state.created_requests.push(created.clone());
        Ok(created)
    }

    async fn update_rebalance_status(&self, request: &RebalanceRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_status_writes {
            bail!("status write rejected");
        }
        state
            .status_writes
            .push((request.name_any(), request.status.clone().unwrap_or_default()));
        Ok(())
    }
}
