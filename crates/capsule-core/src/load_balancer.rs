//! Metabolic Load Balancer (admission controller).
//!
//! Maps each logical backend to one or more physical nodes (a primary plus optional
//! "student" nodes) and tracks the memory each node has committed to in-flight calls.
//! Admission hands out an [`AdmissionPermit`]; dropping the permit releases the load,
//! so every exit path of a dispatch (success, error, timeout, cancellation, or the
//! future being dropped) leaves the counters balanced.
//!
//! The committed-load counters live behind a single mutex and are touched only here.

use crate::traits::{InferenceBackend, ResourceProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 1_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Primary,
    Student,
}

/// One physical node serving a logical backend (`[[nodes]]` in config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub node_id: String,
    pub backend_id: String,
    pub endpoint: String,
    /// Memory this node may commit to concurrent calls.
    pub ceiling_mb: u64,
    #[serde(default)]
    pub role: NodeRole,
    /// Local nodes are also bounded by the host's live free memory.
    #[serde(default = "default_true")]
    pub shares_host_resources: bool,
}

fn default_true() -> bool {
    true
}

impl NodeSpec {
    pub fn new(
        node_id: impl Into<String>,
        backend_id: impl Into<String>,
        endpoint: impl Into<String>,
        ceiling_mb: u64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            backend_id: backend_id.into(),
            endpoint: endpoint.into(),
            ceiling_mb,
            role: NodeRole::Primary,
            shares_host_resources: true,
        }
    }

    pub fn student(mut self) -> Self {
        self.role = NodeRole::Student;
        self
    }

    pub fn remote(mut self) -> Self {
        self.shares_host_resources = false;
        self
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            node_id: self.node_id.clone(),
            backend_id: self.backend_id.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// Handle to the node a call was routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub node_id: String,
    pub backend_id: String,
    pub endpoint: String,
}

/// Why admission was refused. Not an error: the executor reacts by downgrading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// The resource governor reported an unsafe system.
    Unsafe,
    UnknownBackend,
    NoLiveNode,
    NoHeadroom,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsafe => "unsafe",
            Self::UnknownBackend => "unknown_backend",
            Self::NoLiveNode => "no_live_node",
            Self::NoHeadroom => "no_headroom",
        }
    }
}

#[derive(Debug)]
pub enum AdmissionDecision {
    Admitted(AdmissionPermit),
    Denied(DenialReason),
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    pub fn node(&self) -> Option<&NodeRef> {
        match self {
            Self::Admitted(permit) => Some(permit.node()),
            Self::Denied(_) => None,
        }
    }
}

/// Committed load per node id.
#[derive(Debug, Default)]
struct LoadLedger {
    committed: Mutex<HashMap<String, u64>>,
}

impl LoadLedger {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        // A panic elsewhere must not wedge accounting.
        self.committed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, node_id: &str, amount_mb: u64) {
        let mut committed = self.lock();
        if let Some(load) = committed.get_mut(node_id) {
            *load = load.saturating_sub(amount_mb);
        }
    }
}

/// Proof of admission. Releases its committed load exactly once, on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    ledger: Arc<LoadLedger>,
    node: NodeRef,
    amount_mb: u64,
}

impl AdmissionPermit {
    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub fn amount_mb(&self) -> u64 {
        self.amount_mb
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.ledger.release(&self.node.node_id, self.amount_mb);
        debug!(
            target: "capsule::load_balancer",
            node = %self.node.node_id,
            released_mb = self.amount_mb,
            "Load released"
        );
    }
}

/// Read-only view of one node's accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeLoad {
    pub node_id: String,
    pub backend_id: String,
    pub committed_mb: u64,
    pub ceiling_mb: u64,
}

pub struct LoadBalancer {
    /// Logical backend -> nodes, in configured order (primary first).
    nodes: HashMap<String, Vec<NodeSpec>>,
    ledger: Arc<LoadLedger>,
    backend: Arc<dyn InferenceBackend>,
    resources: Arc<dyn ResourceProvider>,
    health_timeout: Duration,
}

impl LoadBalancer {
    pub fn new(
        nodes: Vec<NodeSpec>,
        backend: Arc<dyn InferenceBackend>,
        resources: Arc<dyn ResourceProvider>,
        health_timeout: Duration,
    ) -> Self {
        let mut by_backend: HashMap<String, Vec<NodeSpec>> = HashMap::new();
        for spec in nodes {
            let list = by_backend.entry(spec.backend_id.clone()).or_default();
            if spec.role == NodeRole::Student {
                list.push(spec);
            } else {
                // Primaries go ahead of any student already listed.
                let at = list.iter().position(|n| n.role == NodeRole::Student).unwrap_or(list.len());
                list.insert(at, spec);
            }
        }
        Self {
            nodes: by_backend,
            ledger: Arc::new(LoadLedger::default()),
            backend,
            resources,
            health_timeout,
        }
    }

    pub fn knows_backend(&self, backend_id: &str) -> bool {
        self.nodes.get(backend_id).is_some_and(|n| !n.is_empty())
    }

    /// Request admission of `required_mb` on some node of `backend_id`.
    ///
    /// Denies outright when the governor reports an unsafe system. Otherwise picks the
    /// first live node whose committed load plus the request stays within its ceiling
    /// (and, for host-sharing nodes, within the host's throttled free memory).
    pub async fn request_load(&self, backend_id: &str, required_mb: u64) -> AdmissionDecision {
        let snapshot = self.resources.snapshot().await;
        if !snapshot.is_safe {
            warn!(
                target: "capsule::load_balancer",
                backend = backend_id,
                required_mb,
                "Admission denied: resource governor reports unsafe"
            );
            return AdmissionDecision::Denied(DenialReason::Unsafe);
        }

        let Some(candidates) = self.nodes.get(backend_id).filter(|n| !n.is_empty()) else {
            warn!(target: "capsule::load_balancer", backend = backend_id, "Admission denied: no nodes configured");
            return AdmissionDecision::Denied(DenialReason::UnknownBackend);
        };

        let host_headroom = snapshot.usable_mb();
        let mut any_live = false;
        for spec in candidates {
            let node = spec.node_ref();
            if !self.is_live(&node).await {
                debug!(target: "capsule::load_balancer", node = %node.node_id, "Node failed liveness probe");
                continue;
            }
            any_live = true;
            if spec.shares_host_resources && required_mb > host_headroom {
                continue;
            }
            let admitted = {
                let mut committed = self.ledger.lock();
                let load = committed.entry(spec.node_id.clone()).or_insert(0);
                if load.saturating_add(required_mb) <= spec.ceiling_mb {
                    *load += required_mb;
                    Some(*load)
                } else {
                    None
                }
            };
            if let Some(now) = admitted {
                info!(
                    target: "capsule::load_balancer",
                    node = %node.node_id,
                    backend = backend_id,
                    required_mb,
                    committed_mb = now,
                    "Load admitted"
                );
                return AdmissionDecision::Admitted(AdmissionPermit {
                    ledger: Arc::clone(&self.ledger),
                    node,
                    amount_mb: required_mb,
                });
            }
        }

        let reason = if any_live { DenialReason::NoHeadroom } else { DenialReason::NoLiveNode };
        info!(
            target: "capsule::load_balancer",
            backend = backend_id,
            required_mb,
            free_mb = snapshot.free_resource_mb,
            reason = reason.as_str(),
            "Admission denied"
        );
        AdmissionDecision::Denied(reason)
    }

    /// First live node of `backend_id`, without committing load. Used for cheap audit
    /// calls that ride on an admission already held by the capsule.
    pub async fn probe(&self, backend_id: &str) -> Option<NodeRef> {
        for spec in self.nodes.get(backend_id)? {
            let node = spec.node_ref();
            if self.is_live(&node).await {
                return Some(node);
            }
        }
        None
    }

    async fn is_live(&self, node: &NodeRef) -> bool {
        tokio::time::timeout(self.health_timeout, self.backend.health(node))
            .await
            .unwrap_or(false)
    }

    pub fn committed_mb(&self, node_id: &str) -> u64 {
        self.ledger.lock().get(node_id).copied().unwrap_or(0)
    }

    pub fn total_committed_mb(&self) -> u64 {
        self.ledger.lock().values().sum()
    }

    pub fn snapshot(&self) -> Vec<NodeLoad> {
        let committed = self.ledger.lock();
        let mut out: Vec<NodeLoad> = self
            .nodes
            .values()
            .flatten()
            .map(|spec| NodeLoad {
                node_id: spec.node_id.clone(),
                backend_id: spec.backend_id.clone(),
                committed_mb: committed.get(&spec.node_id).copied().unwrap_or(0),
                ceiling_mb: spec.ceiling_mb,
            })
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }
}
