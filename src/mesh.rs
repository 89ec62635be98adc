//! Node runtime and in-process message fabric.
//!
//! Each registered node runs an event loop over its own inbox: inbound
//! beacons, beacon responses, assignments, and candidate submissions are
//! independent events and never block one another. The fabric delivers
//! envelopes between inboxes and implements the two topology modes; it
//! deliberately exposes no node list to the routing layer — requesters only
//! ever learn about peers from the responses beacons bring back.
//!
//! Unicast toward a beacon's source models reverse-path delivery: the
//! fabric hands the envelope straight to the source's inbox rather than
//! retracing relay hops.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::beacon::{Beacon, BeaconPropagator, BeaconResponse};
use crate::capability::{CapabilityRegistry, CapabilityTag, Matcher};
use crate::config::{MeshConfig, Topology};
use crate::execution::ExecutionShim;
use crate::reputation::{LedgerEntry, ReputationLedger};
use crate::task::{CandidateResult, SubTask};
use crate::types::{BeaconId, MeshError, NodeId, NodeStatus, Result, SubTaskId};

/// Work order sent to the node selected for a subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    /// The subtask to execute, with `previous_results` already threaded
    pub subtask: SubTask,

    /// Node collecting the candidates for this subtask
    pub requester_id: NodeId,

    /// Number of parallel reasoning paths to sample
    pub paths: usize,

    /// Per-path execution deadline in milliseconds
    pub deadline_ms: u64,
}

/// Wire messages exchanged between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshMessage {
    Beacon(Beacon),
    BeaconResponse(BeaconResponse),
    Assignment(Assignment),
    Candidate(CandidateResult),
}

/// One addressed message on the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: MeshMessage,
}

struct Endpoint {
    address: String,
    sender: mpsc::UnboundedSender<Envelope>,
    neighbors: HashSet<NodeId>,
    status: Arc<RwLock<NodeStatus>>,
}

/// The in-process message fabric joining registered nodes.
#[derive(Clone)]
pub struct Mesh {
    config: MeshConfig,
    endpoints: Arc<RwLock<HashMap<NodeId, Endpoint>>>,
}

impl Mesh {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            endpoints: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Register a node and start its event loop.
    ///
    /// A second registration under an already-used id is rejected with
    /// [`MeshError::DuplicateId`] and leaves the existing node untouched.
    pub async fn register(
        &self,
        node_id: impl Into<NodeId>,
        capabilities: Vec<CapabilityTag>,
        address: impl Into<String>,
        shim: Arc<dyn ExecutionShim>,
    ) -> Result<Arc<MeshNode>> {
        let node_id = node_id.into();
        let address = address.into();

        let (sender, inbox) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(NodeStatus::Registered));
        {
            let mut endpoints = self.endpoints.write().await;
            if endpoints.contains_key(&node_id) {
                return Err(MeshError::DuplicateId(node_id));
            }
            endpoints.insert(
                node_id.clone(),
                Endpoint {
                    address: address.clone(),
                    sender,
                    neighbors: HashSet::new(),
                    status: status.clone(),
                },
            );
        }

        let node = Arc::new(MeshNode {
            node_id: node_id.clone(),
            address: address.clone(),
            config: self.config.clone(),
            mesh: self.clone(),
            registry: RwLock::new(CapabilityRegistry::new(node_id.clone(), capabilities)),
            ledger: RwLock::new(ReputationLedger::new(self.config.reputation_alpha)),
            propagator: Mutex::new(BeaconPropagator::new(
                node_id.clone(),
                address.clone(),
                self.config.recent_seen_capacity,
                self.config.response_threshold,
            )),
            matcher: Matcher::from_kind(self.config.similarity, self.config.reduction),
            shim,
            status,
            pending_responses: Mutex::new(HashMap::new()),
            pending_candidates: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        });

        tokio::spawn(node.clone().run(inbox));
        info!(node_id = %node_id, address = %address, "Node registered");
        Ok(node)
    }

    /// Mark a node disconnected and stop delivering to it. The identity
    /// stays reserved; re-registering the same id is still a duplicate.
    pub async fn deregister(&self, node_id: &str) -> Result<()> {
        let endpoints = self.endpoints.read().await;
        let endpoint = endpoints
            .get(node_id)
            .ok_or_else(|| MeshError::Communication(format!("unknown node {node_id}")))?;
        *endpoint.status.write().await = NodeStatus::Disconnected;
        info!(node_id = %node_id, "Node deregistered");
        Ok(())
    }

    /// Create a bidirectional neighbor link, used by the neighbor-broadcast
    /// topology.
    pub async fn connect(&self, a: &str, b: &str) -> Result<()> {
        let mut endpoints = self.endpoints.write().await;
        if !endpoints.contains_key(a) {
            return Err(MeshError::Communication(format!("unknown node {a}")));
        }
        if !endpoints.contains_key(b) {
            return Err(MeshError::Communication(format!("unknown node {b}")));
        }
        if let Some(endpoint) = endpoints.get_mut(a) {
            endpoint.neighbors.insert(b.to_string());
        }
        if let Some(endpoint) = endpoints.get_mut(b) {
            endpoint.neighbors.insert(a.to_string());
        }
        Ok(())
    }

    /// Current lifecycle status of a node, if registered.
    pub async fn status(&self, node_id: &str) -> Option<NodeStatus> {
        let endpoints = self.endpoints.read().await;
        match endpoints.get(node_id) {
            Some(endpoint) => Some(*endpoint.status.read().await),
            None => None,
        }
    }

    /// Registered address of a node, if registered.
    pub async fn address_of(&self, node_id: &str) -> Option<String> {
        let endpoints = self.endpoints.read().await;
        endpoints.get(node_id).map(|e| e.address.clone())
    }

    /// Unicast an envelope. Undeliverable envelopes are logged and dropped;
    /// the mesh is best-effort by design.
    pub async fn send(&self, envelope: Envelope) {
        let endpoints = self.endpoints.read().await;
        let Some(endpoint) = endpoints.get(&envelope.to) else {
            debug!(to = %envelope.to, "Dropping envelope for unknown node");
            return;
        };
        if *endpoint.status.read().await == NodeStatus::Disconnected {
            debug!(to = %envelope.to, "Dropping envelope for disconnected node");
            return;
        }
        if endpoint.sender.send(envelope).is_err() {
            debug!("Dropping envelope for stopped node");
        }
    }

    /// Fan a beacon out from `from` according to the topology: all
    /// reachable nodes under global broadcast, direct neighbors under
    /// neighbor broadcast. Nodes already on the hop path never receive the
    /// copy again.
    pub async fn deliver_beacon(&self, from: &str, beacon: Beacon) {
        let endpoints = self.endpoints.read().await;
        let targets: Vec<NodeId> = match self.config.topology {
            Topology::GlobalBroadcast => endpoints.keys().cloned().collect(),
            Topology::NeighborBroadcast => match endpoints.get(from) {
                Some(endpoint) => endpoint.neighbors.iter().cloned().collect(),
                None => Vec::new(),
            },
        };

        for target in targets {
            if target == from || beacon.hop_path.iter().any(|n| n == &target) {
                continue;
            }
            let Some(endpoint) = endpoints.get(&target) else {
                continue;
            };
            if *endpoint.status.read().await == NodeStatus::Disconnected {
                continue;
            }
            let envelope = Envelope {
                from: from.to_string(),
                to: target.clone(),
                message: MeshMessage::Beacon(beacon.clone()),
            };
            if endpoint.sender.send(envelope).is_err() {
                debug!(to = %target, "Beacon not delivered to stopped node");
            }
        }
    }
}

/// A node participating in the mesh: capability registry, local reputation
/// ledger, beacon propagator, and the execution shim it fronts.
pub struct MeshNode {
    node_id: NodeId,
    address: String,
    config: MeshConfig,
    mesh: Mesh,
    registry: RwLock<CapabilityRegistry>,
    ledger: RwLock<ReputationLedger>,
    propagator: Mutex<BeaconPropagator>,
    matcher: Matcher,
    shim: Arc<dyn ExecutionShim>,
    status: Arc<RwLock<NodeStatus>>,
    pending_responses: Mutex<HashMap<BeaconId, mpsc::UnboundedSender<BeaconResponse>>>,
    pending_candidates: Mutex<HashMap<SubTaskId, mpsc::UnboundedSender<CandidateResult>>>,
    in_flight: Mutex<HashMap<NodeId, u32>>,
}

impl MeshNode {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Declare a new capability on this node's own registry. Registries of
    /// other nodes are never reachable from here.
    pub async fn add_capability(&self, tag: CapabilityTag) {
        self.registry.write().await.add_capability(tag);
    }

    /// Withdraw a capability from this node's own registry.
    pub async fn remove_capability(&self, tag: &str) {
        self.registry.write().await.remove_capability(tag);
    }

    /// Snapshot of this node's declared capabilities.
    pub async fn capabilities(&self) -> Vec<CapabilityTag> {
        self.registry.read().await.capabilities().to_vec()
    }

    /// This node's aggregate score against a requirement set.
    pub async fn self_score(&self, requirements: &[String]) -> f32 {
        let registry = self.registry.read().await;
        self.matcher.score(requirements, &registry)
    }

    /// Append vote outcomes to the local ledger, dropping invalid entries.
    pub async fn record_outcomes(&self, entries: Vec<LedgerEntry>) -> usize {
        self.ledger.write().await.record_all(entries)
    }

    /// Current local reputation of one node.
    pub async fn reputation(&self, node_id: &str) -> f32 {
        self.ledger.read().await.reputation(node_id)
    }

    /// Current local reputation of every node with history.
    pub async fn reputations(&self) -> HashMap<NodeId, f32> {
        self.ledger.read().await.reputations()
    }

    /// Run `f` against the local ledger.
    pub async fn with_ledger<R>(&self, f: impl FnOnce(&ReputationLedger) -> R) -> R {
        let ledger = self.ledger.read().await;
        f(&ledger)
    }

    /// Number of assignments this node currently has outstanding on a peer.
    pub async fn assignments_in_flight(&self, node_id: &str) -> u32 {
        self.in_flight.lock().await.get(node_id).copied().unwrap_or(0)
    }

    pub(crate) async fn note_assignment_started(&self, node_id: &str) {
        *self.in_flight.lock().await.entry(node_id.to_string()).or_insert(0) += 1;
    }

    pub(crate) async fn note_assignment_finished(&self, node_id: &str) {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(count) = in_flight.get_mut(node_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.remove(node_id);
            }
        }
    }

    /// Open a collection channel for responses to one beacon. Responses
    /// arriving after [`MeshNode::close_response_channel`] are discarded.
    pub(crate) async fn open_response_channel(
        &self,
        beacon_id: &str,
    ) -> mpsc::UnboundedReceiver<BeaconResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending_responses
            .lock()
            .await
            .insert(beacon_id.to_string(), tx);
        rx
    }

    pub(crate) async fn close_response_channel(&self, beacon_id: &str) {
        self.pending_responses.lock().await.remove(beacon_id);
    }

    /// Open a collection channel for candidate results of one subtask.
    pub(crate) async fn open_candidate_channel(
        &self,
        subtask_id: &str,
    ) -> mpsc::UnboundedReceiver<CandidateResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending_candidates
            .lock()
            .await
            .insert(subtask_id.to_string(), tx);
        rx
    }

    pub(crate) async fn close_candidate_channel(&self, subtask_id: &str) {
        self.pending_candidates.lock().await.remove(subtask_id);
    }

    /// Issue a locally originated beacon into the fabric.
    pub(crate) async fn broadcast_beacon(&self, beacon: &Beacon) {
        self.propagator.lock().await.note_own(beacon);
        debug!(
            beacon_id = %beacon.beacon_id,
            subtask_id = %beacon.subtask_id,
            ttl = beacon.ttl,
            "Broadcasting beacon"
        );
        self.mesh.deliver_beacon(&self.node_id, beacon.clone()).await;
    }

    /// Dispatch an assignment to its executor (possibly this node itself).
    pub(crate) async fn dispatch_assignment(&self, executor_id: &str, assignment: Assignment) {
        self.mesh
            .send(Envelope {
                from: self.node_id.clone(),
                to: executor_id.to_string(),
                message: MeshMessage::Assignment(assignment),
            })
            .await;
    }

    /// Event loop: drain the inbox until the node is deregistered or the
    /// fabric drops the sending side.
    async fn run(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        *self.status.write().await = NodeStatus::Active;
        while let Some(envelope) = inbox.recv().await {
            if *self.status.read().await == NodeStatus::Disconnected {
                break;
            }
            self.clone().handle_envelope(envelope).await;
        }
        debug!(node_id = %self.node_id, "Event loop stopped");
    }

    async fn handle_envelope(self: Arc<Self>, envelope: Envelope) {
        match envelope.message {
            MeshMessage::Beacon(beacon) => self.handle_beacon(beacon).await,
            MeshMessage::BeaconResponse(response) => {
                let pending = self.pending_responses.lock().await;
                match pending.get(&response.beacon_id) {
                    Some(tx) if tx.send(response.clone()).is_ok() => {}
                    _ => {
                        debug!(
                            beacon_id = %response.beacon_id,
                            responder = %response.responder_id,
                            "Discarding response outside its window"
                        );
                    }
                }
            }
            MeshMessage::Assignment(assignment) => {
                let node = self.clone();
                tokio::spawn(async move {
                    node.execute_assignment(assignment).await;
                });
            }
            MeshMessage::Candidate(candidate) => {
                let pending = self.pending_candidates.lock().await;
                match pending.get(&candidate.subtask_id) {
                    Some(tx) if tx.send(candidate.clone()).is_ok() => {}
                    _ => {
                        debug!(
                            subtask_id = %candidate.subtask_id,
                            node_id = %candidate.node_id,
                            "Discarding candidate outside its window"
                        );
                    }
                }
            }
        }
    }

    async fn handle_beacon(&self, beacon: Beacon) {
        let decision = {
            let registry = self.registry.read().await;
            let mut propagator = self.propagator.lock().await;
            propagator.handle(&beacon, &registry, &self.matcher)
        };
        if decision.duplicate {
            return;
        }

        if let Some(response) = decision.response {
            self.mesh
                .send(Envelope {
                    from: self.node_id.clone(),
                    to: beacon.source_id.clone(),
                    message: MeshMessage::BeaconResponse(response),
                })
                .await;
        }
        if let Some(relay) = decision.relay {
            self.mesh.deliver_beacon(&self.node_id, relay).await;
        }
    }

    /// Execute an assignment: sample the configured number of reasoning
    /// paths in parallel and submit every successful candidate back to the
    /// requester. Per-path failures are logged and skipped; the requester's
    /// voting deadline decides what a silent path costs.
    async fn execute_assignment(self: Arc<Self>, assignment: Assignment) {
        *self.status.write().await = NodeStatus::Busy;
        let deadline = Duration::from_millis(assignment.deadline_ms);
        let paths = assignment.paths.max(1);
        debug!(
            subtask_id = %assignment.subtask.subtask_id,
            requester = %assignment.requester_id,
            paths,
            "Executing assignment"
        );

        let mut handles = Vec::with_capacity(paths);
        for _ in 0..paths {
            let node = self.clone();
            let subtask = assignment.subtask.clone();
            handles.push(tokio::spawn(async move {
                let previous = subtask.previous_results.clone();
                match tokio::time::timeout(deadline, node.shim.execute(&subtask, &previous, deadline))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(MeshError::ExecutionTimeout(subtask.subtask_id.clone())),
                }
            }));
        }

        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Execution path panicked");
                    continue;
                }
            };
            match result {
                Ok(mut candidate) => {
                    // The executor, not the shim, is authoritative for the
                    // candidate's origin.
                    candidate.node_id = self.node_id.clone();
                    candidate.subtask_id = assignment.subtask.subtask_id.clone();
                    self.mesh
                        .send(Envelope {
                            from: self.node_id.clone(),
                            to: assignment.requester_id.clone(),
                            message: MeshMessage::Candidate(candidate),
                        })
                        .await;
                }
                Err(e) => {
                    warn!(
                        subtask_id = %assignment.subtask.subtask_id,
                        error = %e,
                        "Execution path failed"
                    );
                }
            }
        }

        *self.status.write().await = NodeStatus::Active;
    }
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("node_id", &self.node_id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
