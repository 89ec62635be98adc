//! Beacon-based discovery and TTL-bounded propagation.
//!
//! A beacon advertises one subtask's requirements and floods outward until
//! its hop budget runs out. Loop freedom comes from a bounded recent-seen
//! set, not from assuming an acyclic topology: a node that has already seen
//! a beacon id drops the duplicate without relaying. Eviction from the
//! bounded set permits a theoretical duplicate relay after a long delay;
//! that trade-off is accepted to cap memory under beacon storms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::capability::{CapabilityRegistry, Matcher};
use crate::types::{BeaconId, NodeId, SubTaskId};

/// Lifecycle of a beacon from the originator's point of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BeaconState {
    /// Built but not yet sent
    Created,
    /// In flight, response window open
    Propagating,
    /// Response window closed
    Expired,
    /// Reached a node with no remaining hop budget
    Absorbed,
}

/// Discovery message advertising one subtask's requirements.
///
/// Immutable once created; relays produce a copy with a decremented ttl and
/// an extended hop path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    pub beacon_id: BeaconId,

    /// Node that issued this beacon
    pub source_id: NodeId,

    /// Subtask this beacon routes work for
    pub subtask_id: SubTaskId,

    /// Capability requirements a responder is scored against
    pub task_requirements: Vec<String>,

    /// Remaining hop budget; decremented by exactly 1 per relay hop
    pub ttl: u32,

    /// Opaque task context, passed through uninspected
    pub context: serde_json::Value,

    /// Ordered set of nodes this beacon has passed through
    pub hop_path: Vec<NodeId>,

    pub created_at: DateTime<Utc>,
}

impl Beacon {
    /// Create a beacon originating at `source_id`.
    pub fn new(
        source_id: impl Into<NodeId>,
        subtask_id: impl Into<SubTaskId>,
        task_requirements: Vec<String>,
        ttl: u32,
        context: serde_json::Value,
    ) -> Self {
        let source_id = source_id.into();
        Self {
            beacon_id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.clone(),
            subtask_id: subtask_id.into(),
            task_requirements,
            ttl,
            context,
            hop_path: vec![source_id],
            created_at: Utc::now(),
        }
    }

    /// The copy a relaying node forwards, or `None` when the hop budget is
    /// exhausted (`ttl - 1 == 0` means the next hop would be the last
    /// allowed recipient, so relaying stops here).
    pub fn relay_via(&self, via: &str) -> Option<Beacon> {
        if self.ttl <= 1 {
            return None;
        }
        let mut relayed = self.clone();
        relayed.ttl -= 1;
        if !relayed.hop_path.iter().any(|n| n == via) {
            relayed.hop_path.push(via.to_string());
        }
        Some(relayed)
    }
}

/// Answer to a beacon from a node whose local match cleared the response
/// threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconResponse {
    pub response_id: String,
    pub beacon_id: BeaconId,
    pub responder_id: NodeId,

    /// The responder's aggregate match score against the beacon's
    /// requirements, self-assessed
    pub score: f32,

    /// Where an assignment can reach the responder
    pub address: String,

    pub created_at: DateTime<Utc>,
}

impl BeaconResponse {
    pub fn new(
        beacon_id: impl Into<BeaconId>,
        responder_id: impl Into<NodeId>,
        score: f32,
        address: impl Into<String>,
    ) -> Self {
        Self {
            response_id: uuid::Uuid::new_v4().to_string(),
            beacon_id: beacon_id.into(),
            responder_id: responder_id.into(),
            score: score.clamp(0.0, 1.0),
            address: address.into(),
            created_at: Utc::now(),
        }
    }
}

/// Bounded LRU set of recently seen beacon ids.
#[derive(Debug)]
pub struct RecentSeen {
    capacity: usize,
    order: VecDeque<BeaconId>,
    seen: HashSet<BeaconId>,
}

impl RecentSeen {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record a beacon id. Returns `true` if it was not already present.
    pub fn insert(&mut self, beacon_id: &str) -> bool {
        if self.seen.contains(beacon_id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(beacon_id.to_string());
        self.seen.insert(beacon_id.to_string());
        true
    }

    pub fn contains(&self, beacon_id: &str) -> bool {
        self.seen.contains(beacon_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// What a node decided to do with an inbound beacon.
#[derive(Debug)]
pub struct BeaconDecision {
    /// Response to unicast back toward the source, if the local match
    /// cleared the response threshold
    pub response: Option<BeaconResponse>,

    /// Decremented copy to forward, if hop budget remains
    pub relay: Option<Beacon>,

    /// Dropped as an already-seen duplicate
    pub duplicate: bool,
}

impl BeaconDecision {
    fn duplicate() -> Self {
        Self {
            response: None,
            relay: None,
            duplicate: true,
        }
    }
}

/// Per-node beacon handling: dedup, local evaluation, relay decision.
#[derive(Debug)]
pub struct BeaconPropagator {
    node_id: NodeId,
    address: String,
    seen: RecentSeen,
    response_threshold: f32,
}

impl BeaconPropagator {
    pub fn new(
        node_id: impl Into<NodeId>,
        address: impl Into<String>,
        recent_seen_capacity: usize,
        response_threshold: f32,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            seen: RecentSeen::new(recent_seen_capacity),
            response_threshold,
        }
    }

    /// Mark a locally originated beacon as seen so an echoed copy is not
    /// re-processed.
    pub fn note_own(&mut self, beacon: &Beacon) {
        self.seen.insert(&beacon.beacon_id);
    }

    /// Apply the propagation rule to an inbound beacon.
    ///
    /// A duplicate id yields no response and no relay. An unseen beacon is
    /// always evaluated locally, even at `ttl == 0` (absorbed beacons still
    /// get a response); a relay copy is produced only while hop budget
    /// remains.
    pub fn handle(
        &mut self,
        beacon: &Beacon,
        registry: &CapabilityRegistry,
        matcher: &Matcher,
    ) -> BeaconDecision {
        if !self.seen.insert(&beacon.beacon_id) {
            tracing::debug!(
                beacon_id = %beacon.beacon_id,
                node_id = %self.node_id,
                "Dropping duplicate beacon"
            );
            return BeaconDecision::duplicate();
        }

        let score = matcher.score(&beacon.task_requirements, registry);
        let response = if score >= self.response_threshold {
            tracing::debug!(
                beacon_id = %beacon.beacon_id,
                node_id = %self.node_id,
                score,
                "Responding to beacon"
            );
            Some(BeaconResponse::new(
                beacon.beacon_id.clone(),
                self.node_id.clone(),
                score,
                self.address.clone(),
            ))
        } else {
            None
        };

        BeaconDecision {
            response,
            relay: beacon.relay_via(&self.node_id),
            duplicate: false,
        }
    }
}
