//! Decentralized task routing and consensus for unreliable worker meshes.
//!
//! This crate coordinates task execution across an open set of
//! heterogeneous, intermittently connected nodes with no central
//! orchestrator:
//!
//! - **Capability Matching**: nodes declare weighted skill tags; requesters
//!   score responders with pluggable similarity functions
//! - **Beacon Discovery**: TTL-bounded, dedup-protected discovery messages
//!   find capable nodes without any directory service
//! - **Task Routing**: bounded response windows, retry with expanded reach,
//!   busy-node deprioritization
//! - **CoT Voting**: multiple independent answers per subtask, clustered
//!   and weighted by reputation times confidence
//! - **Reputation Ledger**: append-only outcome history per node, with a
//!   recency-weighted score that feeds voting and routing
//!
//! # Architecture
//!
//! Every node runs an event loop over its own inbox; beacons, responses,
//! assignments, and candidate submissions are independent events. The only
//! suspension points are the router's response window and the voter's
//! collection window, both hard wall-clock deadlines. Each node's ledger is
//! local and authoritative only for decisions that node makes.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use taskmesh::{CapabilityTag, EchoShim, Mesh, MeshConfig, Orchestrator};
//!
//! let mesh = Mesh::new(MeshConfig::default());
//! let node = mesh
//!     .register(
//!         "math-specialist",
//!         vec![CapabilityTag::new("mathematical-reasoning")],
//!         "10.0.0.7:7788",
//!         Arc::new(EchoShim::new(0.8)),
//!     )
//!     .await?;
//!
//! let orchestrator = Orchestrator::new(node);
//! let task_id = orchestrator
//!     .submit(
//!         "Predict next quarter's demand",
//!         vec!["data-collection".into(), "mathematical-modeling".into()],
//!         serde_json::json!({"domain": "retail"}),
//!     )
//!     .await?;
//! let report = orchestrator.get_status(&task_id).await?;
//! ```

pub mod beacon;
pub mod capability;
pub mod config;
pub mod execution;
pub mod mesh;
pub mod orchestration;
pub mod reputation;
pub mod routing;
pub mod task;
pub mod types;
pub mod voting;

// Re-export main types for convenience
pub use beacon::{Beacon, BeaconPropagator, BeaconResponse, BeaconState, RecentSeen};
pub use capability::{
    CapabilityRegistry, CapabilityTag, ExactSimilarity, LexicalSimilarity, Matcher, ScoredNode,
    SimilarityFn,
};
pub use config::{MeshConfig, ScoreReduction, SimilarityKind, Topology};
pub use execution::{EchoShim, ExecutionShim};
pub use mesh::{Assignment, Envelope, Mesh, MeshMessage, MeshNode};
pub use orchestration::Orchestrator;
pub use reputation::{LedgerEntry, LedgerOutcome, ReputationLedger};
pub use routing::TaskRouter;
pub use task::{CandidateResult, SubTask, SubTaskStatus, Task, TaskStatus, TaskStatusReport};
pub use types::{MeshError, NodeId, NodeStatus, Result};
pub use voting::{AnswerEquivalence, CotVoter, ExactAnswer, LexicalAnswer, VoteResult};
