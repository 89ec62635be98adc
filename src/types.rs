//! Common types used across the routing-and-consensus engine.

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the mesh.
pub type NodeId = String;

/// Unique identifier for a task.
pub type TaskId = String;

/// Unique identifier for a subtask.
pub type SubTaskId = String;

/// Unique identifier for a beacon message.
pub type BeaconId = String;

/// Lifecycle status of a node as seen by the local mesh.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node has registered but its event loop has not started yet
    Registered,
    /// Node is running and accepting work
    Active,
    /// Node is currently executing an assignment
    Busy,
    /// Node timed out or deregistered; identity is retained, liveness is not
    Disconnected,
}

/// Error types for mesh operations.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("Node id already registered: {0}")]
    DuplicateId(NodeId),

    #[error("No capable node found: {0}")]
    NoMatchFound(String),

    #[error("Execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("Execution failed: {0}")]
    ExecutionError(String),

    #[error("No answer cluster reached positive weight: {0}")]
    VotingDeadlock(String),

    #[error("Ledger entry failed validation: {0}")]
    LedgerCorruption(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task cancelled: {0}")]
    Cancelled(TaskId),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MeshError>;
