//! Task and subtask contracts.
//!
//! A task is decomposed exactly once into an ordered set of subtasks whose
//! dependency edges are fixed at decomposition time. Subtask results are
//! threaded forward through `previous_results` in dependency order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MeshError, NodeId, Result, SubTaskId, TaskId};

/// Lifecycle of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Decomposed,
    Routing,
    Executing,
    Voting,
    Completed,
    Failed,
    Cancelled,
}

/// Lifecycle of a subtask.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    Beaconing,
    Assigned,
    Executed,
    Voted,
    Failed,
}

/// One unit of a decomposed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub subtask_id: SubTaskId,

    /// The task this subtask belongs to
    pub task_id: TaskId,

    /// What the assignee is asked to do
    pub description: String,

    /// Capability requirements used for discovery and scoring
    pub requirements: Vec<String>,

    /// Subtask ids that must reach `Voted` before this one may start
    pub depends_on: Vec<SubTaskId>,

    /// Winning answers of predecessors, appended strictly in dependency
    /// order before execution begins
    pub previous_results: Vec<String>,

    /// The node currently assigned, at most one at a time
    pub assignee: Option<NodeId>,

    pub status: SubTaskStatus,

    /// Winning payload once this subtask reaches `Voted`
    pub result: Option<String>,

    /// Routing attempts consumed (first attempt plus retries)
    pub attempts: u32,
}

impl SubTask {
    pub fn new(
        task_id: impl Into<TaskId>,
        index: usize,
        description: impl Into<String>,
        requirements: Vec<String>,
        depends_on: Vec<SubTaskId>,
    ) -> Self {
        let task_id = task_id.into();
        Self {
            subtask_id: format!("{task_id}-sub-{}", index + 1),
            task_id,
            description: description.into(),
            requirements,
            depends_on,
            previous_results: Vec::new(),
            assignee: None,
            status: SubTaskStatus::Pending,
            result: None,
            attempts: 0,
        }
    }
}

/// A task submitted by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,

    /// Natural-language description of the whole task
    pub description: String,

    /// Ordered capability requirements; decomposition produces one subtask
    /// per requirement
    pub requirements: Vec<String>,

    /// Opaque context blob, passed through to beacons and shims uninspected
    pub context: serde_json::Value,

    /// Populated once at decomposition, never reordered afterward
    pub subtasks: Vec<SubTask>,

    pub status: TaskStatus,

    /// Winning payload of the final subtask once completed
    pub final_result: Option<String>,

    /// Index of the subtask that exhausted its retries, on failure
    pub failed_subtask_index: Option<usize>,

    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task, checking required fields eagerly at the boundary.
    /// The `context` blob is not inspected.
    pub fn new(
        description: impl Into<String>,
        requirements: Vec<String>,
        context: serde_json::Value,
    ) -> Result<Self> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(MeshError::InvalidTask("empty description".to_string()));
        }
        if requirements.is_empty() {
            return Err(MeshError::InvalidTask(
                "at least one requirement is required".to_string(),
            ));
        }
        if requirements.iter().any(|r| r.trim().is_empty()) {
            return Err(MeshError::InvalidTask("blank requirement".to_string()));
        }

        Ok(Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            description,
            requirements,
            context,
            subtasks: Vec::new(),
            status: TaskStatus::Created,
            final_result: None,
            failed_subtask_index: None,
            created_at: Utc::now(),
        })
    }

    /// Index of the last subtask in `Voted` state, for failure diagnostics.
    pub fn last_completed_index(&self) -> Option<usize> {
        self.subtasks
            .iter()
            .rposition(|s| s.status == SubTaskStatus::Voted)
    }
}

/// One candidate answer for a subtask, from one node or one reasoning path.
/// Immutable once submitted to the voter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateResult {
    pub subtask_id: SubTaskId,

    /// The node that produced this candidate
    pub node_id: NodeId,

    /// The proposed answer
    pub payload: String,

    /// Self-reported confidence in [0, 1]
    pub confidence: f32,
}

impl CandidateResult {
    pub fn new(
        subtask_id: impl Into<SubTaskId>,
        node_id: impl Into<NodeId>,
        payload: impl Into<String>,
        confidence: f32,
    ) -> Self {
        Self {
            subtask_id: subtask_id.into(),
            node_id: node_id.into(),
            payload: payload.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Snapshot returned by the status interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub failed_subtask_index: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_boundary_validation() {
        assert!(matches!(
            Task::new("", vec!["translation".to_string()], serde_json::json!({})),
            Err(MeshError::InvalidTask(_))
        ));
        assert!(matches!(
            Task::new("do things", vec![], serde_json::json!({})),
            Err(MeshError::InvalidTask(_))
        ));
        assert!(matches!(
            Task::new(
                "do things",
                vec!["translation".to_string(), "  ".to_string()],
                serde_json::json!({})
            ),
            Err(MeshError::InvalidTask(_))
        ));

        let task = Task::new(
            "translate then summarize",
            vec!["translation".to_string(), "summarization".to_string()],
            serde_json::json!({"domain": "news"}),
        )
        .unwrap();
        assert_eq!(task.status, TaskStatus::Created);
        assert!(task.subtasks.is_empty());
    }

    #[test]
    fn test_candidate_confidence_clamped() {
        let c = CandidateResult::new("sub-1", "node-1", "answer", 1.4);
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn test_last_completed_index() {
        let mut task = Task::new(
            "t",
            vec!["a".to_string(), "b".to_string()],
            serde_json::json!({}),
        )
        .unwrap();
        task.subtasks = vec![
            SubTask::new(task.task_id.clone(), 0, "first", vec!["a".to_string()], vec![]),
            SubTask::new(task.task_id.clone(), 1, "second", vec!["b".to_string()], vec![]),
        ];
        assert_eq!(task.last_completed_index(), None);
        task.subtasks[0].status = SubTaskStatus::Voted;
        assert_eq!(task.last_completed_index(), Some(0));
    }
}
