//! Subtask routing: decomposition, discovery, ranking, assignment.
//!
//! The router turns a task's requirements into one beacon per subtask,
//! holds a bounded response window open, and commits an assignment to the
//! best-scoring respondent. Responses arriving after the window closes are
//! discarded. Nodes already carrying assignments are deprioritized through
//! a ranking penalty, never hard-blocked, so a small capable pool is not
//! starved.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::beacon::{Beacon, BeaconResponse, BeaconState};
use crate::capability::{rank_by_score, ScoredNode, SCORE_EPSILON};
use crate::mesh::{Assignment, MeshNode};
use crate::task::{SubTask, Task, TaskStatus};
use crate::types::{MeshError, NodeId, Result};

/// Routes subtasks on behalf of one requesting node.
#[derive(Debug)]
pub struct TaskRouter {
    node: Arc<MeshNode>,
}

impl TaskRouter {
    pub fn new(node: Arc<MeshNode>) -> Self {
        Self { node }
    }

    /// Populate a task's subtasks: one per requirement, in requirement
    /// order, each depending on all earlier subtasks. Decomposition happens
    /// exactly once; the subtask list is never reordered afterward.
    pub fn decompose(&self, task: &mut Task) {
        if task.status != TaskStatus::Created {
            return;
        }
        let mut subtasks = Vec::with_capacity(task.requirements.len());
        let mut earlier: Vec<String> = Vec::new();
        for (index, requirement) in task.requirements.iter().enumerate() {
            let subtask = SubTask::new(
                task.task_id.clone(),
                index,
                format!("Handle {requirement} for: {}", task.description),
                vec![requirement.clone()],
                earlier.clone(),
            );
            earlier.push(subtask.subtask_id.clone());
            subtasks.push(subtask);
        }
        task.subtasks = subtasks;
        task.status = TaskStatus::Decomposed;
        info!(
            task_id = %task.task_id,
            subtasks = task.subtasks.len(),
            "Task decomposed"
        );
    }

    /// Run one discovery round for a subtask and commit an assignment.
    ///
    /// `round` widens the beacon's hop budget on each retry. Returns the
    /// executor's id, or [`MeshError::NoMatchFound`] when nothing scored
    /// above the matcher threshold inside the response window.
    pub async fn route(
        &self,
        subtask: &mut SubTask,
        context: &serde_json::Value,
        round: u32,
    ) -> Result<NodeId> {
        let config = self.node.config().clone();
        subtask.attempts += 1;
        subtask.status = crate::task::SubTaskStatus::Beaconing;

        let ttl = config.default_ttl + round;
        let beacon = Beacon::new(
            self.node.node_id(),
            subtask.subtask_id.clone(),
            subtask.requirements.clone(),
            ttl,
            context.clone(),
        );
        debug!(
            beacon_id = %beacon.beacon_id,
            ttl,
            state = ?BeaconState::Created,
            "Beacon built"
        );

        let mut rx = self.node.open_response_channel(&beacon.beacon_id).await;
        self.node.broadcast_beacon(&beacon).await;
        debug!(
            beacon_id = %beacon.beacon_id,
            state = ?BeaconState::Propagating,
            "Response window open"
        );

        // Bounded response window: proceed on deadline, never wait for all.
        let window = config.response_window();
        let deadline = tokio::time::Instant::now() + window;
        let mut responses: HashMap<NodeId, BeaconResponse> = HashMap::new();
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, rx.recv()).await {
                Ok(Some(response)) => {
                    // First response per responder wins; later duplicates
                    // for the same beacon are ignored.
                    responses
                        .entry(response.responder_id.clone())
                        .or_insert(response);
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        self.node.close_response_channel(&beacon.beacon_id).await;
        debug!(
            beacon_id = %beacon.beacon_id,
            state = ?BeaconState::Expired,
            responses = responses.len(),
            "Response window closed"
        );

        let executor = self.select_executor(subtask, responses).await?;
        self.commit(subtask, &executor).await;
        Ok(executor.node_id)
    }

    /// Rank respondents and pick the executor.
    ///
    /// The requester's own registry competes like any respondent's, and
    /// within the epsilon band of the top score the requester prefers
    /// itself, saving a network hop.
    async fn select_executor(
        &self,
        subtask: &SubTask,
        responses: HashMap<NodeId, BeaconResponse>,
    ) -> Result<ScoredNode> {
        let config = self.node.config();
        let self_id = self.node.node_id().to_string();

        let mut scored: Vec<ScoredNode> = Vec::with_capacity(responses.len() + 1);
        for (node_id, response) in responses {
            scored.push(ScoredNode {
                node_id,
                score: response.score,
            });
        }
        let self_score = self.node.self_score(&subtask.requirements).await;
        if self_score >= config.matcher_threshold && !scored.iter().any(|s| s.node_id == self_id) {
            scored.push(ScoredNode {
                node_id: self_id.clone(),
                score: self_score,
            });
        }

        scored.retain(|s| s.score >= config.matcher_threshold);
        if scored.is_empty() {
            return Err(MeshError::NoMatchFound(format!(
                "no responder above threshold for subtask {}",
                subtask.subtask_id
            )));
        }

        // Deprioritize nodes already carrying assignments from this
        // requester; a penalty, not a veto.
        for entry in scored.iter_mut() {
            let busy = self.node.assignments_in_flight(&entry.node_id).await;
            entry.score -= config.busy_penalty * busy as f32;
        }

        self.node
            .with_ledger(|ledger| rank_by_score(&mut scored, ledger))
            .await;

        let top_score = scored[0].score;
        let winner = scored
            .iter()
            .find(|s| s.node_id == self_id && (top_score - s.score) < SCORE_EPSILON)
            .unwrap_or(&scored[0])
            .clone();

        debug!(
            subtask_id = %subtask.subtask_id,
            executor = %winner.node_id,
            score = winner.score,
            candidates = scored.len(),
            "Executor selected"
        );
        Ok(winner)
    }

    /// Commit the assignment: mark the subtask and bump the executor's
    /// in-flight count. The work order itself goes out in
    /// [`TaskRouter::dispatch`], after the caller has opened its candidate
    /// collection channel.
    async fn commit(&self, subtask: &mut SubTask, executor: &ScoredNode) {
        subtask.assignee = Some(executor.node_id.clone());
        subtask.status = crate::task::SubTaskStatus::Assigned;
        self.node.note_assignment_started(&executor.node_id).await;
        info!(
            subtask_id = %subtask.subtask_id,
            executor = %executor.node_id,
            "Subtask assigned"
        );
    }

    /// Send the committed assignment to its executor.
    pub async fn dispatch(&self, subtask: &SubTask, executor_id: &str) {
        let config = self.node.config();
        let assignment = Assignment {
            subtask: subtask.clone(),
            requester_id: self.node.node_id().to_string(),
            paths: config.cot_paths,
            deadline_ms: config.voting_window_ms,
        };
        self.node.dispatch_assignment(executor_id, assignment).await;
    }

    /// Release the in-flight slot once a subtask's vote round has ended.
    pub async fn finish_assignment(&self, executor_id: &str) {
        self.node.note_assignment_finished(executor_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityTag;
    use crate::config::MeshConfig;
    use crate::execution::EchoShim;
    use crate::mesh::Mesh;
    use crate::task::SubTaskStatus;

    fn caps(tags: &[&str]) -> Vec<CapabilityTag> {
        tags.iter().map(|t| CapabilityTag::new(*t)).collect()
    }

    fn shim() -> Arc<dyn crate::execution::ExecutionShim> {
        Arc::new(EchoShim::new(0.8))
    }

    fn test_config() -> MeshConfig {
        MeshConfig {
            response_window_ms: 150,
            voting_window_ms: 500,
            max_retries: 1,
            ..MeshConfig::default()
        }
    }

    #[tokio::test]
    async fn test_decompose_builds_dependency_chain() {
        let mut task = Task::new(
            "build a model",
            vec![
                "data-collection".to_string(),
                "mathematical-modeling".to_string(),
                "code-implementation".to_string(),
            ],
            serde_json::json!({}),
        )
        .unwrap();

        let mesh = Mesh::new(test_config());
        let node = mesh.register("solo", caps(&[]), "addr", shim()).await.unwrap();
        let router = TaskRouter::new(node);
        router.decompose(&mut task);

        assert_eq!(task.status, TaskStatus::Decomposed);
        assert_eq!(task.subtasks.len(), 3);
        assert!(task.subtasks[0].depends_on.is_empty());
        assert_eq!(
            task.subtasks[2].depends_on,
            vec![
                task.subtasks[0].subtask_id.clone(),
                task.subtasks[1].subtask_id.clone()
            ]
        );
        // Decomposition happens exactly once
        let snapshot = task.subtasks.clone();
        router.decompose(&mut task);
        assert_eq!(task.subtasks.len(), snapshot.len());
    }

    #[tokio::test]
    async fn test_route_prefers_best_scorer() {
        let mesh = Mesh::new(test_config());
        let requester = mesh
            .register("requester", caps(&[]), "addr-r", shim())
            .await
            .unwrap();
        mesh.register("strong", caps(&["translation"]), "addr-s", shim())
            .await
            .unwrap();
        let weak = mesh
            .register("weak", caps(&[]), "addr-w", shim())
            .await
            .unwrap();
        weak.add_capability(CapabilityTag::weighted("translation", 0.6))
            .await;

        let mut subtask = SubTask::new(
            "task-1",
            0,
            "translate",
            vec!["translation".to_string()],
            vec![],
        );
        let router = TaskRouter::new(requester);
        let executor = router
            .route(&mut subtask, &serde_json::json!({}), 0)
            .await
            .unwrap();

        assert_eq!(executor, "strong");
        assert_eq!(subtask.assignee.as_deref(), Some("strong"));
        assert_eq!(subtask.status, SubTaskStatus::Assigned);
        assert_eq!(subtask.attempts, 1);
    }

    #[tokio::test]
    async fn test_busy_penalty_shifts_assignment() {
        let config = MeshConfig {
            busy_penalty: 0.5,
            ..test_config()
        };
        let mesh = Mesh::new(config);
        let requester = mesh
            .register("requester", caps(&[]), "addr-r", shim())
            .await
            .unwrap();
        for id in ["worker-a", "worker-b"] {
            mesh.register(id, caps(&["translation"]), format!("addr-{id}"), shim())
                .await
                .unwrap();
        }

        let router = TaskRouter::new(requester.clone());
        let mut first = SubTask::new(
            "task-1",
            0,
            "translate",
            vec!["translation".to_string()],
            vec![],
        );
        let first_executor = router.route(&mut first, &serde_json::json!({}), 0).await.unwrap();

        // While the first assignment is still in flight, an identical
        // subtask lands on the other, idle worker.
        let mut second = SubTask::new(
            "task-2",
            0,
            "translate",
            vec!["translation".to_string()],
            vec![],
        );
        let second_executor = router.route(&mut second, &serde_json::json!({}), 0).await.unwrap();

        assert_ne!(first_executor, second_executor);
    }

    #[tokio::test]
    async fn test_self_priority_on_tied_scores() {
        let mesh = Mesh::new(test_config());
        let requester = mesh
            .register("requester", caps(&["translation"]), "addr-r", shim())
            .await
            .unwrap();
        mesh.register("peer", caps(&["translation"]), "addr-p", shim())
            .await
            .unwrap();

        let mut subtask = SubTask::new(
            "task-1",
            0,
            "translate",
            vec!["translation".to_string()],
            vec![],
        );
        let router = TaskRouter::new(requester);
        let executor = router
            .route(&mut subtask, &serde_json::json!({}), 0)
            .await
            .unwrap();

        assert_eq!(executor, "requester");
    }

    #[tokio::test]
    async fn test_no_match_when_nothing_clears_threshold() {
        let mesh = Mesh::new(test_config());
        let requester = mesh
            .register("requester", caps(&[]), "addr-r", shim())
            .await
            .unwrap();
        mesh.register("peer", caps(&["image-generation"]), "addr-p", shim())
            .await
            .unwrap();

        let mut subtask = SubTask::new(
            "task-1",
            0,
            "translate",
            vec!["translation".to_string()],
            vec![],
        );
        let router = TaskRouter::new(requester);
        let err = router
            .route(&mut subtask, &serde_json::json!({}), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NoMatchFound(_)));
        assert!(subtask.assignee.is_none());
    }
}
