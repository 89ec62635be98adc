//! Per-task orchestration.
//!
//! The orchestrator owns a task from submission to its final answer,
//! driving each subtask through routing, execution, and voting. A subtask
//! may only start once every declared predecessor has a voted result;
//! subtasks whose dependencies are all satisfied run concurrently. A
//! subtask that exhausts its retries fails the whole task — no
//! partial-credit completion is ever reported.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::SimilarityKind;
use crate::mesh::MeshNode;
use crate::reputation::{LedgerEntry, LedgerOutcome};
use crate::routing::TaskRouter;
use crate::task::{SubTask, SubTaskStatus, Task, TaskStatus, TaskStatusReport};
use crate::types::{MeshError, Result, TaskId};
use crate::voting::CotVoter;

/// Drives tasks submitted on one requesting node.
#[derive(Clone)]
pub struct Orchestrator {
    node: Arc<MeshNode>,
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
    cancels: Arc<RwLock<HashMap<TaskId, Arc<AtomicBool>>>>,
}

impl Orchestrator {
    pub fn new(node: Arc<MeshNode>) -> Self {
        Self {
            node,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            cancels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Submit a task for asynchronous execution. Returns the task id
    /// immediately; completion is observed through [`Orchestrator::get_status`].
    pub async fn submit(
        &self,
        description: impl Into<String>,
        requirements: Vec<String>,
        context: serde_json::Value,
    ) -> Result<TaskId> {
        let task = Task::new(description, requirements, context)?;
        let task_id = task.task_id.clone();

        let cancel = Arc::new(AtomicBool::new(false));
        self.tasks.write().await.insert(task_id.clone(), task);
        self.cancels.write().await.insert(task_id.clone(), cancel.clone());

        let orchestrator = self.clone();
        let drive_id = task_id.clone();
        tokio::spawn(async move {
            orchestrator.drive(drive_id, cancel).await;
        });

        info!(task_id = %task_id, "Task submitted");
        Ok(task_id)
    }

    /// Current status of a task, with the final answer on completion and
    /// the failing subtask index on failure.
    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatusReport> {
        let tasks = self.tasks.read().await;
        let task = tasks
            .get(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))?;
        Ok(TaskStatusReport {
            task_id: task.task_id.clone(),
            status: task.status.clone(),
            result: task.final_result.clone(),
            failed_subtask_index: task.failed_subtask_index,
        })
    }

    /// Full snapshot of a task, including the per-subtask winner chain.
    pub async fn task_snapshot(&self, task_id: &str) -> Result<Task> {
        let tasks = self.tasks.read().await;
        tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))
    }

    /// Request cancellation. Stops further beaconing and execution for the
    /// task's subtasks at the next boundary; ledger entries already
    /// recorded stay recorded. A no-op once the task is terminal.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let cancels = self.cancels.read().await;
        match cancels.get(task_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(task_id = %task_id, "Cancellation requested");
                Ok(())
            }
            None => {
                // Unknown flag means either an unknown task or one that
                // already reached a terminal state.
                let tasks = self.tasks.read().await;
                if tasks.contains_key(task_id) {
                    Ok(())
                } else {
                    Err(MeshError::TaskNotFound(task_id.to_string()))
                }
            }
        }
    }

    async fn set_task_status(&self, task_id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.status = status;
        }
    }

    async fn write_back_subtask(&self, task_id: &str, index: usize, subtask: SubTask) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            if index < task.subtasks.len() {
                task.subtasks[index] = subtask;
            }
        }
    }

    /// The per-task state machine.
    async fn drive(&self, task_id: TaskId, cancel: Arc<AtomicBool>) {
        // Decompose once.
        {
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(&task_id) {
                TaskRouter::new(self.node.clone()).decompose(task);
            }
        }

        loop {
            if cancel.load(Ordering::SeqCst) {
                self.finish_cancelled(&task_id).await;
                return;
            }

            let snapshot = match self.task_snapshot(&task_id).await {
                Ok(task) => task,
                Err(_) => return,
            };

            if snapshot
                .subtasks
                .iter()
                .all(|s| s.status == SubTaskStatus::Voted)
            {
                self.finish_completed(&task_id).await;
                return;
            }

            // Subtasks whose predecessors all voted may start now, in
            // parallel with each other.
            let voted: Vec<String> = snapshot
                .subtasks
                .iter()
                .filter(|s| s.status == SubTaskStatus::Voted)
                .map(|s| s.subtask_id.clone())
                .collect();
            let ready: Vec<usize> = snapshot
                .subtasks
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    s.status == SubTaskStatus::Pending
                        && s.depends_on.iter().all(|d| voted.contains(d))
                })
                .map(|(i, _)| i)
                .collect();

            if ready.is_empty() {
                warn!(task_id = %task_id, "No runnable subtask; failing task");
                self.finish_failed(&task_id, None).await;
                return;
            }

            self.set_task_status(&task_id, TaskStatus::Routing).await;

            let mut batch = JoinSet::new();
            for index in ready {
                let mut subtask = snapshot.subtasks[index].clone();
                // Thread predecessor winners forward in dependency order.
                subtask.previous_results = subtask
                    .depends_on
                    .iter()
                    .filter_map(|dep_id| {
                        snapshot
                            .subtasks
                            .iter()
                            .find(|s| &s.subtask_id == dep_id)
                            .and_then(|dep| {
                                dep.result
                                    .as_ref()
                                    .map(|r| format!("{} Answer: {r}", dep.description))
                            })
                    })
                    .collect();

                let orchestrator = self.clone();
                let context = snapshot.context.clone();
                let flag = cancel.clone();
                batch.spawn(async move {
                    let result = orchestrator
                        .drive_subtask(&mut subtask, &context, flag)
                        .await;
                    (index, subtask, result)
                });
            }

            let mut failed_index: Option<usize> = None;
            let mut driver_lost = false;
            let mut cancelled = false;
            while let Some(joined) = batch.join_next().await {
                let Ok((index, subtask, result)) = joined else {
                    warn!(task_id = %task_id, "Subtask driver panicked");
                    driver_lost = true;
                    continue;
                };
                self.write_back_subtask(&task_id, index, subtask).await;
                match result {
                    Ok(()) => {}
                    Err(MeshError::Cancelled(_)) => cancelled = true,
                    Err(e) => {
                        debug!(task_id = %task_id, subtask = index, error = %e, "Subtask failed");
                        failed_index = Some(failed_index.map_or(index, |i| i.min(index)));
                    }
                }
            }

            if cancelled {
                self.finish_cancelled(&task_id).await;
                return;
            }
            if failed_index.is_some() || driver_lost {
                self.finish_failed(&task_id, failed_index).await;
                return;
            }
        }
    }

    /// Route, execute, and vote one subtask, retrying with an expanded
    /// candidate pool until the retry budget is exhausted.
    ///
    /// Each round widens the beacon's hop budget by one, so a retry caused
    /// by an empty response window or a voting deadlock reaches further
    /// than the round before it.
    async fn drive_subtask(
        &self,
        subtask: &mut SubTask,
        context: &serde_json::Value,
        cancel: Arc<AtomicBool>,
    ) -> Result<()> {
        let config = self.node.config().clone();
        let router = TaskRouter::new(self.node.clone());
        let voter = match config.vote_equivalence {
            SimilarityKind::Exact => CotVoter::exact(),
            SimilarityKind::Lexical => CotVoter::lexical(config.cluster_threshold),
        };

        let mut last_error = MeshError::NoMatchFound(subtask.subtask_id.clone());
        for round in 0..=config.max_retries {
            if cancel.load(Ordering::SeqCst) {
                return Err(MeshError::Cancelled(subtask.task_id.clone()));
            }

            self.set_task_status(&subtask.task_id, TaskStatus::Routing).await;
            let executor = match router.route(subtask, context, round).await {
                Ok(executor) => executor,
                Err(e) => {
                    debug!(
                        subtask_id = %subtask.subtask_id,
                        round,
                        error = %e,
                        "Discovery round came up empty"
                    );
                    last_error = e;
                    continue;
                }
            };

            self.set_task_status(&subtask.task_id, TaskStatus::Executing).await;
            // The collection channel must be open before the work order
            // goes out.
            let rx = self.node.open_candidate_channel(&subtask.subtask_id).await;
            router.dispatch(subtask, &executor).await;
            let candidates = self.collect_candidates(subtask, rx).await;
            router.finish_assignment(&executor).await;

            if !candidates.is_empty() {
                subtask.status = SubTaskStatus::Executed;
            }

            self.set_task_status(&subtask.task_id, TaskStatus::Voting).await;
            let reputations = self.node.reputations().await;
            let expected = vec![executor.clone()];
            match voter.vote(&candidates, &reputations, &expected) {
                Ok(vote) => {
                    let entries: Vec<LedgerEntry> = vote
                        .outcomes
                        .iter()
                        .map(|(node_id, outcome)| {
                            LedgerEntry::new(
                                node_id.clone(),
                                subtask.task_id.clone(),
                                subtask.subtask_id.clone(),
                                *outcome,
                            )
                        })
                        .collect();
                    self.node.record_outcomes(entries).await;

                    subtask.result = Some(vote.winner.payload.clone());
                    subtask.status = SubTaskStatus::Voted;
                    info!(
                        subtask_id = %subtask.subtask_id,
                        winner = %vote.winner.node_id,
                        weight = vote.winning_weight,
                        "Subtask voted"
                    );
                    return Ok(());
                }
                Err(e) => {
                    // A silent assignee still leaves a mark in the ledger.
                    if candidates.is_empty() {
                        self.node
                            .record_outcomes(vec![LedgerEntry::new(
                                executor.clone(),
                                subtask.task_id.clone(),
                                subtask.subtask_id.clone(),
                                LedgerOutcome::TimedOut,
                            )])
                            .await;
                    }
                    debug!(
                        subtask_id = %subtask.subtask_id,
                        round,
                        error = %e,
                        "Vote round failed"
                    );
                    subtask.assignee = None;
                    last_error = e;
                }
            }
        }

        subtask.status = SubTaskStatus::Failed;
        Err(last_error)
    }

    /// Collect candidate results inside the voting window, returning early
    /// once every expected reasoning path has reported.
    async fn collect_candidates(
        &self,
        subtask: &SubTask,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<crate::task::CandidateResult>,
    ) -> Vec<crate::task::CandidateResult> {
        let config = self.node.config();
        let expected = config.cot_paths.max(1);

        let mut candidates = Vec::with_capacity(expected);
        let deadline = tokio::time::Instant::now() + config.voting_window();
        while candidates.len() < expected {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, rx.recv()).await {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => break,
                Err(_) => break,
            }
        }
        self.node.close_candidate_channel(&subtask.subtask_id).await;
        candidates
    }

    async fn finish_completed(&self, task_id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.final_result = task.subtasks.last().and_then(|s| s.result.clone());
            task.status = TaskStatus::Completed;
            info!(task_id = %task_id, "Task completed");
        }
        drop(tasks);
        self.cancels.write().await.remove(task_id);
    }

    async fn finish_failed(&self, task_id: &str, failed_subtask_index: Option<usize>) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.failed_subtask_index = failed_subtask_index;
            warn!(
                task_id = %task_id,
                failed_subtask_index = ?failed_subtask_index,
                last_completed = ?task.last_completed_index(),
                "Task failed"
            );
        }
        drop(tasks);
        self.cancels.write().await.remove(task_id);
    }

    async fn finish_cancelled(&self, task_id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.status = TaskStatus::Cancelled;
            info!(task_id = %task_id, "Task cancelled");
        }
        drop(tasks);
        self.cancels.write().await.remove(task_id);
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("node", &self.node.node_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityTag;
    use crate::config::MeshConfig;
    use crate::execution::EchoShim;
    use crate::mesh::Mesh;
    use std::time::Duration;

    fn caps(tags: &[&str]) -> Vec<CapabilityTag> {
        tags.iter().map(|t| CapabilityTag::new(*t)).collect()
    }

    fn shim() -> Arc<dyn crate::execution::ExecutionShim> {
        Arc::new(EchoShim::new(0.8))
    }

    async fn wait_terminal(orchestrator: &Orchestrator, task_id: &str) -> TaskStatusReport {
        for _ in 0..100 {
            let report = orchestrator.get_status(task_id).await.unwrap();
            if matches!(
                report.status,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            ) {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {task_id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_tasks() {
        let mesh = Mesh::new(MeshConfig::default());
        let node = mesh.register("solo", caps(&[]), "addr", shim()).await.unwrap();
        let orchestrator = Orchestrator::new(node);

        assert!(matches!(
            orchestrator.submit("", vec!["x".to_string()], serde_json::json!({})).await,
            Err(MeshError::InvalidTask(_))
        ));
        assert!(matches!(
            orchestrator.submit("desc", vec![], serde_json::json!({})).await,
            Err(MeshError::InvalidTask(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_task_status() {
        let mesh = Mesh::new(MeshConfig::default());
        let node = mesh.register("solo", caps(&[]), "addr", shim()).await.unwrap();
        let orchestrator = Orchestrator::new(node);
        assert!(matches!(
            orchestrator.get_status("missing").await,
            Err(MeshError::TaskNotFound(_))
        ));
        assert!(matches!(
            orchestrator.cancel("missing").await,
            Err(MeshError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_exhausts_retries_then_fails_task() {
        let config = MeshConfig {
            response_window_ms: 200,
            voting_window_ms: 200,
            max_retries: 2,
            ..MeshConfig::default()
        };
        let mesh = Mesh::new(config);
        // Requester with no capabilities and no peers: every response
        // window must close empty.
        let node = mesh
            .register("requester", caps(&[]), "addr", shim())
            .await
            .unwrap();
        let orchestrator = Orchestrator::new(node);

        let task_id = orchestrator
            .submit(
                "translate the abstract",
                vec!["translation".to_string()],
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let report = wait_terminal(&orchestrator, &task_id).await;
        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.failed_subtask_index, Some(0));
        assert!(report.result.is_none());

        // Initial attempt plus exactly max_retries retries
        let task = orchestrator.task_snapshot(&task_id).await.unwrap();
        assert_eq!(task.subtasks[0].attempts, 3);
        assert_eq!(task.subtasks[0].status, SubTaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_completion() {
        let config = MeshConfig {
            response_window_ms: 300,
            voting_window_ms: 300,
            max_retries: 5,
            ..MeshConfig::default()
        };
        let mesh = Mesh::new(config);
        let node = mesh
            .register("requester", caps(&[]), "addr", shim())
            .await
            .unwrap();
        let orchestrator = Orchestrator::new(node);

        let task_id = orchestrator
            .submit(
                "translate the abstract",
                vec!["translation".to_string()],
                serde_json::json!({}),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.cancel(&task_id).await.unwrap();

        let report = wait_terminal(&orchestrator, &task_id).await;
        assert_eq!(report.status, TaskStatus::Cancelled);
    }
}
