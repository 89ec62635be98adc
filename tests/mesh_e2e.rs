//! End-to-end mesh scenarios: discovery, dependent subtasks, voting, and
//! ledger updates across multiple nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use taskmesh::{
    CandidateResult, CapabilityTag, ExecutionShim, Mesh, MeshConfig, Orchestrator, SubTask,
    SubTaskStatus, TaskStatus, TaskStatusReport,
};

/// Shim that answers from a fixed table keyed by requirement and records
/// every invocation it sees.
struct RecordingShim {
    answers: HashMap<String, String>,
    confidence: f32,
    log: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl RecordingShim {
    fn new(
        answers: &[(&str, &str)],
        confidence: f32,
        log: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            answers: answers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            confidence,
            log,
        })
    }
}

#[async_trait]
impl ExecutionShim for RecordingShim {
    async fn execute(
        &self,
        subtask: &SubTask,
        previous_results: &[String],
        _deadline: Duration,
    ) -> taskmesh::Result<CandidateResult> {
        self.log
            .lock()
            .await
            .push((subtask.subtask_id.clone(), previous_results.to_vec()));

        let requirement = subtask.requirements.first().cloned().unwrap_or_default();
        let payload = self
            .answers
            .get(&requirement)
            .cloned()
            .unwrap_or_else(|| format!("no answer for {requirement}"));
        Ok(CandidateResult::new(
            subtask.subtask_id.clone(),
            subtask.assignee.clone().unwrap_or_default(),
            payload,
            self.confidence,
        ))
    }
}

fn test_config() -> MeshConfig {
    MeshConfig {
        response_window_ms: 200,
        voting_window_ms: 1_000,
        max_retries: 1,
        cot_paths: 2,
        ..MeshConfig::default()
    }
}

async fn wait_terminal(orchestrator: &Orchestrator, task_id: &str) -> TaskStatusReport {
    for _ in 0..200 {
        let report = orchestrator.get_status(task_id).await.unwrap();
        if matches!(
            report.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        ) {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("task {task_id} never reached a terminal state");
}

#[tokio::test]
async fn test_two_stage_task_threads_results_in_dependency_order() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let mesh = Mesh::new(test_config());
    let log = Arc::new(Mutex::new(Vec::new()));

    let user = mesh
        .register(
            "user",
            vec![],
            "addr-user",
            RecordingShim::new(&[], 0.5, log.clone()),
        )
        .await
        .unwrap();
    mesh.register(
        "translator",
        vec![CapabilityTag::new("translation")],
        "addr-t",
        RecordingShim::new(&[("translation", "hola mundo")], 0.9, log.clone()),
    )
    .await
    .unwrap();
    mesh.register(
        "summarizer",
        vec![CapabilityTag::new("summarization")],
        "addr-s",
        RecordingShim::new(&[("summarization", "a greeting")], 0.9, log.clone()),
    )
    .await
    .unwrap();

    let orchestrator = Orchestrator::new(user);
    let task_id = orchestrator
        .submit(
            "translate the text, then summarize it",
            vec!["translation".to_string(), "summarization".to_string()],
            serde_json::json!({"domain": "demo"}),
        )
        .await
        .unwrap();

    let report = wait_terminal(&orchestrator, &task_id).await;
    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.result.as_deref(), Some("a greeting"));
    assert_eq!(report.failed_subtask_index, None);

    let task = orchestrator.task_snapshot(&task_id).await.unwrap();
    assert_eq!(task.subtasks.len(), 2);
    assert!(task
        .subtasks
        .iter()
        .all(|s| s.status == SubTaskStatus::Voted));
    assert_eq!(task.subtasks[0].assignee.as_deref(), Some("translator"));
    assert_eq!(task.subtasks[1].assignee.as_deref(), Some("summarizer"));
    assert_eq!(task.subtasks[0].result.as_deref(), Some("hola mundo"));

    // The second subtask saw the first subtask's voted answer.
    assert_eq!(task.subtasks[1].previous_results.len(), 1);
    assert!(task.subtasks[1].previous_results[0].contains("hola mundo"));

    // No execution of subtask 2 started before subtask 1 was voted: every
    // invocation for subtask 1 precedes every invocation for subtask 2,
    // and subtask 2 always carried the threaded result.
    let log = log.lock().await;
    let first_id = &task.subtasks[0].subtask_id;
    let second_id = &task.subtasks[1].subtask_id;
    let last_first = log.iter().rposition(|(id, _)| id == first_id).unwrap();
    let first_second = log.iter().position(|(id, _)| id == second_id).unwrap();
    assert!(last_first < first_second);
    for (id, previous) in log.iter() {
        if id == second_id {
            assert!(!previous.is_empty());
        }
    }
}

#[tokio::test]
async fn test_winning_nodes_gain_reputation_on_the_requester() {
    let mesh = Mesh::new(test_config());
    let log = Arc::new(Mutex::new(Vec::new()));

    let user = mesh
        .register(
            "user",
            vec![],
            "addr-user",
            RecordingShim::new(&[], 0.5, log.clone()),
        )
        .await
        .unwrap();
    mesh.register(
        "solver",
        vec![CapabilityTag::new("calculus")],
        "addr-solver",
        RecordingShim::new(&[("calculus", "x = 4")], 0.9, log.clone()),
    )
    .await
    .unwrap();

    let orchestrator = Orchestrator::new(user.clone());
    let task_id = orchestrator
        .submit(
            "solve the integral",
            vec!["calculus".to_string()],
            serde_json::json!({}),
        )
        .await
        .unwrap();

    let report = wait_terminal(&orchestrator, &task_id).await;
    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.result.as_deref(), Some("x = 4"));

    // Both reasoning paths agreed, so the solver won the vote round and
    // its local reputation on the requester rose above the neutral start.
    assert!(user.reputation("solver").await > 0.5);
    let history = user.with_ledger(|l| l.history("solver").len()).await;
    assert_eq!(history, 1);
}

#[tokio::test]
async fn test_failure_reports_last_completed_subtask() {
    let mesh = Mesh::new(test_config());
    let log = Arc::new(Mutex::new(Vec::new()));

    let user = mesh
        .register(
            "user",
            vec![],
            "addr-user",
            RecordingShim::new(&[], 0.5, log.clone()),
        )
        .await
        .unwrap();
    // Only the first requirement has a capable node.
    mesh.register(
        "translator",
        vec![CapabilityTag::new("translation")],
        "addr-t",
        RecordingShim::new(&[("translation", "hola mundo")], 0.9, log.clone()),
    )
    .await
    .unwrap();

    let orchestrator = Orchestrator::new(user);
    let task_id = orchestrator
        .submit(
            "translate then paint",
            vec!["translation".to_string(), "oil-painting".to_string()],
            serde_json::json!({}),
        )
        .await
        .unwrap();

    let report = wait_terminal(&orchestrator, &task_id).await;
    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.failed_subtask_index, Some(1));
    assert!(report.result.is_none());

    // Diagnostics keep the completed prefix of the chain.
    let task = orchestrator.task_snapshot(&task_id).await.unwrap();
    assert_eq!(task.last_completed_index(), Some(0));
    assert_eq!(task.subtasks[0].result.as_deref(), Some("hola mundo"));
    assert_eq!(task.subtasks[1].status, SubTaskStatus::Failed);
}
