//! Execution shim contract.
//!
//! The inference engine that actually produces an answer is an external
//! collaborator. The core only defines the contract: given a subtask, the
//! results of its predecessors, and a deadline, produce one candidate
//! answer with a self-reported confidence, or fail. Implementations must
//! tolerate parallel invocation for the same subtask with no shared
//! mutable state between invocations.

use async_trait::async_trait;
use std::time::Duration;

use crate::task::{CandidateResult, SubTask};
use crate::types::Result;

/// Contract between the routing core and an answer-producing engine.
#[async_trait]
pub trait ExecutionShim: Send + Sync {
    /// Produce one candidate answer for `subtask`.
    ///
    /// `previous_results` holds the winning answers of the subtask's
    /// predecessors in dependency order. Implementations should give up
    /// with [`crate::MeshError::ExecutionTimeout`] once `deadline` has
    /// elapsed; the caller enforces its own outer deadline regardless.
    async fn execute(
        &self,
        subtask: &SubTask,
        previous_results: &[String],
        deadline: Duration,
    ) -> Result<CandidateResult>;
}

/// Trivial shim that answers with the subtask description.
///
/// Stands in for a real engine in tests and examples, the way a node runs
/// in test mode without a loaded model.
#[derive(Debug, Default)]
pub struct EchoShim {
    /// Confidence reported with every answer
    pub confidence: f32,
}

impl EchoShim {
    pub fn new(confidence: f32) -> Self {
        Self {
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl ExecutionShim for EchoShim {
    async fn execute(
        &self,
        subtask: &SubTask,
        previous_results: &[String],
        _deadline: Duration,
    ) -> Result<CandidateResult> {
        let payload = if previous_results.is_empty() {
            format!("echo: {}", subtask.description)
        } else {
            format!(
                "echo: {} (given {} prior results)",
                subtask.description,
                previous_results.len()
            )
        };
        Ok(CandidateResult::new(
            subtask.subtask_id.clone(),
            subtask
                .assignee
                .clone()
                .unwrap_or_else(|| "unassigned".to_string()),
            payload,
            self.confidence,
        ))
    }
}
