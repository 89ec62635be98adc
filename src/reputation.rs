//! Append-only outcome ledger and derived reputation.
//!
//! Every vote round appends one entry per participating node. Reputation is
//! never stored as authoritative state: it is recomputed on demand from the
//! entry history with an exponentially-weighted moving average, so recent
//! behavior dominates and old misbehavior fades. The ledger is local to one
//! node and authoritative only for routing decisions that node makes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{MeshError, NodeId, Result, SubTaskId, TaskId};

/// Reputation assigned to a node with no history.
///
/// Neutral rather than zero, so unknown nodes are not locked out of
/// routing before they get a chance to participate.
pub const DEFAULT_REPUTATION: f32 = 0.5;

/// Outcome of one node's participation in one vote round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    /// Contributed to the winning answer cluster
    Won,
    /// Submitted an answer outside the winning cluster
    Lost,
    /// Was expected to submit but missed the voting deadline
    TimedOut,
}

impl LedgerOutcome {
    /// Numeric value folded into the reputation average.
    pub fn value(&self) -> f32 {
        match self {
            LedgerOutcome::Won => 1.0,
            LedgerOutcome::Lost | LedgerOutcome::TimedOut => 0.0,
        }
    }
}

/// One immutable record of a node's participation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub node_id: NodeId,
    pub task_id: TaskId,
    pub subtask_id: SubTaskId,
    pub outcome: LedgerOutcome,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create an entry stamped with the current time.
    pub fn new(
        node_id: impl Into<NodeId>,
        task_id: impl Into<TaskId>,
        subtask_id: impl Into<SubTaskId>,
        outcome: LedgerOutcome,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            task_id: task_id.into(),
            subtask_id: subtask_id.into(),
            outcome,
            timestamp: Utc::now(),
        }
    }

    /// Required-field validation. Entries that fail are dropped by the
    /// ledger rather than crashing anything: reputation is a derived value,
    /// and a missing entry only biases precision.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(MeshError::LedgerCorruption("empty node_id".to_string()));
        }
        if self.task_id.trim().is_empty() {
            return Err(MeshError::LedgerCorruption("empty task_id".to_string()));
        }
        if self.subtask_id.trim().is_empty() {
            return Err(MeshError::LedgerCorruption("empty subtask_id".to_string()));
        }
        Ok(())
    }
}

/// Append-only per-node history of vote outcomes.
#[derive(Debug, Clone)]
pub struct ReputationLedger {
    entries: Vec<LedgerEntry>,
    by_node: HashMap<NodeId, Vec<usize>>,
    alpha: f32,
}

impl Default for ReputationLedger {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl ReputationLedger {
    /// Create a ledger with the given decay factor, clamped to (0, 1].
    pub fn new(alpha: f32) -> Self {
        Self {
            entries: Vec::new(),
            by_node: HashMap::new(),
            alpha: alpha.clamp(f32::EPSILON, 1.0),
        }
    }

    /// Append an entry. Invalid entries are rejected with
    /// [`MeshError::LedgerCorruption`] and leave the log untouched.
    pub fn record(&mut self, entry: LedgerEntry) -> Result<()> {
        entry.validate()?;
        let index = self.entries.len();
        self.by_node
            .entry(entry.node_id.clone())
            .or_default()
            .push(index);
        self.entries.push(entry);
        Ok(())
    }

    /// Append a batch of entries, dropping and logging any that fail
    /// validation instead of aborting the batch.
    pub fn record_all(&mut self, entries: Vec<LedgerEntry>) -> usize {
        let mut recorded = 0;
        for entry in entries {
            match self.record(entry) {
                Ok(()) => recorded += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping invalid ledger entry");
                }
            }
        }
        recorded
    }

    /// Current reputation of a node, recomputed from its full history.
    ///
    /// Pure function of the entry log: `score = alpha * outcome +
    /// (1 - alpha) * score` folded in append order, seeded with the
    /// neutral default.
    pub fn reputation(&self, node_id: &str) -> f32 {
        match self.by_node.get(node_id) {
            Some(indices) => indices.iter().fold(DEFAULT_REPUTATION, |score, &i| {
                self.alpha * self.entries[i].outcome.value() + (1.0 - self.alpha) * score
            }),
            None => DEFAULT_REPUTATION,
        }
    }

    /// Current reputation for every node with at least one entry.
    pub fn reputations(&self) -> HashMap<NodeId, f32> {
        self.by_node
            .keys()
            .map(|node_id| (node_id.clone(), self.reputation(node_id)))
            .collect()
    }

    /// Full participation history of one node, in append order.
    pub fn history(&self, node_id: &str) -> Vec<&LedgerEntry> {
        self.by_node
            .get(node_id)
            .map(|indices| indices.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }

    /// Total number of entries across all nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(node: &str, outcome: LedgerOutcome) -> LedgerEntry {
        LedgerEntry::new(node, "task-1", "sub-1", outcome)
    }

    #[test]
    fn test_unknown_node_is_neutral() {
        let ledger = ReputationLedger::default();
        assert_eq!(ledger.reputation("stranger"), DEFAULT_REPUTATION);
    }

    #[test]
    fn test_ewma_recency_dominates() {
        let mut ledger = ReputationLedger::new(0.3);
        // Old wins, then a streak of losses
        for _ in 0..5 {
            ledger.record(entry("a", LedgerOutcome::Won)).unwrap();
        }
        let after_wins = ledger.reputation("a");
        for _ in 0..5 {
            ledger.record(entry("a", LedgerOutcome::Lost)).unwrap();
        }
        let after_losses = ledger.reputation("a");

        assert!(after_wins > DEFAULT_REPUTATION);
        assert!(after_losses < after_wins);
        assert!(after_losses < DEFAULT_REPUTATION);
    }

    #[test]
    fn test_reputation_is_pure_function_of_history() {
        let mut first = ReputationLedger::new(0.4);
        let mut second = ReputationLedger::new(0.4);
        let outcomes = [
            LedgerOutcome::Won,
            LedgerOutcome::Lost,
            LedgerOutcome::Won,
            LedgerOutcome::TimedOut,
            LedgerOutcome::Won,
        ];
        for outcome in outcomes {
            first.record(entry("a", outcome)).unwrap();
            second.record(entry("a", outcome)).unwrap();
        }
        assert_eq!(first.reputation("a"), second.reputation("a"));
        // Repeated reads do not drift
        assert_eq!(first.reputation("a"), first.reputation("a"));
    }

    #[test]
    fn test_timed_out_penalizes_like_loss() {
        let mut lost = ReputationLedger::new(0.3);
        let mut timed_out = ReputationLedger::new(0.3);
        lost.record(entry("a", LedgerOutcome::Lost)).unwrap();
        timed_out.record(entry("a", LedgerOutcome::TimedOut)).unwrap();
        assert_eq!(lost.reputation("a"), timed_out.reputation("a"));
    }

    #[test]
    fn test_invalid_entry_dropped() {
        let mut ledger = ReputationLedger::default();
        let bad = LedgerEntry::new("", "task-1", "sub-1", LedgerOutcome::Won);
        assert!(matches!(
            ledger.record(bad),
            Err(MeshError::LedgerCorruption(_))
        ));
        assert!(ledger.is_empty());

        let recorded = ledger.record_all(vec![
            entry("a", LedgerOutcome::Won),
            LedgerEntry::new("b", "", "sub-1", LedgerOutcome::Lost),
        ]);
        assert_eq!(recorded, 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_history_preserves_append_order() {
        let mut ledger = ReputationLedger::default();
        ledger.record(entry("a", LedgerOutcome::Won)).unwrap();
        ledger.record(entry("b", LedgerOutcome::Lost)).unwrap();
        ledger.record(entry("a", LedgerOutcome::Lost)).unwrap();

        let history = ledger.history("a");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].outcome, LedgerOutcome::Won);
        assert_eq!(history[1].outcome, LedgerOutcome::Lost);
        assert_eq!(ledger.len(), 3);
    }
}
