//! Chain-of-Thought voting over candidate answers.
//!
//! Candidates for one subtask are clustered by a configurable equivalence
//! predicate, each cluster is weighted by the sum of contributor reputation
//! times self-reported confidence, and the heaviest cluster wins. Ties
//! break deterministically so a replayed vote always picks the same winner.

use std::collections::HashMap;

use crate::capability::lexical_similarity;
use crate::reputation::{LedgerOutcome, DEFAULT_REPUTATION};
use crate::task::CandidateResult;
use crate::types::{MeshError, NodeId, Result};

/// Weight band within which clusters are considered tied.
const WEIGHT_EPSILON: f32 = 0.01;

/// Decides whether two candidate payloads are the same answer.
pub trait AnswerEquivalence: Send + Sync {
    fn equivalent(&self, a: &str, b: &str) -> bool;
}

/// Exact match after whitespace trimming; right for short categorical
/// answers.
#[derive(Debug, Default)]
pub struct ExactAnswer;

impl AnswerEquivalence for ExactAnswer {
    fn equivalent(&self, a: &str, b: &str) -> bool {
        a.trim() == b.trim()
    }
}

/// Similarity-threshold clustering for free-text answers.
#[derive(Debug)]
pub struct LexicalAnswer {
    pub threshold: f32,
}

impl LexicalAnswer {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }
}

impl AnswerEquivalence for LexicalAnswer {
    fn equivalent(&self, a: &str, b: &str) -> bool {
        lexical_similarity(&a.trim().to_lowercase(), &b.trim().to_lowercase()) >= self.threshold
    }
}

/// Outcome of one vote round.
#[derive(Debug, Clone)]
pub struct VoteResult {
    /// Representative candidate of the winning cluster
    pub winner: CandidateResult,

    /// Combined weight of the winning cluster
    pub winning_weight: f32,

    /// Number of distinct answer clusters observed
    pub cluster_count: usize,

    /// Per-node outcome, including `TimedOut` for expected contributors
    /// that never submitted
    pub outcomes: Vec<(NodeId, LedgerOutcome)>,
}

/// Aggregates candidate answers into one trusted result.
pub struct CotVoter {
    equivalence: Box<dyn AnswerEquivalence>,
}

impl std::fmt::Debug for CotVoter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CotVoter").finish_non_exhaustive()
    }
}

impl CotVoter {
    pub fn new(equivalence: Box<dyn AnswerEquivalence>) -> Self {
        Self { equivalence }
    }

    /// Lexical clustering with the given similarity threshold.
    pub fn lexical(threshold: f32) -> Self {
        Self::new(Box::new(LexicalAnswer::new(threshold)))
    }

    /// Exact-match clustering for categorical answers.
    pub fn exact() -> Self {
        Self::new(Box::new(ExactAnswer))
    }

    /// Cluster, weight, and pick the winning answer.
    ///
    /// `reputations` holds the requester's current view of contributor
    /// reputations; nodes absent from the map count at the neutral default.
    /// `expected` lists the nodes that were assigned work; any of them that
    /// submitted nothing is scored `TimedOut`.
    ///
    /// Fails with [`MeshError::VotingDeadlock`] when no cluster reaches
    /// positive weight — for example when every candidate carries zero
    /// confidence, or none arrived at all.
    pub fn vote(
        &self,
        candidates: &[CandidateResult],
        reputations: &HashMap<NodeId, f32>,
        expected: &[NodeId],
    ) -> Result<VoteResult> {
        if candidates.is_empty() {
            return Err(MeshError::VotingDeadlock(
                "no candidates submitted before the deadline".to_string(),
            ));
        }
        let subtask_id = candidates[0].subtask_id.clone();

        // Greedy clustering against each cluster's first member.
        let mut clusters: Vec<Vec<usize>> = Vec::new();
        for (i, candidate) in candidates.iter().enumerate() {
            let found = clusters.iter_mut().find(|members| {
                let representative = &candidates[members[0]];
                self.equivalence
                    .equivalent(&candidate.payload, &representative.payload)
            });
            match found {
                Some(members) => members.push(i),
                None => clusters.push(vec![i]),
            }
        }

        let reputation_of = |node_id: &str| -> f32 {
            reputations
                .get(node_id)
                .copied()
                .unwrap_or(DEFAULT_REPUTATION)
        };

        let weights: Vec<f32> = clusters
            .iter()
            .map(|members| {
                members
                    .iter()
                    .map(|&i| reputation_of(&candidates[i].node_id) * candidates[i].confidence)
                    .sum()
            })
            .collect();

        let best_weight = weights.iter().fold(0.0f32, |acc, &w| acc.max(w));
        if best_weight <= 0.0 {
            return Err(MeshError::VotingDeadlock(format!(
                "no cluster reached positive weight for subtask {subtask_id}"
            )));
        }

        // Clusters inside the epsilon band of the best weight are tied; the
        // tie breaks to the cluster holding the lexicographically smallest
        // contributor id, so replays are reproducible.
        let winner_cluster = clusters
            .iter()
            .zip(weights.iter())
            .filter(|(_, &w)| best_weight - w < WEIGHT_EPSILON)
            .min_by_key(|(members, _)| {
                members
                    .iter()
                    .map(|&i| candidates[i].node_id.as_str())
                    .min()
                    .unwrap_or("")
                    .to_string()
            })
            .map(|(members, _)| members.clone())
            .ok_or_else(|| {
                MeshError::VotingDeadlock(format!(
                    "no winning cluster for subtask {subtask_id}"
                ))
            })?;

        // Representative payload: highest single confidence, node id as the
        // deterministic fallback.
        let winner_index = winner_cluster
            .iter()
            .copied()
            .min_by(|&a, &b| {
                candidates[b]
                    .confidence
                    .partial_cmp(&candidates[a].confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| candidates[a].node_id.cmp(&candidates[b].node_id))
            })
            .ok_or_else(|| {
                MeshError::VotingDeadlock(format!(
                    "empty winning cluster for subtask {subtask_id}"
                ))
            })?;

        let mut outcomes: Vec<(NodeId, LedgerOutcome)> = Vec::new();
        let mut seen_nodes: Vec<&str> = Vec::new();
        for candidate in candidates {
            if seen_nodes.contains(&candidate.node_id.as_str()) {
                continue;
            }
            seen_nodes.push(&candidate.node_id);
            let won = winner_cluster
                .iter()
                .any(|&i| candidates[i].node_id == candidate.node_id);
            let outcome = if won {
                LedgerOutcome::Won
            } else {
                LedgerOutcome::Lost
            };
            outcomes.push((candidate.node_id.clone(), outcome));
        }
        for node_id in expected {
            if !seen_nodes.contains(&node_id.as_str()) {
                outcomes.push((node_id.clone(), LedgerOutcome::TimedOut));
            }
        }

        let winning_weight = winner_cluster
            .iter()
            .map(|&i| reputation_of(&candidates[i].node_id) * candidates[i].confidence)
            .sum();

        tracing::info!(
            subtask_id = %subtask_id,
            clusters = clusters.len(),
            winning_weight,
            winner = %candidates[winner_index].node_id,
            "Vote resolved"
        );

        Ok(VoteResult {
            winner: candidates[winner_index].clone(),
            winning_weight,
            cluster_count: clusters.len(),
            outcomes,
        })
    }
}
