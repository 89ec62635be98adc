//! Capability registry and matching.
//!
//! Each node declares a set of capability tags with optional proficiency
//! weights. The matcher scores registries against task requirements using a
//! pluggable similarity function, so exact-match, lexical, and
//! embedding-style scoring are interchangeable behind one trait.

use serde::{Deserialize, Serialize};

use crate::config::{ScoreReduction, SimilarityKind};
use crate::reputation::ReputationLedger;
use crate::types::NodeId;

/// Score band within which reputation breaks ranking ties.
pub const SCORE_EPSILON: f32 = 0.01;

/// A declared skill tag with a proficiency weight.
///
/// Owned by exactly one node's registry; other nodes can read it from
/// beacon traffic but never mutate it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityTag {
    /// Normalized (lowercase) tag identifier, e.g. "mathematical-reasoning"
    pub tag: String,

    /// Proficiency from 0.0 to 1.0; scales the match score for this tag
    pub weight: f32,
}

impl CapabilityTag {
    /// Create a tag with full proficiency.
    pub fn new(tag: impl Into<String>) -> Self {
        Self::weighted(tag, 1.0)
    }

    /// Create a tag with an explicit proficiency weight.
    pub fn weighted(tag: impl Into<String>, weight: f32) -> Self {
        Self {
            tag: tag.into().trim().to_lowercase(),
            weight: weight.clamp(0.0, 1.0),
        }
    }
}

/// Similarity between a requirement string and a capability tag.
///
/// Implementations must be pure: same inputs, same score.
pub trait SimilarityFn: Send + Sync {
    /// Score the overlap of two normalized strings in [0, 1].
    fn similarity(&self, requirement: &str, tag: &str) -> f32;
}

/// Exact string equality.
#[derive(Debug, Default)]
pub struct ExactSimilarity;

impl SimilarityFn for ExactSimilarity {
    fn similarity(&self, requirement: &str, tag: &str) -> f32 {
        if requirement == tag {
            1.0
        } else {
            0.0
        }
    }
}

/// Character-bigram Sorensen-Dice overlap.
///
/// Catches partial matches like "calculus" against
/// "mathematical-reasoning-calculus" without any external model.
#[derive(Debug, Default)]
pub struct LexicalSimilarity;

impl SimilarityFn for LexicalSimilarity {
    fn similarity(&self, requirement: &str, tag: &str) -> f32 {
        lexical_similarity(requirement, tag)
    }
}

/// Bigram Dice ratio over two strings, in [0, 1].
pub fn lexical_similarity(a: &str, b: &str) -> f32 {
    if a == b {
        return 1.0;
    }
    let a_grams = bigrams(a);
    let b_grams = bigrams(b);
    if a_grams.is_empty() || b_grams.is_empty() {
        return 0.0;
    }

    let mut remaining = b_grams.clone();
    let mut shared = 0usize;
    for gram in &a_grams {
        if let Some(pos) = remaining.iter().position(|g| g == gram) {
            remaining.swap_remove(pos);
            shared += 1;
        }
    }

    (2.0 * shared as f32) / (a_grams.len() + b_grams.len()) as f32
}

fn bigrams(s: &str) -> Vec<[char; 2]> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| [w[0], w[1]]).collect()
}

/// Per-node store of declared capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRegistry {
    /// The node this registry belongs to
    pub node_id: NodeId,

    tags: Vec<CapabilityTag>,
}

impl CapabilityRegistry {
    /// Create a registry from initial tags. Tags are normalized to
    /// lowercase and deduplicated, keeping the first occurrence.
    pub fn new(node_id: impl Into<NodeId>, tags: Vec<CapabilityTag>) -> Self {
        let mut registry = Self {
            node_id: node_id.into(),
            tags: Vec::new(),
        };
        for tag in tags {
            registry.add_capability(tag);
        }
        registry
    }

    /// Add a capability if an equal tag is not already declared.
    pub fn add_capability(&mut self, tag: CapabilityTag) {
        if !self.tags.iter().any(|t| t.tag == tag.tag) {
            self.tags.push(tag);
        }
    }

    /// Remove a capability by tag identifier.
    pub fn remove_capability(&mut self, tag: &str) {
        let tag = tag.trim().to_lowercase();
        self.tags.retain(|t| t.tag != tag);
    }

    /// All declared tags.
    pub fn capabilities(&self) -> &[CapabilityTag] {
        &self.tags
    }

    /// Best weighted similarity of any declared tag against a requirement.
    pub fn match_requirement(&self, requirement: &str, similarity: &dyn SimilarityFn) -> f32 {
        let requirement = requirement.trim().to_lowercase();
        self.tags
            .iter()
            .map(|t| similarity.similarity(&requirement, &t.tag) * t.weight)
            .fold(0.0, f32::max)
    }
}

/// A node and its aggregate match score for a requirement set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredNode {
    pub node_id: NodeId,
    pub score: f32,
}

/// Scores capability registries against task requirements.
pub struct Matcher {
    similarity: Box<dyn SimilarityFn>,
    reduction: ScoreReduction,
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher")
            .field("reduction", &self.reduction)
            .finish_non_exhaustive()
    }
}

impl Matcher {
    /// Build a matcher with an explicit similarity function.
    pub fn new(similarity: Box<dyn SimilarityFn>, reduction: ScoreReduction) -> Self {
        Self {
            similarity,
            reduction,
        }
    }

    /// Build a matcher from configuration.
    pub fn from_kind(kind: SimilarityKind, reduction: ScoreReduction) -> Self {
        let similarity: Box<dyn SimilarityFn> = match kind {
            SimilarityKind::Exact => Box::new(ExactSimilarity),
            SimilarityKind::Lexical => Box::new(LexicalSimilarity),
        };
        Self::new(similarity, reduction)
    }

    /// Score a single requirement against a registry.
    pub fn score_requirement(&self, requirement: &str, registry: &CapabilityRegistry) -> f32 {
        registry.match_requirement(requirement, self.similarity.as_ref())
    }

    /// Aggregate score of a registry over a requirement set, using the
    /// configured reduction.
    pub fn score(&self, requirements: &[String], registry: &CapabilityRegistry) -> f32 {
        if requirements.is_empty() {
            return 1.0;
        }
        let scores = requirements
            .iter()
            .map(|r| self.score_requirement(r, registry));
        match self.reduction {
            ScoreReduction::Mean => scores.sum::<f32>() / requirements.len() as f32,
            ScoreReduction::Max => scores.fold(0.0, f32::max),
        }
    }

    /// All registries whose aggregate score exceeds `threshold`, ranked
    /// descending with reputation as tie-break inside the epsilon band.
    pub fn match_and_filter(
        &self,
        requirements: &[String],
        registries: &[&CapabilityRegistry],
        threshold: f32,
        ledger: &ReputationLedger,
    ) -> Vec<ScoredNode> {
        let mut scored: Vec<ScoredNode> = registries
            .iter()
            .map(|r| ScoredNode {
                node_id: r.node_id.clone(),
                score: self.score(requirements, r),
            })
            .filter(|s| s.score >= threshold)
            .collect();
        rank_by_score(&mut scored, ledger);
        scored
    }
}

/// Rank scored nodes descending; inside an epsilon-wide score band, higher
/// reputation wins, then the smaller node id for a fully deterministic
/// order.
///
/// Bands are fixed multiples of [`SCORE_EPSILON`], which keeps the ordering
/// transitive; scores that differ by less than epsilon but straddle a band
/// edge sort by band.
pub fn rank_by_score(nodes: &mut [ScoredNode], ledger: &ReputationLedger) {
    nodes.sort_by(|a, b| {
        let band_a = score_band(a.score);
        let band_b = score_band(b.score);
        band_b
            .cmp(&band_a)
            .then_with(|| {
                let rep_a = ledger.reputation(&a.node_id);
                let rep_b = ledger.reputation(&b.node_id);
                rep_b.partial_cmp(&rep_a).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
}

fn score_band(score: f32) -> i64 {
    (score / SCORE_EPSILON).floor() as i64
}
