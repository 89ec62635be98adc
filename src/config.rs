//! Configuration surface for the mesh engine.
//!
//! All knobs the core consumes live here: topology mode, discovery and
//! voting windows, matcher thresholds, reputation decay, and retry limits.
//! Values can be loaded from a TOML file, with file values overriding
//! defaults on a per-field basis.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::Result;

/// How beacons reach other nodes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Every beacon and relay reaches all reachable nodes at once
    GlobalBroadcast,
    /// Beacons travel hop by hop along configured neighbor links
    NeighborBroadcast,
}

/// Reduction applied when a match spans multiple requirement tags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScoreReduction {
    /// Average per-requirement score (default)
    Mean,
    /// Best single per-requirement score
    Max,
}

/// Similarity function used by the capability matcher.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityKind {
    /// Exact tag equality only
    Exact,
    /// Character-bigram lexical overlap (default)
    Lexical,
}

/// Configuration for a mesh node and the engines running on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Beacon propagation mode
    pub topology: Topology,

    /// How long the router collects beacon responses, in milliseconds
    pub response_window_ms: u64,

    /// How long the voter collects candidate results, in milliseconds
    pub voting_window_ms: u64,

    /// Initial hop budget for new beacons
    pub default_ttl: u32,

    /// Minimum aggregate score for a responder to be considered
    pub matcher_threshold: f32,

    /// Minimum local match score before a node answers a beacon
    pub response_threshold: f32,

    /// Similarity function for capability matching
    pub similarity: SimilarityKind,

    /// Reduction over multiple requirement tags
    pub reduction: ScoreReduction,

    /// Decay factor for the reputation moving average, in (0, 1]
    pub reputation_alpha: f32,

    /// Maximum routing retries per subtask after the initial attempt
    pub max_retries: u32,

    /// Parallel reasoning paths sampled per assignment
    pub cot_paths: usize,

    /// Ranking penalty per in-flight assignment on a candidate node
    pub busy_penalty: f32,

    /// Equivalence predicate for clustering answers: exact for short
    /// categorical answers, lexical for free text
    pub vote_equivalence: SimilarityKind,

    /// Similarity threshold for clustering free-text answers
    pub cluster_threshold: f32,

    /// Capacity of the recent-seen beacon dedup set
    pub recent_seen_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            topology: Topology::GlobalBroadcast,
            response_window_ms: 1_000,
            voting_window_ms: 5_000,
            default_ttl: 2,
            matcher_threshold: 0.3,
            response_threshold: 0.3,
            similarity: SimilarityKind::Lexical,
            reduction: ScoreReduction::Mean,
            reputation_alpha: 0.3,
            max_retries: 3,
            cot_paths: 3,
            busy_penalty: 0.1,
            vote_equivalence: SimilarityKind::Lexical,
            cluster_threshold: 0.85,
            recent_seen_capacity: 1_024,
        }
    }
}

impl MeshConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields fall back to their defaults. A missing file is an
    /// error; callers that want silent fallback use [`MeshConfig::load_or_default`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.as_ref().display()))?;
        let config: MeshConfig =
            toml::from_str(&raw).map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or fails to parse.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %path.as_ref().display(),
                    error = %e,
                    "Config not loaded, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Router response collection window.
    pub fn response_window(&self) -> Duration {
        Duration::from_millis(self.response_window_ms)
    }

    /// Voter candidate collection window.
    pub fn voting_window(&self) -> Duration {
        Duration::from_millis(self.voting_window_ms)
    }
}
