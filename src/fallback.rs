//! Fallback responder - deterministic, non-AI answers.
//!
//! When no backend can serve a request (budget exhausted, all circuits open,
//! repeated failures) the gateway still answers: candidates from a locally
//! available pool are ranked by similarity between the caller's attribute
//! embeddings and theirs. The result is explicitly marked as degraded and
//! names the method used, so downstream consumers can tell it apart from a
//! model-generated answer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::similarity::{batch_similarity, weighted_similarity, BatchOptions};

/// Method marker attached to every fallback result.
pub const FALLBACK_METHOD: &str = "similarity-matching";

/// Default number of recommendations returned.
const DEFAULT_LIMIT: usize = 5;

/// Attribute embeddings describing the caller, e.g. channels "skills" and
/// "interests", each an embedding vector. Channel weights default to 1.0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallerProfile {
    pub attributes: HashMap<String, Vec<f64>>,
    #[serde(default)]
    pub weights: HashMap<String, f64>,
}

/// A scoreable entity from the local candidate pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackCandidate {
    pub id: String,
    pub label: String,
    pub attributes: HashMap<String, Vec<f64>>,
}

/// One ranked recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub candidate_id: String,
    pub label: String,
    /// Combined similarity mapped from [-1, 1] into [0, 1].
    pub score: f64,
    pub rank: usize,
}

/// Degraded answer computed without any backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackResult {
    pub recommendations: Vec<Recommendation>,
    pub explanation: String,
    /// Always true; fallback answers are degraded by definition.
    pub degraded: bool,
    pub method: String,
}

/// Computes ranked recommendations over a local candidate pool.
pub struct FallbackResponder {
    limit: usize,
}

impl FallbackResponder {
    pub fn new() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self { limit }
    }

    /// Rank `pool` against `profile`. Never fails: an empty pool or a profile
    /// with no usable attribute channels yields an explicit empty result.
    pub fn respond(&self, profile: &CallerProfile, pool: &[FallbackCandidate]) -> FallbackResult {
        if pool.is_empty() {
            return FallbackResult {
                recommendations: Vec::new(),
                explanation: "no candidates available".to_string(),
                degraded: true,
                method: FALLBACK_METHOD.to_string(),
            };
        }

        let mut combined: Vec<(usize, f64)> = Vec::with_capacity(pool.len());
        for (index, candidate) in pool.iter().enumerate() {
            if let Some(score) = self.candidate_score(profile, candidate) {
                combined.push((index, score));
            }
        }

        if combined.is_empty() {
            return FallbackResult {
                recommendations: Vec::new(),
                explanation:
                    "no candidate shares a comparable attribute channel with the caller".to_string(),
                degraded: true,
                method: FALLBACK_METHOD.to_string(),
            };
        }

        combined.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        combined.truncate(self.limit);

        let recommendations: Vec<Recommendation> = combined
            .into_iter()
            .enumerate()
            .map(|(rank, (index, score))| Recommendation {
                candidate_id: pool[index].id.clone(),
                label: pool[index].label.clone(),
                // Cosine in [-1, 1] mapped into [0, 1].
                score: (score + 1.0) / 2.0,
                rank: rank + 1,
            })
            .collect();

        let explanation = format!(
            "ranked {} of {} local candidates by weighted attribute similarity",
            recommendations.len(),
            pool.len()
        );
        tracing::warn!(
            candidates = pool.len(),
            returned = recommendations.len(),
            "answered via degraded similarity fallback"
        );

        FallbackResult {
            recommendations,
            explanation,
            degraded: true,
            method: FALLBACK_METHOD.to_string(),
        }
    }

    /// Weighted similarity across the attribute channels both sides share.
    /// Malformed channels (dimension mismatch, empty vectors) are skipped;
    /// a candidate with no comparable channel scores `None`.
    fn candidate_score(
        &self,
        profile: &CallerProfile,
        candidate: &FallbackCandidate,
    ) -> Option<f64> {
        let mut scores = Vec::new();
        let mut weights = Vec::new();

        // Channel order must be deterministic for ranking stability.
        let mut channels: Vec<&String> = profile.attributes.keys().collect();
        channels.sort();

        for channel in channels {
            let caller_vec = &profile.attributes[channel];
            let Some(candidate_vec) = candidate.attributes.get(channel) else {
                continue;
            };
            let targets = std::slice::from_ref(candidate_vec);
            let Ok(batch) = batch_similarity(caller_vec, targets, &BatchOptions::default()) else {
                continue;
            };
            let Some(scored) = batch.first() else {
                continue; // malformed channel, skipped by batch_similarity
            };
            scores.push(scored.score);
            weights.push(profile.weights.get(channel).copied().unwrap_or(1.0));
        }

        weighted_similarity(&scores, &weights).ok().filter(|_| !scores.is_empty())
    }
}

impl Default for FallbackResponder {
    fn default() -> Self {
        Self::new()
    }
}
