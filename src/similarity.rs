//! Pure vector similarity primitives.
//!
//! Everything here is synchronous math over `f64` embedding vectors: no I/O,
//! no state. The fallback responder uses these functions to compute degraded
//! answers, and the selector reuses [`weighted_similarity`] as a scoring
//! primitive.

use crate::error::SimilarityError;

/// A scored target from [`batch_similarity`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTarget {
    /// Index into the original target slice.
    pub index: usize,
    /// Raw cosine similarity in [-1, 1].
    pub score: f64,
    /// Min-max normalized score in [0, 1], if normalization was requested.
    pub normalized: Option<f64>,
    /// 1-based rank, descending by effective score.
    pub rank: usize,
}

/// Options for [`batch_similarity`].
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Drop targets scoring below this raw similarity.
    pub min_score: Option<f64>,
    /// Min-max normalize surviving scores into [0, 1].
    pub normalize: bool,
    /// Keep at most this many results after ranking.
    pub top_k: Option<usize>,
}

/// Cosine similarity between two equal-length vectors, clamped to [-1, 1] to
/// absorb floating-point drift.
///
/// Returns 0.0 when either vector has zero magnitude rather than dividing by
/// zero. Fails on empty or mismatched inputs.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Result<f64, SimilarityError> {
    if a.is_empty() || b.is_empty() {
        return Err(SimilarityError::EmptyInput);
    }
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0))
}

/// Score `source` against each target, skipping malformed targets (empty or
/// wrong dimension) instead of failing the whole batch.
///
/// Surviving scores are optionally threshold-filtered, min-max normalized and
/// capped; results come back ranked 1-based in descending score order. An
/// empty result is not an error.
pub fn batch_similarity(
    source: &[f64],
    targets: &[Vec<f64>],
    opts: &BatchOptions,
) -> Result<Vec<ScoredTarget>, SimilarityError> {
    if source.is_empty() {
        return Err(SimilarityError::EmptyInput);
    }

    let mut scored: Vec<(usize, f64)> = Vec::with_capacity(targets.len());
    for (index, target) in targets.iter().enumerate() {
        if target.len() != source.len() {
            tracing::debug!(index, "skipping malformed embedding target");
            continue;
        }
        let score = cosine_similarity(source, target)?;
        if let Some(min) = opts.min_score {
            if score < min {
                continue;
            }
        }
        scored.push((index, score));
    }

    if scored.is_empty() {
        return Ok(Vec::new());
    }

    // Min-max normalization over the survivors. A constant batch maps to 1.0.
    let normalized: Vec<Option<f64>> = if opts.normalize {
        let min = scored.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
        let max = scored
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::NEG_INFINITY, f64::max);
        scored
            .iter()
            .map(|(_, s)| {
                if (max - min).abs() < f64::EPSILON {
                    Some(1.0)
                } else {
                    Some((s - min) / (max - min))
                }
            })
            .collect()
    } else {
        vec![None; scored.len()]
    };

    let mut results: Vec<ScoredTarget> = scored
        .into_iter()
        .zip(normalized)
        .map(|((index, score), normalized)| ScoredTarget {
            index,
            score,
            normalized,
            rank: 0,
        })
        .collect();

    results.sort_by(|a, b| {
        let ka = a.normalized.unwrap_or(a.score);
        let kb = b.normalized.unwrap_or(b.score);
        kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
    });
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = i + 1;
    }

    if let Some(k) = opts.top_k {
        results.truncate(k);
    }

    Ok(results)
}

/// Symmetric n×n similarity matrix with the diagonal forced to 1.0.
pub fn pairwise_similarity_matrix(
    embeddings: &[Vec<f64>],
) -> Result<Vec<Vec<f64>>, SimilarityError> {
    if embeddings.is_empty() {
        return Err(SimilarityError::EmptyInput);
    }

    let n = embeddings.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        matrix[i][i] = 1.0;
        for j in (i + 1)..n {
            let sim = cosine_similarity(&embeddings[i], &embeddings[j])?;
            matrix[i][j] = sim;
            matrix[j][i] = sim;
        }
    }
    Ok(matrix)
}

/// Diversity of a set of embeddings: `1 − mean(off-diagonal similarity)`,
/// floored at 0. Zero or one embeddings are maximally diverse by convention.
pub fn diversity_score(embeddings: &[Vec<f64>]) -> Result<f64, SimilarityError> {
    if embeddings.len() <= 1 {
        return Ok(1.0);
    }

    let matrix = pairwise_similarity_matrix(embeddings)?;
    let n = matrix.len();
    let mut sum = 0.0;
    for (i, row) in matrix.iter().enumerate() {
        for (j, sim) in row.iter().enumerate() {
            if i != j {
                sum += sim;
            }
        }
    }
    let mean = sum / (n * (n - 1)) as f64;
    Ok((1.0 - mean).max(0.0))
}

/// Combine per-channel scores under weights normalized to sum to 1.
///
/// Empty input combines to 0.0.
pub fn weighted_similarity(scores: &[f64], weights: &[f64]) -> Result<f64, SimilarityError> {
    if scores.len() != weights.len() {
        return Err(SimilarityError::LengthMismatch {
            scores: scores.len(),
            weights: weights.len(),
        });
    }
    if scores.is_empty() {
        return Ok(0.0);
    }

    let total: f64 = weights.iter().sum();
    if total == 0.0 {
        return Err(SimilarityError::ZeroWeightSum);
    }

    Ok(scores
        .iter()
        .zip(weights.iter())
        .map(|(s, w)| s * (w / total))
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_similarity_is_one() {
        let v = vec![0.3, -1.2, 4.5, 0.01];
        let sim = cosine_similarity(&v, &v).unwrap();
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn orthogonal_vectors_are_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let sim = cosine_similarity(&a, &b).unwrap();
        assert!(sim.abs() < 1e-9);
    }

    #[test]
    fn cosine_is_symmetric() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![-0.5, 0.25, 4.0];
        assert_eq!(
            cosine_similarity(&a, &b).unwrap(),
            cosine_similarity(&b, &a).unwrap()
        );
    }

    #[test]
    fn zero_magnitude_yields_zero_not_error() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 2.0];
        assert_eq!(cosine_similarity(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0, 2.0, 3.0];
        assert_eq!(
            cosine_similarity(&a, &b),
            Err(SimilarityError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn empty_input_rejected() {
        assert_eq!(
            cosine_similarity(&[], &[1.0]),
            Err(SimilarityError::EmptyInput)
        );
    }

    #[test]
    fn batch_skips_malformed_targets() {
        let source = vec![1.0, 0.0];
        let targets = vec![
            vec![1.0, 0.0],
            vec![1.0, 0.0, 0.0], // wrong dimension, skipped
            vec![],              // empty, skipped
            vec![0.0, 1.0],
        ];
        let results = batch_similarity(&source, &targets, &BatchOptions::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index, 0);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[1].index, 3);
        assert_eq!(results[1].rank, 2);
    }

    #[test]
    fn batch_threshold_and_cap() {
        let source = vec![1.0, 0.0];
        let targets = vec![
            vec![1.0, 0.0],
            vec![0.9, 0.1],
            vec![-1.0, 0.0],
            vec![0.5, 0.5],
        ];
        let opts = BatchOptions {
            min_score: Some(0.0),
            normalize: true,
            top_k: Some(2),
        };
        let results = batch_similarity(&source, &targets, &opts).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index, 0);
        assert_eq!(results[0].normalized, Some(1.0));
        assert!(results.iter().all(|r| r.score >= 0.0));
    }

    #[test]
    fn batch_with_no_survivors_is_empty_not_error() {
        let source = vec![1.0, 0.0];
        let targets = vec![vec![-1.0, 0.0]];
        let opts = BatchOptions {
            min_score: Some(0.5),
            ..Default::default()
        };
        let results = batch_similarity(&source, &targets, &opts).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn matrix_diagonal_and_symmetry() {
        let embeddings = vec![vec![1.0, 0.0], vec![0.5, 0.5], vec![0.0, 1.0]];
        let matrix = pairwise_similarity_matrix(&embeddings).unwrap();
        for i in 0..3 {
            assert_eq!(matrix[i][i], 1.0);
            for j in 0..3 {
                assert_eq!(matrix[i][j], matrix[j][i]);
            }
        }
    }

    #[test]
    fn matrix_rejects_empty() {
        assert_eq!(
            pairwise_similarity_matrix(&[]),
            Err(SimilarityError::EmptyInput)
        );
    }

    #[test]
    fn diversity_conventions() {
        assert_eq!(diversity_score(&[]).unwrap(), 1.0);
        assert_eq!(diversity_score(&[vec![1.0, 0.0]]).unwrap(), 1.0);

        // Identical vectors have zero diversity.
        let same = vec![vec![1.0, 0.0], vec![1.0, 0.0]];
        assert!(diversity_score(&same).unwrap().abs() < 1e-9);

        // Orthogonal vectors are maximally diverse.
        let orth = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert!((diversity_score(&orth).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weighted_similarity_normalizes_weights() {
        let combined = weighted_similarity(&[1.0, 0.0], &[3.0, 1.0]).unwrap();
        assert!((combined - 0.75).abs() < 1e-9);
    }

    #[test]
    fn weighted_similarity_edge_cases() {
        assert_eq!(weighted_similarity(&[], &[]).unwrap(), 0.0);
        assert_eq!(
            weighted_similarity(&[1.0], &[1.0, 2.0]),
            Err(SimilarityError::LengthMismatch {
                scores: 1,
                weights: 2
            })
        );
        assert_eq!(
            weighted_similarity(&[1.0, 2.0], &[0.0, 0.0]),
            Err(SimilarityError::ZeroWeightSum)
        );
    }
}
