//! Distance metrics between embeddings of the same model variant.

use crate::error::{FaceError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - (a·b) / (|a| |b|)`
    Cosine,
    /// `sqrt(sum((a_i - b_i)^2))`
    Euclidean,
    /// Euclidean distance after L2-normalizing both vectors.
    EuclideanL2,
}

impl DistanceMetric {
    pub const ALL: [DistanceMetric; 3] = [
        DistanceMetric::Cosine,
        DistanceMetric::Euclidean,
        DistanceMetric::EuclideanL2,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean_l2",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = FaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "euclidean_l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(FaceError::UnsupportedConfiguration(format!(
                "unknown distance metric '{other}'"
            ))),
        }
    }
}

/// Compute the distance between two vectors.
///
/// Fails with [`FaceError::IncompatibleEmbedding`] on a length mismatch and
/// with [`FaceError::IndeterminateDistance`] when a metric would divide by a
/// zero norm. The result is not clamped.
pub fn distance(a: &[f32], b: &[f32], metric: DistanceMetric) -> Result<f32> {
    if a.len() != b.len() {
        return Err(FaceError::IncompatibleEmbedding(format!(
            "embedding lengths differ ({} vs {})",
            a.len(),
            b.len()
        )));
    }

    match metric {
        DistanceMetric::Cosine => cosine_distance(a, b),
        DistanceMetric::Euclidean => Ok(euclidean_distance(a, b)),
        DistanceMetric::EuclideanL2 => {
            let a = l2_normalize(a)?;
            let b = l2_normalize(b)?;
            Ok(euclidean_distance(&a, &b))
        }
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return Err(FaceError::IndeterminateDistance(
            "cosine distance of a zero vector".into(),
        ));
    }
    Ok(1.0 - dot / denom)
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Return a unit-length copy of `v`.
pub fn l2_normalize(v: &[f32]) -> Result<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return Err(FaceError::IndeterminateDistance(
            "cannot L2-normalize a zero vector".into(),
        ));
    }
    Ok(v.iter().map(|x| x / norm).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_cosine_identical() {
        let a = [1.0, 2.0, 3.0];
        assert!(distance(&a, &a, DistanceMetric::Cosine).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        let d = distance(&[1.0, 0.0], &[0.0, 1.0], DistanceMetric::Cosine).unwrap();
        assert!((d - 1.0).abs() < 1e-6);
        let d = distance(&[1.0, 0.0], &[-1.0, 0.0], DistanceMetric::Cosine).unwrap();
        assert!((d - 2.0).abs() < 1e-6, "no clamping: {d}");
    }

    #[test]
    fn test_euclidean() {
        let d = distance(&[0.0, 0.0], &[3.0, 4.0], DistanceMetric::Euclidean).unwrap();
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_l2_ignores_magnitude() {
        let d = distance(&[3.0, 4.0], &[30.0, 40.0], DistanceMetric::EuclideanL2).unwrap();
        assert!(d.abs() < 1e-6);
        let d = distance(&[1.0, 0.0], &[0.0, 1.0], DistanceMetric::EuclideanL2).unwrap();
        assert!((d - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test_case(DistanceMetric::Cosine)]
    #[test_case(DistanceMetric::Euclidean)]
    #[test_case(DistanceMetric::EuclideanL2)]
    fn test_length_mismatch_never_truncates(metric: DistanceMetric) {
        let err = distance(&[1.0, 2.0, 3.0], &[1.0, 2.0], metric).unwrap_err();
        assert!(matches!(err, FaceError::IncompatibleEmbedding(_)));
    }

    #[test_case(DistanceMetric::Cosine)]
    #[test_case(DistanceMetric::Euclidean)]
    #[test_case(DistanceMetric::EuclideanL2)]
    fn test_symmetry_and_self_distance(metric: DistanceMetric) {
        let a = [0.3, -1.2, 4.0, 0.01];
        let b = [-2.0, 0.5, 1.5, 3.3];
        let ab = distance(&a, &b, metric).unwrap();
        let ba = distance(&b, &a, metric).unwrap();
        assert!((ab - ba).abs() < 1e-6);
        assert!(distance(&a, &a, metric).unwrap().abs() < 1e-5);
    }

    #[test]
    fn test_zero_vector_is_indeterminate() {
        let err = distance(&[0.0, 0.0], &[1.0, 0.0], DistanceMetric::Cosine).unwrap_err();
        assert!(matches!(err, FaceError::IndeterminateDistance(_)));
        let err = distance(&[0.0, 0.0], &[1.0, 0.0], DistanceMetric::EuclideanL2).unwrap_err();
        assert!(matches!(err, FaceError::IndeterminateDistance(_)));
        // Plain euclidean is well defined for zero vectors.
        assert_eq!(distance(&[0.0, 0.0], &[0.0, 0.0], DistanceMetric::Euclidean).unwrap(), 0.0);
    }

    #[test_case("cosine", DistanceMetric::Cosine)]
    #[test_case("euclidean", DistanceMetric::Euclidean)]
    #[test_case("euclidean_l2", DistanceMetric::EuclideanL2)]
    #[test_case("Euclidean-L2", DistanceMetric::EuclideanL2)]
    fn test_parse(input: &str, expected: DistanceMetric) {
        assert_eq!(input.parse::<DistanceMetric>().unwrap(), expected);
    }
}
