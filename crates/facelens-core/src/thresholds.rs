//! Per-(model, metric) verification thresholds and the decision rule.
//!
//! The built-in table is embedded at compile time from `thresholds.toml`
//! and parsed once. A replacement table can be loaded from any TOML
//! string with the same shape.

use crate::distance::DistanceMetric;
use crate::embedder::EmbeddingModel;
use crate::error::{FaceError, Result};
use crate::types::VerificationResult;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const BUILTIN_THRESHOLDS: &str = include_str!("thresholds.toml");

static BUILTIN: OnceLock<ThresholdTable> = OnceLock::new();

/// Declarative mapping from (model, metric) to a distance threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ThresholdTable {
    entries: BTreeMap<EmbeddingModel, BTreeMap<DistanceMetric, f32>>,
}

impl ThresholdTable {
    /// The table shipped with the crate.
    pub fn builtin() -> &'static ThresholdTable {
        BUILTIN.get_or_init(|| match Self::from_toml_str(BUILTIN_THRESHOLDS) {
            Ok(table) => table,
            Err(e) => {
                tracing::error!(error = %e, "embedded threshold table is malformed");
                ThresholdTable {
                    entries: BTreeMap::new(),
                }
            }
        })
    }

    /// Parse a table of `[model]` sections holding `metric = threshold` keys.
    ///
    /// Unknown model or metric names are rejected rather than ignored.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let raw: BTreeMap<String, BTreeMap<String, f32>> = toml::from_str(src)
            .map_err(|e| FaceError::UnsupportedConfiguration(format!("bad threshold table: {e}")))?;

        let mut entries = BTreeMap::new();
        for (model, metrics) in raw {
            let model: EmbeddingModel = model.parse()?;
            let row: &mut BTreeMap<DistanceMetric, f32> = entries.entry(model).or_default();
            for (metric, threshold) in metrics {
                if !threshold.is_finite() {
                    return Err(FaceError::UnsupportedConfiguration(format!(
                        "threshold for {model}/{metric} is not finite"
                    )));
                }
                row.insert(metric.parse()?, threshold);
            }
        }
        Ok(Self { entries })
    }

    pub fn threshold(&self, model: EmbeddingModel, metric: DistanceMetric) -> Result<f32> {
        self.entries
            .get(&model)
            .and_then(|row| row.get(&metric))
            .copied()
            .ok_or_else(|| {
                FaceError::UnsupportedConfiguration(format!("no threshold for model {model} with metric {metric}"))
            })
    }

    /// `verified = distance <= threshold`.
    pub fn verify(&self, distance: f32, model: EmbeddingModel, metric: DistanceMetric) -> Result<VerificationResult> {
        let threshold = self.threshold(model, metric)?;
        Ok(VerificationResult {
            verified: distance <= threshold,
            distance,
            threshold,
            model,
            metric,
            detector_backend: None,
            facial_areas: None,
        })
    }

    /// All `(model, metric, threshold)` rows in table order.
    pub fn iter(&self) -> impl Iterator<Item = (EmbeddingModel, DistanceMetric, f32)> + '_ {
        self.entries
            .iter()
            .flat_map(|(&model, row)| row.iter().map(move |(&metric, &t)| (model, metric, t)))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self::builtin().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_builtin_covers_every_pair() {
        let table = ThresholdTable::builtin();
        assert_eq!(table.len(), EmbeddingModel::ALL.len() * DistanceMetric::ALL.len());
        for model in EmbeddingModel::ALL {
            for metric in DistanceMetric::ALL {
                assert!(table.threshold(model, metric).is_ok(), "{model}/{metric}");
            }
        }
    }

    #[test_case(EmbeddingModel::VggFace, DistanceMetric::Cosine, 0.40)]
    #[test_case(EmbeddingModel::VggFace, DistanceMetric::EuclideanL2, 0.86)]
    #[test_case(EmbeddingModel::Facenet, DistanceMetric::Cosine, 0.40)]
    #[test_case(EmbeddingModel::Facenet, DistanceMetric::Euclidean, 10.0)]
    #[test_case(EmbeddingModel::Facenet512, DistanceMetric::Euclidean, 23.56)]
    #[test_case(EmbeddingModel::OpenFace, DistanceMetric::Cosine, 0.10)]
    #[test_case(EmbeddingModel::DeepFace, DistanceMetric::Euclidean, 64.0)]
    #[test_case(EmbeddingModel::DeepId, DistanceMetric::Cosine, 0.015)]
    #[test_case(EmbeddingModel::Dlib, DistanceMetric::EuclideanL2, 0.4)]
    #[test_case(EmbeddingModel::ArcFace, DistanceMetric::Cosine, 0.68)]
    #[test_case(EmbeddingModel::ArcFace, DistanceMetric::Euclidean, 4.15)]
    #[test_case(EmbeddingModel::SFace, DistanceMetric::EuclideanL2, 1.055)]
    fn test_builtin_values(model: EmbeddingModel, metric: DistanceMetric, expected: f32) {
        let t = ThresholdTable::builtin().threshold(model, metric).unwrap();
        assert!((t - expected).abs() < 1e-6, "{model}/{metric}: {t}");
    }

    #[test]
    fn test_decision_is_inclusive() {
        let table = ThresholdTable::builtin();
        let at = table.verify(0.40, EmbeddingModel::Facenet, DistanceMetric::Cosine).unwrap();
        assert!(at.verified);
        let above = table.verify(0.41, EmbeddingModel::Facenet, DistanceMetric::Cosine).unwrap();
        assert!(!above.verified);
        assert_eq!(above.threshold, 0.40);
        assert_eq!(above.metric, DistanceMetric::Cosine);
    }

    #[test]
    fn test_missing_pair_is_unsupported() {
        let table = ThresholdTable::from_toml_str("[facenet]\ncosine = 0.5\n").unwrap();
        assert_eq!(table.len(), 1);
        let err = table
            .verify(0.1, EmbeddingModel::Facenet, DistanceMetric::Euclidean)
            .unwrap_err();
        assert!(matches!(err, FaceError::UnsupportedConfiguration(_)));
        assert!(table.threshold(EmbeddingModel::ArcFace, DistanceMetric::Cosine).is_err());
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        assert!(ThresholdTable::from_toml_str("[retina]\ncosine = 0.5\n").is_err());
        assert!(ThresholdTable::from_toml_str("[facenet]\nmanhattan = 0.5\n").is_err());
        assert!(ThresholdTable::from_toml_str("not toml at all = = =").is_err());
    }

    #[test]
    fn test_serializes_with_stable_names() {
        let table = ThresholdTable::from_toml_str("[vgg-face]\neuclidean_l2 = 0.86\n").unwrap();
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, r#"{"vgg-face":{"euclidean_l2":0.86}}"#);
    }
}
