//! Attribute predictors: age, gender, emotion and race.
//!
//! Each predictor owns one model handle and fails on its own; a face
//! analysis collects per-attribute outcomes so one broken model never
//! hides the others.

use crate::error::{FaceError, Result};
use crate::preprocess::{self, ChannelOrder, InputContract, Normalization, TensorLayout};
use crate::registry::{ModelHandle, ModelKey, ModelKind};
use crate::types::{AlignedFace, FacialArea};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Aligned face size every attribute model is fed from.
pub const ANALYSIS_FACE_SIZE: (u32, u32) = (224, 224);

const AGE_BINS: usize = 101;
const GENDER_LABELS: [&str; 2] = ["Woman", "Man"];
const EMOTION_LABELS: [&str; 7] = ["angry", "disgust", "fear", "happy", "sad", "surprise", "neutral"];
const RACE_LABELS: [&str; 6] = ["asian", "indian", "black", "white", "middle eastern", "latino hispanic"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Attribute {
    Age,
    Gender,
    Emotion,
    Race,
}

impl Attribute {
    pub const ALL: [Attribute; 4] = [Attribute::Age, Attribute::Gender, Attribute::Emotion, Attribute::Race];

    pub fn as_str(self) -> &'static str {
        match self {
            Attribute::Age => "age",
            Attribute::Gender => "gender",
            Attribute::Emotion => "emotion",
            Attribute::Race => "race",
        }
    }

    pub fn key(self) -> ModelKey {
        ModelKey::new(ModelKind::Analyzer, self.as_str())
    }

    fn contract(self) -> InputContract {
        match self {
            Attribute::Emotion => InputContract {
                width: 48,
                height: 48,
                order: ChannelOrder::Gray,
                layout: TensorLayout::Nhwc,
                normalization: Normalization::Base,
            },
            _ => InputContract {
                width: ANALYSIS_FACE_SIZE.0,
                height: ANALYSIS_FACE_SIZE.1,
                order: ChannelOrder::Bgr,
                layout: TensorLayout::Nhwc,
                normalization: Normalization::Base,
            },
        }
    }

    fn labels(self) -> &'static [&'static str] {
        match self {
            Attribute::Age => &[],
            Attribute::Gender => &GENDER_LABELS,
            Attribute::Emotion => &EMOTION_LABELS,
            Attribute::Race => &RACE_LABELS,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Attribute {
    type Err = FaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "age" => Ok(Attribute::Age),
            "gender" => Ok(Attribute::Gender),
            "emotion" => Ok(Attribute::Emotion),
            "race" | "ethnicity" => Ok(Attribute::Race),
            other => Err(FaceError::UnsupportedConfiguration(format!("unknown attribute '{other}'"))),
        }
    }
}

/// A single attribute prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Prediction {
    /// Expected age over the model's per-year distribution.
    Age { years: f32 },
    /// Winning class with its probability and the full normalized distribution.
    Category {
        label: String,
        confidence: f32,
        scores: BTreeMap<String, f32>,
    },
}

/// Prediction or the reason it could not be made.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeOutcome {
    Predicted(Prediction),
    Failed { error: String },
}

/// Attributes predicted for one face.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub region: FacialArea,
    pub confidence: f32,
    pub attributes: BTreeMap<Attribute, AttributeOutcome>,
}

impl AnalysisResult {
    pub fn prediction(&self, attribute: Attribute) -> Option<&Prediction> {
        match self.attributes.get(&attribute) {
            Some(AttributeOutcome::Predicted(p)) => Some(p),
            _ => None,
        }
    }
}

pub trait AttributePredictor: Send + Sync {
    fn attribute(&self) -> Attribute;
    fn predict(&self, face: &AlignedFace) -> Result<Prediction>;
}

/// Predictor backed by a loaded classification model.
pub struct ModelPredictor {
    attribute: Attribute,
    model: ModelHandle,
}

impl ModelPredictor {
    pub fn new(attribute: Attribute, model: ModelHandle) -> Self {
        Self { attribute, model }
    }
}

impl AttributePredictor for ModelPredictor {
    fn attribute(&self) -> Attribute {
        self.attribute
    }

    fn predict(&self, face: &AlignedFace) -> Result<Prediction> {
        let input = preprocess::to_tensor(&face.pixels, &self.attribute.contract());
        let outputs = self.model.run(&input)?;
        let raw = outputs
            .first()
            .ok_or_else(|| FaceError::Inference(format!("{} model produced no outputs", self.attribute)))?;
        match self.attribute {
            Attribute::Age => expected_age(&raw.data),
            attribute => categorical(attribute, &raw.data),
        }
    }
}

fn normalized(attribute: Attribute, probs: &[f32], expected: usize) -> Result<Vec<f32>> {
    if probs.len() != expected {
        return Err(FaceError::Inference(format!(
            "{attribute} model returned {} scores, expected {expected}",
            probs.len()
        )));
    }
    let total: f32 = probs.iter().map(|p| p.max(0.0)).sum();
    if !(total > 0.0 && total.is_finite()) {
        return Err(FaceError::Inference(format!("{attribute} model returned no probability mass")));
    }
    Ok(probs.iter().map(|p| p.max(0.0) / total).collect())
}

/// `sum(i * p_i)` over the age bins, not the argmax.
fn expected_age(probs: &[f32]) -> Result<Prediction> {
    let probs = normalized(Attribute::Age, probs, AGE_BINS)?;
    let years: f32 = probs.iter().enumerate().map(|(i, p)| i as f32 * p).sum();
    Ok(Prediction::Age { years })
}

fn categorical(attribute: Attribute, probs: &[f32]) -> Result<Prediction> {
    let labels = attribute.labels();
    let probs = normalized(attribute, probs, labels.len())?;

    let (best, confidence) = probs
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::MIN), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

    Ok(Prediction::Category {
        label: labels[best].to_string(),
        confidence,
        scores: labels.iter().map(|l| l.to_string()).zip(probs).collect(),
    })
}

/// A requested attribute with its predictor, or the reason it is unavailable.
pub type PredictorSlot = (Attribute, std::result::Result<Box<dyn AttributePredictor>, String>);

/// Run every requested predictor on one face, recording failures per attribute.
pub fn analyze_face(face: &AlignedFace, predictors: &[PredictorSlot]) -> AnalysisResult {
    let mut attributes = BTreeMap::new();
    for (attribute, predictor) in predictors {
        let outcome = match predictor {
            Ok(p) => match p.predict(face) {
                Ok(prediction) => AttributeOutcome::Predicted(prediction),
                Err(e) => {
                    tracing::warn!(%attribute, error = %e, "attribute prediction failed");
                    AttributeOutcome::Failed { error: e.to_string() }
                }
            },
            Err(reason) => AttributeOutcome::Failed { error: reason.clone() },
        };
        attributes.insert(*attribute, outcome);
    }
    AnalysisResult {
        region: face.region,
        confidence: face.confidence,
        attributes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InferenceModel, ModelOutput};
    use image::RgbImage;
    use ndarray::Array4;
    use std::sync::Arc;
    use test_case::test_case;

    struct Fixed(Vec<f32>);

    impl InferenceModel for Fixed {
        fn run(&self, _input: &Array4<f32>) -> Result<Vec<ModelOutput>> {
            Ok(vec![ModelOutput::new("probs", vec![1, self.0.len()], self.0.clone())])
        }
    }

    struct ShapeCheck(Vec<usize>, Vec<f32>);

    impl InferenceModel for ShapeCheck {
        fn run(&self, input: &Array4<f32>) -> Result<Vec<ModelOutput>> {
            assert_eq!(input.shape(), self.0.as_slice());
            Ok(vec![ModelOutput::new("probs", vec![1, self.1.len()], self.1.clone())])
        }
    }

    fn face() -> AlignedFace {
        AlignedFace {
            pixels: RgbImage::new(224, 224),
            region: FacialArea { x: 3, y: 4, w: 50, h: 60 },
            confidence: 0.9,
        }
    }

    #[test]
    fn test_age_is_expected_value_not_argmax() {
        let mut probs = vec![0.0; AGE_BINS];
        probs[20] = 0.6;
        probs[40] = 0.4;
        let Prediction::Age { years } = expected_age(&probs).unwrap() else {
            panic!("expected an age prediction");
        };
        assert!((years - 28.0).abs() < 1e-4, "{years}");
    }

    #[test]
    fn test_gender_argmax_and_normalization() {
        let predictor = ModelPredictor::new(Attribute::Gender, Arc::new(Fixed(vec![2.0, 6.0])));
        let Prediction::Category { label, confidence, scores } = predictor.predict(&face()).unwrap() else {
            panic!("expected a category");
        };
        assert_eq!(label, "Man");
        assert!((confidence - 0.75).abs() < 1e-6);
        assert!((scores.values().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_emotion_uses_48px_grayscale() {
        let mut probs = vec![0.01; 7];
        probs[3] = 0.94;
        let model = ShapeCheck(vec![1, 48, 48, 1], probs);
        let predictor = ModelPredictor::new(Attribute::Emotion, Arc::new(model));
        let prediction = predictor.predict(&face()).unwrap();
        assert!(matches!(prediction, Prediction::Category { ref label, .. } if label == "happy"));
    }

    #[test]
    fn test_race_uses_224px_bgr() {
        let model = ShapeCheck(vec![1, 224, 224, 3], vec![0.1, 0.1, 0.1, 0.1, 0.5, 0.1]);
        let predictor = ModelPredictor::new(Attribute::Race, Arc::new(model));
        let prediction = predictor.predict(&face()).unwrap();
        assert!(matches!(prediction, Prediction::Category { ref label, .. } if label == "middle eastern"));
    }

    #[test]
    fn test_wrong_class_count() {
        let predictor = ModelPredictor::new(Attribute::Race, Arc::new(Fixed(vec![0.5, 0.5])));
        assert!(matches!(predictor.predict(&face()), Err(FaceError::Inference(_))));
    }

    #[test]
    fn test_partial_failure_keeps_other_attributes() {
        let slot = |attribute: Attribute, probs: Vec<f32>| -> PredictorSlot {
            let predictor: Box<dyn AttributePredictor> = Box::new(ModelPredictor::new(attribute, Arc::new(Fixed(probs))));
            (attribute, Ok(predictor))
        };
        let predictors = vec![
            slot(Attribute::Gender, vec![0.9, 0.1]),
            (Attribute::Race, Err("failed to load model analyzer/race: missing".to_string())),
            slot(Attribute::Emotion, vec![1.0]),
        ];
        let result = analyze_face(&face(), &predictors);

        assert_eq!(result.region, FacialArea { x: 3, y: 4, w: 50, h: 60 });
        assert!(result.prediction(Attribute::Gender).is_some());
        assert!(matches!(result.attributes[&Attribute::Race], AttributeOutcome::Failed { .. }));
        assert!(matches!(result.attributes[&Attribute::Emotion], AttributeOutcome::Failed { .. }));
        assert!(!result.attributes.contains_key(&Attribute::Age));
    }

    #[test_case("age", Attribute::Age)]
    #[test_case("Gender", Attribute::Gender)]
    #[test_case("emotion", Attribute::Emotion)]
    #[test_case("ethnicity", Attribute::Race)]
    fn test_parse_attribute(input: &str, expected: Attribute) {
        assert_eq!(input.parse::<Attribute>().unwrap(), expected);
    }

    #[test]
    fn test_serialized_shape() {
        let outcome = AttributeOutcome::Predicted(Prediction::Age { years: 31.5 });
        assert_eq!(serde_json::to_string(&outcome).unwrap(), r#"{"years":31.5}"#);
        let failed = AttributeOutcome::Failed { error: "boom".into() };
        assert_eq!(serde_json::to_string(&failed).unwrap(), r#"{"error":"boom"}"#);
    }
}
