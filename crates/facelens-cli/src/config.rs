use anyhow::{Context, Result};
use facelens_core::{
    DetectOptions, DetectorBackend, DistanceMetric, EmbeddingModel, RegistryConfig, ThresholdTable, VerifyOptions,
};
use std::path::PathBuf;
use std::str::FromStr;

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing model weight files.
    pub model_dir: PathBuf,
    pub detector: DetectorBackend,
    pub model: EmbeddingModel,
    pub metric: DistanceMetric,
    /// Fail on images without a detectable face instead of using the whole image.
    pub enforce_detection: bool,
    /// Rotate faces upright using landmarks when the detector provides them.
    pub align: bool,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Engine worker threads for batch requests.
    pub workers: usize,
    /// Optional TOML file replacing the built-in threshold table.
    pub thresholds: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `FACELENS_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = lookup("FACELENS_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(facelens_core::default_model_dir);

        Self {
            model_dir,
            detector: parse_or(&lookup, "FACELENS_DETECTOR", DetectorBackend::default()),
            model: parse_or(&lookup, "FACELENS_MODEL", EmbeddingModel::VggFace),
            metric: parse_or(&lookup, "FACELENS_METRIC", DistanceMetric::Cosine),
            enforce_detection: flag(&lookup, "FACELENS_ENFORCE_DETECTION", true),
            align: flag(&lookup, "FACELENS_ALIGN", true),
            intra_threads: parse_or(&lookup, "FACELENS_INTRA_THREADS", 2),
            workers: parse_or(&lookup, "FACELENS_WORKERS", 2usize).max(1),
            thresholds: lookup("FACELENS_THRESHOLDS").map(PathBuf::from),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            model_dir: self.model_dir.clone(),
            intra_threads: self.intra_threads,
        }
    }

    pub fn detect_options(&self) -> DetectOptions {
        DetectOptions {
            backend: self.detector,
            enforce_detection: self.enforce_detection,
            align: self.align,
        }
    }

    pub fn verify_options(&self) -> VerifyOptions {
        VerifyOptions {
            model: self.model,
            metric: self.metric,
            detection: self.detect_options(),
        }
    }

    /// The threshold table to decide with: the configured file, else the built-in one.
    pub fn threshold_table(&self) -> Result<ThresholdTable> {
        let Some(path) = &self.thresholds else {
            return Ok(ThresholdTable::default());
        };
        let src = std::fs::read_to_string(path)
            .with_context(|| format!("reading threshold table {}", path.display()))?;
        ThresholdTable::from_toml_str(&src).with_context(|| format!("parsing threshold table {}", path.display()))
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparseable setting");
            default
        }),
        None => default,
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
        .unwrap_or(default)
}
