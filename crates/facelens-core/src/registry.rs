//! Process-wide cache of loaded models.
//!
//! Every model is addressed by a [`ModelKey`]. The first request for a key
//! claims a per-key slot under a short-lived map lock and then performs the
//! expensive load outside that lock, so concurrent first requests for the
//! same key load exactly once while different keys load in parallel. Failed
//! loads leave the slot empty and are retried by the next request.

use crate::embedder::EmbeddingModel;
use crate::error::{FaceError, Result};
use ndarray::Array4;
use once_cell::sync::OnceCell;
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

const DEFAULT_INTRA_THREADS: usize = 2;

// Classical cascade tuning.
const CASCADE_MIN_FACE_SIZE: u32 = 20;
const CASCADE_SCORE_THRESHOLD: f64 = 2.0;
const CASCADE_PYRAMID_SCALE: f32 = 0.8;
const CASCADE_WINDOW_STEP: u32 = 4;

/// Model family a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelKind {
    Detector,
    Embedder,
    Analyzer,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelKind::Detector => "detector",
            ModelKind::Embedder => "embedder",
            ModelKind::Analyzer => "analyzer",
        })
    }
}

/// Registry key: (model kind, model variant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    pub kind: ModelKind,
    pub variant: &'static str,
}

impl ModelKey {
    pub const fn new(kind: ModelKind, variant: &'static str) -> Self {
        Self { kind, variant }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.variant)
    }
}

/// One output tensor of a model run, flattened row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl ModelOutput {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }
}

/// A loaded model that maps one input tensor to its output tensors.
///
/// Implementations must be safe to call from many threads at once.
pub trait InferenceModel: Send + Sync {
    fn run(&self, input: &Array4<f32>) -> Result<Vec<ModelOutput>>;
}

/// Shared, read-only handle to a cached model.
pub type ModelHandle = Arc<dyn InferenceModel>;

/// Produces model handles on a cache miss.
pub trait ModelLoader: Send + Sync {
    fn load(&self, key: &ModelKey) -> Result<ModelHandle>;
}

/// Default directory holding model weight files.
///
/// `$FACELENS_MODEL_DIR`, else `$XDG_DATA_HOME/facelens/models`, else
/// `$HOME/.local/share/facelens/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACELENS_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facelens")
        .join("models")
}

/// Weight file name for a key, relative to the model directory.
pub fn weight_file(key: &ModelKey) -> Option<&'static str> {
    match key.kind {
        ModelKind::Embedder => key
            .variant
            .parse::<EmbeddingModel>()
            .ok()
            .map(|m| m.spec().file),
        ModelKind::Detector => match key.variant {
            "cascade" => Some("seeta_fd_frontal_v1.0.bin"),
            "ssd" => Some("res10_300x300_ssd.onnx"),
            "yunet" => Some("face_detection_yunet_2023mar.onnx"),
            "scrfd" => Some("det_10g.onnx"),
            "mtcnn-pnet" => Some("mtcnn_pnet.onnx"),
            "mtcnn-rnet" => Some("mtcnn_rnet.onnx"),
            "mtcnn-onet" => Some("mtcnn_onet.onnx"),
            _ => None,
        },
        ModelKind::Analyzer => match key.variant {
            "age" => Some("age_model.onnx"),
            "gender" => Some("gender_model.onnx"),
            "emotion" => Some("facial_expression_model.onnx"),
            "race" => Some("race_model.onnx"),
            _ => None,
        },
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub model_dir: PathBuf,
    pub intra_threads: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            intra_threads: DEFAULT_INTRA_THREADS,
        }
    }
}

/// Loads weight files from a directory.
pub struct FileModelLoader {
    config: RegistryConfig,
}

impl FileModelLoader {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }
}

impl ModelLoader for FileModelLoader {
    fn load(&self, key: &ModelKey) -> Result<ModelHandle> {
        let file = weight_file(key).ok_or_else(|| FaceError::ModelLoad {
            key: *key,
            reason: "no weight file is known for this model".into(),
        })?;
        let path = self.config.model_dir.join(file);
        if !path.exists() {
            return Err(FaceError::ModelLoad {
                key: *key,
                reason: format!(
                    "model file not found: {} (download it into {})",
                    path.display(),
                    self.config.model_dir.display()
                ),
            });
        }

        let handle: ModelHandle = if key.kind == ModelKind::Detector && key.variant == "cascade" {
            Arc::new(CascadeModel::load(&path).map_err(|reason| FaceError::ModelLoad {
                key: *key,
                reason,
            })?)
        } else {
            Arc::new(
                OnnxModel::load(&path, self.config.intra_threads).map_err(|e| FaceError::ModelLoad {
                    key: *key,
                    reason: e.to_string(),
                })?,
            )
        };
        Ok(handle)
    }
}

/// ONNX Runtime session behind a lock; a session run needs exclusive access.
pub struct OnnxModel {
    session: Mutex<Session>,
    output_names: Vec<String>,
}

impl OnnxModel {
    pub fn load(path: &Path, intra_threads: usize) -> Result<Self> {
        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded ONNX model"
        );

        Ok(Self {
            session: Mutex::new(session),
            output_names,
        })
    }
}

impl InferenceModel for OnnxModel {
    fn run(&self, input: &Array4<f32>) -> Result<Vec<ModelOutput>> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut result = Vec::with_capacity(self.output_names.len());
        for (idx, name) in self.output_names.iter().enumerate() {
            let (shape, data) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| FaceError::Inference(format!("output {name}: {e}")))?;
            result.push(ModelOutput::new(
                name.clone(),
                shape.iter().map(|&d| d.max(0) as usize).collect(),
                data.to_vec(),
            ));
        }
        Ok(result)
    }
}

/// SeetaFace funnel cascade exposed through the tensor interface.
///
/// Input is a `[1, 1, H, W]` grayscale tensor in [0, 255]; the single output
/// `faces` has shape `[N, 5]` holding `x, y, width, height, score` rows.
pub struct CascadeModel {
    model: rustface::Model,
}

impl CascadeModel {
    pub fn load(path: &Path) -> std::result::Result<Self, String> {
        let file = std::fs::File::open(path).map_err(|e| format!("{}: {e}", path.display()))?;
        let model = rustface::read_model(std::io::BufReader::new(file))
            .map_err(|e| format!("bad cascade model {}: {e}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded cascade model");
        Ok(Self { model })
    }
}

impl InferenceModel for CascadeModel {
    fn run(&self, input: &Array4<f32>) -> Result<Vec<ModelOutput>> {
        let shape = input.shape();
        if shape[0] != 1 || shape[1] != 1 {
            return Err(FaceError::Inference(format!(
                "cascade expects a [1, 1, H, W] grayscale tensor, got {shape:?}"
            )));
        }
        let (height, width) = (shape[2] as u32, shape[3] as u32);
        let gray: Vec<u8> = input.iter().map(|v| v.round().clamp(0.0, 255.0) as u8).collect();

        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(CASCADE_MIN_FACE_SIZE);
        detector.set_score_thresh(CASCADE_SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(CASCADE_PYRAMID_SCALE);
        detector.set_slide_window_step(CASCADE_WINDOW_STEP, CASCADE_WINDOW_STEP);

        let faces = detector.detect(&rustface::ImageData::new(&gray, width, height));
        let mut data = Vec::with_capacity(faces.len() * 5);
        for face in &faces {
            let bbox = face.bbox();
            data.extend_from_slice(&[
                bbox.x() as f32,
                bbox.y() as f32,
                bbox.width() as f32,
                bbox.height() as f32,
                face.score() as f32,
            ]);
        }
        Ok(vec![ModelOutput::new("faces", vec![faces.len(), 5], data)])
    }
}

/// Lazily-populated model cache with explicit construction and teardown.
pub struct ModelRegistry {
    loader: Arc<dyn ModelLoader>,
    slots: Mutex<HashMap<ModelKey, Arc<OnceCell<ModelHandle>>>>,
}

impl ModelRegistry {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Registry backed by weight files under `config.model_dir`.
    pub fn with_model_dir(config: RegistryConfig) -> Self {
        Self::new(Arc::new(FileModelLoader::new(config)))
    }

    /// Return the cached handle for `key`, loading it on first use.
    pub fn get_or_load(&self, key: &ModelKey) -> Result<ModelHandle> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(*key).or_default().clone()
        };

        slot.get_or_try_init(|| {
            tracing::info!(%key, "loading model");
            let handle = self.loader.load(key);
            if let Err(e) = &handle {
                tracing::warn!(%key, error = %e, "model load failed");
            }
            handle
        })
        .cloned()
    }

    pub fn is_loaded(&self, key: &ModelKey) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).is_some_and(|slot| slot.get().is_some())
    }

    /// Keys with a successfully loaded model, sorted.
    pub fn loaded_keys(&self) -> Vec<ModelKey> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<ModelKey> = slots
            .iter()
            .filter(|(_, slot)| slot.get().is_some())
            .map(|(key, _)| *key)
            .collect();
        keys.sort();
        keys
    }

    /// Drop every cached handle. Handles already given out stay valid.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let count = slots.len();
        slots.clear();
        tracing::debug!(count, "model registry cleared");
    }
}
