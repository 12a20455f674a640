//! Face embedding backends.
//!
//! Each [`EmbeddingModel`] variant fixes its input size, channel order,
//! tensor layout, default pixel normalization and output length. The
//! [`Embedder`] trait is the seam the pipeline talks to.

use crate::error::{FaceError, Result};
use crate::preprocess::{self, ChannelOrder, InputContract, Normalization, TensorLayout};
use crate::registry::{ModelHandle, ModelKey, ModelKind};
use crate::types::{AlignedFace, Embedding};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pretrained recognition architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EmbeddingModel {
    #[serde(rename = "vgg-face")]
    VggFace,
    #[serde(rename = "facenet")]
    Facenet,
    #[serde(rename = "facenet512")]
    Facenet512,
    #[serde(rename = "openface")]
    OpenFace,
    #[serde(rename = "deepface")]
    DeepFace,
    #[serde(rename = "deepid")]
    DeepId,
    #[serde(rename = "dlib")]
    Dlib,
    #[serde(rename = "arcface")]
    ArcFace,
    #[serde(rename = "sface")]
    SFace,
}

/// Static description of one embedding model variant.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub name: &'static str,
    pub input_width: u32,
    pub input_height: u32,
    pub dimensions: usize,
    pub order: ChannelOrder,
    pub layout: TensorLayout,
    pub normalization: Normalization,
    pub file: &'static str,
}

impl EmbeddingModel {
    pub const ALL: [EmbeddingModel; 9] = [
        EmbeddingModel::VggFace,
        EmbeddingModel::Facenet,
        EmbeddingModel::Facenet512,
        EmbeddingModel::OpenFace,
        EmbeddingModel::DeepFace,
        EmbeddingModel::DeepId,
        EmbeddingModel::Dlib,
        EmbeddingModel::ArcFace,
        EmbeddingModel::SFace,
    ];

    pub fn spec(self) -> ModelSpec {
        use ChannelOrder::{Bgr, Rgb};
        use TensorLayout::{Nchw, Nhwc};
        let (name, (w, h), dimensions, order, layout, normalization, file) = match self {
            EmbeddingModel::VggFace => ("vgg-face", (224, 224), 2622, Bgr, Nhwc, Normalization::VggFace, "vgg_face.onnx"),
            EmbeddingModel::Facenet => ("facenet", (160, 160), 128, Rgb, Nhwc, Normalization::Facenet, "facenet128.onnx"),
            EmbeddingModel::Facenet512 => ("facenet512", (160, 160), 512, Rgb, Nhwc, Normalization::Facenet, "facenet512.onnx"),
            EmbeddingModel::OpenFace => ("openface", (96, 96), 128, Rgb, Nhwc, Normalization::Base, "openface.onnx"),
            EmbeddingModel::DeepFace => ("deepface", (152, 152), 4096, Bgr, Nhwc, Normalization::Base, "deepface.onnx"),
            EmbeddingModel::DeepId => ("deepid", (47, 55), 160, Bgr, Nhwc, Normalization::Base, "deepid.onnx"),
            EmbeddingModel::Dlib => ("dlib", (150, 150), 128, Rgb, Nhwc, Normalization::Raw, "dlib_resnet.onnx"),
            EmbeddingModel::ArcFace => ("arcface", (112, 112), 512, Rgb, Nhwc, Normalization::ArcFace, "arcface.onnx"),
            EmbeddingModel::SFace => ("sface", (112, 112), 128, Bgr, Nchw, Normalization::Raw, "face_recognition_sface_2021dec.onnx"),
        };
        ModelSpec {
            name,
            input_width: w,
            input_height: h,
            dimensions,
            order,
            layout,
            normalization,
            file,
        }
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// `(width, height)` an aligned face must have for this model.
    pub fn target_size(self) -> (u32, u32) {
        let spec = self.spec();
        (spec.input_width, spec.input_height)
    }

    pub fn dimensions(self) -> usize {
        self.spec().dimensions
    }

    pub fn key(self) -> ModelKey {
        ModelKey::new(ModelKind::Embedder, self.name())
    }

    pub fn contract(self, normalization: Option<Normalization>) -> InputContract {
        let spec = self.spec();
        InputContract {
            width: spec.input_width,
            height: spec.input_height,
            order: spec.order,
            layout: spec.layout,
            normalization: normalization.unwrap_or(spec.normalization),
        }
    }
}

impl fmt::Display for EmbeddingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EmbeddingModel {
    type Err = FaceError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.to_ascii_lowercase().replace(['_', ' '], "-");
        let wanted = match wanted.as_str() {
            "vggface" => "vgg-face",
            "facenet128" => "facenet",
            other => other,
        }
        .to_string();
        EmbeddingModel::ALL
            .into_iter()
            .find(|m| m.name() == wanted)
            .ok_or_else(|| FaceError::UnsupportedConfiguration(format!("unknown embedding model '{s}'")))
    }
}

/// Maps an aligned face to a fixed-length vector.
pub trait Embedder: Send + Sync {
    fn model(&self) -> EmbeddingModel;
    fn embed(&self, face: &AlignedFace) -> Result<Embedding>;
}

/// Embedder backed by a loaded ONNX model.
pub struct OnnxEmbedder {
    model: EmbeddingModel,
    contract: InputContract,
    handle: ModelHandle,
}

impl OnnxEmbedder {
    pub fn new(model: EmbeddingModel, handle: ModelHandle) -> Self {
        Self::with_normalization(model, handle, None)
    }

    /// Override the variant's default pixel normalization.
    pub fn with_normalization(
        model: EmbeddingModel,
        handle: ModelHandle,
        normalization: Option<Normalization>,
    ) -> Self {
        Self {
            model,
            contract: model.contract(normalization),
            handle,
        }
    }
}

impl Embedder for OnnxEmbedder {
    fn model(&self) -> EmbeddingModel {
        self.model
    }

    fn embed(&self, face: &AlignedFace) -> Result<Embedding> {
        if face.width() != self.contract.width || face.height() != self.contract.height {
            return Err(FaceError::UnsupportedConfiguration(format!(
                "aligned face is {}x{} but {} expects {}x{}",
                face.width(),
                face.height(),
                self.model,
                self.contract.width,
                self.contract.height
            )));
        }

        let input = preprocess::to_tensor(&face.pixels, &self.contract);
        let outputs = self.handle.run(&input)?;
        let raw = outputs
            .into_iter()
            .next()
            .ok_or_else(|| FaceError::Inference(format!("{} produced no outputs", self.model)))?;

        let expected = self.model.dimensions();
        if raw.data.len() != expected {
            return Err(FaceError::Inference(format!(
                "expected {expected}-dim embedding from {}, got {}",
                self.model,
                raw.data.len()
            )));
        }

        Ok(Embedding {
            values: raw.data,
            model: self.model,
        })
    }
}
