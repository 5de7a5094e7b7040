//! The embedding capability: image in, zero or more face embeddings out.

use crate::detector::{DetectorError, FaceDetector};
use crate::models::{self, ModelIntegrityError};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use image::DynamicImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("model integrity: {0}")]
    Integrity(#[from] ModelIntegrityError),
}

/// Produces face embeddings for every face found in an image.
///
/// Embeddings come back ordered by detection confidence, highest first.
/// An empty vector means no face was found; that is not an error.
pub trait FaceEmbedder {
    fn embed(&mut self, image: &DynamicImage) -> Result<Vec<Embedding>, EmbedError>;
}

impl<E: FaceEmbedder + ?Sized> FaceEmbedder for Box<E> {
    fn embed(&mut self, image: &DynamicImage) -> Result<Vec<Embedding>, EmbedError> {
        (**self).embed(image)
    }
}

/// SCRFD detection + ArcFace recognition.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    /// Load both models from `model_dir`.
    ///
    /// With `verify_checksums`, each file must match its pinned SHA-256
    /// before it is handed to ONNX Runtime.
    pub fn load(model_dir: &Path, verify_checksums: bool) -> Result<Self, EmbedError> {
        if verify_checksums {
            models::verify_models_dir(model_dir)?;
        } else {
            tracing::warn!(dir = %model_dir.display(), "model checksum verification disabled");
        }

        let detector = FaceDetector::load(&model_dir.join(models::DETECTOR_MODEL.name))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(models::RECOGNIZER_MODEL.name))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed(&mut self, image: &DynamicImage) -> Result<Vec<Embedding>, EmbedError> {
        let rgb = image.to_rgb8();
        let faces = self.detector.detect(&rgb)?;

        let mut embeddings = Vec::with_capacity(faces.len());
        for face in &faces {
            match self.recognizer.extract(&rgb, face) {
                Ok(embedding) => embeddings.push(embedding),
                Err(RecognizerError::NoLandmarks) => {
                    tracing::debug!(confidence = face.confidence, "skipping face without landmarks");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(faces = faces.len(), embeddings = embeddings.len(), "embedded image");
        Ok(embeddings)
    }
}
