//! attend-core — Face embedding capability.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition, both
//! running via ONNX Runtime for CPU inference, behind the [`FaceEmbedder`]
//! trait so callers can substitute their own extractor.

pub mod alignment;
pub mod detector;
pub mod embedder;
pub mod models;
pub mod recognizer;
pub mod types;

pub use embedder::{EmbedError, FaceEmbedder, OnnxEmbedder};
pub use types::{BoundingBox, CosineMatcher, Embedding, EuclideanMatcher, Matcher};
