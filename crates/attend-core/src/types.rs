use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero-length or zero-norm vector has similarity 0.0 with everything.
    /// Embeddings of different dimensions are not comparable and give NaN.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::NAN;
        }
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Euclidean (L2) distance between two embeddings, NaN on a dimension mismatch.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::NAN;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Distance function and fixed acceptance threshold over embeddings.
///
/// Lower distance means more similar for every implementation, so callers
/// can log and compare distances without knowing the metric.
pub trait Matcher {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32;
    fn is_match(&self, distance: f32) -> bool;
}

/// Default cosine similarity threshold for ArcFace w600k_r50.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.40;

/// Default L2 tolerance for unit-normalised embeddings.
pub const DEFAULT_EUCLIDEAN_TOLERANCE: f32 = 0.6;

/// Cosine matcher. Distance is `1 - similarity`, in [0, 2].
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    /// Minimum cosine similarity for a positive match.
    pub threshold: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl Matcher for CosineMatcher {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        1.0 - a.similarity(b)
    }

    fn is_match(&self, distance: f32) -> bool {
        distance.is_finite() && 1.0 - distance >= self.threshold
    }
}

/// Euclidean matcher, accepting when the L2 distance is within `tolerance`.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_EUCLIDEAN_TOLERANCE,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.euclidean_distance(b)
    }

    fn is_match(&self, distance: f32) -> bool {
        distance <= self.tolerance
    }
}

impl<M: Matcher + ?Sized> Matcher for Box<M> {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        (**self).distance(a, b)
    }

    fn is_match(&self, distance: f32) -> bool {
        (**self).is_match(distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_dimension_mismatch_never_matches() {
        // Shares a prefix with `long`, so a truncated comparison would match.
        let short = Embedding::new(vec![1.0, 0.0]);
        let long = Embedding::new(vec![1.0, 0.0, 0.0]);

        assert!(short.similarity(&long).is_nan());
        assert!(short.euclidean_distance(&long).is_nan());

        let cosine = CosineMatcher::default();
        assert!(!cosine.is_match(cosine.distance(&short, &long)));
        let euclidean = EuclideanMatcher::default();
        assert!(!euclidean.is_match(euclidean.distance(&short, &long)));
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_matcher_threshold() {
        let matcher = CosineMatcher { threshold: 0.5 };
        let probe = Embedding::new(vec![1.0, 0.0]);
        let same = Embedding::new(vec![0.9, 0.1]);
        let other = Embedding::new(vec![0.0, 1.0]);

        let d_same = matcher.distance(&probe, &same);
        let d_other = matcher.distance(&probe, &other);
        assert!(d_same < d_other);
        assert!(matcher.is_match(d_same));
        assert!(!matcher.is_match(d_other));
    }

    #[test]
    fn test_cosine_matcher_rejects_nan() {
        assert!(!CosineMatcher::default().is_match(f32::NAN));
    }

    #[test]
    fn test_euclidean_matcher_tolerance() {
        let matcher = EuclideanMatcher::default();
        assert!(matcher.is_match(0.59));
        assert!(matcher.is_match(0.6));
        assert!(!matcher.is_match(0.61));
        assert!(!matcher.is_match(f32::NAN));
    }

    #[test]
    fn test_boxed_matcher_delegates() {
        let matcher: Box<dyn Matcher> = Box::new(EuclideanMatcher { tolerance: 1.0 });
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.0, 0.5]);
        assert!((matcher.distance(&a, &b) - 0.5).abs() < 1e-6);
        assert!(matcher.is_match(0.5));
    }
}
