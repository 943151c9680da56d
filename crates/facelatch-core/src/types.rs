use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Recognition algorithm, also the tag written into every persisted model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    ClassicLbph,
    ClassicEigen,
    ClassicFisher,
    EmbeddingSimilarity,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::ClassicLbph,
        Algorithm::ClassicEigen,
        Algorithm::ClassicFisher,
        Algorithm::EmbeddingSimilarity,
    ];

    /// Tag used in config files and the model container.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::ClassicLbph => "classic_lbph",
            Algorithm::ClassicEigen => "classic_eigen",
            Algorithm::ClassicFisher => "classic_fisher",
            Algorithm::EmbeddingSimilarity => "embedding_similarity",
        }
    }

    pub fn direction(&self) -> ScoreDirection {
        match self {
            Algorithm::EmbeddingSimilarity => ScoreDirection::HigherIsBetter,
            _ => ScoreDirection::LowerIsBetter,
        }
    }

    /// Threshold used when the configuration leaves it unset.
    ///
    /// LBPH scores are chi-square distances over 64 normalized cell histograms
    /// (range 0–128). Eigen/Fisher scores are Euclidean distances between
    /// projections of [0, 1]-scaled pixels. Embedding scores are cosine
    /// similarities in [-1, 1].
    pub fn default_threshold(&self) -> f32 {
        match self {
            Algorithm::ClassicLbph => 40.0,
            Algorithm::ClassicEigen => 12.0,
            Algorithm::ClassicFisher => 6.0,
            Algorithm::EmbeddingSimilarity => 0.40,
        }
    }

    pub fn is_classic(&self) -> bool {
        !matches!(self, Algorithm::EmbeddingSimilarity)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown algorithm '{s}'"))
    }
}

/// Which way a raw match score improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreDirection {
    /// Distances: smaller is closer.
    LowerIsBetter,
    /// Similarities: larger is closer.
    HigherIsBetter,
}

impl ScoreDirection {
    /// Normalized acceptance test. Scores equal to the threshold pass.
    pub fn passes(&self, score: f32, threshold: f32) -> bool {
        // NaN never passes either comparison.
        match self {
            ScoreDirection::LowerIsBetter => score <= threshold,
            ScoreDirection::HigherIsBetter => score >= threshold,
        }
    }

    /// True if `candidate` is strictly better than `current`.
    pub fn is_better(&self, candidate: f32, current: f32) -> bool {
        match self {
            ScoreDirection::LowerIsBetter => candidate < current,
            ScoreDirection::HigherIsBetter => candidate > current,
        }
    }

    /// Starting value for a running best.
    pub fn worst(&self) -> f32 {
        match self {
            ScoreDirection::LowerIsBetter => f32::INFINITY,
            ScoreDirection::HigherIsBetter => f32::NEG_INFINITY,
        }
    }
}

/// Face embedding vector from a learned feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Always processes every dimension; a zero vector scores 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
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

    /// Unit-length copy; a zero vector is returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            Embedding::new(self.values.iter().map(|x| x / norm).collect())
        } else {
            self.clone()
        }
    }
}

/// Fixed-shape representation of one face sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    /// Grayscale face crop, row-major, one byte per pixel.
    Image {
        data: Vec<u8>,
        width: u32,
        height: u32,
    },
    /// Embedding produced by an external feature extractor.
    Embedding(Embedding),
}

impl Descriptor {
    pub fn image(data: Vec<u8>, width: u32, height: u32) -> Self {
        Descriptor::Image {
            data,
            width,
            height,
        }
    }

    /// Short human-readable shape, for logs and error messages.
    pub fn shape(&self) -> String {
        match self {
            Descriptor::Image { width, height, .. } => format!("image {width}x{height}"),
            Descriptor::Embedding(e) => format!("embedding[{}]", e.dim()),
        }
    }
}

/// One enrollment entry.
#[derive(Debug, Clone)]
pub struct LabeledSample {
    pub descriptor: Descriptor,
    pub label: String,
}

impl LabeledSample {
    pub fn new(descriptor: Descriptor, label: impl Into<String>) -> Self {
        Self {
            descriptor,
            label: label.into(),
        }
    }
}

/// Normalized outcome of comparing one probe against a trained model.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchDecision {
    pub is_match: bool,
    /// Raw score; its direction is given by the recognizer's [`ScoreDirection`].
    pub score: f32,
    /// Label of the closest enrolled sample.
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_cosine_similarity_identical() {
        assert!((emb(&[1.0, 0.0, 0.0]).similarity(&emb(&[1.0, 0.0, 0.0])) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        assert!((emb(&[1.0, 0.0]).similarity(&emb(&[-1.0, 0.0])) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_normalized_has_unit_length() {
        let n = emb(&[3.0, 4.0]).normalized();
        assert!((n.values[0] - 0.6).abs() < 1e-6);
        assert!((n.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_distance_direction() {
        let d = ScoreDirection::LowerIsBetter;
        assert!(!d.passes(60.0, 50.0));
        assert!(d.passes(40.0, 50.0));
        assert!(d.passes(50.0, 50.0));
        assert!(d.is_better(10.0, 20.0));
    }

    #[test]
    fn test_similarity_direction() {
        let d = ScoreDirection::HigherIsBetter;
        assert!(d.passes(0.7, 0.5));
        assert!(!d.passes(0.3, 0.5));
        assert!(d.is_better(0.9, 0.2));
    }

    #[test]
    fn test_nan_never_passes() {
        assert!(!ScoreDirection::LowerIsBetter.passes(f32::NAN, 50.0));
        assert!(!ScoreDirection::HigherIsBetter.passes(f32::NAN, 0.5));
    }

    #[test]
    fn test_algorithm_tags_round_trip() {
        for alg in Algorithm::ALL {
            assert_eq!(alg.as_str().parse::<Algorithm>().unwrap(), alg);
        }
        assert!("opencv_magic".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_algorithm_serde_uses_snake_case_tags() {
        let json = serde_json::to_string(&Algorithm::ClassicFisher).unwrap();
        assert_eq!(json, "\"classic_fisher\"");
    }
}
