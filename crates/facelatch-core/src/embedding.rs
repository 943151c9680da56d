//! Cosine-similarity matcher over enrolled face embeddings.

use crate::error::{AuthError, Result};
use crate::model::Model;
use crate::recognizer::{check_label_indices, index_labels, Recognizer, TaggedModel};
use crate::types::{Algorithm, Descriptor, Embedding, LabeledSample, MatchDecision};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GalleryParams {
    dim: usize,
    embeddings: Vec<Vec<f32>>,
    labels: Vec<usize>,
}

struct Gallery {
    labels: Vec<String>,
    entries: Vec<(Embedding, usize)>,
}

/// Compares a probe against every enrolled embedding and keeps the best.
///
/// Scores are cosine similarities: `is_match = best >= threshold`.
/// The gallery is always traversed in full so timing does not depend on
/// where (or whether) the best match sits.
pub struct EmbeddingRecognizer {
    threshold: f32,
    dim: usize,
    gallery: Option<Gallery>,
}

impl EmbeddingRecognizer {
    pub fn new(threshold: f32, dim: usize) -> Self {
        Self {
            threshold,
            dim,
            gallery: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Recognizer for EmbeddingRecognizer {
    fn algorithm(&self) -> Algorithm {
        Algorithm::EmbeddingSimilarity
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }

    fn train(&mut self, samples: &[LabeledSample]) -> Result<Model> {
        let mut usable: Vec<(&str, Embedding)> = Vec::with_capacity(samples.len());
        for (index, sample) in samples.iter().enumerate() {
            match &sample.descriptor {
                Descriptor::Embedding(e) if e.dim() == self.dim => {
                    let unit = e.normalized();
                    if is_unit(&unit) {
                        usable.push((sample.label.as_str(), unit));
                    } else {
                        tracing::warn!(
                            index,
                            label = %sample.label,
                            "dropping training sample with non-finite or zero-norm embedding"
                        );
                    }
                }
                other => {
                    tracing::warn!(
                        index,
                        label = %sample.label,
                        expected = self.dim,
                        got = %other.shape(),
                        "dropping training sample with wrong shape"
                    );
                }
            }
        }
        if usable.is_empty() {
            return Err(AuthError::InsufficientData(format!(
                "no {}-dimensional embeddings among {} samples",
                self.dim,
                samples.len()
            )));
        }

        let (label_set, label_idx) = index_labels(usable.iter().map(|(label, _)| *label));
        let params = GalleryParams {
            dim: self.dim,
            embeddings: usable.iter().map(|(_, e)| e.values.clone()).collect(),
            labels: label_idx.clone(),
        };
        let model = Model::new(self.algorithm(), label_set.clone(), usable.len(), &params)?;

        tracing::info!(
            samples = usable.len(),
            dropped = samples.len() - usable.len(),
            labels = label_set.len(),
            dim = self.dim,
            "embedding recognizer trained"
        );

        self.gallery = Some(Gallery {
            labels: label_set,
            entries: usable
                .into_iter()
                .map(|(_, e)| e)
                .zip(label_idx)
                .collect(),
        });
        Ok(model)
    }

    fn is_ready(&self) -> bool {
        self.gallery.is_some()
    }

    fn predict(&self, descriptor: &Descriptor) -> Result<MatchDecision> {
        let gallery = self
            .gallery
            .as_ref()
            .ok_or_else(|| AuthError::Config("embedding recognizer has no model".into()))?;

        let probe = match descriptor {
            Descriptor::Embedding(e) if e.dim() == self.dim => e,
            other => {
                return Err(AuthError::Extraction(format!(
                    "expected embedding[{}], got {}",
                    self.dim,
                    other.shape()
                )))
            }
        };

        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;
        for (enrolled, label) in &gallery.entries {
            let sim = probe.similarity(enrolled);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(*label);
            }
        }

        Ok(match best_idx {
            Some(label) => MatchDecision {
                is_match: self.direction().passes(best_sim, self.threshold),
                score: best_sim,
                label: gallery.labels.get(label).cloned(),
            },
            None => MatchDecision {
                is_match: false,
                score: 0.0,
                label: None,
            },
        })
    }

    fn restore(&mut self, model: TaggedModel<'_>) -> Result<()> {
        let params: GalleryParams = model.decode_payload()?;
        if params.dim != self.dim {
            return Err(AuthError::Format(format!(
                "model holds {}-dimensional embeddings, recognizer expects {}",
                params.dim, self.dim
            )));
        }
        if params.embeddings.is_empty() || params.embeddings.len() != params.labels.len() {
            return Err(AuthError::Format("embedding gallery is empty or unlabelled".into()));
        }
        if let Some(bad) = params.embeddings.iter().position(|e| e.len() != self.dim) {
            return Err(AuthError::Format(format!(
                "gallery entry #{bad} is not {}-dimensional",
                self.dim
            )));
        }
        check_label_indices(&params.labels, model.label_set.len())?;

        let entries = params
            .embeddings
            .into_iter()
            .map(Embedding::new)
            .zip(params.labels)
            .collect();
        self.gallery = Some(Gallery {
            labels: model.label_set.clone(),
            entries,
        });
        tracing::debug!(labels = model.label_set.len(), "embedding model loaded");
        Ok(())
    }
}

/// A normalized embedding that can be persisted and compared: every
/// component finite and not all of them zero.
fn is_unit(e: &Embedding) -> bool {
    e.values.iter().all(|v| v.is_finite()) && e.values.iter().any(|&v| v != 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classic::{ClassicMethod, ClassicRecognizer};

    fn sample(values: &[f32], label: &str) -> LabeledSample {
        LabeledSample::new(Descriptor::Embedding(Embedding::new(values.to_vec())), label)
    }

    fn probe(values: &[f32]) -> Descriptor {
        Descriptor::Embedding(Embedding::new(values.to_vec()))
    }

    #[test]
    fn test_best_match_is_last_entry() {
        // Best match sits at the end; the whole gallery is compared.
        let mut rec = EmbeddingRecognizer::new(0.5, 3);
        rec.train(&[
            sample(&[0.0, 1.0, 0.0], "decoy1"),
            sample(&[0.0, 0.0, 1.0], "decoy2"),
            sample(&[1.0, 0.0, 0.0], "match"),
        ])
        .unwrap();

        let d = rec.predict(&probe(&[1.0, 0.0, 0.0])).unwrap();
        assert!(d.is_match);
        assert_eq!(d.label.as_deref(), Some("match"));
        assert!((d.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_direction() {
        // cos(probe, enrolled) = 0.7 and 0.3 respectively against threshold 0.5.
        let mut rec = EmbeddingRecognizer::new(0.5, 2);
        rec.train(&[sample(&[1.0, 0.0], "alice")]).unwrap();

        let high = [0.7f32, (1.0f32 - 0.49).sqrt()];
        let d = rec.predict(&probe(&high)).unwrap();
        assert!((d.score - 0.7).abs() < 1e-5);
        assert!(d.is_match);

        let low = [0.3f32, (1.0f32 - 0.09).sqrt()];
        let d = rec.predict(&probe(&low)).unwrap();
        assert!((d.score - 0.3).abs() < 1e-5);
        assert!(!d.is_match);
    }

    #[test]
    fn test_wrong_dimension_samples_are_dropped() {
        let mut rec = EmbeddingRecognizer::new(0.5, 3);
        let model = rec
            .train(&[
                sample(&[1.0, 0.0], "short"),
                sample(&[0.0, 1.0, 0.0], "alice"),
                LabeledSample::new(Descriptor::image(vec![0; 4], 2, 2), "image"),
            ])
            .unwrap();
        assert_eq!(model.label_set, vec!["alice"]);
        assert_eq!(model.sample_count, 1);
    }

    #[test]
    fn test_degenerate_embeddings_are_dropped_and_model_reloads() {
        let mut rec = EmbeddingRecognizer::new(0.5, 2);
        let model = rec
            .train(&[
                sample(&[1.0, 0.0], "alice"),
                sample(&[f32::NAN, 0.0], "nan"),
                sample(&[f32::INFINITY, 1.0], "inf"),
                sample(&[0.0, 0.0], "zero"),
            ])
            .unwrap();
        assert_eq!(model.label_set, vec!["alice"]);
        assert_eq!(model.sample_count, 1);

        let mut restored = EmbeddingRecognizer::new(0.5, 2);
        restored.load_bytes(&model.to_vec().unwrap()).unwrap();
        assert!(restored.predict(&probe(&[1.0, 0.0])).unwrap().is_match);
    }

    #[test]
    fn test_only_non_finite_is_insufficient() {
        let mut rec = EmbeddingRecognizer::new(0.5, 2);
        let err = rec.train(&[sample(&[f32::NAN, 1.0], "alice")]).unwrap_err();
        assert!(matches!(err, AuthError::InsufficientData(_)));
    }

    #[test]
    fn test_only_wrong_dimension_is_insufficient() {
        let mut rec = EmbeddingRecognizer::new(0.5, 3);
        let err = rec.train(&[sample(&[1.0, 0.0], "short")]).unwrap_err();
        assert!(matches!(err, AuthError::InsufficientData(_)));
        assert!(matches!(rec.train(&[]), Err(AuthError::InsufficientData(_))));
    }

    #[test]
    fn test_wrong_probe_dimension_is_recoverable() {
        let mut rec = EmbeddingRecognizer::new(0.5, 3);
        rec.train(&[sample(&[1.0, 0.0, 0.0], "alice")]).unwrap();
        assert!(rec.predict(&probe(&[1.0, 0.0])).unwrap_err().is_recoverable());
    }

    #[test]
    fn test_round_trip_preserves_verdicts() {
        let samples = [
            sample(&[1.0, 0.1, 0.0], "alice"),
            sample(&[0.9, 0.2, 0.1], "alice"),
            sample(&[0.0, 1.0, 0.3], "bob"),
        ];
        let mut rec = EmbeddingRecognizer::new(0.9, 3);
        let bytes = rec.train(&samples).unwrap().to_vec().unwrap();

        let mut restored = EmbeddingRecognizer::new(0.9, 3);
        restored.load_bytes(&bytes).unwrap();
        for s in &samples {
            let a = rec.predict(&s.descriptor).unwrap();
            let b = restored.predict(&s.descriptor).unwrap();
            assert_eq!(a.is_match, b.is_match);
            assert_eq!(a.label, b.label);
            assert!(b.is_match);
        }
    }

    #[test]
    fn test_loading_classic_model_is_format_error() {
        let img = |seed: u8| {
            Descriptor::image((0..400).map(|i| (i as u8).wrapping_mul(seed)).collect(), 20, 20)
        };
        let mut classic = ClassicRecognizer::new(ClassicMethod::Lbph, 40.0);
        let model = classic
            .train(&[LabeledSample::new(img(3), "alice"), LabeledSample::new(img(5), "alice")])
            .unwrap();

        let mut rec = EmbeddingRecognizer::new(0.5, 3);
        assert!(matches!(rec.load(&model), Err(AuthError::Format(_))));
        assert!(!rec.is_ready());
    }

    #[test]
    fn test_dimension_mismatch_on_load_is_format_error() {
        let mut rec = EmbeddingRecognizer::new(0.5, 3);
        let model = rec.train(&[sample(&[1.0, 0.0, 0.0], "alice")]).unwrap();
        let mut other = EmbeddingRecognizer::new(0.5, 128);
        assert!(matches!(other.load(&model), Err(AuthError::Format(_))));
    }
}
