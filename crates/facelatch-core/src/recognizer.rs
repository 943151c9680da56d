//! Recognition backends behind one normalized interface.
//!
//! Each backend owns its comparison direction, so callers only ever see
//! [`MatchDecision::is_match`]. Loading always goes through
//! [`Recognizer::load`], which checks the container's algorithm tag before
//! any backend-specific code sees the payload.

use crate::classic::{ClassicMethod, ClassicRecognizer};
use crate::config::AuthConfig;
use crate::embedding::EmbeddingRecognizer;
use crate::error::{AuthError, Result};
use crate::model::Model;
use crate::types::{Algorithm, Descriptor, LabeledSample, MatchDecision, ScoreDirection};
use std::collections::HashMap;
use std::ops::Deref;

/// A model whose algorithm tag matches the recognizer restoring it.
///
/// Only [`Recognizer::load`] constructs one, so `restore` implementations
/// never see a container meant for another backend.
pub struct TaggedModel<'a> {
    model: &'a Model,
}

impl Deref for TaggedModel<'_> {
    type Target = Model;

    fn deref(&self) -> &Model {
        self.model
    }
}

pub trait Recognizer: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// Threshold applied by [`predict`](Self::predict).
    fn threshold(&self) -> f32;

    fn direction(&self) -> ScoreDirection {
        self.algorithm().direction()
    }

    /// Train on `samples`, replacing any previous state, and return the
    /// persistable model.
    fn train(&mut self, samples: &[LabeledSample]) -> Result<Model>;

    /// Whether a trained or loaded model is in place.
    fn is_ready(&self) -> bool;

    /// Compare one probe against the trained model.
    ///
    /// A probe of the wrong shape is an [`AuthError::Extraction`] so the
    /// decision loop can retry with the next frame.
    fn predict(&self, descriptor: &Descriptor) -> Result<MatchDecision>;

    /// Backend-specific restore. Implementations must build the new state
    /// completely before replacing the old one.
    fn restore(&mut self, model: TaggedModel<'_>) -> Result<()>;

    /// Load a validated container. Fails with [`AuthError::Format`] if the
    /// container was written by a different backend; the recognizer's
    /// existing state is left untouched on any failure.
    fn load(&mut self, model: &Model) -> Result<()> {
        if model.algorithm != self.algorithm() {
            return Err(AuthError::Format(format!(
                "model was trained with {}, cannot load into {}",
                model.algorithm,
                self.algorithm()
            )));
        }
        self.restore(TaggedModel { model })
    }

    /// Parse, validate and load a serialized container.
    fn load_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let model = Model::from_slice(bytes)?;
        self.load(&model)
    }
}

/// Build the backend selected by `config.method`, untrained.
pub fn recognizer_for(config: &AuthConfig) -> Box<dyn Recognizer> {
    let threshold = config.threshold();
    match config.method {
        Algorithm::ClassicLbph => Box::new(ClassicRecognizer::new(ClassicMethod::Lbph, threshold)),
        Algorithm::ClassicEigen => {
            Box::new(ClassicRecognizer::new(ClassicMethod::Eigen, threshold))
        }
        Algorithm::ClassicFisher => {
            Box::new(ClassicRecognizer::new(ClassicMethod::Fisher, threshold))
        }
        Algorithm::EmbeddingSimilarity => {
            Box::new(EmbeddingRecognizer::new(threshold, config.embedding_dim))
        }
    }
}

/// Distinct labels in first-seen order plus each label's index.
pub(crate) fn index_labels<'a, I>(labels: I) -> (Vec<String>, Vec<usize>)
where
    I: IntoIterator<Item = &'a str>,
{
    let mut set: Vec<String> = Vec::new();
    let mut lookup: HashMap<&'a str, usize> = HashMap::new();
    let indices = labels
        .into_iter()
        .map(|label| {
            *lookup.entry(label).or_insert_with(|| {
                set.push(label.to_string());
                set.len() - 1
            })
        })
        .collect();
    (set, indices)
}

/// Check that payload label indices all refer into the container's label set.
pub(crate) fn check_label_indices(indices: &[usize], label_count: usize) -> Result<()> {
    match indices.iter().find(|&&i| i >= label_count) {
        Some(bad) => Err(AuthError::Format(format!(
            "payload references label #{bad}, label set has {label_count}"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_labels_keeps_first_seen_order() {
        let (set, idx) = index_labels(["bob", "alice", "bob", "carol", "alice"]);
        assert_eq!(set, vec!["bob", "alice", "carol"]);
        assert_eq!(idx, vec![0, 1, 0, 2, 1]);
    }

    #[test]
    fn check_label_indices_rejects_out_of_range() {
        assert!(check_label_indices(&[0, 1], 2).is_ok());
        assert!(matches!(check_label_indices(&[0, 2], 2), Err(AuthError::Format(_))));
    }

    #[test]
    fn recognizer_for_follows_config() {
        for method in Algorithm::ALL {
            let config = AuthConfig {
                method,
                ..AuthConfig::default()
            };
            let rec = recognizer_for(&config);
            assert_eq!(rec.algorithm(), method);
            assert_eq!(rec.threshold(), method.default_threshold());
            assert!(!rec.is_ready());
        }
    }
}
