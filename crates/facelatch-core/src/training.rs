//! Enrollment: gather labeled descriptors, train the configured backend and
//! persist the result.

use crate::config::AuthConfig;
use crate::engine::{CancelToken, DescriptorExtractor, FrameSource, SessionLimits};
use crate::error::{AuthError, Result};
use crate::model::{Model, ModelStore};
use crate::recognizer::recognizer_for;
use crate::types::LabeledSample;
use std::path::Path;
use std::time::Instant;

pub struct TrainingPipeline<'a> {
    config: &'a AuthConfig,
    store: &'a dyn ModelStore,
}

impl<'a> TrainingPipeline<'a> {
    pub fn new(config: &'a AuthConfig, store: &'a dyn ModelStore) -> Self {
        Self { config, store }
    }

    /// Train on `samples` and write the model for `user` under the configured
    /// model directory.
    pub fn enroll(&self, user: &str, samples: &[LabeledSample], force: bool) -> Result<Model> {
        self.train_to(&self.config.model_path(user)?, samples, force)
    }

    /// Train on `samples` and write the model to `path`.
    ///
    /// Nothing is written unless training succeeds with at least
    /// `min_samples` usable samples. An existing model is only replaced when
    /// `force` is set.
    pub fn train_to(&self, path: &Path, samples: &[LabeledSample], force: bool) -> Result<Model> {
        self.config.validate()?;

        if !force && self.store.exists(path) {
            return Err(AuthError::ModelExists(path.to_path_buf()));
        }

        let min = self.config.min_samples;
        if samples.len() < min {
            return Err(AuthError::InsufficientData(format!(
                "{} samples given, at least {min} required",
                samples.len()
            )));
        }

        let mut recognizer = recognizer_for(self.config);
        let model = recognizer.train(samples)?;
        if model.sample_count < min {
            return Err(AuthError::InsufficientData(format!(
                "{} of {} samples usable, at least {min} required",
                model.sample_count,
                samples.len()
            )));
        }

        self.store.write(path, &model)?;
        tracing::info!(
            path = %path.display(),
            algorithm = %model.algorithm,
            samples = model.sample_count,
            replaced = force,
            "enrollment complete"
        );
        Ok(model)
    }
}

/// Pull frames until `count` descriptors are gathered for `label`, the
/// deadline in `limits` passes, or `cancel` fires.
///
/// Frames that yield no descriptor are skipped. Running out of time is not an
/// error: whatever was gathered is returned and the pipeline's minimum-sample
/// policy decides.
pub fn collect_samples<S, X>(
    source: &mut S,
    extractor: &mut X,
    label: &str,
    count: usize,
    limits: SessionLimits,
    cancel: &CancelToken,
) -> Result<Vec<LabeledSample>>
where
    S: FrameSource,
    X: DescriptorExtractor<Frame = S::Frame>,
{
    let deadline = limits.deadline_from(Instant::now())?;
    let mut samples = Vec::with_capacity(count);
    let mut frames = 0u64;

    while samples.len() < count {
        if cancel.is_cancelled() {
            return Err(AuthError::Resource("enrollment cancelled".into()));
        }
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(
                collected = samples.len(),
                wanted = count,
                frames,
                "capture window closed early"
            );
            break;
        }

        if let Some(frame) = source.next_frame()? {
            frames += 1;
            match extractor.extract(&frame) {
                Ok(descriptor) => {
                    samples.push(LabeledSample::new(descriptor, label));
                    tracing::debug!(collected = samples.len(), wanted = count, "sample captured");
                }
                Err(e) if e.is_recoverable() => {
                    tracing::debug!(frame = frames, error = %e, "frame skipped");
                }
                Err(e) => return Err(e),
            }
        }

        if samples.len() < count {
            let nap = limits
                .frame_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            if !nap.is_zero() {
                std::thread::sleep(nap);
            }
        }
    }

    tracing::info!(label, collected = samples.len(), frames, "capture finished");
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Algorithm, Descriptor, Embedding};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryStore {
        models: Mutex<HashMap<PathBuf, Model>>,
    }

    impl MemoryStore {
        fn len(&self) -> usize {
            self.models.lock().unwrap().len()
        }
    }

    impl ModelStore for MemoryStore {
        fn exists(&self, path: &Path) -> bool {
            self.models.lock().unwrap().contains_key(path)
        }

        fn read(&self, path: &Path) -> Result<Model> {
            self.models
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| AuthError::ModelMissing(path.to_path_buf()))
        }

        fn write(&self, path: &Path, model: &Model) -> Result<()> {
            self.models
                .lock()
                .unwrap()
                .insert(path.to_path_buf(), model.clone());
            Ok(())
        }
    }

    fn config() -> AuthConfig {
        AuthConfig {
            method: Algorithm::EmbeddingSimilarity,
            embedding_dim: 3,
            min_samples: 2,
            model_dir: PathBuf::from("/models"),
            ..AuthConfig::default()
        }
    }

    fn emb(values: [f32; 3]) -> Descriptor {
        Descriptor::Embedding(Embedding::new(values.to_vec()))
    }

    fn batch(n: usize) -> Vec<LabeledSample> {
        (0..n)
            .map(|i| LabeledSample::new(emb([1.0, i as f32 * 0.1, 0.0]), "alice"))
            .collect()
    }

    #[test]
    fn test_enroll_writes_model() {
        let store = MemoryStore::default();
        let config = config();
        let model = TrainingPipeline::new(&config, &store)
            .enroll("alice", &batch(3), false)
            .unwrap();

        assert_eq!(model.sample_count, 3);
        let stored = store.read(Path::new("/models/alice.model.json")).unwrap();
        assert_eq!(stored, model);
    }

    #[test]
    fn test_empty_batch_writes_nothing() {
        let store = MemoryStore::default();
        let config = config();
        let err = TrainingPipeline::new(&config, &store)
            .enroll("alice", &[], false)
            .unwrap_err();
        assert!(matches!(err, AuthError::InsufficientData(_)));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_too_few_usable_samples_writes_nothing() {
        let store = MemoryStore::default();
        let config = config();
        // Two samples given, only one has the configured dimension.
        let samples = [
            LabeledSample::new(emb([1.0, 0.0, 0.0]), "alice"),
            LabeledSample::new(Descriptor::Embedding(Embedding::new(vec![1.0])), "alice"),
        ];
        let err = TrainingPipeline::new(&config, &store)
            .enroll("alice", &samples, false)
            .unwrap_err();
        assert!(matches!(err, AuthError::InsufficientData(_)));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_non_finite_samples_do_not_count() {
        let store = MemoryStore::default();
        let config = config();
        let samples = [
            LabeledSample::new(emb([1.0, 0.0, 0.0]), "alice"),
            LabeledSample::new(emb([f32::NAN, 0.0, 0.0]), "alice"),
        ];
        let err = TrainingPipeline::new(&config, &store)
            .enroll("alice", &samples, false)
            .unwrap_err();
        assert!(matches!(err, AuthError::InsufficientData(_)));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_username_outside_model_dir_is_refused() {
        let store = MemoryStore::default();
        let config = config();
        let err = TrainingPipeline::new(&config, &store)
            .enroll("../../etc/x", &batch(3), false)
            .unwrap_err();
        assert!(matches!(err, AuthError::Config(_)));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_existing_model_needs_force() {
        let store = MemoryStore::default();
        let config = config();
        let pipeline = TrainingPipeline::new(&config, &store);
        pipeline.enroll("alice", &batch(2), false).unwrap();

        let err = pipeline.enroll("alice", &batch(4), false).unwrap_err();
        assert!(matches!(err, AuthError::ModelExists(_)));
        let kept = store.read(&config.model_path("alice").unwrap()).unwrap();
        assert_eq!(kept.sample_count, 2);

        let replaced = pipeline.enroll("alice", &batch(4), true).unwrap();
        assert_eq!(replaced.sample_count, 4);
        assert_eq!(store.read(&config.model_path("alice").unwrap()).unwrap().sample_count, 4);
    }

    #[test]
    fn test_invalid_config_is_rejected_before_training() {
        let store = MemoryStore::default();
        let config = AuthConfig {
            threshold: Some(3.0),
            ..config()
        };
        let err = TrainingPipeline::new(&config, &store)
            .enroll("alice", &batch(3), false)
            .unwrap_err();
        assert!(matches!(err, AuthError::Config(_)));
    }

    struct Frames(Vec<Option<bool>>);

    impl FrameSource for Frames {
        type Frame = bool;

        fn next_frame(&mut self) -> Result<Option<bool>> {
            Ok(if self.0.is_empty() { None } else { self.0.remove(0) })
        }
    }

    /// `true` frames carry a face, `false` frames do not.
    struct FaceOrNot;

    impl DescriptorExtractor for FaceOrNot {
        type Frame = bool;

        fn extract(&mut self, frame: &bool) -> Result<Descriptor> {
            if *frame {
                Ok(emb([1.0, 0.0, 0.0]))
            } else {
                Err(AuthError::Extraction("no face".into()))
            }
        }
    }

    fn capture_limits(timeout_ms: u64) -> SessionLimits {
        SessionLimits {
            timeout: Duration::from_millis(timeout_ms),
            frame_interval: Duration::from_millis(1),
            max_frames: None,
        }
    }

    #[test]
    fn test_collect_skips_unusable_frames() {
        let mut source = Frames(vec![Some(false), None, Some(true), Some(false), Some(true), Some(true)]);
        let samples = collect_samples(
            &mut source,
            &mut FaceOrNot,
            "alice",
            2,
            capture_limits(5_000),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.label == "alice"));
        // The last frame was never requested.
        assert_eq!(source.0, vec![Some(true)]);
    }

    #[test]
    fn test_collect_returns_partial_batch_at_deadline() {
        let mut source = Frames(vec![Some(true)]);
        let samples = collect_samples(
            &mut source,
            &mut FaceOrNot,
            "alice",
            5,
            capture_limits(100),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn test_collect_honours_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = collect_samples(
            &mut Frames(vec![Some(true)]),
            &mut FaceOrNot,
            "alice",
            1,
            capture_limits(1_000),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::Resource(_)));
    }

    #[test]
    fn test_collect_rejects_unrepresentable_window() {
        let limits = SessionLimits {
            timeout: Duration::MAX,
            ..capture_limits(0)
        };
        let mut source = Frames(vec![Some(true)]);
        let err = collect_samples(&mut source, &mut FaceOrNot, "alice", 1, limits, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, AuthError::Config(_)));
        assert_eq!(source.0, vec![Some(true)]);
    }
}
