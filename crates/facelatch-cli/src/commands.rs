use anyhow::{bail, Context, Result};
use facelatch_core::{
    collect_samples, decide, AuthConfig, AuthError, CancelToken, Decision, Descriptor, Embedding,
    ErrorKind, FailureReason, FilesystemModelStore, LabeledSample, ModelHeader, ModelStore,
    SessionLimits, TrainingPipeline,
};
use facelatch_hw::{Camera, GrayscaleExtractor};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
}

impl Output {
    fn model(&self, action: &str, path: &Path, header: &ModelHeader) -> Result<()> {
        if self.json {
            let payload = json!({ "action": action, "path": path, "model": header });
            println!("{}", serde_json::to_string(&payload)?);
        } else {
            if !action.is_empty() {
                println!("{action}: {}", path.display());
            }
            println!("  algorithm: {}", header.algorithm);
            println!("  version:   {}", header.version);
            println!("  created:   {}", header.created_at.to_rfc3339());
            println!("  samples:   {}", header.sample_count);
            println!("  labels:    {}", header.label_set.join(", "));
        }
        Ok(())
    }

    fn decision(&self, user: &str, decision: &Decision) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(&decision_json(user, decision))?);
        } else {
            println!("{user}: {}", describe(decision));
        }
        Ok(())
    }
}

pub async fn enroll(
    config: AuthConfig,
    user: &str,
    count: usize,
    seconds: u64,
    force: bool,
    out: Output,
) -> Result<ExitCode> {
    require_camera_method(&config)?;
    let path = config.model_path(user)?;
    if !force && FilesystemModelStore.exists(&path) {
        return Err(AuthError::ModelExists(path.clone()).into());
    }

    let limits = SessionLimits {
        timeout: Duration::from_secs(seconds),
        frame_interval: config.frame_interval(),
        max_frames: None,
    };
    let cancel = cancel_on_ctrl_c();
    let capture_config = config.clone();
    let label = user.to_string();
    tracing::info!(user, count, seconds, "capturing enrollment frames");

    let samples = tokio::task::spawn_blocking(move || -> Result<Vec<LabeledSample>> {
        let camera = Camera::open(&capture_config.camera_device)?;
        let mut stream =
            camera.stream(capture_config.dark_threshold, capture_config.frame_interval())?;
        let mut extractor = GrayscaleExtractor::from_config(&capture_config);
        let samples = collect_samples(&mut stream, &mut extractor, &label, count, limits, &cancel)?;
        tracing::debug!(
            dark_frames = stream.dark_frames(),
            skipped_frames = stream.skipped_frames(),
            "capture stream closed"
        );
        Ok(samples)
    })
    .await
    .context("capture task failed")??;

    let model = TrainingPipeline::new(&config, &FilesystemModelStore)
        .enroll(user, &samples, force)
        .with_context(|| format!("enrolling {user}"))?;
    out.model("enrolled", &path, &model.header())?;
    Ok(ExitCode::SUCCESS)
}

pub fn train(
    config: &AuthConfig,
    user: &str,
    files: &[PathBuf],
    force: bool,
    out: Output,
) -> Result<ExitCode> {
    let samples = if config.method.is_classic() {
        let extractor = GrayscaleExtractor::from_config(config);
        files
            .iter()
            .map(|path| {
                extractor
                    .extract_path(path)
                    .map(|d| LabeledSample::new(d, user))
                    .with_context(|| format!("reading {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        let mut samples = Vec::new();
        for path in files {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let embeddings =
                parse_embeddings(&raw).with_context(|| format!("parsing {}", path.display()))?;
            samples.extend(embeddings.into_iter().map(|values| {
                LabeledSample::new(Descriptor::Embedding(Embedding::new(values)), user)
            }));
        }
        samples
    };

    let path = config.model_path(user)?;
    let model = TrainingPipeline::new(config, &FilesystemModelStore)
        .enroll(user, &samples, force)
        .with_context(|| format!("training {user}"))?;
    out.model("trained", &path, &model.header())?;
    Ok(ExitCode::SUCCESS)
}

pub async fn test(config: AuthConfig, user: &str, out: Output) -> Result<ExitCode> {
    require_camera_method(&config)?;
    let cancel = cancel_on_ctrl_c();
    let path = config.model_path(user)?;
    let session_config = config.clone();

    let decision = tokio::task::spawn_blocking(move || -> Result<Decision> {
        let camera = Camera::open(&session_config.camera_device)?;
        let mut stream =
            camera.stream(session_config.dark_threshold, session_config.frame_interval())?;
        let mut extractor = GrayscaleExtractor::from_config(&session_config);
        Ok(decide(
            &session_config,
            &FilesystemModelStore,
            &path,
            &mut stream,
            &mut extractor,
            &cancel,
        ))
    })
    .await
    .context("session task failed")??;

    out.decision(user, &decision)?;
    Ok(ExitCode::from(exit_status(&decision)))
}

pub fn info(path: &Path, out: Output) -> Result<ExitCode> {
    let model = FilesystemModelStore.read(path)?;
    out.model("", path, &model.header())?;
    Ok(ExitCode::SUCCESS)
}

fn require_camera_method(config: &AuthConfig) -> Result<()> {
    if !config.method.is_classic() {
        bail!(
            "{} needs an external embedding extractor; enroll with `facelatch train` and embedding files",
            config.method
        );
    }
    Ok(())
}

/// Cancel the returned token on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted; cancelling");
            trigger.cancel();
        }
    });
    cancel
}

/// Either one embedding (`[0.1, ...]`) or several (`[[0.1, ...], ...]`).
fn parse_embeddings(raw: &str) -> Result<Vec<Vec<f32>>> {
    if let Ok(many) = serde_json::from_str::<Vec<Vec<f32>>>(raw) {
        return Ok(many);
    }
    let one: Vec<f32> = serde_json::from_str(raw)
        .context("expected an embedding or an array of embeddings")?;
    Ok(vec![one])
}

fn describe(decision: &Decision) -> String {
    match decision {
        Decision::Success { label, score } => format!("match as {label} (score {score:.3})"),
        Decision::Failure {
            reason: FailureReason::NoModel,
        } => "no enrolled model".to_string(),
        Decision::Failure {
            reason: FailureReason::NoMatch { frames, best_score },
        } => match best_score {
            Some(best) => format!("no match after {frames} frames (best score {best:.3})"),
            None => format!("no match after {frames} frames"),
        },
        Decision::Timeout => "timed out".to_string(),
        Decision::Error { kind, detail } => format!("{} error: {detail}", kind_name(*kind)),
    }
}

fn kind_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Config => "config",
        ErrorKind::Format => "format",
        ErrorKind::Resource => "resource",
        ErrorKind::Cancelled => "cancelled",
        ErrorKind::ModelMissing => "model_missing",
    }
}

fn decision_json(user: &str, decision: &Decision) -> serde_json::Value {
    match decision {
        Decision::Success { label, score } => {
            json!({ "user": user, "outcome": "success", "label": label, "score": score })
        }
        Decision::Failure {
            reason: FailureReason::NoModel,
        } => json!({ "user": user, "outcome": "failure", "reason": "no_model" }),
        Decision::Failure {
            reason: FailureReason::NoMatch { frames, best_score },
        } => json!({
            "user": user,
            "outcome": "failure",
            "reason": "no_match",
            "frames": frames,
            "best_score": best_score,
        }),
        Decision::Timeout => json!({ "user": user, "outcome": "timeout" }),
        Decision::Error { kind, detail } => json!({
            "user": user,
            "outcome": "error",
            "kind": kind_name(*kind),
            "detail": detail,
        }),
    }
}

/// 0 on success, 1 on a rejected face, 2 when no verdict could be reached.
fn exit_status(decision: &Decision) -> u8 {
    match decision {
        Decision::Success { .. } => 0,
        Decision::Failure { .. } | Decision::Timeout => 1,
        Decision::Error { .. } => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facelatch_core::Algorithm;

    #[test]
    fn test_parse_single_and_many_embeddings() {
        assert_eq!(parse_embeddings("[0.5, 1.0]").unwrap(), vec![vec![0.5, 1.0]]);
        assert_eq!(
            parse_embeddings("[[1, 0], [0, 1]]").unwrap(),
            vec![vec![1.0, 0.0], vec![0.0, 1.0]]
        );
        assert!(parse_embeddings("{\"values\": [1]}").is_err());
    }

    #[test]
    fn test_decision_rendering() {
        let success = Decision::Success {
            label: "alice".into(),
            score: 0.875,
        };
        assert_eq!(describe(&success), "match as alice (score 0.875)");
        assert_eq!(decision_json("alice", &success)["outcome"], "success");

        let missing = Decision::Error {
            kind: ErrorKind::ModelMissing,
            detail: "gone".into(),
        };
        assert_eq!(describe(&missing), "model_missing error: gone");
        assert_eq!(decision_json("bob", &missing)["kind"], "model_missing");
        assert_eq!(describe(&Decision::Timeout), "timed out");
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(&Decision::Timeout), 1);
        assert_eq!(
            exit_status(&Decision::Error {
                kind: ErrorKind::Resource,
                detail: String::new()
            }),
            2
        );
        assert_eq!(
            exit_status(&Decision::Success {
                label: "alice".into(),
                score: 1.0
            }),
            0
        );
    }

    #[test]
    fn test_embedding_method_cannot_use_camera() {
        let config = AuthConfig {
            method: Algorithm::EmbeddingSimilarity,
            threshold: Some(0.5),
            ..AuthConfig::default()
        };
        assert!(require_camera_method(&config).is_err());
        assert!(require_camera_method(&AuthConfig::default()).is_ok());
    }

    #[test]
    fn test_train_from_embedding_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig {
            method: Algorithm::EmbeddingSimilarity,
            threshold: Some(0.5),
            embedding_dim: 3,
            min_samples: 3,
            model_dir: dir.path().join("models"),
            ..AuthConfig::default()
        };
        let first = dir.path().join("a.json");
        let second = dir.path().join("b.json");
        std::fs::write(&first, "[[1, 0, 0], [0.9, 0.1, 0]]").unwrap();
        std::fs::write(&second, "[1, 0.2, 0]").unwrap();

        train(&config, "alice", &[first, second], false, Output { json: true }).unwrap();

        let model = FilesystemModelStore.read(&config.model_path("alice").unwrap()).unwrap();
        assert_eq!(model.sample_count, 3);
        assert_eq!(model.label_set, vec!["alice"]);
    }

    #[test]
    fn test_train_refuses_username_outside_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig {
            method: Algorithm::EmbeddingSimilarity,
            threshold: Some(0.5),
            embedding_dim: 2,
            min_samples: 1,
            model_dir: dir.path().join("models"),
            ..AuthConfig::default()
        };
        let file = dir.path().join("a.json");
        std::fs::write(&file, "[1, 0]").unwrap();

        assert!(train(&config, "../../x", &[file], false, Output { json: true }).is_err());
        assert!(!dir.path().parent().unwrap().join("x.model.json").exists());
        assert!(!dir.path().join("models").exists());
    }
}
