//! Authentication configuration.
//!
//! One [`AuthConfig`] value is built at startup and passed by reference into
//! the training pipeline and the decision engine. There is no global state.

use crate::error::{AuthError, Result};
use crate::types::Algorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/facelatch/config.toml";
const DEFAULT_MODEL_DIR: &str = "/var/lib/facelatch/models";
/// Longest session or capture window a config may ask for.
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// What to do when the user has no enrolled model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingModelPolicy {
    /// Count as an authentication failure.
    #[default]
    Fail,
    /// Report an error so the host can fall through to other factors.
    Defer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Recognition backend.
    pub method: Algorithm,
    /// Match threshold; `None` uses [`Algorithm::default_threshold`].
    pub threshold: Option<f32>,
    /// Session length. No new frame is requested after it elapses.
    pub timeout_seconds: u64,
    /// Fewest usable samples a training run accepts.
    pub min_samples: usize,
    /// Minimum pause between sampling attempts.
    pub frame_interval_ms: u64,
    /// Optional cap on evaluated frames per session.
    pub max_frames: Option<u32>,
    pub missing_model: MissingModelPolicy,
    /// Side length of the square grayscale crop fed to classic recognizers.
    pub descriptor_size: u32,
    /// Expected embedding dimension for the embedding recognizer.
    pub embedding_dim: usize,
    pub model_dir: PathBuf,
    /// V4L2 device path.
    pub camera_device: String,
    /// Fraction of near-black pixels above which a frame counts as dark.
    pub dark_threshold: f32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: Algorithm::ClassicLbph,
            threshold: None,
            timeout_seconds: 4,
            min_samples: 5,
            frame_interval_ms: 100,
            max_frames: None,
            missing_model: MissingModelPolicy::Fail,
            descriptor_size: 64,
            embedding_dim: 512,
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            camera_device: "/dev/video2".to_string(),
            dark_threshold: 0.95,
        }
    }
}

impl AuthConfig {
    /// Load from a TOML file (defaults if it does not exist), apply
    /// `FACELATCH_*` environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| AuthError::io(path, e))?;
            Self::from_toml_str(&raw)
                .map_err(|e| AuthError::Config(format!("{}: {e}", path.display())))?
        } else {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| AuthError::Config(e.to_string()))
    }

    /// Override fields from `FACELATCH_*` variables read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FACELATCH_METHOD") {
            self.method = v.parse().map_err(AuthError::Config)?;
        }
        if let Some(v) = lookup("FACELATCH_THRESHOLD") {
            self.threshold = Some(parse_env("FACELATCH_THRESHOLD", &v)?);
        }
        if let Some(v) = lookup("FACELATCH_TIMEOUT_SECS") {
            self.timeout_seconds = parse_env("FACELATCH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("FACELATCH_FRAME_INTERVAL_MS") {
            self.frame_interval_ms = parse_env("FACELATCH_FRAME_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("FACELATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACELATCH_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let threshold = self.threshold();
        if !threshold.is_finite() {
            return Err(AuthError::Config(format!("threshold must be finite, got {threshold}")));
        }
        if self.method.is_classic() && threshold < 0.0 {
            return Err(AuthError::Config(format!(
                "{} threshold is a distance and must be >= 0, got {threshold}",
                self.method
            )));
        }
        if !self.method.is_classic() && !(-1.0..=1.0).contains(&threshold) {
            return Err(AuthError::Config(format!(
                "similarity threshold must lie in [-1, 1], got {threshold}"
            )));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_seconds) {
            return Err(AuthError::Config(format!(
                "timeout_seconds must lie in [1, {MAX_TIMEOUT_SECS}], got {}",
                self.timeout_seconds
            )));
        }
        if self.min_samples == 0 {
            return Err(AuthError::Config("min_samples must be at least 1".into()));
        }
        if self.descriptor_size < 16 {
            return Err(AuthError::Config(format!(
                "descriptor_size must be at least 16, got {}",
                self.descriptor_size
            )));
        }
        if self.embedding_dim == 0 {
            return Err(AuthError::Config("embedding_dim must be non-zero".into()));
        }
        if self.max_frames == Some(0) {
            return Err(AuthError::Config("max_frames must be at least 1 when set".into()));
        }
        if !(0.0..=1.0).contains(&self.dark_threshold) {
            return Err(AuthError::Config(format!(
                "dark_threshold must lie in [0, 1], got {}",
                self.dark_threshold
            )));
        }
        Ok(())
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
            .unwrap_or_else(|| self.method.default_threshold())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Canonical model location for `user`.
    ///
    /// Fails with [`AuthError::Config`] for names that would escape
    /// `model_dir`.
    pub fn model_path(&self, user: &str) -> Result<PathBuf> {
        if !is_valid_username(user) {
            return Err(AuthError::Config(format!("refusing username {user:?}")));
        }
        Ok(self.model_dir.join(format!("{user}.model.json")))
    }
}

/// Usernames become file names under the model directory.
pub fn is_valid_username(user: &str) -> bool {
    !user.is_empty()
        && user != "."
        && user != ".."
        && !user.contains(['/', '\\', '\0'])
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AuthError::Config(format!("{key}: cannot parse '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = AuthConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_samples, 5);
        assert_eq!(config.threshold(), Algorithm::ClassicLbph.default_threshold());
    }

    #[test]
    fn parses_partial_toml() {
        let config = AuthConfig::from_toml_str(
            r#"
            method = "embedding_similarity"
            threshold = 0.5
            timeout_seconds = 7
            missing_model = "defer"
            "#,
        )
        .unwrap();
        assert_eq!(config.method, Algorithm::EmbeddingSimilarity);
        assert_eq!(config.threshold(), 0.5);
        assert_eq!(config.timeout(), Duration::from_secs(7));
        assert_eq!(config.missing_model, MissingModelPolicy::Defer);
        assert_eq!(config.frame_interval_ms, 100);
    }

    #[test]
    fn rejects_unknown_method_and_fields() {
        assert!(matches!(
            AuthConfig::from_toml_str("method = \"opencv_magic\""),
            Err(AuthError::Config(_))
        ));
        assert!(matches!(
            AuthConfig::from_toml_str("treshold = 3.0"),
            Err(AuthError::Config(_))
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = AuthConfig {
            timeout_seconds: 0,
            ..AuthConfig::default()
        };
        assert!(config.validate().is_err());

        config.timeout_seconds = u64::MAX;
        assert!(config.validate().is_err());
        config.timeout_seconds = MAX_TIMEOUT_SECS;
        config.validate().unwrap();

        config.timeout_seconds = 3;
        config.method = Algorithm::EmbeddingSimilarity;
        config.threshold = Some(40.0);
        assert!(config.validate().is_err());

        config.method = Algorithm::ClassicEigen;
        config.threshold = Some(-1.0);
        assert!(config.validate().is_err());

        config.threshold = Some(f32::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("FACELATCH_METHOD", "classic_fisher"),
            ("FACELATCH_THRESHOLD", "3.5"),
            ("FACELATCH_TIMEOUT_SECS", "9"),
            ("FACELATCH_MODEL_DIR", "/tmp/models"),
        ]
        .into_iter()
        .collect();

        let mut config = AuthConfig::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.method, Algorithm::ClassicFisher);
        assert_eq!(config.threshold(), 3.5);
        assert_eq!(config.timeout_seconds, 9);
        assert_eq!(
            config.model_path("alice").unwrap(),
            PathBuf::from("/tmp/models/alice.model.json")
        );
    }

    #[test]
    fn env_override_with_garbage_is_config_error() {
        let mut config = AuthConfig::default();
        let err = config
            .apply_env_overrides(|k| (k == "FACELATCH_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, AuthError::Config(_)));
    }

    #[test]
    fn model_path_refuses_names_that_escape_model_dir() {
        let config = AuthConfig::default();
        for user in ["", ".", "..", "../../etc/x", "a/b", "nul\0byte"] {
            assert!(
                matches!(config.model_path(user), Err(AuthError::Config(_))),
                "accepted {user:?}"
            );
        }
        assert!(config.model_path("alice.smith").is_ok());
        assert!(is_valid_username("svc-backup_1"));
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.method, AuthConfig::default().method);
    }
}
