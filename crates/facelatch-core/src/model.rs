//! Versioned model container and its on-disk store.
//!
//! The container is JSON:
//!
//! ```json
//! {
//!   "version": 1,
//!   "algorithm": "classic_lbph",
//!   "created_at": "2026-10-16T09:30:00Z",
//!   "label_set": ["alice"],
//!   "sample_count": 8,
//!   "payload": { ... algorithm-specific ... }
//! }
//! ```
//!
//! Reads are validated in full before anything is handed to a recognizer.
//! Writes go through a temp file in the target directory and are renamed into
//! place, so the canonical path never holds a half-written model.

use crate::error::{AuthError, Result};
use crate::types::Algorithm;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Version written by this build.
pub const FORMAT_VERSION: u32 = 1;
/// Newest version this build can read.
pub const MAX_SUPPORTED_VERSION: u32 = 1;
/// Reads larger than this are rejected before parsing.
pub const MAX_MODEL_BYTES: u64 = 256 * 1024 * 1024;

/// A trained, immutable recognizer snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub version: u32,
    pub algorithm: Algorithm,
    pub created_at: DateTime<Utc>,
    /// Distinct labels in first-seen order. Payloads refer to labels by index.
    pub label_set: Vec<String>,
    pub sample_count: usize,
    pub payload: serde_json::Value,
}

/// Container metadata without the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelHeader {
    pub version: u32,
    pub algorithm: Algorithm,
    pub created_at: DateTime<Utc>,
    pub label_set: Vec<String>,
    pub sample_count: usize,
}

/// Wire shape used for parsing, so that version and tag can be checked
/// with precise errors before the typed container is built.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModel {
    version: u32,
    algorithm: String,
    created_at: DateTime<Utc>,
    label_set: Vec<String>,
    sample_count: usize,
    payload: serde_json::Value,
}

impl Model {
    /// Build a container for freshly trained parameters.
    pub fn new<P: Serialize>(
        algorithm: Algorithm,
        label_set: Vec<String>,
        sample_count: usize,
        payload: &P,
    ) -> Result<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| AuthError::Format(format!("serializing {algorithm} payload: {e}")))?;
        let model = Self {
            version: FORMAT_VERSION,
            algorithm,
            created_at: Utc::now(),
            label_set,
            sample_count,
            payload,
        };
        validate_label_set(&model.label_set)?;
        Ok(model)
    }

    pub fn header(&self) -> ModelHeader {
        ModelHeader {
            version: self.version,
            algorithm: self.algorithm,
            created_at: self.created_at,
            label_set: self.label_set.clone(),
            sample_count: self.sample_count,
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| AuthError::Format(e.to_string()))
    }

    /// Parse and validate a serialized container.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() as u64 > MAX_MODEL_BYTES {
            return Err(AuthError::Format(format!(
                "model is {} bytes, limit is {MAX_MODEL_BYTES}",
                bytes.len()
            )));
        }
        let raw: RawModel = serde_json::from_slice(bytes)
            .map_err(|e| AuthError::Format(format!("malformed model container: {e}")))?;

        if raw.version == 0 || raw.version > MAX_SUPPORTED_VERSION {
            return Err(AuthError::Format(format!(
                "unsupported model version {} (max supported {MAX_SUPPORTED_VERSION})",
                raw.version
            )));
        }
        let algorithm: Algorithm = raw.algorithm.parse().map_err(AuthError::Format)?;
        validate_label_set(&raw.label_set)?;
        if raw.sample_count == 0 {
            return Err(AuthError::Format("model records zero training samples".into()));
        }

        Ok(Self {
            version: raw.version,
            algorithm,
            created_at: raw.created_at,
            label_set: raw.label_set,
            sample_count: raw.sample_count,
            payload: raw.payload,
        })
    }

    /// Decode the payload into the variant's parameter type.
    pub fn decode_payload<P: DeserializeOwned>(&self) -> Result<P> {
        P::deserialize(&self.payload).map_err(|e| {
            AuthError::Format(format!("invalid {} payload: {e}", self.algorithm))
        })
    }
}

fn validate_label_set(labels: &[String]) -> Result<()> {
    if labels.is_empty() {
        return Err(AuthError::Format("label set is empty".into()));
    }
    let mut seen = HashSet::with_capacity(labels.len());
    for label in labels {
        if !seen.insert(label.as_str()) {
            return Err(AuthError::Format(format!("duplicate label '{label}' in label set")));
        }
    }
    Ok(())
}

/// Persistence seam for models. The filesystem implementation is the only
/// production one; tests substitute in-memory stores.
pub trait ModelStore {
    fn exists(&self, path: &Path) -> bool;
    fn read(&self, path: &Path) -> Result<Model>;
    fn write(&self, path: &Path, model: &Model) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemModelStore;

impl ModelStore for FilesystemModelStore {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read(&self, path: &Path) -> Result<Model> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthError::ModelMissing(path.to_path_buf()))
            }
            Err(e) => return Err(AuthError::io(path, e)),
        };
        if meta.len() > MAX_MODEL_BYTES {
            return Err(AuthError::Format(format!(
                "{} is {} bytes, limit is {MAX_MODEL_BYTES}",
                path.display(),
                meta.len()
            )));
        }

        let bytes = fs::read(path).map_err(|e| AuthError::io(path, e))?;
        let model = Model::from_slice(&bytes).map_err(|e| match e {
            AuthError::Format(msg) => AuthError::Format(format!("{}: {msg}", path.display())),
            other => other,
        })?;

        tracing::debug!(
            path = %path.display(),
            algorithm = %model.algorithm,
            labels = model.label_set.len(),
            "model read"
        );
        Ok(model)
    }

    fn write(&self, path: &Path, model: &Model) -> Result<()> {
        let bytes = model.to_vec()?;

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|e| AuthError::io(parent, e))?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| AuthError::io(parent, e))?;
        tmp.write_all(&bytes).map_err(|e| AuthError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| AuthError::io(tmp.path(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(|e| AuthError::io(tmp.path(), e))?;
        }

        tmp.persist(path).map_err(|e| AuthError::io(path, e.error))?;

        tracing::info!(
            path = %path.display(),
            algorithm = %model.algorithm,
            labels = model.label_set.len(),
            samples = model.sample_count,
            "model written"
        );
        Ok(())
    }
}
