//! facelatch-core — face recognizers, model persistence, training and the
//! bounded-time decision engine.
//!
//! Three classic image recognizers (LBPH, Eigenfaces, Fisherfaces) and one
//! embedding-similarity matcher share the [`Recognizer`] trait. A host asks
//! for a verdict through [`decide`], which always returns within the
//! configured timeout plus one frame-source call.

pub mod classic;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
mod lbph;
mod linalg;
pub mod model;
pub mod recognizer;
mod subspace;
pub mod training;
pub mod types;

pub use config::{AuthConfig, MissingModelPolicy};
pub use engine::{
    decide, missing_model, AuthSession, CancelToken, Decision, DecisionEngine,
    DescriptorExtractor, ErrorKind, FailureReason, FrameSource, SessionLimits, SessionState,
};
pub use error::{AuthError, Result};
pub use model::{FilesystemModelStore, Model, ModelHeader, ModelStore};
pub use recognizer::{recognizer_for, Recognizer};
pub use training::{collect_samples, TrainingPipeline};
pub use types::{Algorithm, Descriptor, Embedding, LabeledSample, MatchDecision, ScoreDirection};
