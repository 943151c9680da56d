//! Bounded-time authentication decision engine.
//!
//! One [`AuthSession`] per request. The loop pulls frames from a
//! [`FrameSource`], turns them into descriptors with a
//! [`DescriptorExtractor`], and asks the [`Recognizer`] for a verdict until
//! the first match, the deadline, cancellation, or an unrecoverable error.
//!
//! The deadline gates the *start* of each sampling attempt. An evaluation
//! already under way when the deadline passes is allowed to finish. Nothing
//! reaches [`Decision::Success`] without a usable frame and a matching
//! prediction.

use crate::config::{AuthConfig, MissingModelPolicy};
use crate::error::{AuthError, Result};
use crate::model::ModelStore;
use crate::recognizer::{recognizer_for, Recognizer};
use crate::types::Descriptor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lazy, possibly endless source of raw frames.
///
/// `Ok(None)` means "nothing usable right now" and is always retried.
/// `Err` means the source is unusable and ends the session. Implementations
/// should return promptly; the engine cannot interrupt a blocked call.
pub trait FrameSource {
    type Frame;

    fn next_frame(&mut self) -> Result<Option<Self::Frame>>;
}

/// Turns a raw frame into a descriptor.
///
/// Failures should be [`AuthError::Extraction`] (no face, too dark, ...);
/// the engine treats those as a non-match and samples again.
pub trait DescriptorExtractor {
    type Frame;

    fn extract(&mut self, frame: &Self::Frame) -> Result<Descriptor>;
}

/// Cooperative cancellation flag, checked once per loop iteration and after
/// every pacing sleep.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sampling,
    Evaluating,
    Succeeded,
    Failed,
    TimedOut,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded
                | SessionState::Failed
                | SessionState::TimedOut
                | SessionState::Errored
        )
    }

    /// Legal edges of the session state machine.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Sampling) => true,
            (Sampling, Sampling | Evaluating | TimedOut | Failed) => true,
            (Evaluating, Succeeded | Sampling | TimedOut | Failed) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Frames were evaluated and none matched within the frame budget.
    NoMatch {
        frames: u64,
        best_score: Option<f32>,
    },
    /// No model is enrolled for the user.
    NoModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Format,
    Resource,
    Cancelled,
    /// No model, under [`MissingModelPolicy::Defer`].
    ModelMissing,
}

/// Terminal outcome handed to the host adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Success { label: String, score: f32 },
    Failure { reason: FailureReason },
    Timeout,
    Error { kind: ErrorKind, detail: String },
}

impl Decision {
    pub fn is_success(&self) -> bool {
        matches!(self, Decision::Success { .. })
    }

    fn from_error(err: &AuthError) -> Self {
        let kind = match err {
            AuthError::Format(_) => ErrorKind::Format,
            AuthError::Resource(_) | AuthError::Io { .. } => ErrorKind::Resource,
            AuthError::ModelMissing(_) => ErrorKind::ModelMissing,
            _ => ErrorKind::Config,
        };
        Decision::Error {
            kind,
            detail: err.to_string(),
        }
    }
}

/// Time and frame limits for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub timeout: Duration,
    pub frame_interval: Duration,
    pub max_frames: Option<u32>,
}

impl SessionLimits {
    /// Instant at which a window of `timeout` opened at `start` closes.
    pub fn deadline_from(&self, start: Instant) -> Result<Instant> {
        start.checked_add(self.timeout).ok_or_else(|| {
            AuthError::Config(format!(
                "timeout of {}s cannot be represented",
                self.timeout.as_secs()
            ))
        })
    }
}

impl From<&AuthConfig> for SessionLimits {
    fn from(config: &AuthConfig) -> Self {
        Self {
            timeout: config.timeout(),
            frame_interval: config.frame_interval(),
            max_frames: config.max_frames,
        }
    }
}

/// State of one authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthSession {
    started_at: Instant,
    deadline: Instant,
    frames: u64,
    state: SessionState,
    best_score: Option<f32>,
}

impl AuthSession {
    fn new(started_at: Instant, deadline: Instant) -> Self {
        Self {
            started_at,
            deadline,
            frames: 0,
            state: SessionState::Idle,
            best_score: None,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Usable frames received so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Best score among evaluated probes, in the recognizer's own direction.
    pub fn best_score(&self) -> Option<f32> {
        self.best_score
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {:?} -> {next:?}",
            self.state
        );
        self.state = next;
    }
}

pub struct DecisionEngine<'r> {
    recognizer: &'r dyn Recognizer,
    limits: SessionLimits,
    cancel: CancelToken,
}

impl<'r> DecisionEngine<'r> {
    pub fn new(recognizer: &'r dyn Recognizer, limits: SessionLimits) -> Self {
        Self {
            recognizer,
            limits,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one session to a terminal state.
    pub fn run<S, X>(&self, source: &mut S, extractor: &mut X) -> (Decision, AuthSession)
    where
        S: FrameSource,
        X: DescriptorExtractor<Frame = S::Frame>,
    {
        let now = Instant::now();
        let mut session = match self.limits.deadline_from(now) {
            Ok(deadline) => AuthSession::new(now, deadline),
            Err(e) => {
                let session = AuthSession::new(now, now);
                return self.finish(session, SessionState::Errored, Decision::from_error(&e));
            }
        };

        if !self.recognizer.is_ready() {
            let err = AuthError::Config(format!("{} recognizer has no model", self.recognizer.algorithm()));
            return self.finish(session, SessionState::Errored, Decision::from_error(&err));
        }

        session.advance(SessionState::Sampling);
        tracing::debug!(
            algorithm = %self.recognizer.algorithm(),
            timeout_ms = self.limits.timeout.as_millis() as u64,
            "session started"
        );

        loop {
            if self.cancel.is_cancelled() {
                let decision = Decision::Error {
                    kind: ErrorKind::Cancelled,
                    detail: "session cancelled".into(),
                };
                return self.finish(session, SessionState::Errored, decision);
            }
            if session.expired() {
                return self.finish(session, SessionState::TimedOut, Decision::Timeout);
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::trace!("no frame available");
                    session.advance(SessionState::Sampling);
                    self.pace(&session);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "frame source failed");
                    return self.finish(session, SessionState::Errored, Decision::from_error(&e));
                }
            };

            session.frames += 1;
            session.advance(SessionState::Evaluating);

            match extractor
                .extract(&frame)
                .and_then(|descriptor| self.recognizer.predict(&descriptor))
            {
                Ok(m) => {
                    let direction = self.recognizer.direction();
                    let better = session
                        .best_score
                        .map_or(true, |best| direction.is_better(m.score, best));
                    if better {
                        session.best_score = Some(m.score);
                    }
                    tracing::debug!(
                        frame = session.frames,
                        score = m.score,
                        threshold = self.recognizer.threshold(),
                        is_match = m.is_match,
                        "frame evaluated"
                    );
                    match (m.is_match, m.label) {
                        (true, Some(label)) => {
                            let decision = Decision::Success {
                                label,
                                score: m.score,
                            };
                            return self.finish(session, SessionState::Succeeded, decision);
                        }
                        (true, None) => {
                            tracing::warn!("match without a label; treating as non-match");
                        }
                        (false, _) => {}
                    }
                }
                Err(e) if e.is_recoverable() => {
                    tracing::debug!(frame = session.frames, error = %e, "frame not usable");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "recognizer failed");
                    return self.finish(session, SessionState::Errored, Decision::from_error(&e));
                }
            }

            if let Some(max) = self.limits.max_frames {
                if session.frames >= u64::from(max) {
                    let decision = Decision::Failure {
                        reason: FailureReason::NoMatch {
                            frames: session.frames,
                            best_score: session.best_score,
                        },
                    };
                    return self.finish(session, SessionState::Failed, decision);
                }
            }

            if session.expired() {
                return self.finish(session, SessionState::TimedOut, Decision::Timeout);
            }
            session.advance(SessionState::Sampling);
            self.pace(&session);
        }
    }

    /// Sleep for the frame interval, never past the deadline.
    fn pace(&self, session: &AuthSession) {
        let remaining = session.deadline.saturating_duration_since(Instant::now());
        let nap = self.limits.frame_interval.min(remaining);
        if !nap.is_zero() {
            std::thread::sleep(nap);
        }
    }

    fn finish(
        &self,
        mut session: AuthSession,
        state: SessionState,
        decision: Decision,
    ) -> (Decision, AuthSession) {
        session.advance(state);
        tracing::info!(
            state = ?state,
            frames = session.frames,
            best_score = ?session.best_score,
            elapsed_ms = session.started_at.elapsed().as_millis() as u64,
            "session finished"
        );
        (decision, session)
    }
}

/// Outcome for a user with no enrolled model, per `config.missing_model`.
///
/// Hosts that must acquire hardware before calling [`decide`] can check the
/// store first and answer with this directly.
pub fn missing_model(config: &AuthConfig, path: &Path) -> Decision {
    tracing::info!(path = %path.display(), policy = ?config.missing_model, "no enrolled model");
    match config.missing_model {
        MissingModelPolicy::Fail => Decision::Failure {
            reason: FailureReason::NoModel,
        },
        MissingModelPolicy::Defer => Decision::Error {
            kind: ErrorKind::ModelMissing,
            detail: format!("no model enrolled at {}", path.display()),
        },
    }
}

/// Host entry point: load the user's model and run one session.
///
/// Every failure resolves to a non-success [`Decision`].
pub fn decide<S, X>(
    config: &AuthConfig,
    store: &dyn ModelStore,
    model_path: &Path,
    source: &mut S,
    extractor: &mut X,
    cancel: &CancelToken,
) -> Decision
where
    S: FrameSource,
    X: DescriptorExtractor<Frame = S::Frame>,
{
    if let Err(e) = config.validate() {
        return Decision::from_error(&e);
    }

    let model = match store.read(model_path) {
        Ok(model) => model,
        Err(AuthError::ModelMissing(path)) => return missing_model(config, &path),
        Err(e) => {
            tracing::warn!(error = %e, "model load failed");
            return Decision::from_error(&e);
        }
    };

    let mut recognizer = recognizer_for(config);
    if let Err(e) = recognizer.load(&model) {
        tracing::warn!(error = %e, "model rejected by recognizer");
        return Decision::from_error(&e);
    }

    DecisionEngine::new(recognizer.as_ref(), SessionLimits::from(config))
        .with_cancel(cancel.clone())
        .run(source, extractor)
        .0
}
