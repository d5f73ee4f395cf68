//! Error taxonomy and failure collection.
//!
//! Store and planner operations fail with a typed [`Error`]; per-unit
//! failures during a deploy are gathered by [`ErrorCollector`] so siblings
//! get a chance to complete, then combined once the whole group has settled.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The remote build job never reached its `started` transition.
    NeverStarted,
    /// The remote build job started but never completed.
    NeverCompleted,
    /// A published artifact never became externally visible.
    Visibility,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutKind::NeverStarted => "never-started",
            TimeoutKind::NeverCompleted => "never-completed",
            TimeoutKind::Visibility => "visibility",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Input(String),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("version {full_version} already exists for {deployment_id}")]
    DuplicateVersion {
        deployment_id: String,
        full_version: String,
    },

    #[error("build job {full_version} already exists for {deployment_id}")]
    DuplicateBuildJob {
        deployment_id: String,
        full_version: String,
    },

    #[error("no build job {full_version} for {deployment_id}")]
    MissingBuildJob {
        deployment_id: String,
        full_version: String,
    },

    #[error("publish of {unit} failed: {message}")]
    Publish { unit: String, message: String },

    #[error("{kind} timeout after {} waiting on {subject}", humantime::format_duration(*.waited))]
    Timeout {
        kind: TimeoutKind,
        subject: String,
        waited: Duration,
    },

    #[error("missing build record for {build_id}")]
    MissingBuildRecord { build_id: String },

    #[error("step {step} failed: {message}")]
    Step { step: String, message: String },

    #[error(transparent)]
    Aggregate(AggregateError),
}

impl Error {
    pub fn input(message: impl Into<String>) -> Self {
        Error::Input(message.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<slipway_version::VersionError> for Error {
    fn from(err: slipway_version::VersionError) -> Self {
        Error::Input(err.to_string())
    }
}

impl From<slipway_worker::WorkerError> for Error {
    fn from(err: slipway_worker::WorkerError) -> Self {
        Error::Input(err.to_string())
    }
}

/// Several independent failures from one build, each message preserved.
#[derive(Debug)]
pub struct AggregateError(pub Vec<Error>);

impl std::error::Error for AggregateError {}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} deployment errors:", self.0.len())?;
        for err in &self.0 {
            writeln!(f, "  - {}", render_chain(err))?;
        }
        Ok(())
    }
}

/// Render an error as its message followed by every source in the chain.
/// A blank message falls back to `"Unknown error"`; this never fails, so it
/// is safe to call while recording a failure.
pub fn render_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    if out.trim().is_empty() {
        "Unknown error".to_string()
    } else {
        out
    }
}

/// [`render_chain`] for `anyhow` errors, used at the step/phase boundary.
pub fn render_anyhow(err: &anyhow::Error) -> String {
    let rendered = format!("{err:#}");
    if rendered.trim().is_empty() {
        "Unknown error".to_string()
    } else {
        rendered
    }
}

/// Collects per-unit failures so siblings keep running. A single collected
/// error passes through untouched; several combine into one aggregate that
/// preserves every message.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Vec<Error>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| render_chain(e)).collect()
    }

    pub fn into_result(mut self) -> Result<(), Error> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Aggregate(AggregateError(self.errors))),
        }
    }
}
