// Service Errors
// Error taxonomy shared by the state store, scheduler and finalize path

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::matrix::MatrixError;
use crate::source::SourceError;
use crate::state::JobStatus;

/// Result alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised by the on-disk job set store
#[derive(Debug, Error)]
pub enum StateError {
    /// A job or job set path could not be created or written
    #[error("cannot allocate {path}: {reason}")]
    Allocation { path: PathBuf, reason: String },

    /// A result record already exists for this job
    #[error("job #{job} already has a recorded result")]
    DuplicateResult { job: u32 },

    /// Seal or summarize was attempted while some jobs are unfinished
    #[error("job set {path} is incomplete ({})", describe_pending(.pending, .sealed))]
    IncompleteJobSet {
        path: PathBuf,
        pending: Vec<u32>,
        sealed: bool,
    },

    /// The manifest carries a format version this build does not understand
    #[error("job set format version {found} is unsupported (expected {expected})")]
    VersionMismatch { found: String, expected: String },

    /// A required record (job set or job manifest) is missing
    #[error("missing record {path}")]
    NotFound { path: PathBuf },

    /// A record exists but cannot be parsed
    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("job set {path} is already sealed")]
    AlreadySealed { path: PathBuf },

    /// A job status moved backwards or skipped a state
    #[error("invalid job status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn describe_pending(pending: &[u32], sealed: &bool) -> String {
    if pending.is_empty() && !*sealed {
        return "not sealed".to_string();
    }
    let ids: Vec<String> = pending.iter().map(|id| format!("#{}", id)).collect();
    format!("unfinished jobs: {}", ids.join(", "))
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn allocation(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Allocation {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller may wait and try the same operation again
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::IncompleteJobSet { .. })
    }
}

/// Phase of a run in which a fatal error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Fetching the source and expanding the matrix
    Prepare,
    /// Creating the job set or a job directory
    Allocate,
    /// Dispatching work to the sandbox pool
    Execute,
    /// Writing a job result record
    Record,
    /// Writing the seal marker
    Seal,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Prepare => write!(f, "prepare"),
            RunPhase::Allocate => write!(f, "allocate"),
            RunPhase::Execute => write!(f, "execute"),
            RunPhase::Record => write!(f, "record"),
            RunPhase::Seal => write!(f, "seal"),
        }
    }
}

/// Top-level service error
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    /// A worker task panicked or was cancelled
    #[error("worker task failed: {0}")]
    Worker(String),

    /// The run was aborted; the partial job set is left on disk
    #[error("run aborted during {phase} phase (partial job set at {}): {source}", .job_set.display())]
    Aborted {
        phase: RunPhase,
        job_set: PathBuf,
        #[source]
        source: Box<ServiceError>,
    },
}

impl ServiceError {
    pub fn aborted(phase: RunPhase, job_set: impl Into<PathBuf>, source: ServiceError) -> Self {
        Self::Aborted {
            phase,
            job_set: job_set.into(),
            source: Box::new(source),
        }
    }

    /// Whether the caller may wait and try again
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::State(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// The phase a run failed in, if this error aborted a run
    pub fn phase(&self) -> Option<RunPhase> {
        match self {
            ServiceError::Aborted { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}
