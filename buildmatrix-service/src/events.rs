// Execution Events
// Progress reporting for job set runs

use crate::error::RunPhase;
use crate::state::JobStatus;

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while a job set runs
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// The job set was created and jobs are about to be dispatched
    RunStarted { job_set: PathBuf, total_jobs: usize },

    /// A worker picked up a job and its directory exists
    JobStarted {
        ordinal: u32,
        job_path: PathBuf,
        environment: String,
    },

    /// A job's result was recorded
    JobCompleted {
        ordinal: u32,
        status: JobStatus,
        duration: Duration,
        failure: Option<String>,
    },

    /// Every job finished and the seal marker was written
    RunSealed {
        job_set: PathBuf,
        passed: usize,
        failed: usize,
    },

    /// The run stopped on a fatal error; the set is left unsealed
    RunAborted { phase: RunPhase, message: String },
}

impl ExecutionEvent {
    pub fn run_started(job_set: impl Into<PathBuf>, total_jobs: usize) -> Self {
        Self::RunStarted {
            job_set: job_set.into(),
            total_jobs,
        }
    }

    pub fn job_started(
        ordinal: u32,
        job_path: impl Into<PathBuf>,
        environment: impl Into<String>,
    ) -> Self {
        Self::JobStarted {
            ordinal,
            job_path: job_path.into(),
            environment: environment.into(),
        }
    }

    pub fn job_completed(
        ordinal: u32,
        status: JobStatus,
        duration: Duration,
        failure: Option<String>,
    ) -> Self {
        Self::JobCompleted {
            ordinal,
            status,
            duration,
            failure,
        }
    }

    pub fn run_aborted(phase: RunPhase, message: impl Into<String>) -> Self {
        Self::RunAborted {
            phase,
            message: message.into(),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
