// Build Matrix Service Library
// Matrix expansion, sandboxed job scheduling and durable job set state

pub mod config;
pub mod error;
pub mod events;
pub mod matrix;
pub mod report;
pub mod sandbox;
pub mod scheduler;
pub mod source;
pub mod state;
pub mod summary;

// Re-export commonly used types
pub use error::{RunPhase, ServiceError, ServiceResult, StateError};

pub use config::{ConfigError, RunnerConfig, SandboxConfig, SandboxKind};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use matrix::{AxisValue, Environment, MatrixDefinition, MatrixError, MatrixExpander};
pub use report::{render, report_filename, ReportFormat};
pub use sandbox::{
    ContainerConfig, ContainerExecutor, ExecutionOutcome, ExecutionRequest, ProcessExecutor,
    SandboxExecutor, SandboxFailure,
};
pub use scheduler::{RunOutcome, Scheduler, SchedulerConfig};
pub use source::{GitSource, RepositoryIdentity, SourceError, SourceRef};
pub use state::{JobHandle, JobRecord, JobSetHandle, JobSetView, JobStatus, OutputSink, StateStore};
pub use summary::{format_duration, summarize, JobSummary, Summary};
