// Job Set State
// On-disk job set layout, records and job status lifecycle

pub mod store;
pub mod view;

pub use store::{JobHandle, JobSetHandle, OutputSink, StateStore};
pub use view::{JobRecord, JobSetView};

use crate::error::StateError;
use crate::matrix::Environment;
use crate::source::RepositoryIdentity;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use std::path::Path;

/// Format tag written into every job set manifest
pub const FORMAT_VERSION: &str = "1.0";

/// Job set and job manifest file name
pub const MANIFEST_FILE: &str = "manifest.yml";
/// Job result record; its presence means the job finished
pub const RESULT_FILE: &str = "result.yml";
/// Raw execution log, moved into place together with the result
pub const LOG_FILE: &str = "log";
/// Sentinel at the job set root; its presence means the set is sealed
pub const SEALED_FILE: &str = "sealed";
/// Opaque artifact bundle written by the sandbox
pub const ARTIFACTS_DIR: &str = "artifacts";
/// Log file the sandbox streams into while the job runs
pub(crate) const PARTIAL_LOG_FILE: &str = ".log.partial";

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Passed | JobStatus::Failed)
    }

    /// Move to `next`, allowing only `pending -> running -> passed|failed`
    pub fn advance(self, next: JobStatus) -> Result<JobStatus, StateError> {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running)
            | (JobStatus::Running, JobStatus::Passed)
            | (JobStatus::Running, JobStatus::Failed) => Ok(next),
            (from, to) => Err(StateError::InvalidTransition { from, to }),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Passed => write!(f, "passed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Job set manifest (`<set>/manifest.yml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSetManifest {
    pub format_version: String,
    pub repository: RepositoryIdentity,
    pub created_at: DateTime<Utc>,
}

impl JobSetManifest {
    pub fn new(repository: RepositoryIdentity) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            repository,
            created_at: Utc::now(),
        }
    }
}

/// Job manifest (`<set>/<ordinal>/manifest.yml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    pub id: u32,
    pub name: String,
    pub environment: Environment,
    pub environment_name: String,
    pub created_at: DateTime<Utc>,
}

impl JobManifest {
    pub fn new(id: u32, environment: &Environment) -> Self {
        Self {
            id,
            name: format!("#{}", id),
            environment: environment.clone(),
            environment_name: environment.describe(),
            created_at: Utc::now(),
        }
    }
}

/// Job result record (`<set>/<ordinal>/result.yml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Exit status of the build, when the sandbox ran it to completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    /// Sandbox failure reason (timeout, spawn failure, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl JobResult {
    pub fn passed(&self) -> bool {
        self.status == JobStatus::Passed
    }

    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}

/// Write `record` as YAML into `dir/name` without ever exposing a partial file.
///
/// The record goes to a temp file in the same directory and is linked into
/// place only if `name` does not exist yet; otherwise `AlreadyExists`.
pub(crate) fn write_record<T: Serialize>(dir: &Path, name: &str, record: &T) -> io::Result<()> {
    let content = serde_yaml::to_string(record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut file = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)?;
    file.write_all(content.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist_noclobber(dir.join(name))
        .map_err(|e| e.error)?;
    Ok(())
}

/// Read a YAML record, mapping a missing file to `NotFound`
pub(crate) fn read_record<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StateError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StateError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(StateError::io(path, e)),
    };
    serde_yaml::from_str(&content).map_err(|source| StateError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}
