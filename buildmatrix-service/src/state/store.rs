// Job Set Store
// Allocates job sets and jobs on disk and records results exactly once

use crate::error::StateError;
use crate::matrix::Environment;
use crate::source::RepositoryIdentity;
use crate::state::view::{job_ordinals, JobSetView};
use crate::state::{
    write_record, JobManifest, JobResult, JobSetManifest, JobStatus, ARTIFACTS_DIR, LOG_FILE,
    MANIFEST_FILE, PARTIAL_LOG_FILE, RESULT_FILE, SEALED_FILE,
};

use chrono::Utc;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Suffix of generated job set directory names
pub const JOB_SET_SUFFIX: &str = ".jobset";

/// Root directory under which job sets are allocated
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a new job set named after the current UTC time
    pub fn create_job_set(
        &self,
        repository: RepositoryIdentity,
    ) -> Result<JobSetHandle, StateError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| StateError::allocation(&self.root, e))?;

        let name = format!(
            "{}{}",
            Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ"),
            JOB_SET_SUFFIX
        );
        JobSetHandle::create(self.root.join(name), repository)
    }

    /// Allocate a job set at an explicit path
    pub fn create_job_set_at(
        &self,
        path: impl AsRef<Path>,
        repository: RepositoryIdentity,
    ) -> Result<JobSetHandle, StateError> {
        JobSetHandle::create(path.as_ref().to_path_buf(), repository)
    }

    pub fn open_job_set(&self, path: impl AsRef<Path>) -> Result<JobSetView, StateError> {
        JobSetView::open(path)
    }

    /// Open a set for finalization: it must be sealed and every job finished
    pub fn open_sealed_job_set(&self, path: impl AsRef<Path>) -> Result<JobSetView, StateError> {
        let view = JobSetView::open(path)?;
        view.ensure_complete()?;
        Ok(view)
    }

    /// Job set directories under the root, oldest first, sealed or not
    pub fn list_job_sets(&self) -> Result<Vec<PathBuf>, StateError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(&self.root, e)),
        };

        let mut sets = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::io(&self.root, e))?;
            let path = entry.path();
            if path.join(MANIFEST_FILE).is_file() {
                sets.push(path);
            }
        }
        sets.sort();
        Ok(sets)
    }
}

/// Write access to one job set during a run
#[derive(Debug, Clone)]
pub struct JobSetHandle {
    root: PathBuf,
    manifest: JobSetManifest,
}

impl JobSetHandle {
    fn create(root: PathBuf, repository: RepositoryIdentity) -> Result<Self, StateError> {
        fs::create_dir(&root).map_err(|e| StateError::allocation(&root, e))?;

        let manifest = JobSetManifest::new(repository);
        write_record(&root, MANIFEST_FILE, &manifest)
            .map_err(|e| StateError::allocation(root.join(MANIFEST_FILE), e))?;

        tracing::info!(path = %root.display(), "created job set");
        Ok(Self { root, manifest })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &JobSetManifest {
        &self.manifest
    }

    pub fn is_sealed(&self) -> bool {
        self.root.join(SEALED_FILE).exists()
    }

    /// Create the directory and manifest for job `ordinal`
    pub fn add_job(&self, environment: &Environment, ordinal: u32) -> Result<JobHandle, StateError> {
        if self.is_sealed() {
            return Err(StateError::allocation(&self.root, "job set is sealed"));
        }

        let dir = self.root.join(ordinal.to_string());
        fs::create_dir(&dir).map_err(|e| StateError::allocation(&dir, e))?;

        let manifest = JobManifest::new(ordinal, environment);
        write_record(&dir, MANIFEST_FILE, &manifest)
            .map_err(|e| StateError::allocation(dir.join(MANIFEST_FILE), e))?;

        let artifacts = dir.join(ARTIFACTS_DIR);
        fs::create_dir(&artifacts).map_err(|e| StateError::allocation(&artifacts, e))?;

        tracing::debug!(job = ordinal, path = %dir.display(), "created job");
        Ok(JobHandle { id: ordinal, dir })
    }

    /// Write the seal marker once every job has a result record
    pub fn seal(&self) -> Result<(), StateError> {
        let marker = self.root.join(SEALED_FILE);
        if marker.exists() {
            return Err(StateError::AlreadySealed {
                path: self.root.clone(),
            });
        }

        let pending: Vec<u32> = job_ordinals(&self.root)?
            .into_iter()
            .filter(|id| !self.root.join(id.to_string()).join(RESULT_FILE).exists())
            .collect();
        if !pending.is_empty() {
            return Err(StateError::IncompleteJobSet {
                path: self.root.clone(),
                pending,
                sealed: false,
            });
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => StateError::AlreadySealed {
                    path: self.root.clone(),
                },
                _ => StateError::io(&marker, e),
            })?;
        writeln!(file, "{}", Utc::now().to_rfc3339())
            .and_then(|_| file.sync_all())
            .map_err(|e| StateError::io(&marker, e))?;

        tracing::info!(path = %self.root.display(), "sealed job set");
        Ok(())
    }
}

/// Write access to one job directory; owned by a single worker
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: u32,
    dir: PathBuf,
}

impl JobHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn is_finished(&self) -> bool {
        self.dir.join(RESULT_FILE).exists()
    }

    /// Where the sandbox writes its log and artifacts. Touches nothing on disk.
    pub fn output_sink(&self) -> OutputSink {
        OutputSink {
            log: self.dir.join(PARTIAL_LOG_FILE),
            artifacts: self.dir.join(ARTIFACTS_DIR),
        }
    }

    /// Record the job's terminal result and move its log into place.
    ///
    /// The result record is written last, so a reader that sees it also sees
    /// the log. A second call fails with `DuplicateResult` and changes nothing.
    pub fn record_result(&self, result: &JobResult, output: OutputSink) -> Result<(), StateError> {
        if !result.status.is_terminal() {
            return Err(StateError::InvalidTransition {
                from: JobStatus::Running,
                to: result.status,
            });
        }

        let result_path = self.dir.join(RESULT_FILE);
        if result_path.exists() {
            return Err(StateError::DuplicateResult { job: self.id });
        }

        let log_path = self.dir.join(LOG_FILE);
        if output.log.exists() {
            fs::rename(&output.log, &log_path).map_err(|e| StateError::io(&log_path, e))?;
        } else {
            fs::File::create(&log_path).map_err(|e| StateError::io(&log_path, e))?;
        }

        write_record(&self.dir, RESULT_FILE, result).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => StateError::DuplicateResult { job: self.id },
            _ => StateError::io(&result_path, e),
        })?;

        tracing::debug!(job = self.id, status = %result.status, "recorded result");
        Ok(())
    }
}

/// Scoped output of one sandboxed execution: a log stream and an artifact directory
#[derive(Debug)]
pub struct OutputSink {
    log: PathBuf,
    artifacts: PathBuf,
}

impl OutputSink {
    pub fn log_path(&self) -> &Path {
        &self.log
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts
    }

    /// Create (or truncate) the log file for streaming
    pub async fn open_log(&self) -> io::Result<tokio::fs::File> {
        tokio::fs::File::create(&self.log).await
    }

    /// Append a line to the log, creating it if needed
    pub async fn append_log(&self, bytes: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await
    }
}
