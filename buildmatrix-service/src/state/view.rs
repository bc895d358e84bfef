// Job Set View
// Read-only, version-checked view of a job set on disk

use crate::error::StateError;
use crate::state::{
    read_record, JobManifest, JobResult, JobSetManifest, JobStatus, ARTIFACTS_DIR,
    FORMAT_VERSION, LOG_FILE, MANIFEST_FILE, RESULT_FILE, SEALED_FILE,
};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A job set as found on disk
#[derive(Debug, Clone)]
pub struct JobSetView {
    path: PathBuf,
    manifest: JobSetManifest,
    jobs: Vec<JobRecord>,
    sealed: bool,
}

/// One job as found on disk
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub dir: PathBuf,
    pub manifest: JobManifest,
    /// `None` while the job is pending or running, or if it crashed mid-run
    pub result: Option<JobResult>,
}

impl JobRecord {
    pub fn id(&self) -> u32 {
        self.manifest.id
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }

    /// Recorded status, or `Pending` when no result exists
    pub fn status(&self) -> JobStatus {
        self.result
            .as_ref()
            .map(|r| r.status)
            .unwrap_or(JobStatus::Pending)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join(ARTIFACTS_DIR)
    }

    pub fn read_log(&self) -> Result<Vec<u8>, StateError> {
        let path = self.log_path();
        fs::read(&path).map_err(|e| StateError::io(path, e))
    }
}

impl JobSetView {
    /// Open and version-check the job set at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        let manifest_path = path.join(MANIFEST_FILE);

        // Check the tag before the full schema so an unknown version is
        // reported as such rather than as a parse error
        let raw: serde_yaml::Value = read_record(&manifest_path)?;
        let found = raw
            .get("format_version")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or("<missing>");
        if found != FORMAT_VERSION {
            return Err(StateError::VersionMismatch {
                found: found.to_string(),
                expected: FORMAT_VERSION.to_string(),
            });
        }
        let manifest: JobSetManifest =
            serde_yaml::from_value(raw).map_err(|source| StateError::Corrupt {
                path: manifest_path.clone(),
                source,
            })?;

        let mut jobs = Vec::new();
        for id in job_ordinals(&path)? {
            let dir = path.join(id.to_string());
            let manifest: JobManifest = read_record(&dir.join(MANIFEST_FILE))?;
            let result_path = dir.join(RESULT_FILE);
            let result = if result_path.exists() {
                Some(read_record(&result_path)?)
            } else {
                None
            };
            jobs.push(JobRecord {
                dir,
                manifest,
                result,
            });
        }

        let sealed = path.join(SEALED_FILE).exists();

        Ok(Self {
            path,
            manifest,
            jobs,
            sealed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &JobSetManifest {
        &self.manifest
    }

    /// Jobs ordered by ordinal
    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Ordinals of jobs without a result record
    pub fn pending(&self) -> Vec<u32> {
        self.jobs
            .iter()
            .filter(|job| !job.is_finished())
            .map(JobRecord::id)
            .collect()
    }

    /// Fail with `IncompleteJobSet` unless the set is sealed and every job finished
    pub fn ensure_complete(&self) -> Result<(), StateError> {
        let pending = self.pending();
        if self.sealed && pending.is_empty() {
            return Ok(());
        }
        Err(StateError::IncompleteJobSet {
            path: self.path.clone(),
            pending,
            sealed: self.sealed,
        })
    }
}

/// Numeric job directory names under a job set, ascending
pub(crate) fn job_ordinals(root: &Path) -> Result<Vec<u32>, StateError> {
    let entries = fs::read_dir(root).map_err(|e| StateError::io(root, e))?;

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StateError::io(root, e))?;
        let is_dir = entry
            .file_type()
            .map(|t| t.is_dir())
            .map_err(|e: io::Error| StateError::io(entry.path(), e))?;
        if !is_dir {
            continue;
        }
        if let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
            .filter(|id| *id > 0)
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{AxisValue, Environment};
    use crate::source::RepositoryIdentity;
    use crate::state::StateStore;
    use chrono::Utc;
    use tempfile::TempDir;

    fn environment(value: &str) -> Environment {
        vec![("env".to_string(), AxisValue::from(value))]
            .into_iter()
            .collect()
    }

    fn passed() -> JobResult {
        let now = Utc::now();
        JobResult {
            status: JobStatus::Passed,
            started_at: now,
            ended_at: now,
            exit_status: Some(0),
            failure: None,
        }
    }

    #[test]
    fn test_open_missing_manifest_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = JobSetView::open(dir.path()).unwrap_err();
        assert!(matches!(err, StateError::NotFound { .. }));
    }

    #[test]
    fn test_job_dir_without_manifest_is_not_found() {
        let dir = TempDir::new().unwrap();
        let set = StateStore::new(dir.path())
            .create_job_set_at(dir.path().join("run"), RepositoryIdentity::default())
            .unwrap();
        fs::create_dir(set.path().join("1")).unwrap();

        match JobSetView::open(set.path()).unwrap_err() {
            StateError::NotFound { path } => {
                assert_eq!(path, set.path().join("1").join(MANIFEST_FILE));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_open_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            "format_version: '2.0'\nsomething_else: true\n",
        )
        .unwrap();

        match JobSetView::open(dir.path()).unwrap_err() {
            StateError::VersionMismatch { found, expected } => {
                assert_eq!(found, "2.0");
                assert_eq!(expected, "1.0");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_open_rejects_missing_version() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), "created_at: now\n").unwrap();

        let err = JobSetView::open(dir.path()).unwrap_err();
        assert!(matches!(err, StateError::VersionMismatch { ref found, .. } if found == "<missing>"));
    }

    #[test]
    fn test_open_reports_pending_jobs_after_restart() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let set = store
            .create_job_set_at(dir.path().join("run"), RepositoryIdentity::default())
            .unwrap();
        let one = set.add_job(&environment("a"), 1).unwrap();
        set.add_job(&environment("b"), 2).unwrap();
        one.record_result(&passed(), one.output_sink()).unwrap();
        drop(set);

        let view = store.open_job_set(dir.path().join("run")).unwrap();

        assert_eq!(view.jobs().len(), 2);
        assert_eq!(view.jobs()[0].status(), JobStatus::Passed);
        assert_eq!(view.jobs()[1].status(), JobStatus::Pending);
        assert_eq!(view.pending(), vec![2]);
        assert!(!view.is_sealed());
        assert!(matches!(
            view.ensure_complete().unwrap_err(),
            StateError::IncompleteJobSet { sealed: false, .. }
        ));
        assert!(store.open_sealed_job_set(view.path()).is_err());
    }

    #[test]
    fn test_open_sealed_set() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let set = store
            .create_job_set_at(dir.path().join("run"), RepositoryIdentity::default())
            .unwrap();
        for id in [2u32, 10, 1] {
            let job = set.add_job(&environment(&id.to_string()), id).unwrap();
            job.record_result(&passed(), job.output_sink()).unwrap();
        }
        set.seal().unwrap();

        let view = store.open_sealed_job_set(set.path()).unwrap();

        let ids: Vec<u32> = view.jobs().iter().map(JobRecord::id).collect();
        assert_eq!(ids, vec![1, 2, 10]);
        assert!(view.jobs()[0].read_log().unwrap().is_empty());
        assert!(view.jobs()[0].artifacts_dir().is_dir());
    }

    #[test]
    fn test_job_ordinals_skip_non_numeric() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("3")).unwrap();
        fs::create_dir(dir.path().join("0")).unwrap();
        fs::create_dir(dir.path().join("artifacts")).unwrap();
        fs::write(dir.path().join("7"), "").unwrap();

        assert_eq!(job_ordinals(dir.path()).unwrap(), vec![3]);
    }
}
