// Result Aggregation
// Folds a sealed job set into an overall verdict

use crate::error::StateError;
use crate::source::RepositoryIdentity;
use crate::state::{JobSetView, JobStatus};

use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Per-job line of a summary
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub ordinal: u32,
    /// Environment descriptor, e.g. `runtime=2.1; env=A`
    pub environment: String,
    pub status: JobStatus,
    pub duration: chrono::Duration,
    pub exit_status: Option<i32>,
    pub failure: Option<String>,
    pub log_path: PathBuf,
}

impl JobSummary {
    pub fn passed(&self) -> bool {
        self.status == JobStatus::Passed
    }
}

/// Verdict over a whole job set
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub job_set: PathBuf,
    pub repository: RepositoryIdentity,
    pub passed: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Ordered by ordinal
    pub jobs: Vec<JobSummary>,
}

impl Summary {
    pub fn status_label(&self) -> &'static str {
        if self.passed {
            "Passed"
        } else {
            "Failed"
        }
    }

    /// Wall clock span from the earliest start to the latest end
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn passed_count(&self) -> usize {
        self.jobs.iter().filter(|job| job.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.jobs.len() - self.passed_count()
    }
}

/// Summarize a sealed view; unsealed or unfinished sets are refused
pub fn summarize(view: &JobSetView) -> Result<Summary, StateError> {
    view.ensure_complete()?;

    let mut jobs = Vec::with_capacity(view.jobs().len());
    let mut start_time: Option<DateTime<Utc>> = None;
    let mut end_time: Option<DateTime<Utc>> = None;

    for record in view.jobs() {
        let result = record
            .result
            .as_ref()
            .ok_or_else(|| StateError::IncompleteJobSet {
                path: view.path().to_path_buf(),
                pending: vec![record.id()],
                sealed: view.is_sealed(),
            })?;

        start_time = Some(start_time.map_or(result.started_at, |t| t.min(result.started_at)));
        end_time = Some(end_time.map_or(result.ended_at, |t| t.max(result.ended_at)));

        jobs.push(JobSummary {
            ordinal: record.id(),
            environment: record.manifest.environment_name.clone(),
            status: result.status,
            duration: result.duration(),
            exit_status: result.exit_status,
            failure: result.failure.clone(),
            log_path: record.log_path(),
        });
    }

    let passed = jobs.iter().all(JobSummary::passed);
    tracing::debug!(
        job_set = %view.path().display(),
        jobs = jobs.len(),
        passed,
        "summarized job set"
    );

    Ok(Summary {
        job_set: view.path().to_path_buf(),
        repository: view.manifest().repository.clone(),
        passed,
        start_time,
        end_time,
        jobs,
    })
}

/// Render a duration as `1 hour 2 min 3 sec`; zero components other than
/// seconds are omitted
pub fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut words = String::new();
    if hours > 0 {
        words.push_str(&format!(
            "{} {} ",
            hours,
            if hours > 1 { "hours" } else { "hour" }
        ));
    }
    if minutes > 0 {
        words.push_str(&format!("{} min ", minutes));
    }
    words.push_str(&format!("{} sec", seconds));
    words
}
