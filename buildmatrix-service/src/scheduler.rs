// Job Scheduler
// Fans expanded environments out to a bounded pool of sandbox workers

use crate::config::{ConfigError, RunnerConfig};
use crate::error::{RunPhase, ServiceError, ServiceResult};
use crate::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::matrix::Environment;
use crate::sandbox::{ExecutionOutcome, ExecutionRequest, SandboxExecutor, SandboxFailure};
use crate::source::SourceRef;
use crate::state::{JobResult, JobSetHandle, JobStatus};

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// Limits applied to a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum sandboxes in flight at once
    pub max_concurrency: usize,
    /// Wall clock limit for each job
    pub job_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            job_timeout: Duration::from_secs(3600),
        }
    }
}

impl From<&RunnerConfig> for SchedulerConfig {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            job_timeout: config.job_timeout(),
        }
    }
}

/// What a completed run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub job_set: PathBuf,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub sealed: bool,
}

impl RunOutcome {
    /// A run passes when it sealed and no job failed
    pub fn success(&self) -> bool {
        self.sealed && self.failed == 0
    }
}

type WorkItem = (u32, Environment);
type WorkerFailure = (RunPhase, ServiceError);
/// Requests whose sandbox may still be alive, keyed by ordinal
type InFlight = Arc<Mutex<HashMap<u32, ExecutionRequest>>>;

#[derive(Debug, Default)]
struct Tally {
    passed: usize,
    failed: usize,
}

/// Runs every environment of a job set through a sandbox executor
pub struct Scheduler {
    executor: Arc<dyn SandboxExecutor>,
    config: SchedulerConfig,
    event_tx: Option<ProgressSender>,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn SandboxExecutor>, config: SchedulerConfig) -> Self {
        Self {
            executor,
            config,
            event_tx: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every environment and seal the set.
    ///
    /// Ordinals are assigned from expansion order, starting at 1. Jobs whose
    /// sandbox fails or times out are recorded as failed; any other fault
    /// aborts the run, cancels in-flight workers and leaves the set unsealed.
    pub async fn run(
        &self,
        job_set: &JobSetHandle,
        environments: Vec<Environment>,
        source: &SourceRef,
    ) -> ServiceResult<RunOutcome> {
        if self.config.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".to_string()).into());
        }

        let total = environments.len();
        let workers_needed = self.config.max_concurrency.min(total);
        tracing::info!(
            job_set = %job_set.path().display(),
            jobs = total,
            workers = workers_needed,
            "starting run"
        );
        self.event_tx
            .send_event(ExecutionEvent::run_started(job_set.path(), total));

        // The queue is filled up front and closed, so workers drain it in
        // expansion order and stop when it is empty
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<WorkItem>();
        for (index, environment) in environments.into_iter().enumerate() {
            let _ = queue_tx.send((index as u32 + 1, environment));
        }
        drop(queue_tx);
        let queue = Arc::new(Mutex::new(queue_rx));

        let instance_prefix = instance_prefix(job_set);
        let in_flight: InFlight = Arc::default();
        let mut workers = JoinSet::new();
        for _ in 0..workers_needed {
            let worker = Worker {
                queue: Arc::clone(&queue),
                job_set: job_set.clone(),
                source: source.clone(),
                executor: Arc::clone(&self.executor),
                timeout: self.config.job_timeout,
                instance_prefix: instance_prefix.clone(),
                in_flight: Arc::clone(&in_flight),
                event_tx: self.event_tx.clone(),
            };
            workers.spawn(worker.run());
        }

        let mut tally = Tally::default();
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err((RunPhase::Execute, ServiceError::Worker(e.to_string())))
            });
            match result {
                Ok(worker_tally) => {
                    tally.passed += worker_tally.passed;
                    tally.failed += worker_tally.failed;
                }
                Err((phase, err)) => {
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    self.teardown_in_flight(&in_flight).await;
                    tracing::error!(
                        phase = %phase,
                        job_set = %job_set.path().display(),
                        error = %err,
                        "run aborted"
                    );
                    self.event_tx
                        .send_event(ExecutionEvent::run_aborted(phase, err.to_string()));
                    return Err(ServiceError::aborted(phase, job_set.path(), err));
                }
            }
        }

        if let Err(err) = job_set.seal() {
            self.event_tx
                .send_event(ExecutionEvent::run_aborted(RunPhase::Seal, err.to_string()));
            return Err(ServiceError::aborted(RunPhase::Seal, job_set.path(), err.into()));
        }

        tracing::info!(
            job_set = %job_set.path().display(),
            passed = tally.passed,
            failed = tally.failed,
            "run sealed"
        );
        self.event_tx.send_event(ExecutionEvent::RunSealed {
            job_set: job_set.path().to_path_buf(),
            passed: tally.passed,
            failed: tally.failed,
        });

        Ok(RunOutcome {
            job_set: job_set.path().to_path_buf(),
            total,
            passed: tally.passed,
            failed: tally.failed,
            sealed: true,
        })
    }
}

impl Scheduler {
    /// Cancelled workers only drop their client process; remove the sandboxes too
    async fn teardown_in_flight(&self, in_flight: &InFlight) {
        let requests: Vec<ExecutionRequest> =
            in_flight.lock().await.drain().map(|(_, request)| request).collect();
        for request in requests {
            tracing::warn!(job = request.job_id, instance = %request.instance, "tearing down cancelled job");
            self.executor.teardown(&request).await;
        }
    }
}

/// Sandbox instance names are `buildmatrix-<set>-<ordinal>`, restricted to
/// the characters container runtimes accept
fn instance_prefix(job_set: &JobSetHandle) -> String {
    let name = job_set
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("buildmatrix-{}", sanitized.trim_matches(|c| c == '-' || c == '.'))
}

struct Worker {
    queue: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    job_set: JobSetHandle,
    source: SourceRef,
    executor: Arc<dyn SandboxExecutor>,
    timeout: Duration,
    instance_prefix: String,
    in_flight: InFlight,
    event_tx: Option<ProgressSender>,
}

impl Worker {
    async fn run(self) -> Result<Tally, WorkerFailure> {
        let mut tally = Tally::default();
        loop {
            let next = self.queue.lock().await.recv().await;
            let Some((ordinal, environment)) = next else {
                break;
            };

            match self.run_job(ordinal, environment).await? {
                JobStatus::Passed => tally.passed += 1,
                _ => tally.failed += 1,
            }
        }
        Ok(tally)
    }

    async fn run_job(
        &self,
        ordinal: u32,
        environment: Environment,
    ) -> Result<JobStatus, WorkerFailure> {
        let job = self
            .job_set
            .add_job(&environment, ordinal)
            .map_err(|e| (RunPhase::Allocate, e.into()))?;
        let status = JobStatus::Pending
            .advance(JobStatus::Running)
            .map_err(|e| (RunPhase::Execute, e.into()))?;

        let description = environment.describe();
        tracing::info!(job = ordinal, environment = %description, "job started");
        self.event_tx.send_event(ExecutionEvent::job_started(
            ordinal,
            job.path(),
            description,
        ));

        let output = job.output_sink();
        let request = ExecutionRequest {
            job_id: ordinal,
            instance: format!("{}-{}", self.instance_prefix, ordinal),
            environment,
            source: self.source.clone(),
        };

        self.in_flight.lock().await.insert(ordinal, request.clone());
        let started_at = Utc::now();
        let start = Instant::now();
        let outcome =
            match tokio::time::timeout(self.timeout, self.executor.execute(&request, &output))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(job = ordinal, timeout_secs = self.timeout.as_secs(), "job timed out");
                    self.executor.teardown(&request).await;
                    ExecutionOutcome::SandboxFailure(SandboxFailure::Timeout(self.timeout))
                }
            };
        self.in_flight.lock().await.remove(&ordinal);
        let ended_at = Utc::now();
        let duration = start.elapsed();

        if let Some(failure) = outcome.failure() {
            tracing::warn!(job = ordinal, failure = %failure, "sandbox failure");
        }

        let next = if outcome.passed() {
            JobStatus::Passed
        } else {
            JobStatus::Failed
        };
        let status = status
            .advance(next)
            .map_err(|e| (RunPhase::Execute, e.into()))?;

        let failure = outcome.failure().map(ToString::to_string);
        let result = JobResult {
            status,
            started_at,
            ended_at,
            exit_status: outcome.exit_status(),
            failure: failure.clone(),
        };
        job.record_result(&result, output)
            .map_err(|e| (RunPhase::Record, e.into()))?;

        tracing::info!(
            job = ordinal,
            status = %status,
            duration_ms = duration.as_millis() as u64,
            "job finished"
        );
        self.event_tx
            .send_event(ExecutionEvent::job_completed(ordinal, status, duration, failure));

        Ok(status)
    }
}
