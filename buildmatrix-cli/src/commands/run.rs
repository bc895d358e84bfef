use crate::output;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;

use buildmatrix_service::sandbox::process::Shell;
use buildmatrix_service::{
    progress_channel, ContainerExecutor, ExecutionEvent, GitSource, JobStatus,
    MatrixDefinition, MatrixExpander, ProcessExecutor, RunnerConfig, SandboxExecutor, SandboxKind,
    Scheduler, SchedulerConfig, StateStore,
};

/// Fetch a repository, expand its build matrix and run every environment
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Git URL of the repository under test
    pub url: String,

    /// Commit to check out (default: the remote HEAD)
    pub commit: Option<String>,

    /// Maximum number of sandboxes running at once
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<usize>,

    /// Run only the first N environments after sorting
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Per-job timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Sandbox backend: container or process
    #[arg(long, value_name = "KIND")]
    pub sandbox: Option<SandboxKind>,

    /// Container image for the container sandbox
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<String>,

    /// Build script for the process sandbox
    #[arg(long, value_name = "SCRIPT")]
    pub script: Option<String>,

    /// Run the process sandbox script with bash instead of sh
    #[arg(long)]
    pub bash: bool,

    /// Directory job sets are created under
    #[arg(long, short = 'o', value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Write each job directory to this file as it is created (truncated first)
    #[arg(long, value_name = "FILE")]
    pub save_paths: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, config: &mut RunnerConfig) {
        if let Some(jobs) = self.jobs {
            config.max_concurrency = jobs;
        }
        if self.limit.is_some() {
            config.limit = self.limit;
        }
        if let Some(timeout) = self.timeout {
            config.job_timeout_secs = timeout;
        }
        if let Some(kind) = self.sandbox {
            config.sandbox.kind = kind;
        }
        if let Some(image) = &self.image {
            config.sandbox.image = image.clone();
        }
        if let Some(script) = &self.script {
            config.sandbox.script = script.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
    }
}

fn open_save_paths(path: &Path) -> Result<File> {
    File::create(path).wrap_err_with(|| format!("cannot open {}", path.display()))
}

fn build_executor(config: &RunnerConfig, bash: bool) -> Result<Arc<dyn SandboxExecutor>> {
    match config.sandbox.kind {
        SandboxKind::Container => {
            let executor = ContainerExecutor::new(config.sandbox.container_config())?;
            Ok(Arc::new(executor))
        }
        SandboxKind::Process => {
            let mut executor = ProcessExecutor::new(config.sandbox.script.clone());
            if bash {
                executor = executor.with_shell(Shell::Bash);
            }
            Ok(Arc::new(executor))
        }
    }
}

pub async fn execute(args: RunArgs, mut config: RunnerConfig) -> Result<()> {
    args.apply(&mut config);
    config.validate()?;
    tracing::debug!(?config, "effective configuration");

    let executor = build_executor(&config, args.bash)?;

    let mut save_paths = args.save_paths.as_deref().map(open_save_paths).transpose()?;

    // Prepare: fetch the source and expand the matrix
    let workdir = tempfile::Builder::new().prefix("buildmatrix-").tempdir()?;
    output::status("Fetching", &args.url);
    let source = GitSource::new()?
        .fetch(&args.url, args.commit.as_deref(), workdir.path())
        .await?;
    tracing::info!(
        url = %args.url,
        commit = %source.repository.sha,
        checkout = %source.checkout.display(),
        "source fetched"
    );
    output::info(&format!(
        "{} {} ({})",
        source.repository.commit, source.repository.subject, source.repository.author
    ));

    let matrix_path = source.checkout.join(&config.matrix_file);
    let definition = MatrixDefinition::from_file(&matrix_path, &config.axes)?;
    let environments = MatrixExpander::with_axes(config.axes.clone())
        .with_limit(config.limit)
        .expand(&definition);
    if environments.is_empty() {
        output::warning(&format!(
            "{} expands to no environments; the job set will be empty",
            config.matrix_file
        ));
    }

    let store = StateStore::new(&config.output_dir);
    let job_set = store.create_job_set(source.repository.clone())?;
    tracing::info!(job_set = %job_set.path().display(), jobs = environments.len(), "job set created");
    output::status("Created", &job_set.path().display().to_string());

    let (tx, mut rx) = progress_channel();
    let scheduler = Scheduler::new(executor, SchedulerConfig::from(&config)).with_progress(tx);

    let run_set = job_set.clone();
    let exec_handle =
        tokio::spawn(async move { scheduler.run(&run_set, environments, &source).await });

    while let Some(event) = rx.recv().await {
        match &event {
            ExecutionEvent::RunStarted { total_jobs, .. } => {
                output::header(&format!(
                    "Running {} job(s) with up to {} sandbox(es)",
                    total_jobs, config.max_concurrency
                ));
            }

            ExecutionEvent::JobStarted {
                ordinal,
                job_path,
                environment,
            } => {
                println!("    Job #{} {}", ordinal, environment);
                if let Some(file) = save_paths.as_mut() {
                    writeln!(file, "{}", job_path.display())
                        .and_then(|_| file.flush())
                        .wrap_err("cannot save job path")?;
                }
            }

            ExecutionEvent::JobCompleted {
                ordinal,
                status,
                duration,
                failure,
            } => {
                let line = format!(
                    "    Job #{} {} ({:.2}s)",
                    ordinal,
                    status,
                    duration.as_secs_f64()
                );
                if *status == JobStatus::Passed {
                    output::dim_success(&line);
                } else {
                    output::dim_failure(&line);
                    if let Some(failure) = failure {
                        output::warning(&format!("      {}", failure));
                    }
                }
            }

            ExecutionEvent::RunSealed { .. } => {}

            ExecutionEvent::RunAborted { phase, message } => {
                output::error(&format!("run aborted during {} phase: {}", phase, message));
            }
        }
    }

    let outcome = exec_handle
        .await
        .map_err(|e| eyre!("scheduler task failed: {}", e))??;

    tracing::info!(
        job_set = %outcome.job_set.display(),
        passed = outcome.passed,
        failed = outcome.failed,
        "run finished"
    );
    drop(workdir);

    println!();
    println!("{}", outcome.job_set.display());
    if outcome.success() {
        output::success(&format!("All {} job(s) passed", outcome.total));
        Ok(())
    } else {
        output::failure(&format!(
            "{} of {} job(s) failed",
            outcome.failed, outcome.total
        ));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_paths_file_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("paths.txt");
        std::fs::write(&path, "/old/jobset/1\n").unwrap();

        let mut file = open_save_paths(&path).unwrap();
        writeln!(file, "/new/jobset/1").unwrap();
        drop(file);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "/new/jobset/1\n");
    }

    #[test]
    fn test_image_flag_satisfies_container_sandbox() {
        let args = RunArgs {
            url: "https://example.com/app.git".to_string(),
            commit: None,
            jobs: None,
            limit: None,
            timeout: None,
            sandbox: Some(SandboxKind::Container),
            image: Some("ruby:3.3".to_string()),
            script: None,
            bash: false,
            output_dir: None,
            save_paths: None,
        };
        let mut config = RunnerConfig::default();
        assert!(config.validate().is_err());

        args.apply(&mut config);
        assert_eq!(config.sandbox.image, "ruby:3.3");
        assert!(config.validate().is_ok());
    }
}
