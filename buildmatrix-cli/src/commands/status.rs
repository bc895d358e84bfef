use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use buildmatrix_service::{JobStatus, RunnerConfig, StateStore};

/// Show the progress of a job set, sealed or not
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Path to the job set directory
    pub job_set: PathBuf,
}

pub fn execute(args: StatusArgs, config: &RunnerConfig) -> Result<()> {
    let store = StateStore::new(&config.output_dir);
    let view = store.open_job_set(&args.job_set)?;
    let repo = &view.manifest().repository;

    output::header(&view.path().display().to_string());
    if !repo.url.is_empty() {
        output::info(&format!("{} @ {} {}", repo.url, repo.commit, repo.subject));
    }

    for job in view.jobs() {
        let line = format!(
            "  #{} {} {}",
            job.id(),
            job.status(),
            job.manifest.environment_name
        );
        match job.status() {
            JobStatus::Passed => output::dim_success(&line),
            JobStatus::Failed => output::dim_failure(&line),
            _ => println!("{}", line),
        }
    }

    let pending = view.pending();
    let finished = view.jobs().len() - pending.len();
    println!();
    if view.is_sealed() {
        output::check(&format!("Sealed, {} job(s) finished", finished));
    } else {
        output::warning(&format!(
            "Not sealed: {} of {} job(s) finished",
            finished,
            view.jobs().len()
        ));
    }

    Ok(())
}
