use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use buildmatrix_service::{render, report_filename, summarize, ReportFormat, RunnerConfig, StateStore};

/// Summarize a sealed job set and render its report
#[derive(Args, Debug)]
pub struct FinalizeArgs {
    /// Path to the job set directory
    pub job_set: PathBuf,

    /// Output format: terminal, junit, tap
    #[arg(long, short = 'f', default_value = "terminal")]
    pub format: String,

    /// Write the report to this file instead of stdout
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Substitute %{status} in the report file name with PASS or FAIL
    #[arg(long)]
    pub format_report_filename: bool,
}

pub fn execute(args: FinalizeArgs, config: &RunnerConfig) -> Result<()> {
    let format: ReportFormat = args
        .format
        .parse()
        .map_err(|e: String| color_eyre::eyre::eyre!("{}", e))?;

    let store = StateStore::new(&config.output_dir);
    let view = store.open_sealed_job_set(&args.job_set)?;
    let summary = summarize(&view)?;
    let report = render(&summary, format);

    match &args.report {
        Some(path) => {
            let path = if args.format_report_filename {
                PathBuf::from(report_filename(&path.to_string_lossy(), summary.passed))
            } else {
                path.clone()
            };
            tracing::info!(report = %path.display(), format = %format, passed = summary.passed, "saving report");
            output::status("Saving", &format!("report to {}", path.display()));
            std::fs::write(&path, report)
                .wrap_err_with(|| format!("cannot write report {}", path.display()))?;
        }
        None => print!("{}", report),
    }

    if summary.passed {
        output::success(&format!("{}: {} job(s)", summary.status_label(), summary.jobs.len()));
        Ok(())
    } else {
        output::failure(&format!(
            "{}: {} of {} job(s) failed",
            summary.status_label(),
            summary.failed_count(),
            summary.jobs.len()
        ));
        std::process::exit(1);
    }
}
