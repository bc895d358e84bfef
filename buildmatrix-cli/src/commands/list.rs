use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use buildmatrix_service::{RunnerConfig, StateStore};

/// List job sets under the output directory
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Directory to list (default: the configured output directory)
    #[arg(long, short = 'o', value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

pub fn execute(args: ListArgs, config: &RunnerConfig) -> Result<()> {
    let root = args.output_dir.unwrap_or_else(|| config.output_dir.clone());
    let store = StateStore::new(&root);
    let sets = store.list_job_sets()?;

    if sets.is_empty() {
        output::info(&format!("No job sets under {}", root.display()));
        return Ok(());
    }

    for path in sets {
        match store.open_job_set(&path) {
            Ok(view) => {
                let state = if view.is_sealed() { "sealed" } else { "open" };
                println!(
                    "{}  {:<6} {} job(s)",
                    path.display(),
                    state,
                    view.jobs().len()
                );
            }
            Err(e) => output::warning(&format!("{}: {}", path.display(), e)),
        }
    }

    Ok(())
}
