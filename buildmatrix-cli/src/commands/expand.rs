use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use buildmatrix_service::{MatrixDefinition, MatrixExpander, RunnerConfig};

/// Print the environments a matrix file expands to
#[derive(Args, Debug)]
pub struct ExpandArgs {
    /// Path to the matrix file (e.g. .travis.yml)
    pub file: PathBuf,

    /// Keep only the first N environments after sorting
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Axis to expand (can be repeated; default: from config)
    #[arg(long = "axis", value_name = "NAME")]
    pub axes: Vec<String>,
}

pub fn execute(args: ExpandArgs, config: &RunnerConfig) -> Result<()> {
    if !args.file.exists() {
        color_eyre::eyre::bail!("Matrix file not found: {}", args.file.display());
    }

    let axes = if args.axes.is_empty() {
        config.axes.clone()
    } else {
        args.axes.clone()
    };
    let limit = args.limit.or(config.limit);

    let definition = MatrixDefinition::from_file(&args.file, &axes)?;
    let environments = MatrixExpander::with_axes(axes.clone())
        .with_limit(limit)
        .expand(&definition);

    if environments.is_empty() {
        output::warning("Matrix expands to no environments");
        return Ok(());
    }

    output::status(
        "Expanded",
        &format!("{} environment(s) over [{}]", environments.len(), axes.join(", ")),
    );
    for (index, environment) in environments.iter().enumerate() {
        println!("#{} {}", index + 1, environment.describe());
    }

    Ok(())
}
