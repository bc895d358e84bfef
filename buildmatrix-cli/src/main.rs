mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use buildmatrix_service::RunnerConfig;

use commands::{expand, finalize, list, run, status};

/// Run a repository's build matrix in sandboxes and report the verdict
#[derive(Parser, Debug)]
#[command(name = "buildmatrix", version, about)]
struct Cli {
    /// Configuration file (YAML); defaults apply when omitted
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace (RUST_LOG takes precedence)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(run::RunArgs),
    Expand(expand::ExpandArgs),
    Status(status::StatusArgs),
    Finalize(finalize::FinalizeArgs),
    List(list::ListArgs),
}

fn load_config(cli: &Cli) -> Result<RunnerConfig> {
    let mut config = match &cli.config {
        Some(path) => RunnerConfig::from_file(path)?,
        None => RunnerConfig::default(),
    };
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    Ok(config)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Run(args) => run::execute(args, config).await,
        Commands::Expand(args) => expand::execute(args, &config),
        Commands::Status(args) => status::execute(args, &config),
        Commands::Finalize(args) => finalize::execute(args, &config),
        Commands::List(args) => list::execute(args, &config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildmatrix_service::SandboxKind;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "buildmatrix",
            "--log-level",
            "debug",
            "run",
            "https://example.com/app.git",
            "abc1234",
            "--jobs",
            "4",
            "--sandbox",
            "process",
            "--save-paths",
            "paths.txt",
        ])
        .unwrap();

        let config = load_config(&cli).unwrap();
        assert_eq!(config.log_level, "debug");

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.commit.as_deref(), Some("abc1234"));
        assert_eq!(args.jobs, Some(4));
        assert_eq!(args.sandbox, Some(SandboxKind::Process));
        assert_eq!(args.save_paths, Some(PathBuf::from("paths.txt")));
    }

    #[test]
    fn test_parse_finalize_flags() {
        let cli = Cli::try_parse_from([
            "buildmatrix",
            "finalize",
            "/sets/run",
            "--format",
            "junit",
            "--report",
            "report-%{status}.xml",
            "--format-report-filename",
        ])
        .unwrap();

        let Commands::Finalize(args) = cli.command else {
            panic!("expected finalize command");
        };
        assert_eq!(args.format, "junit");
        assert!(args.format_report_filename);
    }
}
