mod build_log;
mod cache_key;
mod cli;
mod config;
mod container_runtime;
mod github;
mod http;
mod logs;
mod pipeline;
mod registry;
mod report;
mod snapshots;
mod store;
mod taxonomy;
mod workflows;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Build version: CI sets CI_TELEMETRY_VERSION from the git tag, local builds use Cargo.toml.
pub const VERSION: &str = match option_env!("CI_TELEMETRY_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

/// ci-telemetry: CI build telemetry for the dashboard.
///
/// Collects GitHub Actions workflow durations, per-package colcon build times
/// and container image sizes into a single JSON report.
#[derive(Parser)]
#[command(name = "ci-telemetry", version = VERSION, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect workflow runs, build logs and image sizes into the report
    Collect {
        /// Report path (default: configured output)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Only runs created after this date (YYYY-MM-DD or RFC 3339, "none" for all)
        #[arg(long)]
        since: Option<String>,
    },

    /// Measure the configured image tags and record a size snapshot
    Images {
        /// Snapshot directory (default: configured data dir)
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Measure and compare without writing a snapshot
        #[arg(long)]
        dry_run: bool,
    },

    /// Summarize pull requests of the configured repository
    Pulls,

    /// Inspect or wipe the fetch cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached fetch results
    List,
    /// Remove every cached fetch result
    Purge,
}

fn main() -> Result<()> {
    // CI_TELEMETRY_LOG (not RUST_LOG) keeps reqwest and hyper quiet by default.
    let env_filter = tracing_subscriber::EnvFilter::try_from_env("CI_TELEMETRY_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ci_telemetry=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = config::Config::load()?;

    match cli.command {
        Commands::Collect { output, since } => {
            if let Some(since) = since {
                config.since = config::parse_since(&since)?;
            }
            cli::collect(&config, output.as_deref())
        }
        Commands::Images {
            output_dir,
            dry_run,
        } => cli::images(&config, output_dir.as_deref(), dry_run),
        Commands::Pulls => cli::pulls(&config),
        Commands::Cache { command } => match command {
            CacheCommands::List => cli::cache_list(&config),
            CacheCommands::Purge => cli::cache_purge(&config),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_collect_flags() {
        let cli = Cli::parse_from([
            "ci-telemetry",
            "collect",
            "--output",
            "out/report.json",
            "--since",
            "2024-06-01",
        ]);
        match cli.command {
            Commands::Collect { output, since } => {
                assert_eq!(output, Some(PathBuf::from("out/report.json")));
                assert_eq!(since.as_deref(), Some("2024-06-01"));
            }
            _ => panic!("expected collect"),
        }
    }

    #[test]
    fn test_parse_cache_purge() {
        let cli = Cli::parse_from(["ci-telemetry", "cache", "purge"]);
        assert!(matches!(
            cli.command,
            Commands::Cache {
                command: CacheCommands::Purge
            }
        ));
    }
}
