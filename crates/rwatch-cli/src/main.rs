use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use rwatch_core::DayKey;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "rwatch")]
#[command(about = "Repository Watch command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture one snapshot and reconcile every category.
    Sync,
    /// Run the sync on the configured cron schedule until interrupted.
    Schedule,
    /// Print a Markdown summary of one day's change stores.
    Report {
        /// Day as YYYYMMDD; defaults to today in the display timezone.
        #[arg(long, value_parser = parse_day)]
        day: Option<DayKey>,
    },
}

fn parse_day(value: &str) -> Result<DayKey> {
    DayKey::parse(value).ok_or_else(|| anyhow!("expected YYYYMMDD, got {value:?}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Sync)).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "rwatch failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Sync => {
            let summary = rwatch_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} categories={} new={} changed={} failed={}",
                summary.run_id,
                summary.categories.len() + summary.failures.len(),
                summary.total_new(),
                summary.total_changed(),
                summary.failures.len()
            );
            for failure in &summary.failures {
                eprintln!("category {} failed: {}", failure.label, failure.error);
            }
            if !summary.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Schedule => rwatch_sync::run_scheduler_from_env().await?,
        Commands::Report { day } => {
            print!("{}", rwatch_sync::report_daily_from_env(day).await?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn report_day_must_be_compact() {
        let cli = Cli::try_parse_from(["rwatch", "report", "--day", "20251102"]).unwrap();
        match cli.command {
            Some(Commands::Report { day }) => assert_eq!(day.unwrap().to_string(), "20251102"),
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["rwatch", "report", "--day", "2025-11-02"]).is_err());
    }

    #[test]
    fn no_subcommand_means_sync() {
        let cli = Cli::try_parse_from(["rwatch"]).unwrap();
        assert!(cli.command.is_none());
    }
}
