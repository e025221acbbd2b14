use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pzl_core::RatingEntry;
use pzl_storage::{DatasetStore, JsonFileStore};
use pzl_sync::{ErrorKind, Reporter, RunError, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

const EXIT_RUN_FAILED: u8 = 1;
const EXIT_SETUP_FAILED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "pzl")]
#[command(
    about = "Puzzle rating ledger: fetch the profile page and merge new days into the dataset"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, merge and persist once (the default).
    Sync,
    /// Print the stored dataset without fetching.
    Show,
}

#[derive(Debug, Default)]
struct ConsoleReporter;

fn format_entry(entry: &RatingEntry) -> String {
    format!(
        "{} amount={} score={}",
        entry.date, entry.stats.amount, entry.stats.score
    )
}

fn format_failure(kind: ErrorKind, detail: &str) -> String {
    format!("error [{kind}]: {detail}")
}

impl Reporter for ConsoleReporter {
    fn new_entry(&mut self, entry: &RatingEntry) {
        println!("new entry: {}", format_entry(entry));
    }

    fn no_new_entries(&mut self) {
        println!("no new entries");
    }

    fn success(&mut self, summary: &SyncRunSummary) {
        println!(
            "success: {} entries on page, {} new, {} updated, {} stored",
            summary.fetched_entries,
            summary.new_entries.len(),
            summary.updated_dates.len(),
            summary.total_entries
        );
    }

    fn failure(&mut self, error: &RunError) {
        eprintln!("{}", format_failure(error.kind(), &error.to_string()));
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn sync(config: &SyncConfig) -> Result<ExitCode> {
    let pipeline = SyncPipeline::from_config(config)?;
    let mut reporter = ConsoleReporter;
    Ok(match pipeline.run_once(&mut reporter).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::from(EXIT_RUN_FAILED),
    })
}

async fn show(config: &SyncConfig) -> ExitCode {
    let store = JsonFileStore::new(config.dataset_path.clone());
    match store.load().await {
        Ok(dataset) => {
            for entry in dataset.iter() {
                println!("{}", format_entry(&entry));
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{}", format_failure(ErrorKind::ReadFailure, &err.to_string()));
            ExitCode::from(EXIT_RUN_FAILED)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = SyncConfig::from_env().context("reading configuration from environment")?;
    debug!(
        url = %config.profile_url,
        dataset = %config.dataset_path.display(),
        policy = ?config.merge_policy,
        date_path = %config.date_path,
        "loaded configuration"
    );
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => sync(&config).await,
        Commands::Show => Ok(show(&config).await),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "setup failed");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_SETUP_FAILED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pzl_core::DateKey;

    #[test]
    fn no_arguments_means_sync() {
        let cli = Cli::try_parse_from(["pzl"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["pzl", "show"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Show)));

        assert!(Cli::try_parse_from(["pzl", "--url", "x"]).is_err());
    }

    #[test]
    fn notices_name_the_date_and_failure_kind() {
        let entry = RatingEntry::new(DateKey::from_ymd(2024, 1, 2).unwrap(), 3, 1510);
        assert_eq!(format_entry(&entry), "2024-01-02 amount=3 score=1510");
        assert_eq!(
            format_failure(ErrorKind::FetchFailure, "http status 503"),
            "error [FetchFailure]: http status 503"
        );
    }
}
