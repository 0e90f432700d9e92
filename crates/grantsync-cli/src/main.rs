use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use grantsync_sync::{PgRecordStore, SyncConfig, SyncRunSummary};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "grantsync")]
#[command(about = "Grant application sync: API to SQL with duplicate review")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull applications and reconcile them into the database.
    Sync(SyncArgs),
    /// Run an interactive sync whose questions are answered on the web review desk.
    Serve {
        #[command(flatten)]
        sync: SyncArgs,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply pending schema migrations.
    Migrate,
    /// Markdown digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Auto-skip every possible duplicate instead of prompting.
    #[arg(long)]
    non_interactive: bool,
    #[arg(long)]
    threshold: Option<f64>,
    #[arg(long)]
    fiscal_year: Option<String>,
    #[arg(long)]
    program: Option<String>,
    /// Read applications from a JSON fixture instead of the API.
    #[arg(long)]
    fixture: Option<PathBuf>,
}

impl SyncArgs {
    fn apply(&self, config: &mut SyncConfig) -> Result<()> {
        if self.non_interactive {
            config.interactive = false;
        }
        if let Some(threshold) = self.threshold {
            anyhow::ensure!(
                (0.0..=1.0).contains(&threshold),
                "--threshold must be between 0 and 1, got {threshold}"
            );
            config.similarity_threshold = threshold;
        }
        if let Some(year) = &self.fiscal_year {
            config.fiscal_year = year.clone();
        }
        if let Some(program) = &self.program {
            config.program_name = program.clone();
        }
        Ok(())
    }

    /// The review desk answers every prompt, so it always runs interactively.
    fn apply_for_review(&self, config: &mut SyncConfig) -> Result<()> {
        anyhow::ensure!(
            !self.non_interactive,
            "the review desk only serves interactive runs"
        );
        self.apply(config)?;
        config.interactive = true;
        Ok(())
    }
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} applications={} investments(+{} ~{}) people(+{} ~{} ={}) companies(+{} ~{} ={}) links={} failed={} reports={}",
        summary.run_id,
        summary.fetched_applications,
        summary.investments.inserted,
        summary.investments.updated,
        summary.people.inserted,
        summary.people.updated,
        summary.people.skipped,
        summary.companies.inserted,
        summary.companies.updated,
        summary.companies.skipped,
        summary.links.project_links_created + summary.links.company_links_created,
        summary.investments.failed + summary.people.failed + summary.companies.failed,
        summary.reports_dir
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            args.apply(&mut config)?;
            let summary = grantsync_sync::run_sync(config, args.fixture).await?;
            print_summary(&summary);
        }
        Commands::Serve { sync, port } => {
            sync.apply_for_review(&mut config)?;
            let port = port.unwrap_or_else(grantsync_web::port_from_env);
            let summary = grantsync_web::serve_review(config, sync.fixture, port).await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            let store = PgRecordStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            sqlx::migrate!("../../migrations")
                .run(store.pool())
                .await
                .context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Report { runs } => {
            let markdown = grantsync_sync::report_runs_markdown(runs, &config.reports_root())?;
            println!("{markdown}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flags_override_environment() {
        let cli = Cli::try_parse_from([
            "grantsync",
            "sync",
            "--non-interactive",
            "--threshold",
            "0.9",
            "--fiscal-year",
            "2024",
        ])
        .unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        let mut config = SyncConfig::from_env();
        args.apply(&mut config).unwrap();
        assert!(!config.interactive);
        assert_eq!(config.similarity_threshold, 0.9);
        assert_eq!(config.fiscal_year, "2024");
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let args = SyncArgs {
            threshold: Some(1.5),
            ..Default::default()
        };
        assert!(args.apply(&mut SyncConfig::from_env()).is_err());
    }

    #[test]
    fn report_defaults_to_five_runs() {
        let cli = Cli::try_parse_from(["grantsync", "report"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Report { runs: 5 })));
    }

    #[test]
    fn serve_takes_sync_flags_and_forces_interactive() {
        let cli = Cli::try_parse_from([
            "grantsync",
            "serve",
            "--port",
            "8123",
            "--fixture",
            "fixtures/smapply/sample/applications.json",
        ])
        .unwrap();
        let Some(Commands::Serve { sync, port }) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(port, Some(8123));
        assert!(sync.fixture.is_some());

        let mut config = SyncConfig::from_env();
        config.interactive = false;
        sync.apply_for_review(&mut config).unwrap();
        assert!(config.interactive);

        let refused = SyncArgs {
            non_interactive: true,
            ..Default::default()
        };
        assert!(refused.apply_for_review(&mut SyncConfig::from_env()).is_err());
    }
}
