//! Storage collaborator, join linker and the sync orchestrator for grant applications.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use grantsync_adapters::{ApplicationSource, ClientSettings, FixtureSource, SmApplyClient};
use grantsync_core::{OperatorPort, StdioOperator};
use grantsync_storage::{ArtifactStore, HttpClientConfig, HttpFetcher};

pub mod config;
pub mod linker;
pub mod pipeline;
pub mod postgres;
pub mod reports;
pub mod store;

pub use config::SyncConfig;
pub use linker::{JoinLinker, LinkReport};
pub use pipeline::{
    drop_exact_duplicates, operator_phase, EntityCounts, SyncPipeline, SyncRunSummary,
};
pub use postgres::PgRecordStore;
pub use reports::{report_runs_markdown, OutcomeRecord, ParquetManifest, ParquetManifestFile};
pub use store::{
    BatchReport, CompanyAssignment, MemoryRecordStore, ProjectAssignment, RecordStore, RowFailure,
    StoreError,
};

pub const CRATE_NAME: &str = "grantsync-sync";

fn live_source(config: &SyncConfig) -> Result<SmApplyClient> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let settings = ClientSettings {
        base_url: config.api_base_url.clone(),
        token_url: config.token_url.clone(),
        credentials_path: config.credentials_path.clone(),
    };
    let client = SmApplyClient::new(http, settings)
        .with_context(|| format!("loading credentials {}", config.credentials_path.display()))?
        .with_archive(ArtifactStore::new(config.artifacts_dir.clone()));
    Ok(client)
}

/// Runs one sync against Postgres, reading from the live API or from `fixture` when given.
/// Interactive runs talk to the operator on the terminal.
pub async fn run_sync(config: SyncConfig, fixture: Option<PathBuf>) -> Result<SyncRunSummary> {
    let mut stdio = StdioOperator;
    let operator: Option<&mut dyn OperatorPort> = if config.interactive {
        Some(&mut stdio)
    } else {
        None
    };
    run_sync_with(config, fixture, operator).await
}

/// Same as [`run_sync`] with the operator supplied by the caller.
pub async fn run_sync_with(
    config: SyncConfig,
    fixture: Option<PathBuf>,
    operator: Option<&mut (dyn OperatorPort + '_)>,
) -> Result<SyncRunSummary> {
    let store = PgRecordStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let mut source: Box<dyn ApplicationSource> = match fixture {
        Some(path) => Box::new(FixtureSource::load(&path)?),
        None => Box::new(live_source(&config)?),
    };
    let mut pipeline = SyncPipeline::new(config, store)?;
    pipeline.run_once(source.as_mut(), operator).await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync(SyncConfig::from_env(), None).await
}
