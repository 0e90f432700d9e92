//! Source API collaborator and field mapping for grant applications.

use grantsync_storage::FetchError;
use thiserror::Error;

pub mod client;
pub mod mapping;
pub mod records;
pub mod source;

pub use client::{
    num_pages, page_results, ApiCredentials, ApiTransport, ClientSettings, CredentialsFile,
    SmApplyClient,
};
pub use mapping::{MappingTables, RegionTable, REGIONS};
pub use records::{map_applications, RawApplication};
pub use source::{ApplicationSource, FixtureSource, SourceRequest};

pub const CRATE_NAME: &str = "grantsync-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("token refresh response was not usable: {0}")]
    TokenRefresh(String),
    #[error("program '{0}' not found")]
    ProgramNotFound(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
