//! Raw page archive and HTTP plumbing for grantsync.

pub mod artifact;
pub mod http;

pub use artifact::{endpoint_slug, ArtifactStore, StoredArtifact};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "grantsync-storage";
