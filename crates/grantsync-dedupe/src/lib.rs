//! Duplicate detection and reconciliation for incoming grant records.
//!
//! Everything here is synchronous and storage-agnostic: callers hand in the incoming batch
//! plus the existing rows they loaded, and get back a disjoint insert / skip / update split.

pub mod matcher;
pub mod normalize;
pub mod resolver;
pub mod similarity;
pub mod splitter;

pub use matcher::{find_similar, find_similar_companies, find_similar_people, MatchKey, Matchable};
pub use normalize::{extract_operating_name, normalize_company, normalize_person};
pub use resolver::{Adjudication, Resolver, MAX_DISPLAYED_CANDIDATES};
pub use similarity::{ratcliff_obershelp, SimilarityMetric};
pub use splitter::{split_insert_update, Keyed, UniqueKey};

pub const CRATE_NAME: &str = "grantsync-dedupe";
