//! Candidate search: one incoming record against every existing row of its kind.

use grantsync_core::{
    Company, ExistingCompany, ExistingPerson, IncomingRecord, MatchCandidate, Person,
};

use tracing::warn;

use crate::normalize::{extract_operating_name, normalize_company, normalize_person};
use crate::similarity::SimilarityMetric;

/// Comparison form of a record: a normalized name plus an optional exact identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchKey {
    pub name: String,
    pub email: Option<String>,
}

impl MatchKey {
    fn with_email(name: String, email: Option<&str>) -> Self {
        let email = email
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());
        Self { name, email }
    }

    /// No name survives normalization and there is no email to compare.
    pub fn is_blank(&self) -> bool {
        self.name.is_empty() && self.email.is_none()
    }

    /// Equal non-empty emails force 1.0; otherwise the metric scores the normalized names.
    pub fn similarity(&self, other: &MatchKey, metric: SimilarityMetric) -> f64 {
        match (&self.email, &other.email) {
            (Some(a), Some(b)) if a == b => 1.0,
            _ => metric.score(&self.name, &other.name),
        }
    }
}

pub trait Matchable: IncomingRecord {
    fn match_key(&self) -> MatchKey;
    fn existing_key(existing: &Self::Existing) -> MatchKey;
}

fn company_key(name: &str) -> MatchKey {
    MatchKey::with_email(normalize_company(extract_operating_name(name)), None)
}

fn person_key(first: &str, last: &str, email: Option<&str>) -> MatchKey {
    MatchKey::with_email(normalize_person(&format!("{first}{last}")), email)
}

impl Matchable for Company {
    fn match_key(&self) -> MatchKey {
        company_key(&self.name)
    }

    fn existing_key(existing: &ExistingCompany) -> MatchKey {
        company_key(&existing.name)
    }
}

impl Matchable for Person {
    fn match_key(&self) -> MatchKey {
        person_key(&self.first_name, &self.last_name, self.email.as_deref())
    }

    fn existing_key(existing: &ExistingPerson) -> MatchKey {
        person_key(
            &existing.first_name,
            &existing.last_name,
            existing.email.as_deref(),
        )
    }
}

/// Every existing row scoring `>= threshold`, best first. Equal scores keep the order of
/// `existing`.
pub fn find_similar<R: Matchable>(
    incoming: &R,
    existing: &[R::Existing],
    threshold: f64,
    metric: SimilarityMetric,
) -> Vec<MatchCandidate<R::Existing>> {
    let key = incoming.match_key();
    if key.is_blank() {
        warn!(
            kind = %R::KIND,
            name = %incoming.display_name(),
            "name normalizes to an empty form; it scores 1.0 against every other empty form"
        );
    }
    let mut candidates: Vec<_> = existing
        .iter()
        .filter_map(|row| {
            let similarity = key.similarity(&R::existing_key(row), metric);
            (similarity >= threshold).then(|| MatchCandidate {
                existing: row.clone(),
                similarity,
            })
        })
        .collect();
    candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    candidates
}

pub fn find_similar_companies(
    incoming: &Company,
    existing: &[ExistingCompany],
    threshold: f64,
) -> Vec<MatchCandidate<ExistingCompany>> {
    find_similar(incoming, existing, threshold, SimilarityMetric::default())
}

pub fn find_similar_people(
    incoming: &Person,
    existing: &[ExistingPerson],
    threshold: f64,
) -> Vec<MatchCandidate<ExistingPerson>> {
    find_similar(incoming, existing, threshold, SimilarityMetric::default())
}
