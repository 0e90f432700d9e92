//! Core record model, identities and resolution outcomes for grantsync.

use std::fmt;
use std::hash::Hash;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub mod operator;

pub use operator::{
    ActionChoice, CandidateView, OperatorPort, OperatorReply, PromptRequest, ScriptedOperator,
    StdioOperator, TargetPurpose,
};

pub const CRATE_NAME: &str = "grantsync-core";

/// Durable primary key of a `people_info` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(pub i64);

/// Durable primary key of a `voucher_company` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyId(pub i64);

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Investment,
    Person,
    Company,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Investment => "investment",
            EntityKind::Person => "person",
            EntityKind::Company => "company",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One funded (or requested) project, keyed by its externally assigned reference number.
///
/// `applicant_email` and `company_name` are not persisted on the investment row; they are
/// carried as foreign-key hints for the join linker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investment {
    pub ref_num: String,
    pub title: Option<String>,
    pub exec_summary: Option<String>,
    pub fiscal_year: Option<String>,
    pub research_fund_id: String,
    pub application_date: Option<NaiveDateTime>,
    pub decision_date: Option<NaiveDate>,
    pub amount_requested: f64,
    pub amount_awarded: f64,
    pub total_leverage: f64,
    pub private_sector_leverage: f64,
    pub fed_leverage: Option<f64>,
    pub other_leverage: Option<f64>,
    pub fte: Option<f64>,
    pub pte: Option<f64>,
    pub sector: Option<String>,
    pub notes: Option<String>,
    pub applicant_email: Option<String>,
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub note: Option<String>,
    pub comm_opt_out: Option<bool>,
}

impl Person {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub incorporation_date: Option<NaiveDate>,
}

/// Persisted person loaded for comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingPerson {
    pub person_id: PersonId,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
}

/// Persisted company loaded for comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingCompany {
    pub company_id: CompanyId,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
}

/// A previously persisted row that carries a durable identity.
pub trait ExistingRecord: Clone + fmt::Debug {
    type Id: Copy + Eq + Hash + fmt::Display + fmt::Debug + Serialize;

    fn identity(&self) -> Self::Id;
    fn display_name(&self) -> String;
    fn display_contact(&self) -> String;
    fn detail_fields(&self) -> Vec<(&'static str, String)>;
}

/// An incoming record that is deduplicated against existing rows of the same kind.
pub trait IncomingRecord: Clone + fmt::Debug {
    type Existing: ExistingRecord;
    const KIND: EntityKind;

    fn display_name(&self) -> String;
    fn display_contact(&self) -> String;
    fn detail_fields(&self) -> Vec<(&'static str, String)>;
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

impl ExistingRecord for ExistingPerson {
    type Id = PersonId;

    fn identity(&self) -> PersonId {
        self.person_id
    }

    fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    fn display_contact(&self) -> String {
        self.email
            .as_deref()
            .filter(|e| !e.is_empty())
            .unwrap_or("None")
            .to_string()
    }

    fn detail_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("person_id", self.person_id.to_string()),
            ("first_name", self.first_name.clone()),
            ("last_name", self.last_name.clone()),
            ("email", opt(&self.email)),
        ]
    }
}

impl ExistingRecord for ExistingCompany {
    type Id = CompanyId;

    fn identity(&self) -> CompanyId {
        self.company_id
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn display_contact(&self) -> String {
        format!("{}, {}", opt(&self.address), opt(&self.city))
    }

    fn detail_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("company_id", self.company_id.to_string()),
            ("name", self.name.clone()),
            ("address", opt(&self.address)),
            ("city", opt(&self.city)),
            ("province", opt(&self.province)),
        ]
    }
}

impl IncomingRecord for Person {
    type Existing = ExistingPerson;
    const KIND: EntityKind = EntityKind::Person;

    fn display_name(&self) -> String {
        self.full_name()
    }

    fn display_contact(&self) -> String {
        self.email.clone().unwrap_or_else(|| "N/A".to_string())
    }

    fn detail_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("first_name", self.first_name.clone()),
            ("last_name", self.last_name.clone()),
            ("email", opt(&self.email)),
            ("phone", opt(&self.phone)),
            ("note", opt(&self.note)),
            (
                "comm_opt_out",
                self.comm_opt_out.map(|b| b.to_string()).unwrap_or_default(),
            ),
        ]
    }
}

impl IncomingRecord for Company {
    type Existing = ExistingCompany;
    const KIND: EntityKind = EntityKind::Company;

    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn display_contact(&self) -> String {
        format!(
            "{}, {}",
            self.address.as_deref().unwrap_or("N/A"),
            self.city.as_deref().unwrap_or("N/A")
        )
    }

    fn detail_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("name", self.name.clone()),
            ("address", opt(&self.address)),
            ("city", opt(&self.city)),
            ("province", opt(&self.province)),
            ("postal_code", opt(&self.postal_code)),
            ("country", opt(&self.country)),
            ("region", opt(&self.region)),
            (
                "incorporation_date",
                self.incorporation_date
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
            ),
        ]
    }
}

/// Existing record that scored at or above the threshold for one incoming record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate<E> {
    pub existing: E,
    pub similarity: f64,
}

impl<E: ExistingRecord> MatchCandidate<E> {
    pub fn identity(&self) -> E::Id {
        self.existing.identity()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Insert,
    Skip,
    Update,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Insert => "insert",
            OutcomeKind::Skip => "skip",
            OutcomeKind::Update => "update",
        }
    }
}

/// Incoming record judged a duplicate of an existing row; no write, identity kept for linking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Skipped<T, Id> {
    pub record: T,
    pub matched: Id,
    pub matched_label: String,
    pub similarity: f64,
}

/// Incoming record whose non-key fields overwrite the target row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Updated<T, Id> {
    pub record: T,
    pub target: Id,
    pub target_label: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T, Id> {
    Insert(T),
    Skip(Skipped<T, Id>),
    Update(Updated<T, Id>),
}

impl<T, Id> Resolution<T, Id> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Resolution::Insert(_) => OutcomeKind::Insert,
            Resolution::Skip(_) => OutcomeKind::Skip,
            Resolution::Update(_) => OutcomeKind::Update,
        }
    }
}

/// Disjoint insert / skip / update partition of one incoming batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionSets<T, Id> {
    pub insert: Vec<T>,
    pub skip: Vec<Skipped<T, Id>>,
    pub update: Vec<Updated<T, Id>>,
}

impl<T, Id> Default for ResolutionSets<T, Id> {
    fn default() -> Self {
        Self {
            insert: Vec::new(),
            skip: Vec::new(),
            update: Vec::new(),
        }
    }
}

impl<T, Id> ResolutionSets<T, Id> {
    pub fn push(&mut self, resolution: Resolution<T, Id>) {
        match resolution {
            Resolution::Insert(record) => self.insert.push(record),
            Resolution::Skip(skipped) => self.skip.push(skipped),
            Resolution::Update(updated) => self.update.push(updated),
        }
    }

    pub fn len(&self) -> usize {
        self.insert.len() + self.skip.len() + self.update.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type PeopleOutcomes = ResolutionSets<Person, PersonId>;
pub type CompanyOutcomes = ResolutionSets<Company, CompanyId>;

/// Everything one source pull produced, before deduplication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceBatch {
    pub investments: Vec<Investment>,
    pub people: Vec<Person>,
    pub companies: Vec<Company>,
}
