//! Storage collaborator: the operations the orchestrator and join linker need from the
//! database, plus an in-memory implementation used by tests and dry runs.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grantsync_core::{
    Company, CompanyId, ExistingCompany, ExistingPerson, Investment, Person, PersonId,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage is unreachable; the current sync step cannot continue.
    #[error("storage unavailable: {0}")]
    Connection(String),
    /// A single statement was rejected; callers record it and move on.
    #[error("statement rejected: {0}")]
    Statement(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_)
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
            other => StoreError::Statement(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowFailure {
    pub label: String,
    pub error: String,
    pub values: JsonValue,
}

/// What happened to one insert or update set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub applied: usize,
    pub failed: Vec<RowFailure>,
    /// Update targets that matched no row.
    pub missing_targets: Vec<String>,
}

impl BatchReport {
    pub fn record_failure(&mut self, label: &str, values: &impl Serialize, err: impl fmt::Display) {
        let values = serde_json::to_value(values).unwrap_or(JsonValue::Null);
        error!(label, error = %err, values = %values, "row rejected; continuing with batch");
        self.failed.push(RowFailure {
            label: label.to_string(),
            error: err.to_string(),
            values,
        });
    }

    pub fn record_missing(&mut self, label: &str) {
        warn!(label, "update matched no rows; target no longer exists");
        self.missing_targets.push(label.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectAssignment {
    pub ref_num: String,
    pub person_id: PersonId,
    pub participation: String,
    pub person_title: String,
    pub batch_id: Uuid,
    pub loaded_at: DateTime<Utc>,
}

impl ProjectAssignment {
    /// Principal investigator row, the only participation the sync creates.
    pub fn principal(
        ref_num: &str,
        person_id: PersonId,
        batch_id: Uuid,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            ref_num: ref_num.to_string(),
            person_id,
            participation: "PI".to_string(),
            person_title: "F".to_string(),
            batch_id,
            loaded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompanyAssignment {
    pub ref_num: String,
    pub company_id: CompanyId,
    pub batch_id: Uuid,
    pub loaded_at: DateTime<Utc>,
}

pub fn person_label(person: &Person) -> String {
    person
        .email
        .clone()
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| person.full_name())
}

/// Text key comparison used for reference numbers, emails and company names.
pub fn same_key(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

#[async_trait]
pub trait RecordStore: Send {
    async fn load_investment_keys(&mut self, research_fund_id: &str)
        -> Result<Vec<String>, StoreError>;
    async fn load_people(&mut self) -> Result<Vec<ExistingPerson>, StoreError>;
    async fn load_companies(&mut self) -> Result<Vec<ExistingCompany>, StoreError>;

    async fn insert_investments(&mut self, rows: &[Investment]) -> Result<BatchReport, StoreError>;
    /// Overwrites every non-key column of the row whose reference number matches.
    async fn update_investments(&mut self, rows: &[Investment]) -> Result<BatchReport, StoreError>;
    async fn insert_people(&mut self, rows: &[Person]) -> Result<BatchReport, StoreError>;
    async fn update_people(&mut self, rows: &[(PersonId, Person)])
        -> Result<BatchReport, StoreError>;
    async fn insert_companies(&mut self, rows: &[Company]) -> Result<BatchReport, StoreError>;
    async fn update_companies(
        &mut self,
        rows: &[(CompanyId, Company)],
    ) -> Result<BatchReport, StoreError>;

    async fn lookup_person_id(&mut self, email: &str) -> Result<Option<PersonId>, StoreError>;
    async fn lookup_company_id(&mut self, name: &str) -> Result<Option<CompanyId>, StoreError>;

    async fn project_assignment_exists(
        &mut self,
        ref_num: &str,
        person_id: PersonId,
    ) -> Result<bool, StoreError>;
    async fn insert_project_assignment(
        &mut self,
        assignment: &ProjectAssignment,
    ) -> Result<(), StoreError>;
    async fn company_assignment_exists(
        &mut self,
        ref_num: &str,
        company_id: CompanyId,
    ) -> Result<bool, StoreError>;
    async fn insert_company_assignment(
        &mut self,
        assignment: &CompanyAssignment,
    ) -> Result<(), StoreError>;
}

/// Keeps every table in vectors. Rows can be marked as rejected by label to exercise the
/// best-effort failure path, and the whole store can be taken offline.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    pub investments: Vec<Investment>,
    pub people: Vec<(PersonId, Person)>,
    pub companies: Vec<(CompanyId, Company)>,
    pub project_assignments: Vec<ProjectAssignment>,
    pub company_assignments: Vec<CompanyAssignment>,
    next_id: i64,
    rejected: HashSet<String>,
    offline: bool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_investment(&mut self, investment: Investment) {
        self.investments.push(investment);
    }

    pub fn seed_person(&mut self, person: Person) -> PersonId {
        let id = PersonId(self.allocate());
        self.people.push((id, person));
        id
    }

    pub fn seed_company(&mut self, company: Company) -> CompanyId {
        let id = CompanyId(self.allocate());
        self.companies.push((id, company));
        id
    }

    pub fn reject(&mut self, label: impl Into<String>) {
        self.rejected.insert(label.into());
    }

    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn online(&self) -> Result<(), StoreError> {
        if self.offline {
            return Err(StoreError::Connection("memory store is offline".into()));
        }
        Ok(())
    }

    fn check_row(&self, label: &str) -> Result<(), StoreError> {
        if self.rejected.contains(label) {
            return Err(StoreError::Statement(format!("row '{label}' rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load_investment_keys(
        &mut self,
        research_fund_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        self.online()?;
        Ok(self
            .investments
            .iter()
            .filter(|inv| inv.research_fund_id == research_fund_id)
            .map(|inv| inv.ref_num.clone())
            .collect())
    }

    async fn load_people(&mut self) -> Result<Vec<ExistingPerson>, StoreError> {
        self.online()?;
        Ok(self
            .people
            .iter()
            .map(|(id, p)| ExistingPerson {
                person_id: *id,
                first_name: p.first_name.clone(),
                last_name: p.last_name.clone(),
                email: p.email.clone(),
            })
            .collect())
    }

    async fn load_companies(&mut self) -> Result<Vec<ExistingCompany>, StoreError> {
        self.online()?;
        Ok(self
            .companies
            .iter()
            .map(|(id, c)| ExistingCompany {
                company_id: *id,
                name: c.name.clone(),
                address: c.address.clone(),
                city: c.city.clone(),
                province: c.province.clone(),
            })
            .collect())
    }

    async fn insert_investments(&mut self, rows: &[Investment]) -> Result<BatchReport, StoreError> {
        self.online()?;
        let mut report = BatchReport::default();
        for row in rows {
            let duplicate = self
                .investments
                .iter()
                .any(|inv| same_key(&inv.ref_num, &row.ref_num));
            let outcome = self.check_row(&row.ref_num).and_then(|_| {
                if duplicate {
                    Err(StoreError::Statement(format!(
                        "duplicate reference number {}",
                        row.ref_num
                    )))
                } else {
                    Ok(())
                }
            });
            match outcome {
                Ok(()) => {
                    self.investments.push(row.clone());
                    report.applied += 1;
                }
                Err(err) => report.record_failure(&row.ref_num, row, err),
            }
        }
        Ok(report)
    }

    async fn update_investments(&mut self, rows: &[Investment]) -> Result<BatchReport, StoreError> {
        self.online()?;
        let mut report = BatchReport::default();
        for row in rows {
            if let Err(err) = self.check_row(&row.ref_num) {
                report.record_failure(&row.ref_num, row, err);
                continue;
            }
            match self
                .investments
                .iter_mut()
                .find(|inv| same_key(&inv.ref_num, &row.ref_num))
            {
                Some(target) => {
                    let ref_num = target.ref_num.clone();
                    *target = Investment {
                        ref_num,
                        ..row.clone()
                    };
                    report.applied += 1;
                }
                None => report.record_missing(&row.ref_num),
            }
        }
        Ok(report)
    }

    async fn insert_people(&mut self, rows: &[Person]) -> Result<BatchReport, StoreError> {
        self.online()?;
        let mut report = BatchReport::default();
        for row in rows {
            let label = person_label(row);
            match self.check_row(&label) {
                Ok(()) => {
                    self.seed_person(row.clone());
                    report.applied += 1;
                }
                Err(err) => report.record_failure(&label, row, err),
            }
        }
        Ok(report)
    }

    async fn update_people(
        &mut self,
        rows: &[(PersonId, Person)],
    ) -> Result<BatchReport, StoreError> {
        self.online()?;
        let mut report = BatchReport::default();
        for (id, row) in rows {
            let label = person_label(row);
            if let Err(err) = self.check_row(&label) {
                report.record_failure(&label, row, err);
                continue;
            }
            match self.people.iter_mut().find(|(existing, _)| existing == id) {
                Some((_, target)) => {
                    *target = row.clone();
                    report.applied += 1;
                }
                None => report.record_missing(&format!("person {id}")),
            }
        }
        Ok(report)
    }

    async fn insert_companies(&mut self, rows: &[Company]) -> Result<BatchReport, StoreError> {
        self.online()?;
        let mut report = BatchReport::default();
        for row in rows {
            match self.check_row(&row.name) {
                Ok(()) => {
                    self.seed_company(row.clone());
                    report.applied += 1;
                }
                Err(err) => report.record_failure(&row.name, row, err),
            }
        }
        Ok(report)
    }

    async fn update_companies(
        &mut self,
        rows: &[(CompanyId, Company)],
    ) -> Result<BatchReport, StoreError> {
        self.online()?;
        let mut report = BatchReport::default();
        for (id, row) in rows {
            if let Err(err) = self.check_row(&row.name) {
                report.record_failure(&row.name, row, err);
                continue;
            }
            match self.companies.iter_mut().find(|(existing, _)| existing == id) {
                Some((_, target)) => {
                    *target = row.clone();
                    report.applied += 1;
                }
                None => report.record_missing(&format!("company {id}")),
            }
        }
        Ok(report)
    }

    async fn lookup_person_id(&mut self, email: &str) -> Result<Option<PersonId>, StoreError> {
        self.online()?;
        Ok(self
            .people
            .iter()
            .find(|(_, p)| p.email.as_deref().is_some_and(|e| same_key(e, email)))
            .map(|(id, _)| *id))
    }

    async fn lookup_company_id(&mut self, name: &str) -> Result<Option<CompanyId>, StoreError> {
        self.online()?;
        Ok(self
            .companies
            .iter()
            .find(|(_, c)| same_key(&c.name, name))
            .map(|(id, _)| *id))
    }

    async fn project_assignment_exists(
        &mut self,
        ref_num: &str,
        person_id: PersonId,
    ) -> Result<bool, StoreError> {
        self.online()?;
        Ok(self
            .project_assignments
            .iter()
            .any(|a| a.person_id == person_id && same_key(&a.ref_num, ref_num)))
    }

    async fn insert_project_assignment(
        &mut self,
        assignment: &ProjectAssignment,
    ) -> Result<(), StoreError> {
        self.online()?;
        if self
            .project_assignment_exists(&assignment.ref_num, assignment.person_id)
            .await?
        {
            return Err(StoreError::Statement(format!(
                "project assignment ({}, {}) already exists",
                assignment.ref_num, assignment.person_id
            )));
        }
        self.check_row(&assignment.ref_num)?;
        self.project_assignments.push(assignment.clone());
        Ok(())
    }

    async fn company_assignment_exists(
        &mut self,
        ref_num: &str,
        company_id: CompanyId,
    ) -> Result<bool, StoreError> {
        self.online()?;
        Ok(self
            .company_assignments
            .iter()
            .any(|a| a.company_id == company_id && same_key(&a.ref_num, ref_num)))
    }

    async fn insert_company_assignment(
        &mut self,
        assignment: &CompanyAssignment,
    ) -> Result<(), StoreError> {
        self.online()?;
        if self
            .company_assignment_exists(&assignment.ref_num, assignment.company_id)
            .await?
        {
            return Err(StoreError::Statement(format!(
                "company assignment ({}, {}) already exists",
                assignment.ref_num, assignment.company_id
            )));
        }
        self.check_row(&assignment.ref_num)?;
        self.company_assignments.push(assignment.clone());
        Ok(())
    }
}
