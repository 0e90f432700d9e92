//! Join linker: associates each investment with its principal investigator and company.
//!
//! Identities come from the resolution outcomes first (skip, then update) and from a storage
//! lookup otherwise, which is how freshly inserted rows are found. Association writes are
//! idempotent across runs (storage check) and within a run (in-memory set).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use grantsync_core::{CompanyId, CompanyOutcomes, Investment, PeopleOutcomes, PersonId};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{same_key, CompanyAssignment, ProjectAssignment, RecordStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub project_links_created: usize,
    pub company_links_created: usize,
    pub already_linked: usize,
    pub unresolved_people: Vec<String>,
    pub unresolved_companies: Vec<String>,
    pub failed: Vec<String>,
}

pub struct JoinLinker {
    batch_id: Uuid,
    loaded_at: DateTime<Utc>,
    linked_people: HashSet<(String, PersonId)>,
    linked_companies: HashSet<(String, CompanyId)>,
}

fn emails_match(candidate: &Option<String>, email: &str) -> bool {
    candidate.as_deref().is_some_and(|c| same_key(c, email))
}

impl JoinLinker {
    pub fn new(batch_id: Uuid, loaded_at: DateTime<Utc>) -> Self {
        Self {
            batch_id,
            loaded_at,
            linked_people: HashSet::new(),
            linked_companies: HashSet::new(),
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub async fn resolve_person<S: RecordStore + ?Sized>(
        store: &mut S,
        email: &str,
        people: &PeopleOutcomes,
    ) -> Result<Option<PersonId>, StoreError> {
        if let Some(skipped) = people.skip.iter().find(|s| emails_match(&s.record.email, email)) {
            return Ok(Some(skipped.matched));
        }
        if let Some(updated) = people
            .update
            .iter()
            .find(|u| emails_match(&u.record.email, email))
        {
            return Ok(Some(updated.target));
        }
        store.lookup_person_id(email).await
    }

    pub async fn resolve_company<S: RecordStore + ?Sized>(
        store: &mut S,
        name: &str,
        companies: &CompanyOutcomes,
    ) -> Result<Option<CompanyId>, StoreError> {
        if let Some(skipped) = companies
            .skip
            .iter()
            .find(|s| same_key(&s.record.name, name))
        {
            return Ok(Some(skipped.matched));
        }
        if let Some(updated) = companies
            .update
            .iter()
            .find(|u| same_key(&u.record.name, name))
        {
            return Ok(Some(updated.target));
        }
        store.lookup_company_id(name).await
    }

    pub async fn link<S: RecordStore + ?Sized>(
        &mut self,
        store: &mut S,
        investments: &[Investment],
        people: &PeopleOutcomes,
        companies: &CompanyOutcomes,
    ) -> Result<LinkReport, StoreError> {
        let mut report = LinkReport::default();
        for investment in investments {
            self.link_person(store, investment, people, &mut report).await?;
            self.link_company(store, investment, companies, &mut report)
                .await?;
        }
        info!(
            batch_id = %self.batch_id,
            project_links = report.project_links_created,
            company_links = report.company_links_created,
            already_linked = report.already_linked,
            "join linking complete"
        );
        Ok(report)
    }

    async fn link_person<S: RecordStore + ?Sized>(
        &mut self,
        store: &mut S,
        investment: &Investment,
        people: &PeopleOutcomes,
        report: &mut LinkReport,
    ) -> Result<(), StoreError> {
        let ref_num = investment.ref_num.as_str();
        let Some(email) = investment.applicant_email.as_deref().filter(|e| !e.is_empty()) else {
            warn!(ref_num, "no applicant email; project assignment not created");
            report.unresolved_people.push(ref_num.to_string());
            return Ok(());
        };
        let Some(person_id) = Self::resolve_person(store, email, people).await? else {
            warn!(ref_num, email, "no person identity for applicant");
            report.unresolved_people.push(ref_num.to_string());
            return Ok(());
        };

        let key = (ref_num.to_lowercase(), person_id);
        if self.linked_people.contains(&key)
            || store.project_assignment_exists(ref_num, person_id).await?
        {
            self.linked_people.insert(key);
            report.already_linked += 1;
            return Ok(());
        }

        let assignment =
            ProjectAssignment::principal(ref_num, person_id, self.batch_id, self.loaded_at);
        match store.insert_project_assignment(&assignment).await {
            Ok(()) => {
                info!(ref_num, %person_id, email, "linked principal investigator");
                self.linked_people.insert(key);
                report.project_links_created += 1;
            }
            Err(err) if !err.is_fatal() => {
                warn!(ref_num, %person_id, error = %err, "project assignment rejected");
                report.failed.push(format!("{ref_num}/person {person_id}"));
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    async fn link_company<S: RecordStore + ?Sized>(
        &mut self,
        store: &mut S,
        investment: &Investment,
        companies: &CompanyOutcomes,
        report: &mut LinkReport,
    ) -> Result<(), StoreError> {
        let ref_num = investment.ref_num.as_str();
        let Some(name) = investment
            .company_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
        else {
            warn!(ref_num, "no company name; company assignment not created");
            report.unresolved_companies.push(ref_num.to_string());
            return Ok(());
        };
        let Some(company_id) = Self::resolve_company(store, name, companies).await? else {
            warn!(ref_num, company = name, "no company identity");
            report.unresolved_companies.push(ref_num.to_string());
            return Ok(());
        };

        let key = (ref_num.to_lowercase(), company_id);
        if self.linked_companies.contains(&key)
            || store.company_assignment_exists(ref_num, company_id).await?
        {
            self.linked_companies.insert(key);
            report.already_linked += 1;
            return Ok(());
        }

        let assignment = CompanyAssignment {
            ref_num: ref_num.to_string(),
            company_id,
            batch_id: self.batch_id,
            loaded_at: self.loaded_at,
        };
        match store.insert_company_assignment(&assignment).await {
            Ok(()) => {
                info!(ref_num, %company_id, company = name, "linked company");
                self.linked_companies.insert(key);
                report.company_links_created += 1;
            }
            Err(err) if !err.is_fatal() => {
                warn!(ref_num, %company_id, error = %err, "company assignment rejected");
                report.failed.push(format!("{ref_num}/company {company_id}"));
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }
}
