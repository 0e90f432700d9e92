use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use grantsync_adapters::{map_applications, ApplicationSource, MappingTables, RegionTable, SourceRequest};
use grantsync_core::{
    Company, EntityKind, OperatorPort, Person, ResolutionSets, SourceBatch,
};
use grantsync_dedupe::{split_insert_update, Adjudication, Resolver, UniqueKey};
use serde::Serialize;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::linker::{JoinLinker, LinkReport};
use crate::reports::{
    export_parquet_snapshot, investment_outcomes, resolution_outcomes, write_reports,
};
use crate::store::{person_label, BatchReport, RecordStore, RowFailure};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub incoming: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub missing_targets: usize,
}

impl EntityCounts {
    fn absorb(&mut self, inserts: &BatchReport, updates: &BatchReport) {
        self.inserted += inserts.applied;
        self.updated += updates.applied;
        self.failed += inserts.failed.len() + updates.failed.len();
        self.missing_targets += inserts.missing_targets.len() + updates.missing_targets.len();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_applications: usize,
    pub dropped_duplicates: usize,
    pub investments: EntityCounts,
    pub people: EntityCounts,
    pub companies: EntityCounts,
    pub links: LinkReport,
    /// Cities whose region the operator supplied during this run.
    pub learned_regions: Vec<String>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

/// Drops exact repeats, keeping the first occurrence and input order.
pub fn drop_exact_duplicates<T: PartialEq>(records: Vec<T>) -> (Vec<T>, usize) {
    let before = records.len();
    let mut kept: Vec<T> = Vec::with_capacity(before);
    for record in records {
        if !kept.contains(&record) {
            kept.push(record);
        }
    }
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Runs a phase that may block on operator input. On a multi-thread runtime the worker is
/// handed over with `block_in_place` so timers, I/O and a review server keep running.
pub fn operator_phase<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

pub struct SyncPipeline<S> {
    config: SyncConfig,
    store: S,
    tables: MappingTables,
    resolver: Resolver,
}

impl<S: RecordStore> SyncPipeline<S> {
    pub fn new(config: SyncConfig, store: S) -> Result<Self> {
        let tables = MappingTables::load(config.mappings_path())?;
        let resolver = Resolver::new(config.similarity_threshold, config.similarity_metric);
        Ok(Self {
            config,
            store,
            tables,
            resolver,
        })
    }

    pub fn with_tables(mut self, tables: MappingTables) -> Self {
        self.tables = tables;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// One full pass: fetch, map, reconcile investments, resolve people and companies, link,
    /// report. `operator` is consulted only when the configuration is interactive.
    pub async fn run_once(
        &mut self,
        source: &mut dyn ApplicationSource,
        operator: Option<&mut (dyn OperatorPort + '_)>,
    ) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = source.source_id());
        self.run_inner(run_id, source, operator)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &mut self,
        run_id: Uuid,
        source: &mut dyn ApplicationSource,
        operator: Option<&mut (dyn OperatorPort + '_)>,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let interactive = self.config.interactive;
        let mut operator = operator.filter(|_| interactive);
        info!(
            program = %self.config.program_name,
            fiscal_year = %self.config.fiscal_year,
            interactive = operator.is_some(),
            threshold = self.resolver.threshold(),
            "sync run started"
        );

        let request = SourceRequest {
            program_name: self.config.program_name.clone(),
            fiscal_year: self.config.fiscal_year.clone(),
        };
        let raws = source
            .fetch_applications(&request)
            .await
            .context("fetching applications")?;

        let regions = RegionTable::seeded(&self.tables);
        let (batch, regions) = operator_phase(|| {
            map_applications(
                &raws,
                &self.config.research_fund_id,
                &self.tables,
                regions,
                operator.as_deref_mut(),
            )
        })
        .context("mapping applications")?;
        let SourceBatch {
            investments,
            people,
            companies,
        } = batch;

        let (investments, dropped_investments) = drop_exact_duplicates(investments);
        let (people, dropped_people) = drop_exact_duplicates(people);
        let (companies, dropped_companies) = drop_exact_duplicates(companies);
        let dropped_duplicates = dropped_investments + dropped_people + dropped_companies;
        if dropped_duplicates > 0 {
            info!(
                investments = dropped_investments,
                people = dropped_people,
                companies = dropped_companies,
                "dropped exact duplicates"
            );
        }

        let mut failures: Vec<RowFailure> = Vec::new();

        // Investments: exact reference-number reconciliation.
        let mut investment_counts = EntityCounts {
            incoming: investments.len(),
            ..Default::default()
        };
        let existing_keys: Vec<UniqueKey> = self
            .store
            .load_investment_keys(&self.config.research_fund_id)
            .await
            .context("loading existing investment reference numbers")?
            .into_iter()
            .map(UniqueKey::from)
            .collect();
        let (new_investments, known_investments) =
            split_insert_update(investments.clone(), &existing_keys);
        let inserted = self
            .store
            .insert_investments(&new_investments)
            .await
            .context("inserting investments")?;
        let updated = self
            .store
            .update_investments(&known_investments)
            .await
            .context("updating investments")?;
        investment_counts.absorb(&inserted, &updated);
        failures.extend(inserted.failed.iter().chain(&updated.failed).cloned());
        let mut outcomes = investment_outcomes(&new_investments, &known_investments);

        // People.
        let mut people_counts = EntityCounts {
            incoming: people.len(),
            ..Default::default()
        };
        let existing_people = self
            .store
            .load_people()
            .await
            .context("loading existing people")?;
        let adjudication = match operator.as_deref_mut() {
            Some(op) => Adjudication::Interactive(op),
            None => Adjudication::AutoSkip,
        };
        let resolver = self.resolver;
        let people_outcomes =
            operator_phase(|| resolver.resolve(people, &existing_people, adjudication))?;
        let (inserted, updated) = self.persist_people(&people_outcomes).await?;
        people_counts.absorb(&inserted, &updated);
        people_counts.skipped = people_outcomes.skip.len();
        failures.extend(inserted.failed.iter().chain(&updated.failed).cloned());
        outcomes.extend(resolution_outcomes(
            EntityKind::Person,
            &people_outcomes,
            person_label,
            |id| id.0,
        ));

        // Companies.
        let mut company_counts = EntityCounts {
            incoming: companies.len(),
            ..Default::default()
        };
        let existing_companies = self
            .store
            .load_companies()
            .await
            .context("loading existing companies")?;
        let adjudication = match operator.as_deref_mut() {
            Some(op) => Adjudication::Interactive(op),
            None => Adjudication::AutoSkip,
        };
        let company_outcomes =
            operator_phase(|| resolver.resolve(companies, &existing_companies, adjudication))?;
        let (inserted, updated) = self.persist_companies(&company_outcomes).await?;
        company_counts.absorb(&inserted, &updated);
        company_counts.skipped = company_outcomes.skip.len();
        failures.extend(inserted.failed.iter().chain(&updated.failed).cloned());
        outcomes.extend(resolution_outcomes(
            EntityKind::Company,
            &company_outcomes,
            |c: &Company| c.name.clone(),
            |id| id.0,
        ));

        let mut linker = JoinLinker::new(run_id, started_at);
        let links = linker
            .link(&mut self.store, &investments, &people_outcomes, &company_outcomes)
            .await
            .context("linking investments to people and companies")?;

        let reports_dir = self.config.reports_root().join(run_id.to_string());
        let mut summary = SyncRunSummary {
            run_id,
            source_id: source.source_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            fetched_applications: raws.len(),
            dropped_duplicates,
            investments: investment_counts,
            people: people_counts,
            companies: company_counts,
            links,
            learned_regions: regions.learned().to_vec(),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: String::new(),
        };
        let manifest_path = export_parquet_snapshot(&reports_dir, &outcomes).await?;
        summary.parquet_manifest = manifest_path.display().to_string();
        write_reports(&reports_dir, &summary, &outcomes, &failures).await?;

        if !failures.is_empty() {
            warn!(failed = failures.len(), "some rows were rejected; see outcomes.json");
        }
        info!(
            investments_inserted = summary.investments.inserted,
            investments_updated = summary.investments.updated,
            people_inserted = summary.people.inserted,
            people_skipped = summary.people.skipped,
            companies_inserted = summary.companies.inserted,
            companies_skipped = summary.companies.skipped,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn persist_people(
        &mut self,
        outcomes: &ResolutionSets<Person, grantsync_core::PersonId>,
    ) -> Result<(BatchReport, BatchReport)> {
        let inserted = self
            .store
            .insert_people(&outcomes.insert)
            .await
            .context("inserting people")?;
        let updates: Vec<_> = outcomes
            .update
            .iter()
            .map(|u| (u.target, u.record.clone()))
            .collect();
        let updated = self
            .store
            .update_people(&updates)
            .await
            .context("updating people")?;
        Ok((inserted, updated))
    }

    async fn persist_companies(
        &mut self,
        outcomes: &ResolutionSets<Company, grantsync_core::CompanyId>,
    ) -> Result<(BatchReport, BatchReport)> {
        let inserted = self
            .store
            .insert_companies(&outcomes.insert)
            .await
            .context("inserting companies")?;
        let updates: Vec<_> = outcomes
            .update
            .iter()
            .map(|u| (u.target, u.record.clone()))
            .collect();
        let updated = self
            .store
            .update_companies(&updates)
            .await
            .context("updating companies")?;
        Ok((inserted, updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{company, investment, person};
    use crate::store::MemoryRecordStore;
    use grantsync_adapters::records::{
        LABEL_COMPANY_CITY, LABEL_COMPANY_NAME, LABEL_COMPANY_PROVINCE, LABEL_PI_EMAIL,
        LABEL_PI_FIRST_NAME, LABEL_PI_LAST_NAME, LABEL_TITLE,
    };
    use grantsync_adapters::{FixtureSource, RawApplication};
    use grantsync_core::{OperatorReply, PromptRequest, ScriptedOperator};
    use grantsync_dedupe::SimilarityMetric;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;

    /// Waits on the runtime before every answer, like an operator reached over the network.
    struct RuntimeBackedOperator {
        handle: Handle,
        script: ScriptedOperator,
    }

    impl OperatorPort for RuntimeBackedOperator {
        fn show(&mut self, text: &str) {
            self.script.show(text);
        }

        fn ask(&mut self, request: &PromptRequest<'_>) -> std::io::Result<OperatorReply> {
            self.handle
                .block_on(tokio::time::sleep(Duration::from_millis(1)));
            self.script.ask(request)
        }
    }

    fn config(root: &Path, interactive: bool, threshold: f64) -> SyncConfig {
        SyncConfig {
            database_url: String::new(),
            artifacts_dir: root.join("artifacts"),
            workspace_root: root.to_path_buf(),
            api_base_url: String::new(),
            token_url: String::new(),
            credentials_path: root.join("program_info.json"),
            program_name: "Innovation Voucher Fund".into(),
            fiscal_year: "2025".into(),
            research_fund_id: "IVF".into(),
            similarity_threshold: threshold,
            similarity_metric: SimilarityMetric::RatcliffObershelp,
            interactive,
            user_agent: "grantsync-test".into(),
            http_timeout_secs: 5,
        }
    }

    fn application(id: i64, ref_num: &str, first: &str, last: &str, email: &str, company: &str) -> RawApplication {
        let field = |label: &str, value: serde_json::Value| json!({"label": label, "response": value});
        RawApplication {
            application: json!({
                "id": id,
                "custom_fields": [
                    {"name": "Fiscal Year", "value": "2025"},
                    {"name": "NBIF Reference Number", "value": ref_num}
                ]
            }),
            form: vec![json!({"data": {
                "title": field(LABEL_TITLE, json!(format!("Project {id}"))),
                "email": field(LABEL_PI_EMAIL, json!(email)),
                "first": field(LABEL_PI_FIRST_NAME, json!(first)),
                "last": field(LABEL_PI_LAST_NAME, json!(last)),
                "company": field(LABEL_COMPANY_NAME, json!(company)),
                "city": field(LABEL_COMPANY_CITY, json!("Moncton")),
                "province": field(LABEL_COMPANY_PROVINCE, json!(3))
            }})],
            sector: Vec::new(),
        }
    }

    #[test]
    fn exact_duplicates_keep_first_occurrence() {
        let (kept, dropped) = drop_exact_duplicates(vec![3, 1, 3, 2, 1]);
        assert_eq!(kept, vec![3, 1, 2]);
        assert_eq!(dropped, 2);
    }

    #[tokio::test]
    async fn non_interactive_run_skips_matches_and_links_identities() {
        let root = tempfile::tempdir().unwrap();
        let mut store = MemoryRecordStore::new();
        store.seed_investment(investment("NBIF-2025-001"));
        let mciver = store.seed_person(person("William", "McIver", "Bill.McIver@nbcc.ca"));
        let acme = store.seed_company(company("Acme Tools"));

        let mut source = FixtureSource::new(vec![
            application(1, "NBIF-2025-001", "Bill", "McIver", "bill.mciver@nbcc.ca", "Acme Tools Inc."),
            application(2, "NBIF-2025-002", "Grace", "Hopper", "grace@cobol.ca", "Compiler Works"),
            application(2, "NBIF-2025-002", "Grace", "Hopper", "grace@cobol.ca", "Compiler Works"),
        ]);

        let mut pipeline = SyncPipeline::new(config(root.path(), false, 0.75), store).unwrap();
        let summary = pipeline.run_once(&mut source, None).await.unwrap();

        assert_eq!(summary.fetched_applications, 3);
        assert_eq!(summary.dropped_duplicates, 3);
        assert_eq!(summary.investments.inserted, 1);
        assert_eq!(summary.investments.updated, 1);
        assert_eq!(summary.people.skipped, 1);
        assert_eq!(summary.people.inserted, 1);
        assert_eq!(summary.companies.skipped, 1);
        assert_eq!(summary.companies.inserted, 1);
        assert_eq!(summary.links.project_links_created, 2);
        assert_eq!(summary.links.company_links_created, 2);

        let store = pipeline.into_store();
        assert_eq!(store.people.len(), 2);
        assert_eq!(store.companies.len(), 2);
        assert!(store
            .project_assignments
            .iter()
            .any(|a| a.ref_num == "NBIF-2025-001" && a.person_id == mciver));
        assert!(store
            .company_assignments
            .iter()
            .any(|a| a.ref_num == "NBIF-2025-001" && a.company_id == acme));

        let run_dir = Path::new(&summary.reports_dir);
        assert!(run_dir.join("run_summary.md").exists());
        assert!(run_dir.join("outcomes.json").exists());
        assert!(run_dir.join("snapshots").join("outcomes.parquet").exists());
    }

    #[tokio::test]
    async fn second_run_creates_no_new_rows_or_links() {
        let root = tempfile::tempdir().unwrap();
        let apps = vec![application(
            5,
            "NBIF-2025-005",
            "Ada",
            "Lovelace",
            "ada@engines.ca",
            "Analytical Engines",
        )];
        let mut pipeline =
            SyncPipeline::new(config(root.path(), false, 0.75), MemoryRecordStore::new()).unwrap();
        pipeline
            .run_once(&mut FixtureSource::new(apps.clone()), None)
            .await
            .unwrap();
        let second = pipeline
            .run_once(&mut FixtureSource::new(apps), None)
            .await
            .unwrap();

        assert_eq!(second.investments.updated, 1);
        assert_eq!(second.people.skipped, 1);
        assert_eq!(second.companies.skipped, 1);
        assert_eq!(second.links.project_links_created, 0);
        assert_eq!(second.links.already_linked, 2);
        let store = pipeline.store();
        assert_eq!(store.people.len(), 1);
        assert_eq!(store.project_assignments.len(), 1);
        assert_eq!(store.company_assignments.len(), 1);
    }

    #[tokio::test]
    async fn interactive_update_overwrites_the_chosen_target() {
        let root = tempfile::tempdir().unwrap();
        let mut store = MemoryRecordStore::new();
        let target = store.seed_person(person("Amber", "Garber", "amber@old.ca"));
        store.seed_company(company("Garber Labs"));

        let mut source = FixtureSource::new(vec![application(
            9,
            "NBIF-2025-009",
            "Amber",
            "Garber",
            "amber@new.ca",
            "Garber Labs",
        )]);
        // person: update the only candidate; company: skip as duplicate.
        let mut operator = ScriptedOperator::new(["3", "2"]);
        let mut pipeline = SyncPipeline::new(config(root.path(), true, 0.75), store).unwrap();
        let summary = pipeline
            .run_once(&mut source, Some(&mut operator))
            .await
            .unwrap();

        assert_eq!(operator.remaining(), 0);
        assert_eq!(summary.people.updated, 1);
        assert_eq!(summary.companies.skipped, 1);
        let store = pipeline.store();
        assert_eq!(store.people.len(), 1);
        assert_eq!(store.people[0].0, target);
        assert_eq!(store.people[0].1.email.as_deref(), Some("amber@new.ca"));
        assert_eq!(store.project_assignments[0].person_id, target);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_operator_runs_outside_the_async_worker() {
        let root = tempfile::tempdir().unwrap();
        let mut store = MemoryRecordStore::new();
        let target = store.seed_person(person("Amber", "Garber", "amber@old.ca"));
        store.seed_company(company("Garber Labs"));
        let mut source = FixtureSource::new(vec![application(
            13,
            "NBIF-2025-013",
            "Amber",
            "Garber",
            "amber@new.ca",
            "Garber Labs",
        )]);

        let mut operator = RuntimeBackedOperator {
            handle: Handle::current(),
            script: ScriptedOperator::new(["3", "2"]),
        };
        let mut pipeline = SyncPipeline::new(config(root.path(), true, 0.75), store).unwrap();
        let summary = pipeline
            .run_once(&mut source, Some(&mut operator))
            .await
            .unwrap();

        assert_eq!(operator.script.remaining(), 0);
        assert_eq!(summary.people.updated, 1);
        assert_eq!(summary.companies.skipped, 1);
        assert_eq!(pipeline.store().project_assignments[0].person_id, target);
    }

    #[test]
    fn operator_phase_runs_inline_without_a_runtime() {
        assert_eq!(operator_phase(|| 41 + 1), 42);
    }

    #[tokio::test]
    async fn rejected_rows_do_not_abort_the_run() {
        let root = tempfile::tempdir().unwrap();
        let mut store = MemoryRecordStore::new();
        store.reject("NBIF-2025-010");
        let mut source = FixtureSource::new(vec![
            application(10, "NBIF-2025-010", "Alan", "Turing", "alan@bombe.ca", "Bombe Ltd"),
            application(11, "NBIF-2025-011", "Joan", "Clarke", "joan@bombe.ca", "Hut Eight"),
        ]);
        let mut pipeline = SyncPipeline::new(config(root.path(), false, 0.75), store).unwrap();
        let summary = pipeline.run_once(&mut source, None).await.unwrap();

        assert_eq!(summary.investments.inserted, 1);
        assert_eq!(summary.investments.failed, 1);
        let outcomes: serde_json::Value = serde_json::from_slice(
            &std::fs::read(Path::new(&summary.reports_dir).join("outcomes.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(outcomes["failures"][0]["label"], "NBIF-2025-010");
    }

    #[tokio::test]
    async fn unreachable_store_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let mut store = MemoryRecordStore::new();
        store.set_offline(true);
        let mut source = FixtureSource::new(vec![application(
            12,
            "NBIF-2025-012",
            "Ada",
            "Lovelace",
            "ada@engines.ca",
            "Analytical Engines",
        )]);
        let mut pipeline = SyncPipeline::new(config(root.path(), false, 0.75), store).unwrap();
        let err = pipeline.run_once(&mut source, None).await.unwrap_err();
        assert!(format!("{err:#}").contains("storage unavailable"));
    }
}
