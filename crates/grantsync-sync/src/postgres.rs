//! Postgres-backed [`RecordStore`].
//!
//! Each insert or update set runs in its own transaction. Every row gets a savepoint, so a
//! rejected statement rolls back that row only and the rest of the set still commits.

use std::time::Duration;

use async_trait::async_trait;
use grantsync_core::{
    Company, CompanyId, ExistingCompany, ExistingPerson, Investment, Person, PersonId,
};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Connection, Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::store::{
    person_label, BatchReport, CompanyAssignment, ProjectAssignment, RecordStore, StoreError,
};

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

/// Runs one statement inside a savepoint and returns the affected row count.
async fn run_in_savepoint(
    tx: &mut Transaction<'_, Postgres>,
    query: Query<'_, Postgres, PgArguments>,
) -> Result<u64, sqlx::Error> {
    let mut savepoint = Connection::begin(&mut **tx).await?;
    match query.execute(&mut *savepoint).await {
        Ok(done) => {
            savepoint.commit().await?;
            Ok(done.rows_affected())
        }
        Err(err) => {
            savepoint.rollback().await?;
            Err(err)
        }
    }
}

/// Folds one row's outcome into the report; only connection loss escapes.
fn settle(
    report: &mut BatchReport,
    label: &str,
    values: &impl serde::Serialize,
    outcome: Result<u64, sqlx::Error>,
) -> Result<(), StoreError> {
    match outcome {
        Ok(0) => report.record_missing(label),
        Ok(_) => report.applied += 1,
        Err(err) => match StoreError::from(err) {
            fatal @ StoreError::Connection(_) => return Err(fatal),
            rejected => report.record_failure(label, values, rejected),
        },
    }
    Ok(())
}

impl PgRecordStore {
    /// Opens a single-connection pool; a sync run talks to the database sequentially.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn finish(
        tx: Transaction<'_, Postgres>,
        table: &str,
        action: &str,
        report: &BatchReport,
    ) -> Result<(), StoreError> {
        tx.commit().await?;
        info!(
            table,
            action,
            applied = report.applied,
            failed = report.failed.len(),
            missing = report.missing_targets.len(),
            "batch committed"
        );
        Ok(())
    }
}

fn investment_insert(row: &Investment) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO investment (
            ref_num, appl_title, exec_sum, fiscal_year, research_fund_id, appl_date,
            decision_date, amt_rqstd, amt_awarded, total_lev_amt, priv_sector_lev,
            fed_leverage, other_leverage, fte, pte, nbif_sector, notes
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#,
    )
    .bind(&row.ref_num)
    .bind(&row.title)
    .bind(&row.exec_summary)
    .bind(&row.fiscal_year)
    .bind(&row.research_fund_id)
    .bind(row.application_date)
    .bind(row.decision_date)
    .bind(row.amount_requested)
    .bind(row.amount_awarded)
    .bind(row.total_leverage)
    .bind(row.private_sector_leverage)
    .bind(row.fed_leverage)
    .bind(row.other_leverage)
    .bind(row.fte)
    .bind(row.pte)
    .bind(&row.sector)
    .bind(&row.notes)
}

fn investment_update(row: &Investment) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        UPDATE investment SET
            appl_title = $2, exec_sum = $3, fiscal_year = $4, research_fund_id = $5,
            appl_date = $6, decision_date = $7, amt_rqstd = $8, amt_awarded = $9,
            total_lev_amt = $10, priv_sector_lev = $11, fed_leverage = $12,
            other_leverage = $13, fte = $14, pte = $15, nbif_sector = $16, notes = $17
        WHERE lower(ref_num) = lower($1)
        "#,
    )
    .bind(&row.ref_num)
    .bind(&row.title)
    .bind(&row.exec_summary)
    .bind(&row.fiscal_year)
    .bind(&row.research_fund_id)
    .bind(row.application_date)
    .bind(row.decision_date)
    .bind(row.amount_requested)
    .bind(row.amount_awarded)
    .bind(row.total_leverage)
    .bind(row.private_sector_leverage)
    .bind(row.fed_leverage)
    .bind(row.other_leverage)
    .bind(row.fte)
    .bind(row.pte)
    .bind(&row.sector)
    .bind(&row.notes)
}

fn person_insert(row: &Person) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO people_info (first_name, last_name, email, phone, note, comm_opt_out)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&row.first_name)
    .bind(&row.last_name)
    .bind(&row.email)
    .bind(&row.phone)
    .bind(&row.note)
    .bind(row.comm_opt_out)
}

fn person_update(id: PersonId, row: &Person) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        UPDATE people_info SET
            first_name = $2, last_name = $3, email = $4, phone = $5, note = $6,
            comm_opt_out = $7
        WHERE person_id = $1
        "#,
    )
    .bind(id.0)
    .bind(&row.first_name)
    .bind(&row.last_name)
    .bind(&row.email)
    .bind(&row.phone)
    .bind(&row.note)
    .bind(row.comm_opt_out)
}

fn company_insert(row: &Company) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO voucher_company (
            company_name, address, city, province, postal_code, country, region,
            incorporation_date
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&row.name)
    .bind(&row.address)
    .bind(&row.city)
    .bind(&row.province)
    .bind(&row.postal_code)
    .bind(&row.country)
    .bind(&row.region)
    .bind(row.incorporation_date)
}

fn company_update(id: CompanyId, row: &Company) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        UPDATE voucher_company SET
            company_name = $2, address = $3, city = $4, province = $5, postal_code = $6,
            country = $7, region = $8, incorporation_date = $9
        WHERE company_id = $1
        "#,
    )
    .bind(id.0)
    .bind(&row.name)
    .bind(&row.address)
    .bind(&row.city)
    .bind(&row.province)
    .bind(&row.postal_code)
    .bind(&row.country)
    .bind(&row.region)
    .bind(row.incorporation_date)
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn load_investment_keys(
        &mut self,
        research_fund_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT ref_num FROM investment WHERE research_fund_id LIKE $1")
            .bind(research_fund_id)
            .fetch_all(&self.pool)
            .await?;
        let keys = rows
            .iter()
            .map(|row| row.try_get::<String, _>("ref_num"))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(research_fund_id, count = keys.len(), "loaded investment keys");
        Ok(keys)
    }

    async fn load_people(&mut self) -> Result<Vec<ExistingPerson>, StoreError> {
        let rows = sqlx::query(
            "SELECT person_id, first_name, last_name, email FROM people_info ORDER BY person_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut people = Vec::with_capacity(rows.len());
        for row in rows {
            people.push(ExistingPerson {
                person_id: PersonId(row.try_get("person_id")?),
                first_name: row
                    .try_get::<Option<String>, _>("first_name")?
                    .unwrap_or_default(),
                last_name: row
                    .try_get::<Option<String>, _>("last_name")?
                    .unwrap_or_default(),
                email: row.try_get("email")?,
            });
        }
        Ok(people)
    }

    async fn load_companies(&mut self) -> Result<Vec<ExistingCompany>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT company_id, company_name, address, city, province
            FROM voucher_company
            ORDER BY company_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut companies = Vec::with_capacity(rows.len());
        for row in rows {
            companies.push(ExistingCompany {
                company_id: CompanyId(row.try_get("company_id")?),
                name: row
                    .try_get::<Option<String>, _>("company_name")?
                    .unwrap_or_default(),
                address: row.try_get("address")?,
                city: row.try_get("city")?,
                province: row.try_get("province")?,
            });
        }
        Ok(companies)
    }

    async fn insert_investments(&mut self, rows: &[Investment]) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport::default();
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let outcome = run_in_savepoint(&mut tx, investment_insert(row)).await;
            settle(&mut report, &row.ref_num, row, outcome)?;
        }
        Self::finish(tx, "investment", "insert", &report).await?;
        Ok(report)
    }

    async fn update_investments(&mut self, rows: &[Investment]) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport::default();
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let outcome = run_in_savepoint(&mut tx, investment_update(row)).await;
            settle(&mut report, &row.ref_num, row, outcome)?;
        }
        Self::finish(tx, "investment", "update", &report).await?;
        Ok(report)
    }

    async fn insert_people(&mut self, rows: &[Person]) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport::default();
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let outcome = run_in_savepoint(&mut tx, person_insert(row)).await;
            settle(&mut report, &person_label(row), row, outcome)?;
        }
        Self::finish(tx, "people_info", "insert", &report).await?;
        Ok(report)
    }

    async fn update_people(
        &mut self,
        rows: &[(PersonId, Person)],
    ) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport::default();
        let mut tx = self.pool.begin().await?;
        for (id, row) in rows {
            let outcome = run_in_savepoint(&mut tx, person_update(*id, row)).await;
            settle(&mut report, &format!("person {id}"), row, outcome)?;
        }
        Self::finish(tx, "people_info", "update", &report).await?;
        Ok(report)
    }

    async fn insert_companies(&mut self, rows: &[Company]) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport::default();
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let outcome = run_in_savepoint(&mut tx, company_insert(row)).await;
            settle(&mut report, &row.name, row, outcome)?;
        }
        Self::finish(tx, "voucher_company", "insert", &report).await?;
        Ok(report)
    }

    async fn update_companies(
        &mut self,
        rows: &[(CompanyId, Company)],
    ) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport::default();
        let mut tx = self.pool.begin().await?;
        for (id, row) in rows {
            let outcome = run_in_savepoint(&mut tx, company_update(*id, row)).await;
            settle(&mut report, &format!("company {id}"), row, outcome)?;
        }
        Self::finish(tx, "voucher_company", "update", &report).await?;
        Ok(report)
    }

    async fn lookup_person_id(&mut self, email: &str) -> Result<Option<PersonId>, StoreError> {
        let row = sqlx::query(
            "SELECT person_id FROM people_info WHERE lower(email) = lower($1) ORDER BY person_id LIMIT 1",
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("person_id").map(PersonId))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn lookup_company_id(&mut self, name: &str) -> Result<Option<CompanyId>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT company_id FROM voucher_company
            WHERE lower(trim(company_name)) = lower(trim($1))
            ORDER BY company_id
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("company_id").map(CompanyId))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn project_assignment_exists(
        &mut self,
        ref_num: &str,
        person_id: PersonId,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM project_asgmt WHERE lower(ref_num) = lower($1) AND person_id = $2",
        )
        .bind(ref_num)
        .bind(person_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_project_assignment(
        &mut self,
        assignment: &ProjectAssignment,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO project_asgmt (ref_num, person_id, participation, person_title, batch_id, loaded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&assignment.ref_num)
        .bind(assignment.person_id.0)
        .bind(&assignment.participation)
        .bind(&assignment.person_title)
        .bind(assignment.batch_id)
        .bind(assignment.loaded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn company_assignment_exists(
        &mut self,
        ref_num: &str,
        company_id: CompanyId,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM company_asgmt WHERE lower(ref_num) = lower($1) AND company_id = $2",
        )
        .bind(ref_num)
        .bind(company_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_company_assignment(
        &mut self,
        assignment: &CompanyAssignment,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO company_asgmt (ref_num, company_id, batch_id, loaded_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&assignment.ref_num)
        .bind(assignment.company_id.0)
        .bind(assignment.batch_id)
        .bind(assignment.loaded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
