//! Application JSON plus task answers to typed investment, person and company records.

use grantsync_core::{Company, Investment, OperatorPort, Person};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::client::page_results;
use crate::mapping::{
    clean_amount, clean_email, map_decision_date, map_fiscal_year, map_province, map_region,
    map_sector, parse_created_at, parse_incorporation_date, MappingTables, RegionTable,
};

pub const APPLICATION_FORM_TASK: &str = "IVF - Application Form";
pub const SECTOR_TASK: &str = "Select Sector of Research";

pub const FIELD_FISCAL_YEAR: &str = "Fiscal Year";
pub const FIELD_REFERENCE_NUMBER: &str = "NBIF Reference Number";
pub const FIELD_DECISION_DATE: &str = "Current Date for NOD";

pub const LABEL_TITLE: &str = "Project Information: | Title of Project:";
pub const LABEL_EXEC_SUMMARY: &str = "Executive Summary:";
pub const LABEL_AMOUNT_REQUESTED: &str = "Requested Contribution from NBIF:";
pub const LABEL_PI_EMAIL: &str = "Researcher Information: | PI E-mail Address:";
pub const LABEL_PI_FIRST_NAME: &str =
    "Researcher Information: | Principal Investigator (PI) First Name:";
pub const LABEL_PI_LAST_NAME: &str = "Researcher Information: | PI Last Name:";
pub const LABEL_COMPANY_NAME: &str = "Company Information: | Company Name:";
pub const LABEL_COMPANY_ADDRESS: &str = "Company Information: | Company Street Address:";
pub const LABEL_COMPANY_CITY: &str = "Company Information: | City:";
pub const LABEL_COMPANY_PROVINCE: &str = "Company Information: | Province:";
pub const LABEL_COMPANY_POSTAL_CODE: &str = "Company Information: | Postal Code:";
pub const LABEL_INCORPORATION_DATE: &str = "Company Information: | Date of Incorporation:";

/// One application with the task pages needed to map it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawApplication {
    pub application: JsonValue,
    #[serde(default)]
    pub form: Vec<JsonValue>,
    #[serde(default)]
    pub sector: Vec<JsonValue>,
}

impl RawApplication {
    pub fn id(&self) -> Option<i64> {
        self.application.get("id").and_then(JsonValue::as_i64)
    }
}

/// Custom field `name` on an application, if present.
pub fn custom_field<'a>(application: &'a JsonValue, name: &str) -> Option<&'a JsonValue> {
    application
        .get("custom_fields")
        .and_then(JsonValue::as_array)?
        .iter()
        .find(|field| field.get("name").and_then(JsonValue::as_str) == Some(name))
        .and_then(|field| field.get("value"))
}

fn value_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Keeps applications in `fiscal_year` that carry a reference number.
pub fn filter_applications<'a>(
    pages: &'a [JsonValue],
    fiscal_year: &str,
) -> impl Iterator<Item = &'a JsonValue> {
    let fiscal_year = fiscal_year.trim().to_string();
    page_results(pages).filter(move |application| {
        let in_year = custom_field(application, FIELD_FISCAL_YEAR)
            .and_then(value_text)
            .is_some_and(|year| year == fiscal_year);
        let has_ref = custom_field(application, FIELD_REFERENCE_NUMBER)
            .and_then(value_text)
            .is_some();
        in_year && has_ref
    })
}

/// Id of the task called `name` in a task listing.
pub fn task_id(task_pages: &[JsonValue], name: &str) -> Option<i64> {
    page_results(task_pages)
        .find(|task| task.get("name").and_then(JsonValue::as_str) == Some(name))
        .and_then(|task| task.get("id"))
        .and_then(JsonValue::as_i64)
}

/// `(label, response)` for every answered field of a task.
pub fn task_fields(task_pages: &[JsonValue]) -> impl Iterator<Item = (&str, &JsonValue)> {
    task_pages
        .iter()
        .filter_map(|page| page.get("data").and_then(JsonValue::as_object))
        .flat_map(|data| data.values())
        .filter_map(|field| {
            let label = field.get("label").and_then(JsonValue::as_str)?;
            let response = field.get("response")?;
            Some((label, response))
        })
}

pub fn task_value<'a>(task_pages: &'a [JsonValue], label: &str) -> Option<&'a JsonValue> {
    task_fields(task_pages)
        .find(|(l, _)| *l == label)
        .map(|(_, response)| response)
}

pub fn task_text(task_pages: &[JsonValue], label: &str) -> Option<String> {
    task_value(task_pages, label).and_then(value_text)
}

pub fn map_investment(raw: &RawApplication, research_fund_id: &str, tables: &MappingTables) -> Investment {
    let application = &raw.application;
    let amount_awarded = clean_amount(
        application
            .get("decision")
            .and_then(|decision| decision.get("awarded")),
    );
    let leverage = if amount_awarded > 0.0 {
        amount_awarded / 4.0
    } else {
        0.0
    };

    Investment {
        ref_num: custom_field(application, FIELD_REFERENCE_NUMBER)
            .and_then(value_text)
            .unwrap_or_default(),
        title: task_text(&raw.form, LABEL_TITLE),
        exec_summary: task_text(&raw.form, LABEL_EXEC_SUMMARY),
        fiscal_year: custom_field(application, FIELD_FISCAL_YEAR)
            .and_then(value_text)
            .map(|year| map_fiscal_year(&year)),
        research_fund_id: research_fund_id.to_string(),
        application_date: application
            .get("created_at")
            .and_then(JsonValue::as_str)
            .and_then(parse_created_at),
        decision_date: custom_field(application, FIELD_DECISION_DATE)
            .and_then(value_text)
            .and_then(|date| map_decision_date(&date)),
        amount_requested: clean_amount(task_value(&raw.form, LABEL_AMOUNT_REQUESTED)),
        amount_awarded,
        total_leverage: leverage,
        private_sector_leverage: leverage,
        fed_leverage: None,
        other_leverage: None,
        fte: None,
        pte: None,
        sector: map_sector(task_fields(&raw.sector), tables),
        notes: None,
        applicant_email: task_text(&raw.form, LABEL_PI_EMAIL).and_then(|e| clean_email(&e)),
        company_name: task_text(&raw.form, LABEL_COMPANY_NAME),
    }
}

pub fn map_person(form: &[JsonValue]) -> Person {
    Person {
        first_name: task_text(form, LABEL_PI_FIRST_NAME).unwrap_or_default(),
        last_name: task_text(form, LABEL_PI_LAST_NAME).unwrap_or_default(),
        email: task_text(form, LABEL_PI_EMAIL).and_then(|e| clean_email(&e)),
        phone: None,
        note: None,
        comm_opt_out: None,
    }
}

pub fn map_company(
    form: &[JsonValue],
    tables: &MappingTables,
    regions: &mut RegionTable,
    mut operator: Option<&mut (dyn OperatorPort + '_)>,
) -> std::io::Result<Company> {
    let name = task_text(form, LABEL_COMPANY_NAME).unwrap_or_default();
    let city = task_text(form, LABEL_COMPANY_CITY);
    let province = map_province(
        task_value(form, LABEL_COMPANY_PROVINCE),
        tables,
        &name,
        operator.as_deref_mut(),
    )?;
    let region = match &city {
        Some(city) => map_region(city, regions, operator.as_deref_mut())?,
        None => None,
    };
    Ok(Company {
        address: task_text(form, LABEL_COMPANY_ADDRESS),
        city,
        province,
        postal_code: task_text(form, LABEL_COMPANY_POSTAL_CODE),
        country: Some("Canada".to_string()),
        region,
        incorporation_date: task_text(form, LABEL_INCORPORATION_DATE)
            .and_then(|date| parse_incorporation_date(&date)),
        name,
    })
}

/// Maps every application into the three record batches. Records with no usable identity
/// (no reference number, no person name or email, no company name) are dropped with a
/// warning.
pub fn map_applications(
    raws: &[RawApplication],
    research_fund_id: &str,
    tables: &MappingTables,
    mut regions: RegionTable,
    mut operator: Option<&mut (dyn OperatorPort + '_)>,
) -> std::io::Result<(grantsync_core::SourceBatch, RegionTable)> {
    let mut batch = grantsync_core::SourceBatch::default();
    for raw in raws {
        let id = raw.id();
        let investment = map_investment(raw, research_fund_id, tables);
        if investment.ref_num.is_empty() {
            warn!(?id, "application without reference number");
            continue;
        }

        let person = map_person(&raw.form);
        if person.full_name().is_empty() && person.email.is_none() {
            warn!(ref_num = %investment.ref_num, "application without principal investigator");
        } else {
            batch.people.push(person);
        }

        let company = map_company(&raw.form, tables, &mut regions, operator.as_deref_mut())?;
        if company.name.is_empty() {
            warn!(ref_num = %investment.ref_num, "application without company name");
        } else {
            batch.companies.push(company);
        }

        batch.investments.push(investment);
    }
    info!(
        investments = batch.investments.len(),
        people = batch.people.len(),
        companies = batch.companies.len(),
        learned_regions = regions.learned().len(),
        "mapped applications"
    );
    Ok((batch, regions))
}
