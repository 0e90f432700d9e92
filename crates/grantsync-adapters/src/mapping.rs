//! Value cleaning and lookup tables for application form answers.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use grantsync_core::{OperatorPort, OperatorReply, PromptRequest};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

pub const REGIONS: [&str; 4] = ["NE", "NW", "SE", "SW"];

const EMBEDDED_MAPPINGS: &str = include_str!("../../../mappings.yaml");

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\w.-]+@[\w.-]+\.\w+").expect("static email pattern"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingTables {
    #[serde(default)]
    pub sectors: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub provinces: BTreeMap<u32, String>,
    #[serde(default)]
    pub city_regions: BTreeMap<String, String>,
}

impl MappingTables {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing mapping tables")
    }

    pub fn embedded() -> Result<Self> {
        Self::from_yaml(EMBEDDED_MAPPINGS)
    }

    /// Reads `path` when it exists, otherwise the copy compiled into the binary.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Self::embedded();
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }
}

/// City to region lookup for one run. Seeded from the mapping tables and extended with
/// operator answers; the caller owns it and passes it back in on the next mapping call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionTable {
    regions: BTreeMap<String, String>,
    learned: Vec<String>,
}

impl RegionTable {
    pub fn seeded(tables: &MappingTables) -> Self {
        Self {
            regions: tables.city_regions.clone(),
            learned: Vec::new(),
        }
    }

    pub fn get(&self, city: &str) -> Option<&str> {
        self.regions.get(&title_case(city.trim())).map(String::as_str)
    }

    pub fn learn(&mut self, city: &str, region: &str) {
        let key = title_case(city.trim());
        if self.regions.insert(key.clone(), region.to_string()).is_none() {
            self.learned.push(key);
        }
    }

    /// Cities answered by the operator during this run, in the order they were learned.
    pub fn learned(&self) -> &[String] {
        &self.learned
    }
}

/// Uppercases the first letter of every alphabetic run, lowercases the rest.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut at_word_start = true;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = true;
        }
    }
    out
}

/// First email-shaped substring, lowercased.
pub fn clean_email(raw: &str) -> Option<String> {
    EMAIL
        .find(raw)
        .map(|m| m.as_str().trim().to_lowercase())
}

/// Currency-ish answer to a number. `$` and thousands separators are dropped; anything
/// unparseable is `0.0`.
pub fn clean_amount(raw: Option<&JsonValue>) -> f64 {
    match raw {
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(JsonValue::String(s)) => {
            let stripped: String = s.chars().filter(|c| *c != '$' && *c != ',').collect();
            match stripped.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => v,
                _ => {
                    if !stripped.trim().is_empty() {
                        warn!(value = %s, "unparseable amount, using 0.0");
                    }
                    0.0
                }
            }
        }
        _ => 0.0,
    }
}

pub fn map_fiscal_year(value: &str) -> String {
    match value.trim() {
        "2024" => "2023-2024".to_string(),
        "2023" => "2022-2023".to_string(),
        other => other.to_string(),
    }
}

pub fn map_decision_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date());
    }
    warn!(value, "unparseable decision date");
    None
}

pub fn parse_created_at(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|_| warn!(value, "unexpected created_at format"))
        .ok()
}

pub fn parse_incorporation_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim().replace('/', "-");
    if value.is_empty() {
        return None;
    }
    for format in ["%Y-%m-%d", "%m-%d-%Y", "%d-%m-%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(&value, format) {
            return Some(date);
        }
    }
    warn!(value = %value, "unparseable incorporation date");
    None
}

/// Sector label for a sector-of-research answer: the question label picks the list, the
/// numeric answer indexes into it.
pub fn map_sector<'a>(
    fields: impl IntoIterator<Item = (&'a str, &'a JsonValue)>,
    tables: &MappingTables,
) -> Option<String> {
    fields.into_iter().find_map(|(label, response)| {
        let options = tables.sectors.get(label)?;
        let index = response_index(response)?;
        options.get(index).cloned()
    })
}

fn response_index(response: &JsonValue) -> Option<usize> {
    match response {
        JsonValue::Number(n) => n.as_u64().map(|v| v as usize),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Province code for a dropdown answer. Unknown indices go to the operator when one is
/// available, otherwise resolve to `None`.
pub fn map_province(
    response: Option<&JsonValue>,
    tables: &MappingTables,
    company: &str,
    operator: Option<&mut (dyn OperatorPort + '_)>,
) -> std::io::Result<Option<String>> {
    if let Some(code) = response
        .and_then(response_index)
        .and_then(|i| u32::try_from(i).ok())
        .and_then(|i| tables.provinces.get(&i))
    {
        return Ok(Some(code.clone()));
    }
    let Some(operator) = operator else {
        warn!(company, ?response, "unknown province answer");
        return Ok(None);
    };
    match operator.ask(&PromptRequest::Province { company })? {
        OperatorReply::Province(code) => Ok(Some(code)),
        _ => Ok(None),
    }
}

/// Region for `city`. Unknown cities are asked once and remembered in `regions`.
pub fn map_region(
    city: &str,
    regions: &mut RegionTable,
    operator: Option<&mut (dyn OperatorPort + '_)>,
) -> std::io::Result<Option<String>> {
    if city.trim().is_empty() {
        return Ok(None);
    }
    if let Some(region) = regions.get(city) {
        return Ok(Some(region.to_string()));
    }
    let Some(operator) = operator else {
        warn!(city, "no region known for city");
        return Ok(None);
    };
    loop {
        let reply = operator.ask(&PromptRequest::Region {
            city,
            options: &REGIONS,
        })?;
        if let OperatorReply::Region(code) = reply {
            regions.learn(city, &code);
            return Ok(Some(code));
        }
        operator.show("Invalid input. Please enter NE, NW, SE, or SW.");
    }
}
