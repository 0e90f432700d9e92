//! Where application batches come from: the live API or a JSON fixture on disk.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::client::{ApiTransport, SmApplyClient};
use crate::records::{filter_applications, task_id, RawApplication, APPLICATION_FORM_TASK, SECTOR_TASK};
use crate::SourceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    pub program_name: String,
    pub fiscal_year: String,
}

#[async_trait]
pub trait ApplicationSource: Send {
    fn source_id(&self) -> &'static str;

    async fn fetch_applications(
        &mut self,
        request: &SourceRequest,
    ) -> Result<Vec<RawApplication>, SourceError>;
}

#[async_trait]
impl<T: ApiTransport> ApplicationSource for SmApplyClient<T> {
    fn source_id(&self) -> &'static str {
        "smapply"
    }

    async fn fetch_applications(
        &mut self,
        request: &SourceRequest,
    ) -> Result<Vec<RawApplication>, SourceError> {
        let program_id = self
            .program_id(&request.program_name)
            .await?
            .ok_or_else(|| SourceError::ProgramNotFound(request.program_name.clone()))?;
        let pages = self.applications(program_id).await?;
        let selected: Vec<JsonValue> = filter_applications(&pages, &request.fiscal_year)
            .cloned()
            .collect();
        info!(
            program_id,
            fiscal_year = %request.fiscal_year,
            selected = selected.len(),
            "selected applications"
        );

        let mut raws = Vec::with_capacity(selected.len());
        for application in selected {
            let Some(id) = application.get("id").and_then(JsonValue::as_i64) else {
                warn!("application without id");
                continue;
            };
            let tasks = self.application_tasks(id).await?;
            let form = match task_id(&tasks, APPLICATION_FORM_TASK) {
                Some(task) => self.application_task(id, task).await?,
                None => {
                    warn!(application_id = id, task = APPLICATION_FORM_TASK, "task missing");
                    Vec::new()
                }
            };
            let sector = match task_id(&tasks, SECTOR_TASK) {
                Some(task) => self.application_task(id, task).await?,
                None => Vec::new(),
            };
            raws.push(RawApplication {
                application,
                form,
                sector,
            });
        }
        Ok(raws)
    }
}

/// Applications captured earlier as a JSON array of [`RawApplication`].
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    applications: Vec<RawApplication>,
}

impl FixtureSource {
    pub fn new(applications: Vec<RawApplication>) -> Self {
        Self { applications }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        let applications = serde_json::from_str(&data)
            .with_context(|| format!("parsing fixture {}", path.display()))?;
        Ok(Self { applications })
    }
}

#[async_trait]
impl ApplicationSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    /// Applies the same fiscal-year and reference-number filter as the live API.
    async fn fetch_applications(
        &mut self,
        request: &SourceRequest,
    ) -> Result<Vec<RawApplication>, SourceError> {
        let wrapped = [serde_json::json!({
            "results": self
                .applications
                .iter()
                .map(|raw| raw.application.clone())
                .collect::<Vec<_>>()
        })];
        let kept: Vec<&JsonValue> = filter_applications(&wrapped, &request.fiscal_year).collect();
        Ok(self
            .applications
            .iter()
            .filter(|raw| kept.iter().any(|app| **app == raw.application))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(id: i64, year: &str, ref_num: &str) -> RawApplication {
        RawApplication {
            application: json!({
                "id": id,
                "custom_fields": [
                    {"name": "Fiscal Year", "value": year},
                    {"name": "NBIF Reference Number", "value": ref_num}
                ]
            }),
            form: Vec::new(),
            sector: Vec::new(),
        }
    }

    fn request(year: &str) -> SourceRequest {
        SourceRequest {
            program_name: "Innovation Voucher Fund".into(),
            fiscal_year: year.into(),
        }
    }

    #[tokio::test]
    async fn fixture_source_filters_like_the_api() {
        let mut source = FixtureSource::new(vec![
            raw(1, "2025", "NBIF-2025-001"),
            raw(2, "2024", "NBIF-2024-004"),
            raw(3, "2025", ""),
        ]);
        let kept = source.fetch_applications(&request("2025")).await.unwrap();
        assert_eq!(kept.iter().filter_map(RawApplication::id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(source.source_id(), "fixture");
    }

    #[tokio::test]
    async fn fixture_source_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applications.json");
        let body = serde_json::to_string(&vec![raw(7, "2025", "NBIF-2025-007")]).unwrap();
        std::fs::write(&path, body).unwrap();
        let mut source = FixtureSource::load(&path).unwrap();
        assert_eq!(source.fetch_applications(&request("2025")).await.unwrap().len(), 1);
    }

    #[test]
    fn unreadable_fixture_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FixtureSource::load(dir.path().join("missing.json")).is_err());
    }
}
