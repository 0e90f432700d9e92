//! Per-run audit trail: markdown summary, outcome JSON, parquet snapshot and its manifest.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use grantsync_core::{EntityKind, Investment, OutcomeKind, ResolutionSets};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::pipeline::{EntityCounts, SyncRunSummary};
use crate::store::RowFailure;

/// One line of the audit trail: what was decided for one incoming record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub entity: EntityKind,
    pub label: String,
    pub outcome: OutcomeKind,
    pub identity: Option<i64>,
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn investment_outcomes(inserted: &[Investment], updated: &[Investment]) -> Vec<OutcomeRecord> {
    let row = |inv: &Investment, outcome| OutcomeRecord {
        entity: EntityKind::Investment,
        label: inv.ref_num.clone(),
        outcome,
        identity: None,
        similarity: None,
    };
    inserted
        .iter()
        .map(|inv| row(inv, OutcomeKind::Insert))
        .chain(updated.iter().map(|inv| row(inv, OutcomeKind::Update)))
        .collect()
}

pub fn resolution_outcomes<T, Id: Copy>(
    entity: EntityKind,
    sets: &ResolutionSets<T, Id>,
    label: impl Fn(&T) -> String,
    raw_id: impl Fn(Id) -> i64,
) -> Vec<OutcomeRecord> {
    let inserts = sets.insert.iter().map(|record| OutcomeRecord {
        entity,
        label: label(record),
        outcome: OutcomeKind::Insert,
        identity: None,
        similarity: None,
    });
    let skips = sets.skip.iter().map(|s| OutcomeRecord {
        entity,
        label: label(&s.record),
        outcome: OutcomeKind::Skip,
        identity: Some(raw_id(s.matched)),
        similarity: Some(s.similarity),
    });
    let updates = sets.update.iter().map(|u| OutcomeRecord {
        entity,
        label: label(&u.record),
        outcome: OutcomeKind::Update,
        identity: Some(raw_id(u.target)),
        similarity: Some(u.similarity),
    });
    inserts.chain(skips).chain(updates).collect()
}

fn counts_line(name: &str, counts: &EntityCounts) -> String {
    format!(
        "| {name} | {} | {} | {} | {} | {} | {} |",
        counts.incoming,
        counts.inserted,
        counts.updated,
        counts.skipped,
        counts.failed,
        counts.missing_targets
    )
}

pub async fn write_reports(
    reports_dir: &Path,
    summary: &SyncRunSummary,
    outcomes: &[OutcomeRecord],
    failures: &[RowFailure],
) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let brief = format!(
        "# Grant Application Sync\n\n- Run ID: `{}`\n- Source: {}\n- Started: {}\n- Finished: {}\n- Applications fetched: {}\n- Dropped exact duplicates: {}\n\n## Outcomes\n| entity | incoming | inserted | updated | skipped | failed | missing |\n|---|---|---|---|---|---|---|\n{}\n{}\n{}\n\n## Join links\n- project assignments created: {}\n- company assignments created: {}\n- already linked: {}\n- unresolved people: {}\n- unresolved companies: {}\n",
        summary.run_id,
        summary.source_id,
        summary.started_at,
        summary.finished_at,
        summary.fetched_applications,
        summary.dropped_duplicates,
        counts_line("investment", &summary.investments),
        counts_line("person", &summary.people),
        counts_line("company", &summary.companies),
        summary.links.project_links_created,
        summary.links.company_links_created,
        summary.links.already_linked,
        summary.links.unresolved_people.len(),
        summary.links.unresolved_companies.len(),
    );
    fs::write(reports_dir.join("run_summary.md"), brief)
        .await
        .context("writing run_summary.md")?;

    let outcomes_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": summary,
        "outcomes": outcomes,
        "failures": failures,
    }))
    .context("serializing outcomes")?;
    fs::write(reports_dir.join("outcomes.json"), outcomes_json)
        .await
        .context("writing outcomes.json")?;

    Ok(())
}

pub async fn export_parquet_snapshot(
    reports_dir: &Path,
    outcomes: &[OutcomeRecord],
) -> Result<std::path::PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let outcomes_path = snapshot_dir.join("outcomes.parquet");
    write_outcomes_parquet(&outcomes_path, outcomes)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("outcomes", reports_dir, &outcomes_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Markdown digest of the `runs` most recent run directories under `reports_root`.
pub fn report_runs_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("outcomes.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Grant Application Sync Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let outcomes_path = dir.path().join("outcomes.json");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&outcomes_path)
                .with_context(|| format!("reading {}", outcomes_path.display()))?,
        )
        .with_context(|| format!("parsing {}", outcomes_path.display()))?;
        let run = value.get("run").cloned().unwrap_or_default();
        let count = |entity: &str, field: &str| {
            run.get(entity)
                .and_then(|c| c.get(field))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let failures = value
            .get("failures")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);

        lines.push(format!("## Run `{run_id}`"));
        if let Some(finished) = run.get("finished_at").and_then(|v| v.as_str()) {
            lines.push(format!("- finished: {finished}"));
        }
        for entity in ["investments", "people", "companies"] {
            lines.push(format!(
                "- {entity}: {} inserted, {} updated, {} skipped",
                count(entity, "inserted"),
                count(entity, "updated"),
                count(entity, "skipped")
            ));
        }
        lines.push(format!("- failed rows: {failures}"));
        lines.push(format!("- outcomes: `{}`", outcomes_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_outcomes_parquet(path: &Path, outcomes: &[OutcomeRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity", DataType::Utf8, false),
        ArrowField::new("label", DataType::Utf8, false),
        ArrowField::new("outcome", DataType::Utf8, false),
        ArrowField::new("identity", DataType::Int64, true),
        ArrowField::new("similarity", DataType::Float64, true),
    ]));

    let entities = StringArray::from(
        outcomes
            .iter()
            .map(|o| Some(o.entity.as_str()))
            .collect::<Vec<_>>(),
    );
    let labels = StringArray::from(
        outcomes
            .iter()
            .map(|o| Some(o.label.as_str()))
            .collect::<Vec<_>>(),
    );
    let kinds = StringArray::from(
        outcomes
            .iter()
            .map(|o| Some(o.outcome.as_str()))
            .collect::<Vec<_>>(),
    );
    let identities = Int64Array::from(outcomes.iter().map(|o| o.identity).collect::<Vec<_>>());
    let similarities =
        Float64Array::from(outcomes.iter().map(|o| o.similarity).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(entities),
            Arc::new(labels),
            Arc::new(kinds),
            Arc::new(identities),
            Arc::new(similarities),
        ],
    )
    .context("building outcomes record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::LinkReport;
    use chrono::Utc;
    use grantsync_core::{Person, PersonId, Skipped};
    use uuid::Uuid;

    fn summary(reports_dir: &Path) -> SyncRunSummary {
        SyncRunSummary {
            run_id: Uuid::new_v4(),
            source_id: "fixture".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            fetched_applications: 2,
            dropped_duplicates: 0,
            investments: EntityCounts {
                incoming: 2,
                inserted: 2,
                ..Default::default()
            },
            people: EntityCounts {
                incoming: 1,
                skipped: 1,
                ..Default::default()
            },
            companies: EntityCounts::default(),
            links: LinkReport::default(),
            learned_regions: Vec::new(),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: String::new(),
        }
    }

    #[test]
    fn resolution_outcomes_carry_identity_and_similarity() {
        let mut sets: ResolutionSets<Person, PersonId> = ResolutionSets::default();
        sets.skip.push(Skipped {
            record: Person {
                first_name: "Bill".into(),
                last_name: "McIver".into(),
                email: None,
                phone: None,
                note: None,
                comm_opt_out: None,
            },
            matched: PersonId(113),
            matched_label: "William McIver".into(),
            similarity: 1.0,
        });
        let rows = resolution_outcomes(EntityKind::Person, &sets, Person::full_name, |id| id.0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "Bill McIver");
        assert_eq!(rows[0].outcome, OutcomeKind::Skip);
        assert_eq!(rows[0].identity, Some(113));
        assert_eq!(rows[0].similarity, Some(1.0));
    }

    #[tokio::test]
    async fn reports_and_snapshot_land_in_run_directory() {
        let root = tempfile::tempdir().unwrap();
        let run_dir = root.path().join("run-a");
        let summary = summary(&run_dir);
        let outcomes = vec![OutcomeRecord {
            entity: EntityKind::Investment,
            label: "NBIF-2025-001".into(),
            outcome: OutcomeKind::Insert,
            identity: None,
            similarity: None,
        }];

        write_reports(&run_dir, &summary, &outcomes, &[]).await.unwrap();
        let manifest_path = export_parquet_snapshot(&run_dir, &outcomes).await.unwrap();

        let brief = std::fs::read_to_string(run_dir.join("run_summary.md")).unwrap();
        assert!(brief.contains("| investment | 2 | 2 | 0 | 0 | 0 | 0 |"));
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["files"][0]["path"], "snapshots/outcomes.parquet");
        assert_eq!(manifest["files"][0]["sha256"].as_str().unwrap().len(), 64);

        let digest = report_runs_markdown(5, root.path()).unwrap();
        assert!(digest.contains("## Run `run-a`"));
        assert!(digest.contains("- investments: 2 inserted, 0 updated, 0 skipped"));
        assert!(digest.contains("- people: 0 inserted, 0 updated, 1 skipped"));
    }

    #[test]
    fn digest_ignores_directories_without_outcomes() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("scratch")).unwrap();
        let digest = report_runs_markdown(3, root.path()).unwrap();
        assert!(!digest.contains("scratch"));
    }
}
