//! Insert / skip / update decisions for one incoming batch.
//!
//! Each record is fully resolved before the next one is looked at. In interactive mode the
//! operator sees up to [`MAX_DISPLAYED_CANDIDATES`] ranked candidates and must pick one of
//! insert, skip, update or show details; details and invalid input loop back to the same
//! menu. Without an operator every record that has a candidate is skipped against the top
//! candidate, so nothing is overwritten without a human confirming it.

use anyhow::{Context, Result};
use grantsync_core::{
    ActionChoice, CandidateView, ExistingRecord, IncomingRecord, MatchCandidate, OperatorPort,
    OperatorReply, PromptRequest, Resolution, ResolutionSets, Skipped, TargetPurpose, Updated,
};
use tracing::info;

use crate::matcher::{find_similar, Matchable};
use crate::similarity::SimilarityMetric;

pub const MAX_DISPLAYED_CANDIDATES: usize = 3;

type IdOf<R> = <<R as IncomingRecord>::Existing as ExistingRecord>::Id;

pub enum Adjudication<'a> {
    Interactive(&'a mut dyn OperatorPort),
    AutoSkip,
}

#[derive(Debug, Clone, Copy)]
pub struct Resolver {
    threshold: f64,
    metric: SimilarityMetric,
}

impl Resolver {
    pub fn new(threshold: f64, metric: SimilarityMetric) -> Self {
        Self { threshold, metric }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn resolve<R: Matchable>(
        &self,
        batch: Vec<R>,
        existing: &[R::Existing],
        mut adjudication: Adjudication<'_>,
    ) -> Result<ResolutionSets<R, IdOf<R>>> {
        let mut sets = ResolutionSets::default();
        for record in batch {
            let label = record.display_name();
            let resolution = self
                .resolve_one(record, existing, &mut adjudication)
                .with_context(|| format!("resolving {} '{label}'", R::KIND))?;
            sets.push(resolution);
        }
        info!(
            kind = %R::KIND,
            inserted = sets.insert.len(),
            skipped = sets.skip.len(),
            updated = sets.update.len(),
            "resolution complete"
        );
        Ok(sets)
    }

    pub fn resolve_one<R: Matchable>(
        &self,
        record: R,
        existing: &[R::Existing],
        adjudication: &mut Adjudication<'_>,
    ) -> Result<Resolution<R, IdOf<R>>> {
        let candidates = find_similar(&record, existing, self.threshold, self.metric);

        let Some(top) = candidates.first() else {
            info!(
                kind = %R::KIND,
                name = %record.display_name(),
                contact = %record.display_contact(),
                threshold = self.threshold,
                "auto-inserting: no candidate at or above threshold"
            );
            return Ok(Resolution::Insert(record));
        };

        match adjudication {
            Adjudication::AutoSkip => {
                info!(
                    kind = %R::KIND,
                    name = %record.display_name(),
                    contact = %record.display_contact(),
                    similarity = top.similarity,
                    matched = %top.existing.display_name(),
                    matched_id = %top.identity(),
                    "auto-skipping potential duplicate"
                );
                Ok(Resolution::Skip(Skipped {
                    matched: top.identity(),
                    matched_label: top.existing.display_name(),
                    similarity: top.similarity,
                    record,
                }))
            }
            Adjudication::Interactive(operator) => {
                let shown = &candidates[..candidates.len().min(MAX_DISPLAYED_CANDIDATES)];
                adjudicate(record, shown, &mut **operator)
                    .context("reading operator decision")
            }
        }
    }
}

fn adjudicate<R: Matchable>(
    record: R,
    shown: &[MatchCandidate<R::Existing>],
    operator: &mut dyn OperatorPort,
) -> std::io::Result<Resolution<R, IdOf<R>>> {
    operator.show(&render_comparison(&record, shown));
    let label = record.display_name();
    let contact = record.display_contact();
    let views = candidate_views(shown);

    loop {
        let reply = operator.ask(&PromptRequest::Action {
            kind: R::KIND,
            label: &label,
            contact: &contact,
            candidates: &views,
        })?;
        match reply {
            OperatorReply::Action(ActionChoice::Insert) => {
                info!(kind = %R::KIND, name = %label, "operator chose insert");
                return Ok(Resolution::Insert(record));
            }
            OperatorReply::Action(ActionChoice::Skip) => {
                let chosen =
                    select_target::<R>(shown, &views, TargetPurpose::Duplicate, operator)?;
                info!(
                    kind = %R::KIND,
                    name = %label,
                    matched_id = %chosen.identity(),
                    similarity = chosen.similarity,
                    "operator marked duplicate"
                );
                return Ok(Resolution::Skip(Skipped {
                    matched: chosen.identity(),
                    matched_label: chosen.existing.display_name(),
                    similarity: chosen.similarity,
                    record,
                }));
            }
            OperatorReply::Action(ActionChoice::Update) => {
                let chosen = select_target::<R>(shown, &views, TargetPurpose::Update, operator)?;
                operator.show(&format!(
                    "Will update '{}' (ID: {})",
                    chosen.existing.display_name(),
                    chosen.identity()
                ));
                info!(
                    kind = %R::KIND,
                    name = %label,
                    target_id = %chosen.identity(),
                    similarity = chosen.similarity,
                    "operator chose update"
                );
                return Ok(Resolution::Update(Updated {
                    target: chosen.identity(),
                    target_label: chosen.existing.display_name(),
                    similarity: chosen.similarity,
                    record,
                }));
            }
            OperatorReply::Action(ActionChoice::Details) => {
                operator.show(&render_details(&record, shown))
            }
            _ => operator.show("Invalid choice. Please enter 1, 2, 3, or 4."),
        }
    }
}

fn select_target<'c, R: Matchable>(
    shown: &'c [MatchCandidate<R::Existing>],
    views: &[CandidateView],
    purpose: TargetPurpose,
    operator: &mut dyn OperatorPort,
) -> std::io::Result<&'c MatchCandidate<R::Existing>> {
    if let [only] = shown {
        return Ok(only);
    }

    let heading = match purpose {
        TargetPurpose::Duplicate => format!("\nWhich existing {} is this a duplicate of?", R::KIND),
        TargetPurpose::Update => format!("\nSelect which existing {} to update:", R::KIND),
    };
    let mut listing = vec![heading];
    for (i, candidate) in shown.iter().enumerate() {
        listing.push(format!(
            "   {}. '{}' ({}) [ID: {}]",
            i + 1,
            candidate.existing.display_name(),
            candidate.existing.display_contact(),
            candidate.identity()
        ));
    }
    operator.show(&listing.join("\n"));

    loop {
        let reply = operator.ask(&PromptRequest::Target {
            kind: R::KIND,
            purpose,
            candidates: views,
        })?;
        match reply {
            OperatorReply::Target(n) => return Ok(&shown[n - 1]),
            OperatorReply::OutOfRange(_) => operator.show("Invalid selection. Try again."),
            _ => operator.show("Please enter a valid number."),
        }
    }
}

fn candidate_views<E: ExistingRecord>(shown: &[MatchCandidate<E>]) -> Vec<CandidateView> {
    shown
        .iter()
        .map(|candidate| CandidateView {
            id: candidate.identity().to_string(),
            name: candidate.existing.display_name(),
            contact: candidate.existing.display_contact(),
            similarity: candidate.similarity,
        })
        .collect()
}

fn format_row(label: &str, name: &str, contact: &str, id: &str, similarity: &str) -> String {
    format!("{label:<10} | {name:<30} | {contact:<40} | ID: {id:<6} Sim: {similarity}")
}

fn render_comparison<R: IncomingRecord>(
    record: &R,
    shown: &[MatchCandidate<R::Existing>],
) -> String {
    let rule = "-".repeat(100);
    let mut lines = vec![
        format!("\n{}", "=".repeat(100)),
        format!("Potential duplicate found for {}: {}", R::KIND, record.display_name()),
        rule.clone(),
        format!(
            "{:<10} | {:<30} | {:<40} | ID / Similarity",
            "Label", "Name", "Contact"
        ),
        rule.clone(),
        format_row(
            "NEW",
            &record.display_name(),
            &record.display_contact(),
            "",
            "",
        ),
    ];
    for (i, candidate) in shown.iter().enumerate() {
        lines.push(format_row(
            &format!("MATCH {}", i + 1),
            &candidate.existing.display_name(),
            &candidate.existing.display_contact(),
            &candidate.identity().to_string(),
            &format!("{:.2}", candidate.similarity),
        ));
    }
    lines.push(rule);
    lines.join("\n")
}

fn render_details<R: IncomingRecord>(record: &R, shown: &[MatchCandidate<R::Existing>]) -> String {
    let mut lines = vec![format!("\nNew {} details:", R::KIND)];
    for (key, value) in record.detail_fields() {
        lines.push(format!("  {key}: {value}"));
    }
    lines.push(format!("\nExisting {} details:", R::KIND));
    for (i, candidate) in shown.iter().enumerate() {
        lines.push(format!(
            "\n  Match {}: '{}' [ID: {}]",
            i + 1,
            candidate.existing.display_name(),
            candidate.identity()
        ));
        for (key, value) in candidate.existing.detail_fields() {
            lines.push(format!("    {key}: {value}"));
        }
        lines.push(format!("    similarity: {:.4}", candidate.similarity));
    }
    lines.join("\n")
}
