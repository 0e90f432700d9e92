//! Exact-key insert/update partition for records with a durable natural key.

use std::collections::HashSet;

use grantsync_core::Investment;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UniqueKey {
    Text(String),
    Int(i64),
}

impl UniqueKey {
    /// Text keys compare case-insensitively with surrounding whitespace ignored.
    pub fn folded(&self) -> UniqueKey {
        match self {
            UniqueKey::Text(s) => UniqueKey::Text(s.trim().to_lowercase()),
            UniqueKey::Int(n) => UniqueKey::Int(*n),
        }
    }
}

impl From<&str> for UniqueKey {
    fn from(value: &str) -> Self {
        UniqueKey::Text(value.to_string())
    }
}

impl From<String> for UniqueKey {
    fn from(value: String) -> Self {
        UniqueKey::Text(value)
    }
}

impl From<i64> for UniqueKey {
    fn from(value: i64) -> Self {
        UniqueKey::Int(value)
    }
}

pub trait Keyed {
    fn unique_key(&self) -> UniqueKey;
}

impl Keyed for Investment {
    fn unique_key(&self) -> UniqueKey {
        UniqueKey::Text(self.ref_num.clone())
    }
}

/// Returns `(to_insert, to_update)`, each in input order.
pub fn split_insert_update<T: Keyed>(incoming: Vec<T>, existing: &[UniqueKey]) -> (Vec<T>, Vec<T>) {
    let known: HashSet<UniqueKey> = existing.iter().map(UniqueKey::folded).collect();
    incoming
        .into_iter()
        .partition(|record| !known.contains(&record.unique_key().folded()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn investment(ref_num: &str) -> Investment {
        Investment {
            ref_num: ref_num.into(),
            title: Some(format!("Project {ref_num}")),
            exec_summary: None,
            fiscal_year: Some("2024-2025".into()),
            research_fund_id: "IVF".into(),
            application_date: None,
            decision_date: None,
            amount_requested: 0.0,
            amount_awarded: 0.0,
            total_leverage: 0.0,
            private_sector_leverage: 0.0,
            fed_leverage: None,
            other_leverage: None,
            fte: None,
            pte: None,
            sector: None,
            notes: None,
            applicant_email: None,
            company_name: None,
        }
    }

    fn refs(records: &[Investment]) -> Vec<&str> {
        records.iter().map(|r| r.ref_num.as_str()).collect()
    }

    #[test]
    fn known_reference_numbers_go_to_update() {
        let existing = vec![UniqueKey::from("NBIF-2025-001")];
        let (insert, update) = split_insert_update(
            vec![investment("NBIF-2025-001"), investment("NBIF-2025-002")],
            &existing,
        );
        assert_eq!(refs(&insert), vec!["NBIF-2025-002"]);
        assert_eq!(refs(&update), vec!["NBIF-2025-001"]);
    }

    #[test]
    fn key_comparison_ignores_case_and_padding() {
        let existing = vec![UniqueKey::from(" nbif-2025-001 ")];
        let (insert, update) = split_insert_update(vec![investment("NBIF-2025-001")], &existing);
        assert!(insert.is_empty());
        assert_eq!(update.len(), 1);
    }

    #[test]
    fn output_is_disjoint_and_exhaustive() {
        let existing: Vec<UniqueKey> = ["A-1", "A-3", "Z-9"].into_iter().map(Into::into).collect();
        let incoming: Vec<_> = ["A-1", "A-2", "A-3", "A-4"].into_iter().map(investment).collect();
        let (insert, update) = split_insert_update(incoming, &existing);
        assert_eq!(refs(&insert), vec!["A-2", "A-4"]);
        assert_eq!(refs(&update), vec!["A-1", "A-3"]);
    }

    #[test]
    fn integer_keys_match_exactly() {
        struct Row(i64);
        impl Keyed for Row {
            fn unique_key(&self) -> UniqueKey {
                UniqueKey::Int(self.0)
            }
        }
        let (insert, update) = split_insert_update(vec![Row(1), Row(2)], &[UniqueKey::Int(2)]);
        assert_eq!(insert.iter().map(|r| r.0).collect::<Vec<_>>(), vec![1]);
        assert_eq!(update.iter().map(|r| r.0).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn empty_store_inserts_everything() {
        let (insert, update) = split_insert_update(vec![investment("X")], &[]);
        assert_eq!(insert.len(), 1);
        assert!(update.is_empty());
    }
}
