//! String similarity ratios in `[0, 1]`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimilarityMetric {
    #[default]
    RatcliffObershelp,
    JaroWinkler,
}

impl SimilarityMetric {
    pub fn score(&self, a: &str, b: &str) -> f64 {
        match self {
            SimilarityMetric::RatcliffObershelp => ratcliff_obershelp(a, b),
            SimilarityMetric::JaroWinkler => strsim::jaro_winkler(a, b),
        }
    }
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimilarityMetric::RatcliffObershelp => f.write_str("ratcliff-obershelp"),
            SimilarityMetric::JaroWinkler => f.write_str("jaro-winkler"),
        }
    }
}

impl FromStr for SimilarityMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ratcliff-obershelp" | "ratcliff_obershelp" | "sequence" => {
                Ok(SimilarityMetric::RatcliffObershelp)
            }
            "jaro-winkler" | "jaro_winkler" => Ok(SimilarityMetric::JaroWinkler),
            other => Err(format!("unknown similarity metric: {other}")),
        }
    }
}

/// Gestalt pattern matching: `2 * M / T`, where `M` counts characters in the recursively
/// found longest common blocks and `T` is the combined length. Two empty strings score 1.0.
pub fn ratcliff_obershelp(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, k) = longest_match(a, b, alo, ahi, blo, bhi);
        if k == 0 {
            continue;
        }
        matched += k;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            pending.push((i + k, ahi, j + k, bhi));
        }
    }
    matched
}

/// Longest common block in `a[alo..ahi]` x `b[blo..bhi]`; earliest in `a`, then in `b`, wins ties.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_k) = (alo, blo, 0);
    let width = bhi - blo;
    let mut prev = vec![0usize; width + 1];
    let mut cur = vec![0usize; width + 1];
    for i in alo..ahi {
        for j in blo..bhi {
            let slot = j - blo + 1;
            if a[i] == b[j] {
                let k = prev[slot - 1] + 1;
                cur[slot] = k;
                if k > best_k {
                    best_i = i + 1 - k;
                    best_j = j + 1 - k;
                    best_k = k;
                }
            } else {
                cur[slot] = 0;
            }
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    (best_i, best_j, best_k)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn identical_strings_score_one() {
        assert!(close(ratcliff_obershelp("acme tools", "acme tools"), 1.0));
        assert!(close(ratcliff_obershelp("", ""), 1.0));
    }

    #[test]
    fn disjoint_strings_score_zero() {
        assert!(close(ratcliff_obershelp("abc", "xyz"), 0.0));
        assert!(close(ratcliff_obershelp("abc", ""), 0.0));
    }

    #[test]
    fn matches_reference_ratios() {
        // a shared "bcd" block: 2 * 3 / 8
        assert!(close(ratcliff_obershelp("abcd", "bcde"), 0.75));
        // "mciver" then "ill": 2 * 9 / 23
        assert!(close(
            ratcliff_obershelp("billmciver", "williammciver"),
            18.0 / 23.0
        ));
    }

    #[test]
    fn ratio_is_symmetric_for_simple_inputs() {
        let pairs = [("fundy marine", "fundy maritime"), ("blue door", "bluedoor labs")];
        for (a, b) in pairs {
            assert!(close(ratcliff_obershelp(a, b), ratcliff_obershelp(b, a)));
        }
    }

    #[test]
    fn metric_parses_from_config_strings() {
        assert_eq!(
            "Jaro-Winkler".parse::<SimilarityMetric>().unwrap(),
            SimilarityMetric::JaroWinkler
        );
        assert_eq!(
            "ratcliff_obershelp".parse::<SimilarityMetric>().unwrap(),
            SimilarityMetric::RatcliffObershelp
        );
        assert!("cosine".parse::<SimilarityMetric>().is_err());
    }

    #[test]
    fn jaro_winkler_scores_identical_names_one() {
        assert!(close(SimilarityMetric::JaroWinkler.score("acme", "acme"), 1.0));
    }
}
