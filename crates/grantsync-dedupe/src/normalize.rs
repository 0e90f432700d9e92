//! Canonical forms for free-text company and person names.

use once_cell::sync::Lazy;
use regex::Regex;

static COMPANY_SUFFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\binc\.?$",
        r"\bincorporated$",
        r"\bcorp\.?$",
        r"\bcorporation$",
        r"\bltd\.?$",
        r"\blimited$",
        r"\bllc$",
        r"\bco\.?$",
        r"\bcompany$",
        r"\benterprises?$",
        r"\bgroup$",
        r"\bholdings?$",
        r"\bassociates?$",
        r"\bpartners?$",
        r"\bsolutions?$",
        r"\bservices?$",
        r"\btechnologies$",
        r"\btechnology$",
        r"\btech$",
        r"\bsystems?$",
        r"\bindustries$",
        r"\bindustrial$",
        r"\bmanufacturing$",
        r"\bmfg$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static suffix pattern"))
    .collect()
});

static PERSON_AFFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^\s*mr\.?\s+",
        r"^\s*mrs\.?\s+",
        r"^\s*ms\.?\s+",
        r"^\s*dr\.?\s+",
        r"\s+phd\.?\s*$",
        r"\s+md\.?\s*$",
        r"\s+jr\.?\s*$",
        r"\s+sr\.?\s*$",
        r"\s+mba\.?\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static affix pattern"))
    .collect()
});

static OPERATING_NAME: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)operating\s+business\s+name:\s*(.+?)(?:,|$)",
        r"(?i)\bdba\b\.?\s*(.+?)(?:,|$)",
        r"(?i)doing\s+business\s+as\s*(.+?)(?:,|$)",
        r"(?i)\boperating\s+as\s*(.+?)(?:,|$)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static operating-name pattern"))
    .collect()
});

static HYPHENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_]").expect("static pattern"));
static NON_WORD_KEEP_DOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s.]").expect("static pattern"));
static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").expect("static pattern"));

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_company_suffixes(mut normalized: String) -> String {
    loop {
        let before = normalized.clone();
        for suffix in COMPANY_SUFFIXES.iter() {
            normalized = suffix.replace(&normalized, "").into_owned();
        }
        normalized = collapse_whitespace(&normalized);
        if normalized == before {
            return normalized;
        }
    }
}

/// Returns the `X` of "dba X", "doing business as X", "operating as X" or
/// "operating business name: X" when present, otherwise the input unchanged.
pub fn extract_operating_name(company_name: &str) -> &str {
    for pattern in OPERATING_NAME.iter() {
        if let Some(found) = pattern.captures(company_name).and_then(|c| c.get(1)) {
            let trimmed = found.as_str().trim();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
    }
    company_name
}

/// Lowercases, strips trailing business-entity suffixes until none match, and removes
/// punctuation. Suffix stripping runs again after punctuation cleanup so the result is a
/// fixed point: `normalize_company(normalize_company(x)) == normalize_company(x)`.
pub fn normalize_company(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    if lowered.is_empty() {
        return String::new();
    }

    let stripped = strip_company_suffixes(lowered);
    let spaced = HYPHENS.replace_all(&stripped, " ");
    let cleaned = NON_WORD_KEEP_DOT.replace_all(&spaced, " ");
    let cleaned = collapse_whitespace(&cleaned).replace('.', "");
    strip_company_suffixes(collapse_whitespace(&cleaned))
}

/// Lowercases, drops leading honorifics and trailing credentials, removes punctuation.
pub fn normalize_person(name: &str) -> String {
    let mut normalized = name.trim().to_lowercase();
    if normalized.is_empty() {
        return String::new();
    }
    for affix in PERSON_AFFIXES.iter() {
        normalized = affix.replace(&normalized, "").into_owned();
    }
    collapse_whitespace(&NON_WORD.replace_all(&normalized, " "))
}
