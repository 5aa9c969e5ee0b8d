//! SQL identifier normalization and collision handling

use unicode_normalization::UnicodeNormalization;

/// PostgreSQL identifier length limit.
const MAX_IDENT_LEN: usize = 63;

/// Decompose and strip to ASCII, collapsing everything else to underscores.
/// Produces a lowercase candidate without the leading-digit or length rules.
fn normalize_core(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());

    for ch in raw.nfkd() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if ch == '_' || !ch.is_ascii() || ch.is_ascii_whitespace() || ch.is_ascii_punctuation()
        {
            // Non-ASCII survivors of NFKD are dropped; everything else
            // joins the current underscore run.
            if ch.is_ascii() && !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
        }
    }

    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn finish(mut name: String) -> String {
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name.truncate(MAX_IDENT_LEN);
    if name.is_empty() {
        name.push_str("col");
    }
    name
}

/// Normalize an arbitrary string into a safe SQL identifier.
///
/// Idempotent: `normalize_identifier(normalize_identifier(x)) ==
/// normalize_identifier(x)`.
pub fn normalize_identifier(raw: &str) -> String {
    finish(normalize_core(raw))
}

/// Build a table name from the path parts of a leaf folder.
///
/// Parts are normalized individually and joined with underscores; the
/// leading-digit and length rules apply to the joined result, so
/// `["sales", "2024"]` maps to `sales_2024`.
pub fn table_name_from_parts(parts: &[String]) -> String {
    let joined = parts
        .iter()
        .map(|p| normalize_core(p))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    finish(joined)
}

/// Disambiguate duplicate identifiers in input order: `name`, `name_2`,
/// `name_3`, ... Results never exceed the identifier length limit.
pub fn dedupe_identifiers(names: &[String]) -> Vec<String> {
    use std::collections::{HashMap, HashSet};

    let mut used: HashSet<String> = HashSet::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(names.len());

    for name in names {
        let unique = if used.contains(name) {
            let mut n = counts.get(name).copied().unwrap_or(1);
            loop {
                n += 1;
                let suffix = format!("_{n}");
                let mut base = name.clone();
                base.truncate(MAX_IDENT_LEN - suffix.len());
                let candidate = format!("{base}{suffix}");
                if !used.contains(&candidate) {
                    counts.insert(name.clone(), n);
                    break candidate;
                }
            }
        } else {
            counts.insert(name.clone(), 1);
            name.clone()
        };

        used.insert(unique.clone());
        out.push(unique);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_basic() {
        assert_eq!(normalize_identifier("  My Col (%)"), "my_col");
        assert_eq!(normalize_identifier("Revenue $ USD"), "revenue_usd");
        assert_eq!(normalize_identifier("Crédit Récupéré"), "credit_recupere");
    }

    #[test]
    fn test_normalize_leading_digit() {
        assert_eq!(normalize_identifier("2024 totals"), "_2024_totals");
    }

    #[test]
    fn test_normalize_empty_becomes_col() {
        assert_eq!(normalize_identifier(""), "col");
        assert_eq!(normalize_identifier("(%)"), "col");
    }

    #[test]
    fn test_normalize_truncates() {
        let long = "x".repeat(100);
        assert_eq!(normalize_identifier(&long).len(), 63);
    }

    #[test]
    fn test_normalize_idempotent() {
        for raw in ["  My Col (%)", "2024 totals", "Crédit", "", "already_clean"] {
            let once = normalize_identifier(raw);
            assert_eq!(normalize_identifier(&once), once);
        }
    }

    #[test]
    fn test_table_name_from_parts() {
        assert_eq!(
            table_name_from_parts(&strings(&["sales", "2024"])),
            "sales_2024"
        );
        assert_eq!(
            table_name_from_parts(&strings(&["Folder B", "Nested"])),
            "folder_b_nested"
        );
        assert_eq!(table_name_from_parts(&strings(&["2024", "q1"])), "_2024_q1");
    }

    #[test]
    fn test_dedupe_suffixes_in_order() {
        assert_eq!(
            dedupe_identifiers(&strings(&["x", "x", "x"])),
            strings(&["x", "x_2", "x_3"])
        );
        assert_eq!(
            dedupe_identifiers(&strings(&["a", "b", "a"])),
            strings(&["a", "b", "a_2"])
        );
    }

    #[test]
    fn test_dedupe_avoids_existing_suffix() {
        assert_eq!(
            dedupe_identifiers(&strings(&["x", "x_2", "x", "x"])),
            strings(&["x", "x_2", "x_3", "x_4"])
        );
    }

    #[test]
    fn test_dedupe_respects_length_limit() {
        let long = "y".repeat(63);
        let result = dedupe_identifiers(&strings(&[&long, &long]));
        assert_eq!(result[0].len(), 63);
        assert_eq!(result[1].len(), 63);
        assert!(result[1].ends_with("_2"));
        assert_ne!(result[0], result[1]);
    }
}
