use regex::Regex;
use std::sync::OnceLock;

use crate::config::QcConfig;
use crate::model::{ExtractedStatement, QcStatus, SourceMatchSummary, UnmatchedValue};
use crate::qc::{formula, units};

const UNMATCHED_SAMPLE_LIMIT: usize = 5;
const SCALED_MATCH_REL_TOL: f64 = 0.001;
const EXACT_MATCH_REL_TOL: f64 = 0.0001;

fn number_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    // The formats seen in OCR'd statements: comma-grouped, space-grouped,
    // bracket-wrapped negatives, currency-prefixed. Each pattern scans the
    // text independently; a space-grouped run also contributes its
    // individual tokens through the plain pattern.
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"\([\d,]+(?:\.\d+)?\)").expect("valid number pattern"),
            Regex::new(r"[\d,]+(?:\.\d+)?").expect("valid number pattern"),
            Regex::new(r"\(\d{1,3}(?: \d{3})+(?:\.\d+)?\)").expect("valid number pattern"),
            Regex::new(r"\d{1,3}(?: \d{3})+(?:\.\d+)?").expect("valid number pattern"),
        ]
    })
}

/// Parses one numeric token; parentheses mean negative, grouping characters
/// and currency signs are stripped.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace("**", "");
    let mut cleaned = cleaned.replace([',', ' '], "");
    if let Some(stripped) = cleaned.strip_prefix('$') {
        cleaned = stripped.to_string();
    }
    if cleaned.is_empty() || cleaned == "-" || cleaned.eq_ignore_ascii_case("n/a") {
        return None;
    }

    let negative = cleaned.starts_with('(') && cleaned.ends_with(')');
    if negative {
        cleaned = cleaned[1..cleaned.len() - 1].to_string();
    }

    cleaned.parse::<f64>().ok().map(|value| {
        if negative { -value } else { value }
    })
}

/// All distinct numeric magnitudes in the source text, sorted ascending.
pub fn extract_numbers(text: &str) -> Vec<f64> {
    let mut numbers: Vec<f64> = number_patterns()
        .iter()
        .flat_map(|pattern| pattern.find_iter(text))
        .filter_map(|token| parse_number(token.as_str()))
        .map(f64::abs)
        .filter(|value| *value > 0.0)
        .collect();
    numbers.sort_by(|a, b| a.total_cmp(b));
    numbers.dedup();
    numbers
}

fn contains_close(sorted: &[f64], target: f64, rel_tol: f64) -> bool {
    if target <= 0.0 {
        return false;
    }
    let low = target * (1.0 - rel_tol);
    let start = sorted.partition_point(|value| *value < low);
    sorted[start..]
        .iter()
        .take_while(|value| **value <= target * (1.0 + rel_tol))
        .next()
        .is_some()
}

fn value_matches_source(value: f64, multiplier: f64, source_numbers: &[f64]) -> bool {
    let magnitude = value.abs();
    // As printed at the statement's declared scale, or written out in full.
    if contains_close(source_numbers, magnitude, EXACT_MATCH_REL_TOL) {
        return true;
    }
    if contains_close(source_numbers, magnitude * multiplier, EXACT_MATCH_REL_TOL) {
        return true;
    }
    // Full-currency source figure that divides back onto the declared scale.
    if multiplier > 1.0 && contains_close(source_numbers, magnitude * multiplier, SCALED_MATCH_REL_TOL)
    {
        return true;
    }
    false
}

/// Compares every extracted leaf value against the numeric tokens of the
/// cited source pages. Computed rows are skipped: subtotals and per-share
/// figures legitimately never appear verbatim, which is also why the
/// middle band warns instead of failing.
pub fn check_statement(
    statement: &ExtractedStatement,
    source_text: &str,
    config: &QcConfig,
) -> Option<SourceMatchSummary> {
    let source_numbers = extract_numbers(source_text);
    if source_numbers.is_empty() {
        return None;
    }

    let multiplier = units::full_scale_multiplier(&statement.unit_type);
    let mut checked = 0_usize;
    let mut matched = 0_usize;
    let mut unmatched = Vec::new();

    for row in &statement.rows {
        let is_computed = formula::parse_reference(&row.reference)
            .map(|reference| reference.formula.is_some())
            .unwrap_or(false);
        if is_computed {
            continue;
        }

        for value in row.values.iter().flatten() {
            if *value == 0.0 {
                continue;
            }
            checked += 1;
            if value_matches_source(*value, multiplier, &source_numbers) {
                matched += 1;
            } else if unmatched.len() < UNMATCHED_SAMPLE_LIMIT {
                unmatched.push(UnmatchedValue {
                    source_label: row.source_label.chars().take(40).collect(),
                    value: *value,
                });
            }
        }
    }

    if checked == 0 {
        return None;
    }

    let match_ratio = matched as f64 / checked as f64;
    let status = if match_ratio >= config.source_match_pass {
        QcStatus::Pass
    } else if match_ratio >= config.source_match_warn {
        QcStatus::Warn
    } else {
        QcStatus::Fail
    };

    Some(SourceMatchSummary {
        checked,
        matched,
        match_ratio,
        status,
        unmatched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PeriodColumn, StatementRow};

    fn statement(unit_type: &str, rows: Vec<(&str, &str, Vec<Option<f64>>)>) -> ExtractedStatement {
        let column_count = rows.first().map(|row| row.2.len()).unwrap_or(0);
        ExtractedStatement {
            ticker: "LUCK".into(),
            filing: "annual_2024".into(),
            statement: "pl".into(),
            consolidation: "consolidated".into(),
            unit_type: unit_type.into(),
            source_pages: vec![12],
            columns: (0..column_count)
                .map(|index| PeriodColumn {
                    period_end: format!("2024-0{}-30", index + 1),
                    duration_months: 12,
                })
                .collect(),
            rows: rows
                .into_iter()
                .map(|(canonical, reference, values)| StatementRow {
                    source_label: canonical.to_string(),
                    canonical: canonical.into(),
                    reference: reference.into(),
                    values,
                })
                .collect(),
        }
    }

    #[test]
    fn number_formats_all_parse() {
        assert_eq!(parse_number("1,234,567"), Some(1_234_567.0));
        assert_eq!(parse_number("(1,234)"), Some(-1234.0));
        assert_eq!(parse_number("1 234 567"), Some(1_234_567.0));
        assert_eq!(parse_number("(1 234)"), Some(-1234.0));
        assert_eq!(parse_number("$5,000"), Some(5000.0));
        assert_eq!(parse_number("12.75"), Some(12.75));
        assert_eq!(parse_number("-"), None);
        assert_eq!(parse_number("N/A"), None);
    }

    #[test]
    fn extraction_captures_grouped_and_bracketed_tokens() {
        let numbers = extract_numbers("Revenue 1,234,567 less cost (456,789) and 9 876 543 units");
        assert!(numbers.contains(&1_234_567.0));
        assert!(numbers.contains(&456_789.0));
        assert!(numbers.contains(&9_876_543.0));
    }

    #[test]
    fn matched_values_at_declared_scale_pass() {
        let statement = statement(
            "thousands",
            vec![
                ("Revenue", "A", vec![Some(1_234_567.0)]),
                ("Cost of sales", "B", vec![Some(-456_789.0)]),
            ],
        );
        let summary = check_statement(
            &statement,
            "Revenue 1,234,567\nCost of sales (456,789)",
            &QcConfig::default(),
        )
        .expect("summary");
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.matched, 2);
        assert_eq!(summary.status, QcStatus::Pass);
    }

    #[test]
    fn unit_scaled_source_figures_match() {
        // Statement declared in thousands, source printed in full rupees.
        let statement = statement("thousands", vec![("Revenue", "A", vec![Some(1_234.0)])]);
        let summary =
            check_statement(&statement, "Revenue 1,234,000", &QcConfig::default()).expect("summary");
        assert_eq!(summary.matched, 1);
    }

    #[test]
    fn computed_rows_are_not_held_against_the_source() {
        let statement = statement(
            "thousands",
            vec![
                ("Revenue", "A", vec![Some(100.0)]),
                ("Cost", "B", vec![Some(50.0)]),
                ("Gross profit", "C=A-B", vec![Some(50.0)]),
            ],
        );
        let summary =
            check_statement(&statement, "Revenue 100 cost 50", &QcConfig::default()).expect("summary");
        assert_eq!(summary.checked, 2);
    }

    #[test]
    fn low_ratio_fails_and_middle_band_warns() {
        let config = QcConfig::default();
        let statement_fail = statement(
            "thousands",
            vec![
                ("Revenue", "A", vec![Some(111.0)]),
                ("Cost", "B", vec![Some(222.0)]),
                ("Other", "C", vec![Some(333.0)]),
            ],
        );
        let summary =
            check_statement(&statement_fail, "nothing matches 999", &config).expect("summary");
        assert_eq!(summary.status, QcStatus::Fail);
        assert_eq!(summary.unmatched.len(), 3);

        let statement_warn = statement(
            "thousands",
            vec![
                ("A", "A", vec![Some(111.0)]),
                ("B", "B", vec![Some(222.0)]),
                ("C", "C", vec![Some(333.0)]),
                ("D", "D", vec![Some(444.0)]),
                ("E", "E", vec![Some(555.0)]),
            ],
        );
        let summary = check_statement(&statement_warn, "111 222 333 444 and noise", &config)
            .expect("summary");
        assert_eq!(summary.matched, 4);
        assert_eq!(summary.status, QcStatus::Warn);
    }

    #[test]
    fn empty_source_text_yields_no_summary() {
        let statement = statement("thousands", vec![("Revenue", "A", vec![Some(100.0)])]);
        assert!(check_statement(&statement, "no digits here", &QcConfig::default()).is_none());
    }
}
