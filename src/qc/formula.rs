use std::collections::BTreeMap;

use anyhow::{Result, bail};
use regex::Regex;
use std::sync::OnceLock;

use crate::config::{QcConfig, within_tolerance};
use crate::model::{
    ExtractedStatement, FileStatus, FormulaFailure, FormulaPeriodFailure, StatementRow,
};

/// One signed operand reference inside a parsed formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub sign: f64,
    pub operand: String,
}

/// A declared arithmetic relationship, parsed once per statement and
/// evaluated once per period column.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub raw: String,
    pub terms: Vec<Term>,
}

/// A row's reference cell: its operand name, plus the formula when the row
/// is a computed subtotal rather than a leaf input.
#[derive(Debug, Clone)]
pub struct ParsedReference {
    pub name: String,
    pub formula: Option<Formula>,
}

fn term_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(?:([+-])\s*)?([A-Z]+)(?:\.\.([A-Z]+))?\s*").expect("valid term pattern")
    })
}

/// Successor in spreadsheet column order: A..Z, AA, AB, ...
fn next_operand(name: &str) -> String {
    let mut chars: Vec<u8> = name.bytes().collect();
    for position in (0..chars.len()).rev() {
        if chars[position] < b'Z' {
            chars[position] += 1;
            return String::from_utf8(chars).expect("ascii operand");
        }
        chars[position] = b'A';
    }
    let mut widened = String::with_capacity(chars.len() + 1);
    widened.push('A');
    widened.push_str(&String::from_utf8(chars).expect("ascii operand"));
    widened
}

fn expand_range(start: &str, end: &str, raw: &str) -> Result<Vec<String>> {
    let mut operands = Vec::new();
    let mut current = start.to_string();
    loop {
        operands.push(current.clone());
        if current == end {
            return Ok(operands);
        }
        if operands.len() > 64 {
            bail!("unresolvable operand range {start}..{end} in formula '{raw}'");
        }
        current = next_operand(&current);
    }
}

fn parse_expression(raw: &str) -> Result<Formula> {
    let mut terms = Vec::new();
    let mut rest = raw.trim();
    let mut first = true;

    while !rest.is_empty() {
        let Some(captures) = term_pattern().captures(rest) else {
            bail!("unparseable formula expression '{raw}'");
        };
        let sign = match captures.get(1).map(|sign| sign.as_str()) {
            Some("-") => -1.0,
            Some(_) => 1.0,
            None if first => 1.0,
            None => bail!("missing operator before operand in formula '{raw}'"),
        };
        let operand = captures
            .get(2)
            .map(|operand| operand.as_str())
            .unwrap_or_default();

        if let Some(range_end) = captures.get(3) {
            if sign < 0.0 {
                bail!("operand ranges cannot be subtracted in formula '{raw}'");
            }
            for expanded in expand_range(operand, range_end.as_str(), raw)? {
                terms.push(Term {
                    sign: 1.0,
                    operand: expanded,
                });
            }
        } else {
            terms.push(Term {
                sign,
                operand: operand.to_string(),
            });
        }

        rest = &rest[captures.get(0).map(|whole| whole.end()).unwrap_or(0)..];
        first = false;
    }

    if terms.is_empty() {
        bail!("empty formula expression '{raw}'");
    }

    Ok(Formula {
        raw: raw.trim().to_string(),
        terms,
    })
}

/// Parses a reference cell. Plain names (`A`) are leaf inputs; `NAME=expr`
/// declares a computed row. An unparseable cell is a structural violation
/// for the whole statement, surfaced to the caller.
pub fn parse_reference(raw: &str) -> Result<ParsedReference> {
    let cleaned = raw.replace("**", "");
    let cleaned = cleaned.trim();

    match cleaned.split_once('=') {
        None => {
            if cleaned.is_empty() || !cleaned.bytes().all(|byte| byte.is_ascii_uppercase()) {
                bail!("invalid operand reference '{raw}'");
            }
            Ok(ParsedReference {
                name: cleaned.to_string(),
                formula: None,
            })
        }
        Some((name, expression)) => {
            let name = name.trim();
            if name.is_empty() || !name.bytes().all(|byte| byte.is_ascii_uppercase()) {
                bail!("invalid formula target '{raw}'");
            }
            Ok(ParsedReference {
                name: name.to_string(),
                formula: Some(parse_expression(expression)?),
            })
        }
    }
}

#[derive(Debug)]
pub struct FormulaOutcome {
    pub file_status: FileStatus,
    pub formula_total: usize,
    pub formula_passed: usize,
    pub formula_failed: usize,
    pub incomplete_rows: usize,
    pub failures: Vec<FormulaFailure>,
}

enum ColumnVerdict {
    Pass,
    Fail(FormulaPeriodFailure),
    Incomplete,
}

fn evaluate_column(
    formula: &Formula,
    refs: &BTreeMap<&str, &StatementRow>,
    column: usize,
    actual: Option<f64>,
    config: &QcConfig,
) -> ColumnVerdict {
    let Some(actual) = actual else {
        return ColumnVerdict::Incomplete;
    };

    let mut expected = 0.0;
    for term in &formula.terms {
        // Operand lookup stops at the referenced row's own value. A parent
        // formula over a subtotal row consumes the subtotal, never the
        // subtotal's leaves, so leaves are not counted twice.
        let value = refs
            .get(term.operand.as_str())
            .and_then(|row| row.values.get(column))
            .and_then(|value| *value);
        match value {
            Some(value) => expected += term.sign * value,
            None => return ColumnVerdict::Incomplete,
        }
    }

    if within_tolerance(actual, expected, config.formula_rel_tol, config.formula_abs_floor) {
        ColumnVerdict::Pass
    } else {
        ColumnVerdict::Fail(FormulaPeriodFailure {
            column: column + 1,
            expected,
            actual,
            diff: (actual - expected).abs(),
        })
    }
}

/// Evaluates every declared formula in the statement against every period
/// column. Missing operands make a column incomplete, never failed; a
/// duplicate or unparseable reference aborts the statement as a structural
/// violation.
pub fn validate(statement: &ExtractedStatement, config: &QcConfig) -> Result<FormulaOutcome> {
    let mut parsed = Vec::with_capacity(statement.rows.len());
    let mut refs: BTreeMap<&str, &StatementRow> = BTreeMap::new();

    for row in &statement.rows {
        let reference = parse_reference(&row.reference)
            .map_err(|err| err.context(format!("row '{}'", row.source_label)))?;
        parsed.push(reference);
    }
    for (row, reference) in statement.rows.iter().zip(&parsed) {
        if refs.insert(reference.name.as_str(), row).is_some() {
            bail!(
                "duplicate operand reference '{}' at row '{}'",
                reference.name,
                row.source_label
            );
        }
    }

    let column_count = statement.columns.len();
    let mut outcome = FormulaOutcome {
        file_status: FileStatus::Pass,
        formula_total: 0,
        formula_passed: 0,
        formula_failed: 0,
        incomplete_rows: 0,
        failures: Vec::new(),
    };

    for (row, reference) in statement.rows.iter().zip(&parsed) {
        let Some(formula) = &reference.formula else {
            continue;
        };
        outcome.formula_total += 1;

        let mut failures = Vec::new();
        let mut incomplete = false;
        for column in 0..column_count {
            let actual = row.values.get(column).and_then(|value| *value);
            match evaluate_column(formula, &refs, column, actual, config) {
                ColumnVerdict::Pass => {}
                ColumnVerdict::Incomplete => incomplete = true,
                ColumnVerdict::Fail(failure) => failures.push(failure),
            }
        }

        if !failures.is_empty() {
            outcome.formula_failed += 1;
            outcome.failures.push(FormulaFailure {
                reference: reference.name.clone(),
                formula: formula.raw.clone(),
                canonical: row.canonical.clone(),
                periods: failures,
            });
        } else {
            outcome.formula_passed += 1;
            if incomplete {
                outcome.incomplete_rows += 1;
            }
        }
    }

    outcome.file_status = if outcome.formula_failed > 0 {
        FileStatus::Fail
    } else if outcome.incomplete_rows > 0 {
        FileStatus::Incomplete
    } else {
        FileStatus::Pass
    };

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PeriodColumn;

    fn statement(rows: Vec<(&str, &str, Vec<Option<f64>>)>) -> ExtractedStatement {
        let column_count = rows.first().map(|row| row.2.len()).unwrap_or(0);
        ExtractedStatement {
            ticker: "LUCK".into(),
            filing: "annual_2024".into(),
            statement: "pl".into(),
            consolidation: "consolidated".into(),
            unit_type: "thousands".into(),
            source_pages: vec![],
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
    fn plain_and_formula_references_parse() {
        let leaf = parse_reference("A").expect("leaf");
        assert!(leaf.formula.is_none());

        let formula = parse_reference("C=A+B").expect("formula");
        assert_eq!(formula.name, "C");
        let terms = formula.formula.expect("terms").terms;
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].sign, 1.0);
        assert_eq!(terms[1].operand, "B");
    }

    #[test]
    fn range_references_expand_in_column_order() {
        let parsed = parse_reference("F=A..E").expect("range");
        let operands: Vec<String> = parsed
            .formula
            .expect("formula")
            .terms
            .into_iter()
            .map(|term| term.operand)
            .collect();
        assert_eq!(operands, ["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn multi_letter_operands_and_subtraction_parse() {
        let parsed = parse_reference("AC=AA-AB").expect("formula");
        let terms = parsed.formula.expect("formula").terms;
        assert_eq!(terms[0].operand, "AA");
        assert_eq!(terms[1].sign, -1.0);
        assert_eq!(terms[1].operand, "AB");
    }

    #[test]
    fn garbage_references_are_structural_violations() {
        assert!(parse_reference("C=A+").is_err());
        assert!(parse_reference("1=A+B").is_err());
        assert!(parse_reference("").is_err());
        assert!(parse_reference("C=A B").is_err());
    }

    #[test]
    fn tolerance_boundary_separates_pass_from_fail() {
        let config = QcConfig {
            formula_rel_tol: 0.01,
            formula_abs_floor: 1.0,
            ..QcConfig::default()
        };

        // 1% of 300 = 3: C=303 sits exactly on the band edge and passes.
        let passing = statement(vec![
            ("revenue", "A", vec![Some(100.0)]),
            ("other_income", "B", vec![Some(200.0)]),
            ("total_income", "C=A+B", vec![Some(303.0)]),
        ]);
        let outcome = validate(&passing, &config).expect("validate");
        assert_eq!(outcome.file_status, FileStatus::Pass);

        let failing = statement(vec![
            ("revenue", "A", vec![Some(100.0)]),
            ("other_income", "B", vec![Some(200.0)]),
            ("total_income", "C=A+B", vec![Some(304.0)]),
        ]);
        let outcome = validate(&failing, &config).expect("validate");
        assert_eq!(outcome.file_status, FileStatus::Fail);
        assert_eq!(outcome.failures[0].periods[0].expected, 300.0);
    }

    #[test]
    fn default_half_percent_band_passes_exact_sums() {
        let exact = statement(vec![
            ("revenue", "A", vec![Some(100.0)]),
            ("other_income", "B", vec![Some(200.0)]),
            ("total_income", "C=A+B", vec![Some(300.0)]),
        ]);
        let outcome = validate(&exact, &QcConfig::default()).expect("validate");
        assert_eq!(outcome.file_status, FileStatus::Pass);
        assert_eq!(outcome.formula_passed, 1);
    }

    #[test]
    fn missing_operand_is_incomplete_not_failed() {
        let incomplete = statement(vec![
            ("revenue", "A", vec![Some(100.0), Some(120.0)]),
            ("other_income", "B", vec![Some(200.0), None]),
            ("total_income", "C=A+B", vec![Some(300.0), Some(320.0)]),
        ]);
        let outcome = validate(&incomplete, &QcConfig::default()).expect("validate");
        assert_eq!(outcome.file_status, FileStatus::Incomplete);
        assert_eq!(outcome.formula_failed, 0);
        assert_eq!(outcome.incomplete_rows, 1);
    }

    #[test]
    fn parent_formula_consumes_subtotals_without_double_counting() {
        // D is a subtotal of A+B; the parent E sums D+C, not A+B+C+D.
        let nested = statement(vec![
            ("cash", "A", vec![Some(10.0)]),
            ("receivables", "B", vec![Some(20.0)]),
            ("current_assets", "D=A+B", vec![Some(30.0)]),
            ("fixed_assets", "C", vec![Some(70.0)]),
            ("total_assets", "E=D+C", vec![Some(100.0)]),
        ]);
        let outcome = validate(&nested, &QcConfig::default()).expect("validate");
        assert_eq!(outcome.file_status, FileStatus::Pass);
        assert_eq!(outcome.formula_passed, 2);
    }

    #[test]
    fn duplicate_references_abort_the_statement() {
        let duplicated = statement(vec![
            ("revenue", "A", vec![Some(100.0)]),
            ("other_income", "A", vec![Some(200.0)]),
        ]);
        assert!(validate(&duplicated, &QcConfig::default()).is_err());
    }
}
