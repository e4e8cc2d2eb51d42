use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One extracted statement as produced by the upstream extraction stage:
/// one entity, one filing, one statement type, one consolidation scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedStatement {
    pub ticker: String,
    /// Filing identifier, e.g. `annual_2024` or `quarterly_2024-03-31`.
    pub filing: String,
    /// Statement type: `pl`, `bs`, or `cf`.
    pub statement: String,
    /// `consolidated` or `unconsolidated`.
    pub consolidation: String,
    /// Declared unit scale: `thousands`, `millions`, `rupees`, `full_rupees`.
    pub unit_type: String,
    /// Source page numbers within the filing the statement was read from.
    #[serde(default)]
    pub source_pages: Vec<u32>,
    /// Reporting period columns, first column is the filing's own period.
    pub columns: Vec<PeriodColumn>,
    pub rows: Vec<StatementRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodColumn {
    /// Period end date, `YYYY-MM-DD`.
    pub period_end: String,
    pub duration_months: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementRow {
    /// Verbatim line label from the source document.
    pub source_label: String,
    /// Normalized field name, e.g. `revenue_net`.
    pub canonical: String,
    /// Operand reference, plain (`A`) or a formula (`C=A+B`, `F=A..E`).
    pub reference: String,
    /// One value per period column; `null` where the cell was empty.
    pub values: Vec<Option<f64>>,
}

/// Whether a period entry came from a filing's own reporting column or from
/// a comparative (prior-period) column of a later filing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodOrigin {
    Primary,
    Comparative,
}

/// A value displaced during merge by the source-selection rule, kept for
/// audit alongside the winning value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestatedValue {
    pub value: f64,
    pub source_filing: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodEntry {
    pub period_end: String,
    pub duration_months: u32,
    pub consolidation: String,
    pub unit_type: String,
    pub source_filing: String,
    pub origin: PeriodOrigin,
    pub values: BTreeMap<String, f64>,
    /// Conflicting values superseded by the source-selection rule.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub restated: BTreeMap<String, RestatedValue>,
}

/// The merged per-entity view across all filings of one statement type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledRecord {
    pub ticker: String,
    pub statement: String,
    pub fiscal_year_end_month: u32,
    pub compiled_at: String,
    pub periods: Vec<PeriodEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerivationMethod {
    #[serde(rename = "direct_3M")]
    Direct3M,
    #[serde(rename = "12M-9M")]
    TwelveMinusNine,
    #[serde(rename = "9M-6M")]
    NineMinusSix,
    #[serde(rename = "6M-Q1")]
    SixMinusQ1,
    #[serde(rename = "9M-Q1-Q3")]
    NineMinusQ1Q3,
    #[serde(rename = "9M-Q1-Q2")]
    NineMinusQ1Q2,
    #[serde(rename = "12M-Q1-Q2-Q3")]
    TwelveMinusQ1Q2Q3,
    #[serde(rename = "12M-6M-Q3")]
    TwelveMinusSixQ3,
    #[serde(rename = "cross_validated")]
    CrossValidated,
}

impl DerivationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct3M => "direct_3M",
            Self::TwelveMinusNine => "12M-9M",
            Self::NineMinusSix => "9M-6M",
            Self::SixMinusQ1 => "6M-Q1",
            Self::NineMinusQ1Q3 => "9M-Q1-Q3",
            Self::NineMinusQ1Q2 => "9M-Q1-Q2",
            Self::TwelveMinusQ1Q2Q3 => "12M-Q1-Q2-Q3",
            Self::TwelveMinusSixQ3 => "12M-6M-Q3",
            Self::CrossValidated => "cross_validated",
        }
    }

    pub fn is_derived(self) -> bool {
        self != Self::Direct3M
    }
}

/// One standalone 3-month result with its derivation provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedQuarter {
    /// 1-based quarter within the fiscal year.
    pub quarter: u32,
    pub period_end: String,
    pub fiscal_year: i32,
    pub consolidation: String,
    pub method: DerivationMethod,
    /// Filing identifiers of the periods consumed by the derivation.
    pub sources: Vec<String>,
    /// Values on the canonical thousands scale.
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedQuarterSet {
    pub ticker: String,
    pub statement: String,
    pub fiscal_year_end_month: u32,
    pub generated_at: String,
    pub quarters: Vec<DerivedQuarter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QcStatus {
    Pass,
    Fail,
    Warn,
}

impl QcStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Warn => "warn",
        }
    }
}

/// One check outcome for one (entity, filing-or-period, check) key.
/// Append-only: a later run supersedes, never mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcResult {
    pub ticker: String,
    /// Filing id, period key, or fiscal-year key the check applies to.
    pub subject: String,
    pub check: String,
    pub status: QcStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discrepancy: Option<f64>,
    pub diagnosis: String,
    /// Documented-exception annotation; the raw outcome above is preserved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowlisted: Option<String>,
}

impl QcResult {
    pub fn new(
        ticker: impl Into<String>,
        subject: impl Into<String>,
        check: impl Into<String>,
        status: QcStatus,
        diagnosis: impl Into<String>,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            subject: subject.into(),
            check: check.into(),
            status,
            discrepancy: None,
            diagnosis: diagnosis.into(),
            allowlisted: None,
        }
    }

    pub fn with_discrepancy(mut self, discrepancy: f64) -> Self {
        self.discrepancy = Some(discrepancy);
        self
    }
}

/// Overall status for one validated extraction file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pass,
    Fail,
    Incomplete,
    Error,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Incomplete => "incomplete",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaPeriodFailure {
    /// 1-based period column index.
    pub column: usize,
    pub expected: f64,
    pub actual: f64,
    pub diff: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaFailure {
    pub reference: String,
    pub formula: String,
    pub canonical: String,
    pub periods: Vec<FormulaPeriodFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedValue {
    pub source_label: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMatchSummary {
    pub checked: usize,
    pub matched: usize,
    pub match_ratio: f64,
    pub status: QcStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmatched: Vec<UnmatchedValue>,
}

/// Layer 1 result for one extraction file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileQcResult {
    pub file: String,
    pub ticker: String,
    pub filing: String,
    pub consolidation: String,
    pub status: FileStatus,
    pub formula_total: usize,
    pub formula_passed: usize,
    pub formula_failed: usize,
    pub incomplete_rows: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formula_failures: Vec<FormulaFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_match: Option<SourceMatchSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowlisted: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Layer1Stats {
    pub files_total: usize,
    pub files_passed: usize,
    pub files_failed: usize,
    pub files_incomplete: usize,
    pub files_error: usize,
    pub files_skipped: usize,
    pub formula_total: usize,
    pub formula_passed: usize,
    pub formula_failed: usize,
    pub source_checked: usize,
    pub source_matched: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer1Report {
    pub manifest_version: u32,
    pub generated_at: String,
    pub statement: String,
    pub stats: Layer1Stats,
    pub files: Vec<FileQcResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QcReportStats {
    pub entities_total: usize,
    pub entities_clean: usize,
    pub entities_with_issues: usize,
    pub results_total: usize,
    pub failed: usize,
    pub warned: usize,
    pub allowlisted: usize,
    pub by_check: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcReport {
    pub manifest_version: u32,
    pub generated_at: String,
    pub stage: String,
    pub statement: String,
    pub stats: QcReportStats,
    pub results: Vec<QcResult>,
}

impl QcReport {
    pub fn new(stage: &str, statement: &str, results: Vec<QcResult>, entities_total: usize) -> Self {
        let mut stats = QcReportStats {
            entities_total,
            ..QcReportStats::default()
        };

        let mut dirty_entities = std::collections::BTreeSet::new();
        for result in &results {
            stats.results_total += 1;
            match result.status {
                QcStatus::Fail => stats.failed += 1,
                QcStatus::Warn => stats.warned += 1,
                QcStatus::Pass => {}
            }
            if result.allowlisted.is_some() {
                stats.allowlisted += 1;
            }
            if result.status != QcStatus::Pass {
                dirty_entities.insert(result.ticker.clone());
            }
            *stats.by_check.entry(result.check.clone()).or_insert(0) += 1;
        }
        stats.entities_with_issues = dirty_entities.len();
        stats.entities_clean = entities_total.saturating_sub(dirty_entities.len());

        Self {
            manifest_version: 1,
            generated_at: crate::util::now_utc_string(),
            stage: stage.to_string(),
            statement: statement.to_string(),
            stats,
            results,
        }
    }
}

/// Optional per-entity metadata supplied alongside the extraction data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityInfo {
    pub ticker: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub fiscal_year_end_month: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityManifest {
    #[serde(default)]
    pub entities: Vec<EntityInfo>,
}

impl EntityManifest {
    pub fn lookup(&self, ticker: &str) -> Option<&EntityInfo> {
        self.entities.iter().find(|entity| entity.ticker == ticker)
    }
}
