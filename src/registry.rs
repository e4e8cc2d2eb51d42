use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::QcResult;
use crate::util::read_json;

fn wildcard() -> String {
    "*".to_string()
}

/// Coarse tier: excludes a (ticker, filing) pair from one check category
/// before the check runs. `filing` and `check` accept `*` or a substring
/// of the filing identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipEntry {
    pub ticker: String,
    #[serde(default = "wildcard")]
    pub filing: String,
    #[serde(default = "wildcard")]
    pub check: String,
    pub reason: String,
}

/// Fine tier: annotates a QC result that was produced anyway. The check
/// still runs and its raw outcome is preserved for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub ticker: String,
    /// Period key, fiscal-year key, or filing id; `*` or substring match.
    #[serde(default = "wildcard")]
    pub subject: String,
    #[serde(default = "wildcard")]
    pub check: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SkipManifest {
    #[serde(default)]
    entries: Vec<SkipEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AllowlistManifest {
    #[serde(default)]
    entries: Vec<AllowlistEntry>,
}

fn pattern_matches(pattern: &str, subject: &str) -> bool {
    pattern == "*" || (!pattern.is_empty() && subject.contains(pattern))
}

/// Human-curated overrides, partitioned by statement type and injected into
/// the validators. Append-only on disk; nothing in the QC engine writes
/// entries, and no entry is ever inferred from magnitude heuristics.
#[derive(Debug, Clone, Default)]
pub struct ExceptionRegistry {
    skips: Vec<SkipEntry>,
    allowlist: Vec<AllowlistEntry>,
}

impl ExceptionRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(skips: Vec<SkipEntry>, allowlist: Vec<AllowlistEntry>) -> Self {
        Self { skips, allowlist }
    }

    /// Loads `<statement>_skips.json` and `<statement>_allowlist.json` from
    /// the exceptions directory; absent files mean empty tiers.
    pub fn load(dir: &Path, statement: &str) -> Result<Self> {
        let skip_path = dir.join(format!("{statement}_skips.json"));
        let allow_path = dir.join(format!("{statement}_allowlist.json"));

        let skips = if skip_path.exists() {
            let manifest: SkipManifest = read_json(&skip_path)?;
            manifest.entries
        } else {
            Vec::new()
        };

        let allowlist = if allow_path.exists() {
            let manifest: AllowlistManifest = read_json(&allow_path)?;
            manifest.entries
        } else {
            Vec::new()
        };

        if !skips.is_empty() || !allowlist.is_empty() {
            info!(
                statement,
                skips = skips.len(),
                allowlist = allowlist.len(),
                "loaded exception registry"
            );
        }

        Ok(Self { skips, allowlist })
    }

    pub fn skip_count(&self) -> usize {
        self.skips.len()
    }

    pub fn allowlist_count(&self) -> usize {
        self.allowlist.len()
    }

    pub fn skip_reason(&self, ticker: &str, filing: &str, check: &str) -> Option<&str> {
        self.skips
            .iter()
            .find(|entry| {
                entry.ticker == ticker
                    && pattern_matches(&entry.filing, filing)
                    && (entry.check == "*" || entry.check == check)
            })
            .map(|entry| entry.reason.as_str())
    }

    /// Entities registered as discrete-quarter reporters opt out of the
    /// cumulative monotonicity check entirely.
    pub fn skips_monotonicity(&self, ticker: &str) -> bool {
        self.skip_reason(ticker, "*", "monotonicity").is_some()
    }

    pub fn allowlist_reason(&self, ticker: &str, subject: &str, check: &str) -> Option<&str> {
        self.allowlist
            .iter()
            .find(|entry| {
                entry.ticker == ticker
                    && pattern_matches(&entry.subject, subject)
                    && (entry.check == "*" || entry.check == check)
            })
            .map(|entry| entry.reason.as_str())
    }

    /// Annotates, never suppresses: status and diagnosis stay intact.
    pub fn annotate(&self, result: &mut QcResult) {
        if let Some(reason) = self.allowlist_reason(&result.ticker, &result.subject, &result.check)
        {
            result.allowlisted = Some(reason.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QcStatus;

    fn registry() -> ExceptionRegistry {
        ExceptionRegistry::from_entries(
            vec![
                SkipEntry {
                    ticker: "EFERT".into(),
                    filing: "annual_2021".into(),
                    check: "*".into(),
                    reason: "ocr corruption, values shifted between rows".into(),
                },
                SkipEntry {
                    ticker: "AABS".into(),
                    filing: "*".into(),
                    check: "monotonicity".into(),
                    reason: "reports discrete quarters".into(),
                },
            ],
            vec![AllowlistEntry {
                ticker: "KAPCO".into(),
                subject: "2023".into(),
                check: "derivation_anomaly".into(),
                reason: "ipp operations ceased".into(),
            }],
        )
    }

    #[test]
    fn skip_matches_filing_substring_and_check_wildcard() {
        let registry = registry();
        assert!(
            registry
                .skip_reason("EFERT", "EFERT_annual_2021_consolidated", "monotonicity")
                .is_some()
        );
        assert!(
            registry
                .skip_reason("EFERT", "EFERT_annual_2022_consolidated", "monotonicity")
                .is_none()
        );
        assert!(registry.skip_reason("LUCK", "annual_2021", "*").is_none());
    }

    #[test]
    fn monotonicity_opt_out_matches_any_filing() {
        let registry = registry();
        assert!(registry.skips_monotonicity("AABS"));
        assert!(!registry.skips_monotonicity("EFERT"));
    }

    #[test]
    fn annotate_preserves_the_raw_outcome() {
        let registry = registry();
        let mut result = QcResult::new(
            "KAPCO",
            "2023-Q4",
            "derivation_anomaly",
            QcStatus::Warn,
            "negative revenue_net: -500",
        );
        registry.annotate(&mut result);

        assert_eq!(result.status, QcStatus::Warn);
        assert_eq!(result.diagnosis, "negative revenue_net: -500");
        assert_eq!(result.allowlisted.as_deref(), Some("ipp operations ceased"));
    }

    #[test]
    fn annotate_leaves_unlisted_results_untouched() {
        let registry = registry();
        let mut result = QcResult::new(
            "LUCK",
            "2023-Q4",
            "derivation_anomaly",
            QcStatus::Warn,
            "negative revenue_net: -500",
        );
        registry.annotate(&mut result);
        assert!(result.allowlisted.is_none());
    }

    #[test]
    fn missing_registry_files_load_as_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let registry = ExceptionRegistry::load(tmp.path(), "pl").expect("load");
        assert!(registry.skip_reason("ANY", "annual_2024", "*").is_none());
    }
}
