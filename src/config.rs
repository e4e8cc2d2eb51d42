use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::util::read_json;

/// Tunable QC thresholds. Every constant here is an empirically chosen
/// business threshold, not a derived quantity; deployments override them via
/// `<cache-root>/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// Relative tolerance for intra-statement formula checks (Layer 1).
    pub formula_rel_tol: f64,
    /// Absolute floor for formula checks, so near-zero rows don't fail on
    /// rounding noise.
    pub formula_abs_floor: f64,
    /// Relative tolerance for cross-statement semantic checks (Layer 2);
    /// looser than Layer 1 because it absorbs compounding rounding across
    /// source rows.
    pub semantic_rel_tol: f64,
    /// Absolute floor for semantic checks.
    pub semantic_abs_floor: f64,
    /// Relative tolerance for quarter-sum-vs-annual arithmetic.
    pub period_sum_rel_tol: f64,
    /// Source match ratio at or above which a file passes outright.
    pub source_match_pass: f64,
    /// Source match ratio at or above which a file is only warned about;
    /// below this it fails. Subtotals and per-share figures never appear
    /// verbatim in source text, hence the band.
    pub source_match_warn: f64,
    /// Ratio against the per-entity median beyond which a period value is
    /// flagged as a probable unit-declaration error.
    pub outlier_ratio: f64,
    /// Minimum non-zero samples required before the outlier median is
    /// considered meaningful.
    pub outlier_min_samples: usize,
    /// Differences within this band between a standalone value and a later
    /// filing's comparative column are treated as normal restatements.
    pub restatement_tol: f64,
    /// Persist the checkpoint every N recorded outcomes.
    pub checkpoint_save_interval: usize,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            formula_rel_tol: 0.005,
            formula_abs_floor: 1.0,
            semantic_rel_tol: 0.05,
            semantic_abs_floor: 1.0,
            period_sum_rel_tol: 0.05,
            source_match_pass: 0.97,
            source_match_warn: 0.80,
            outlier_ratio: 100.0,
            outlier_min_samples: 3,
            restatement_tol: 0.10,
            checkpoint_save_interval: 100,
        }
    }
}

impl QcConfig {
    pub fn load(cache_root: &Path) -> Result<Self> {
        let path = cache_root.join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }

        let config: Self = read_json(&path)?;
        info!(path = %path.display(), "loaded qc config overrides");
        Ok(config)
    }
}

/// `|actual − expected| ≤ max(rel × |expected|, floor)`, boundary inclusive.
pub fn within_tolerance(actual: f64, expected: f64, rel_tol: f64, abs_floor: f64) -> bool {
    let band = (rel_tol * expected.abs()).max(abs_floor);
    (actual - expected).abs() <= band
}
