use crate::config::QcConfig;
use crate::model::{PeriodEntry, QcResult, QcStatus};

pub const VALID_UNITS: &[&str] = &["thousands", "millions", "rupees", "full_rupees"];

/// Fields the cross-period outlier scan anchors on, in preference order.
/// Later entries cover banks, insurers, and balance sheets.
const OUTLIER_REF_FIELDS: &[&str] = &[
    "revenue_net",
    "net_profit",
    "gross_profit",
    "net_interest_income",
    "net_premium",
    "total_assets",
];

/// Per-share figures are reported in currency units per share and are never
/// rescaled with the rest of the statement.
pub fn is_per_share(canonical: &str) -> bool {
    let lower = canonical.to_ascii_lowercase();
    lower.contains("eps") || lower.contains("per_share")
}

/// Multiplier taking a declared-unit value onto the canonical thousands
/// scale. Unknown declarations are assumed to already be thousands.
pub fn to_thousands_multiplier(unit_type: &str) -> f64 {
    let unit = unit_type.trim().to_ascii_lowercase();
    if unit == "rupees" || unit == "rupee" || unit == "full_rupees" {
        0.001
    } else if unit == "millions" {
        1000.0
    } else {
        1.0
    }
}

/// Multiplier taking a declared-unit value onto the absolute currency
/// scale, as printed in source documents.
pub fn full_scale_multiplier(unit_type: &str) -> f64 {
    let unit = unit_type.trim().to_ascii_lowercase();
    if unit == "millions" {
        1_000_000.0
    } else if unit == "rupees" || unit == "rupee" || unit == "full_rupees" {
        1.0
    } else {
        1000.0
    }
}

pub fn normalize_value(value: f64, unit_type: &str, canonical: &str) -> f64 {
    if is_per_share(canonical) {
        return value;
    }
    value * to_thousands_multiplier(unit_type)
}

pub fn check_unit_types(ticker: &str, periods: &[&PeriodEntry]) -> Vec<QcResult> {
    let mut results = Vec::new();
    for period in periods {
        let unit = period.unit_type.trim().to_ascii_lowercase();
        if unit.is_empty() {
            results.push(QcResult::new(
                ticker,
                period_key(period),
                "unit_type",
                QcStatus::Fail,
                format!("missing unit declaration in {}", period.source_filing),
            ));
        } else if !VALID_UNITS.contains(&unit.as_str()) {
            results.push(QcResult::new(
                ticker,
                period_key(period),
                "unit_type",
                QcStatus::Fail,
                format!(
                    "invalid unit declaration '{unit}' in {}, expected one of {VALID_UNITS:?}",
                    period.source_filing
                ),
            ));
        }
    }
    results
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn period_key(period: &PeriodEntry) -> String {
    format!(
        "{}_{}M_{}",
        period.period_end, period.duration_months, period.consolidation
    )
}

/// Flags periods whose anchor-field magnitude sits far outside the
/// entity's median, the signature of a wrong unit declaration. Detection
/// only: values are never rescaled here, because legitimate volatility
/// (holding companies, wind-downs) can mimic a unit error.
pub fn detect_outliers(ticker: &str, periods: &[&PeriodEntry], config: &QcConfig) -> Vec<QcResult> {
    let mut results = Vec::new();

    let mut scopes: Vec<&str> = periods
        .iter()
        .map(|period| period.consolidation.as_str())
        .collect();
    scopes.sort_unstable();
    scopes.dedup();

    for scope in scopes {
        let scoped: Vec<&PeriodEntry> = periods
            .iter()
            .copied()
            .filter(|period| period.consolidation == scope)
            .collect();

        let Some(ref_field) = OUTLIER_REF_FIELDS.iter().find(|field| {
            scoped
                .iter()
                .filter(|period| {
                    period
                        .values
                        .get(**field)
                        .is_some_and(|value| *value != 0.0)
                })
                .count()
                >= config.outlier_min_samples
        }) else {
            continue;
        };

        let mut samples: Vec<(&PeriodEntry, f64)> = scoped
            .iter()
            .filter_map(|period| {
                period
                    .values
                    .get(*ref_field)
                    .filter(|value| **value != 0.0)
                    .map(|value| (*period, value.abs()))
            })
            .collect();
        if samples.len() < config.outlier_min_samples {
            continue;
        }

        let mut magnitudes: Vec<f64> = samples.iter().map(|(_, value)| *value).collect();
        magnitudes.sort_by(|a, b| a.total_cmp(b));
        let median = median(&magnitudes);
        if median == 0.0 {
            continue;
        }

        samples.sort_by(|a, b| a.0.period_end.cmp(&b.0.period_end));
        for (period, magnitude) in samples {
            let ratio = magnitude / median;
            if ratio > config.outlier_ratio || ratio < 1.0 / config.outlier_ratio {
                results.push(
                    QcResult::new(
                        ticker,
                        period_key(period),
                        "unit_outlier",
                        QcStatus::Fail,
                        format!(
                            "{ref_field}={magnitude:.0} is {ratio:.0}x the median ({median:.0}) \
                             across {scope} periods, probable unit declaration error in {}",
                            period.source_filing
                        ),
                    )
                    .with_discrepancy(ratio),
                );
            }
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PeriodOrigin;
    use std::collections::BTreeMap;

    fn period(end: &str, value: f64) -> PeriodEntry {
        let mut values = BTreeMap::new();
        values.insert("revenue_net".to_string(), value);
        PeriodEntry {
            period_end: end.into(),
            duration_months: 3,
            consolidation: "consolidated".into(),
            unit_type: "thousands".into(),
            source_filing: format!("quarterly_{end}"),
            origin: PeriodOrigin::Primary,
            values,
            restated: BTreeMap::new(),
        }
    }

    #[test]
    fn declared_units_map_onto_the_canonical_scale() {
        assert_eq!(normalize_value(5.0, "millions", "revenue_net"), 5000.0);
        assert_eq!(normalize_value(5000.0, "rupees", "revenue_net"), 5.0);
        assert_eq!(normalize_value(5.0, "thousands", "revenue_net"), 5.0);
        assert_eq!(normalize_value(5.0, "unknown", "revenue_net"), 5.0);
        assert_eq!(normalize_value(12.5, "millions", "eps_basic"), 12.5);
    }

    #[test]
    fn hundredfold_outlier_is_flagged_and_peers_are_not() {
        // Median of the series is 105; the last value sits two orders of
        // magnitude above it.
        let periods: Vec<PeriodEntry> = [100.0, 105.0, 98.0, 110.0, 11000.0]
            .iter()
            .enumerate()
            .map(|(index, value)| period(&format!("2024-0{}-28", index + 1), *value))
            .collect();
        let refs: Vec<&PeriodEntry> = periods.iter().collect();

        let results = detect_outliers("LUCK", &refs, &QcConfig::default());
        assert_eq!(results.len(), 1);
        assert!(results[0].subject.starts_with("2024-05-28"));
        assert_eq!(results[0].status, QcStatus::Fail);
        assert!(results[0].diagnosis.contains("probable unit declaration"));
    }

    #[test]
    fn values_inside_the_ratio_band_are_not_flagged() {
        let periods: Vec<PeriodEntry> = [100.0, 105.0, 98.0, 110.0, 10200.0]
            .iter()
            .enumerate()
            .map(|(index, value)| period(&format!("2024-0{}-28", index + 1), *value))
            .collect();
        let refs: Vec<&PeriodEntry> = periods.iter().collect();

        // 10200 against a median of 105 is a 97x ratio, just inside the
        // default 100x band; a tighter configured band flags it.
        assert!(detect_outliers("LUCK", &refs, &QcConfig::default()).is_empty());

        let tighter = QcConfig {
            outlier_ratio: 90.0,
            ..QcConfig::default()
        };
        let results = detect_outliers("LUCK", &refs, &tighter);
        assert_eq!(results.len(), 1);
        assert!(results[0].subject.starts_with("2024-05-28"));
    }

    #[test]
    fn too_few_samples_produce_no_outlier_flags() {
        let periods = vec![period("2024-03-31", 100.0), period("2024-06-30", 10200.0)];
        let refs: Vec<&PeriodEntry> = periods.iter().collect();
        assert!(detect_outliers("LUCK", &refs, &QcConfig::default()).is_empty());
    }

    #[test]
    fn invalid_unit_declarations_fail_validation() {
        let mut bad = period("2024-03-31", 100.0);
        bad.unit_type = "lakhs".into();
        let results = check_unit_types("LUCK", &[&bad]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].check, "unit_type");
        assert_eq!(results[0].status, QcStatus::Fail);
    }
}
