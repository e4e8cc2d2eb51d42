use std::collections::BTreeMap;

use crate::config::{QcConfig, within_tolerance};
use crate::model::{CompiledRecord, DerivedQuarter, PeriodEntry, QcResult, QcStatus};
use crate::periods;
use crate::qc::units::{self, period_key};
use crate::registry::ExceptionRegistry;

/// Field names that can carry an entity's primary income line, by entity
/// class: trading companies, banks, insurers, modarabas, IPPs, leasing and
/// holding companies all label the top line differently.
pub const REVENUE_ALIASES: &[&str] = &[
    "revenue_net",
    "revenue_gross",
    "revenue",
    "net_interest_income",
    "interest_income",
    "net_premium",
    "gross_premium",
    "underwriting_profit",
    "dividend_income",
    "royalty_income",
    "total_income",
    "revenue_lease_financing",
    "revenue_diminishing_musharaka",
    "capacity_revenue",
    "energy_revenue",
    "turnover",
    "lease_income",
    "share_of_associates",
    "share_of_profit_in_associates",
    "other_income",
];

pub const BOTTOM_LINE_ALIASES: &[&str] = &["net_profit", "profit_after_tax", "net_profit_parent"];

/// Cumulative fields expected to grow with duration inside a fiscal year.
const MONOTONIC_FIELDS: &[&str] = &["revenue_net", "cost_of_goods_sold"];

const PL_CRITICAL: &[(&str, &[&str])] = &[
    ("revenue", REVENUE_ALIASES),
    ("bottom_line", BOTTOM_LINE_ALIASES),
];
const BS_CRITICAL: &[(&str, &[&str])] = &[
    ("total_assets", &["total_assets"]),
    (
        "equity_total",
        &["total_equity", "total_equity_and_liabilities"],
    ),
];
const CF_CRITICAL: &[(&str, &[&str])] = &[
    ("operating_cash_flow", &["cfo"]),
    ("cash_end", &["cash_end"]),
];

/// Balance-sheet equation variants in priority order; the first that
/// balances within tolerance wins.
const IDENTITY_VARIANTS: &[(&str, &[&str])] = &[
    ("stated_total", &["total_equity_and_liabilities"]),
    (
        "equity_plus_liabilities",
        &["total_equity", "total_liabilities"],
    ),
    (
        "equity_plus_liabilities_plus_minority",
        &["total_equity", "total_liabilities", "minority_interest"],
    ),
    (
        "equity_plus_liabilities_plus_surplus",
        &["total_equity", "total_liabilities", "surplus_on_revaluation"],
    ),
    (
        "equity_plus_liabilities_plus_minority_plus_surplus",
        &[
            "total_equity",
            "total_liabilities",
            "minority_interest",
            "surplus_on_revaluation",
        ],
    ),
];

/// Primary income field by entity class; the anomaly and period-sum checks
/// anchor on it.
pub fn income_field_for(industry: Option<&str>) -> &'static str {
    match industry {
        Some("Banking") => "net_interest_income",
        Some("Insurance") => "net_premium",
        _ => "revenue_net",
    }
}

/// Total taxation for the bottom-line identity. Two structures occur: a
/// plain `taxation` total (possibly alongside its components), and a
/// two-tier presentation where `taxation` holds only final taxes and the
/// income-tax components are separate.
pub fn taxation_total(values: &BTreeMap<String, f64>) -> Option<f64> {
    if let Some(total) = values.get("taxation_total") {
        return Some(*total);
    }

    let two_tier = values.contains_key("taxation_income_tax_total")
        || values.contains_key("profit_before_income_taxes");

    let component_keys: &[&str] = if two_tier {
        &[
            "taxation",
            "taxation_current",
            "taxation_deferred",
            "taxation_prior",
            "taxation_minimum",
        ]
    } else {
        if let Some(taxation) = values.get("taxation") {
            return Some(*taxation);
        }
        &[
            "taxation_current",
            "taxation_deferred",
            "taxation_prior",
            "taxation_minimum",
        ]
    };

    let mut total = 0.0;
    let mut found = false;
    for key in component_keys {
        if let Some(value) = values.get(*key) {
            total += value;
            found = true;
        }
    }
    found.then_some(total)
}

fn field_list(values: &BTreeMap<String, f64>, fields: &[&str]) -> Option<f64> {
    let mut sum = 0.0;
    for field in fields {
        sum += values.get(*field)?;
    }
    Some(sum)
}

fn check_critical_fields(ticker: &str, statement: &str, period: &PeriodEntry) -> Vec<QcResult> {
    let mut results = Vec::new();
    let groups: &[(&str, &[&str])] = match statement {
        "pl" => PL_CRITICAL,
        "bs" => BS_CRITICAL,
        "cf" => CF_CRITICAL,
        _ => &[],
    };

    for (group, aliases) in groups {
        let present = aliases.iter().any(|alias| period.values.contains_key(*alias));
        if !present {
            results.push(QcResult::new(
                ticker,
                period_key(period),
                "critical_fields",
                QcStatus::Fail,
                format!(
                    "missing {group} field in {}, need one of {aliases:?}",
                    period.source_filing
                ),
            ));
        }
    }
    results
}

/// Accounting identity with prioritized equation variants. The literal
/// identity misfires on legitimate structural variants (minority interest,
/// revaluation surplus presented outside equity), so the first variant
/// that balances within tolerance wins.
fn check_accounting_identity(
    ticker: &str,
    period: &PeriodEntry,
    config: &QcConfig,
) -> Vec<QcResult> {
    let values = &period.values;
    let Some(assets) = values.get("total_assets") else {
        return Vec::new();
    };

    let mut attempted = Vec::new();
    let mut balanced: Option<&str> = None;
    for (name, fields) in IDENTITY_VARIANTS {
        let Some(sum) = field_list(values, fields) else {
            continue;
        };
        if within_tolerance(sum, *assets, config.semantic_rel_tol, config.semantic_abs_floor) {
            balanced = Some(*name);
            break;
        }
        attempted.push((*name, sum));
    }

    let mut results = Vec::new();
    match balanced {
        Some(_) => {
            // The sheet balances; still verify the stated total agrees with
            // its own components, which catches a correct total over
            // misextracted components.
            if let (Some(stated), Some(components)) = (
                values.get("total_equity_and_liabilities"),
                field_list(values, &["total_equity", "total_liabilities"]),
            ) {
                let components_ok = within_tolerance(
                    components,
                    *stated,
                    config.semantic_rel_tol,
                    config.semantic_abs_floor,
                );
                let extended_ok = field_list(
                    values,
                    &["total_equity", "total_liabilities", "minority_interest"],
                )
                .map(|extended| {
                    within_tolerance(
                        extended,
                        *stated,
                        config.semantic_rel_tol,
                        config.semantic_abs_floor,
                    )
                })
                .unwrap_or(false);

                if !components_ok && !extended_ok {
                    results.push(
                        QcResult::new(
                            ticker,
                            period_key(period),
                            "accounting_identity",
                            QcStatus::Fail,
                            format!(
                                "stated total_equity_and_liabilities {stated:.0} does not match \
                                 total_equity + total_liabilities = {components:.0} in {}",
                                period.source_filing
                            ),
                        )
                        .with_discrepancy((components - stated).abs()),
                    );
                }
            }
        }
        None => {
            // No variant had all of its fields present: nothing to verify.
            let Some((closest_name, closest_sum)) = attempted
                .iter()
                .min_by(|a, b| (a.1 - assets).abs().total_cmp(&(b.1 - assets).abs()))
                .copied()
            else {
                return results;
            };
            results.push(
                QcResult::new(
                    ticker,
                    period_key(period),
                    "accounting_identity",
                    QcStatus::Fail,
                    format!(
                        "total_assets {assets:.0} does not balance against any equation \
                         variant; closest was {closest_name} = {closest_sum:.0} in {}",
                        period.source_filing
                    ),
                )
                .with_discrepancy((closest_sum - assets).abs()),
            );
        }
    }
    results
}

/// Bottom-line identity for income statements. Complex structures
/// (discontinued operations, associates recognized below the line) use the
/// continuing-operations variant, greedily admitting post-continuing items
/// only when they move the sum toward the reported total.
fn check_net_profit_identity(
    ticker: &str,
    period: &PeriodEntry,
    config: &QcConfig,
) -> Option<QcResult> {
    let values = &period.values;
    let net_profit = *values.get("net_profit")?;

    let (expected, equation) = if let Some(continuing) = values.get("net_profit_continuing") {
        let mut expected = *continuing;
        let mut parts = vec![format!("net_profit_continuing({continuing:.0})")];
        if let Some(discontinued) = values.get("net_profit_discontinued") {
            expected += discontinued;
            parts.push(format!("net_profit_discontinued({discontinued:.0})"));
        }
        for field in [
            "share_of_associates",
            "share_of_joint_ventures",
            "gain_on_disposal",
            "loss_on_disposal",
            "other_non_operating",
            "other_income",
        ] {
            if let Some(value) = values.get(field) {
                if (net_profit - (expected + value)).abs() < (net_profit - expected).abs() {
                    expected += value;
                    parts.push(format!("{field}({value:.0})"));
                }
            }
        }
        (expected, parts.join(" + "))
    } else {
        let pbt = *values.get("profit_before_tax")?;
        match taxation_total(values) {
            Some(taxation) => (
                pbt + taxation,
                format!("profit_before_tax({pbt:.0}) + taxation({taxation:.0})"),
            ),
            None => (pbt, format!("profit_before_tax({pbt:.0})")),
        }
    };

    if within_tolerance(net_profit, expected, config.semantic_rel_tol, config.semantic_abs_floor) {
        return None;
    }

    let diff = (net_profit - expected).abs();
    let base = net_profit.abs().max(expected.abs()).max(1.0);
    let severity = if diff / base < 0.10 {
        QcStatus::Warn
    } else {
        QcStatus::Fail
    };
    Some(
        QcResult::new(
            ticker,
            period_key(period),
            "net_profit_identity",
            severity,
            format!(
                "net_profit {net_profit:.0} vs {equation} = {expected:.0} in {}",
                period.source_filing
            ),
        )
        .with_discrepancy(diff),
    )
}

/// Cumulative periods of one fiscal year must be non-decreasing in
/// magnitude as duration grows. Skipped wholesale for entities registered
/// as discrete-quarter reporters.
fn check_monotonicity(
    ticker: &str,
    periods_in: &[&PeriodEntry],
    fy_end_month: u32,
    results: &mut Vec<QcResult>,
) {
    let mut scopes: Vec<&str> = periods_in
        .iter()
        .map(|period| period.consolidation.as_str())
        .collect();
    scopes.sort_unstable();
    scopes.dedup();

    for scope in scopes {
        let mut by_fiscal_year: BTreeMap<i32, Vec<&PeriodEntry>> = BTreeMap::new();
        for period in periods_in
            .iter()
            .copied()
            .filter(|period| period.consolidation == scope)
        {
            let Ok((_, month)) = periods::parse_year_month(&period.period_end) else {
                continue;
            };
            // Only periods on the fiscal cadence form a cumulative series.
            let mut expected_month = (fy_end_month + period.duration_months) % 12;
            if expected_month == 0 {
                expected_month = 12;
            }
            let on_cadence = month == expected_month
                || (period.duration_months == 12 && month == fy_end_month);
            if !on_cadence {
                continue;
            }
            if let Ok(fiscal_year) =
                periods::fiscal_year_for(&period.period_end, period.duration_months, fy_end_month)
            {
                by_fiscal_year.entry(fiscal_year).or_default().push(period);
            }
        }

        for (fiscal_year, mut series) in by_fiscal_year {
            series.sort_by_key(|period| period.duration_months);
            series.dedup_by_key(|period| period.duration_months);
            if series.len() < 2 {
                continue;
            }

            for field in MONOTONIC_FIELDS {
                let values: Vec<(&PeriodEntry, f64)> = series
                    .iter()
                    .filter_map(|period| {
                        period.values.get(*field).map(|value| (*period, *value))
                    })
                    .collect();

                for pair in values.windows(2) {
                    let (shorter, shorter_value) = pair[0];
                    let (longer, longer_value) = pair[1];
                    // Loss-making periods do not follow the cumulative
                    // pattern.
                    if shorter_value < 0.0 || longer_value < 0.0 {
                        continue;
                    }
                    if longer_value < shorter_value {
                        results.push(
                            QcResult::new(
                                ticker,
                                format!("FY{fiscal_year}_{scope}"),
                                "monotonicity",
                                QcStatus::Fail,
                                format!(
                                    "{field}: {}M ({longer_value:.0}) < {}M ({shorter_value:.0}) \
                                     in FY{fiscal_year}, cumulative values should not shrink \
                                     ({} vs {})",
                                    longer.duration_months,
                                    shorter.duration_months,
                                    longer.source_filing,
                                    shorter.source_filing
                                ),
                            )
                            .with_discrepancy(shorter_value - longer_value),
                        );
                    }
                }
            }
        }
    }
}

/// Sum of four standalone quarters against the annual period, on the
/// anchor fields least likely to suffer field-collision noise. Tolerance is
/// loose: legitimate restatements land between quarterly and annual
/// filings.
pub fn check_period_sum(
    ticker: &str,
    quarters: &[&DerivedQuarter],
    annual: &PeriodEntry,
    income_field: &str,
    config: &QcConfig,
) -> Vec<QcResult> {
    let mut results = Vec::new();
    if quarters.len() != 4 {
        return results;
    }

    let fiscal_year = quarters[0].fiscal_year;
    let scope = &quarters[0].consolidation;
    for field in [income_field, "gross_profit", "net_profit"] {
        let Some(annual_value) = annual.values.get(field) else {
            continue;
        };
        let mut sum = 0.0;
        let mut complete = true;
        for quarter in quarters {
            match quarter.values.get(field) {
                Some(value) => sum += value,
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if !complete {
            continue;
        }

        if !within_tolerance(sum, *annual_value, config.period_sum_rel_tol, config.semantic_abs_floor)
        {
            results.push(
                QcResult::new(
                    ticker,
                    format!("FY{fiscal_year}_{scope}"),
                    "period_sum",
                    QcStatus::Fail,
                    format!(
                        "{field}: Q1+Q2+Q3+Q4 = {sum:.0} vs annual {annual_value:.0} in {}",
                        annual.source_filing
                    ),
                )
                .with_discrepancy((sum - annual_value).abs()),
            );
        }
    }
    results
}

/// Runs every Layer 2 check over one compiled record. The skip tier of the
/// registry excludes (entity, filing) pairs from individual check
/// categories before they run; the allowlist tier annotates whatever was
/// produced.
pub fn run_checks(
    record: &CompiledRecord,
    registry: &ExceptionRegistry,
    config: &QcConfig,
) -> Vec<QcResult> {
    let ticker = record.ticker.as_str();
    let mut results = Vec::new();

    let surviving = |check: &str| -> Vec<&PeriodEntry> {
        record
            .periods
            .iter()
            .filter(|period| {
                registry
                    .skip_reason(ticker, &period.source_filing, check)
                    .is_none()
            })
            .collect()
    };

    for period in surviving("critical_fields") {
        results.extend(check_critical_fields(ticker, &record.statement, period));
    }

    if record.statement == "bs" {
        for period in surviving("accounting_identity") {
            results.extend(check_accounting_identity(ticker, period, config));
        }
    }

    if record.statement == "pl" {
        for period in surviving("net_profit_identity") {
            results.extend(check_net_profit_identity(ticker, period, config));
        }
    }

    if !registry.skips_monotonicity(ticker) {
        check_monotonicity(
            ticker,
            &surviving("monotonicity"),
            record.fiscal_year_end_month,
            &mut results,
        );
    }

    results.extend(units::check_unit_types(ticker, &surviving("unit_type")));
    results.extend(units::detect_outliers(
        ticker,
        &surviving("unit_outlier"),
        config,
    ));

    for result in &mut results {
        registry.annotate(result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PeriodOrigin;
    use crate::registry::SkipEntry;
    use crate::util::now_utc_string;

    fn period(
        end: &str,
        duration: u32,
        filing: &str,
        values: Vec<(&str, f64)>,
    ) -> PeriodEntry {
        PeriodEntry {
            period_end: end.into(),
            duration_months: duration,
            consolidation: "consolidated".into(),
            unit_type: "thousands".into(),
            source_filing: filing.into(),
            origin: PeriodOrigin::Primary,
            values: values
                .into_iter()
                .map(|(field, value)| (field.to_string(), value))
                .collect(),
            restated: BTreeMap::new(),
        }
    }

    fn record(statement: &str, fy_month: u32, periods: Vec<PeriodEntry>) -> CompiledRecord {
        CompiledRecord {
            ticker: "LUCK".into(),
            statement: statement.into(),
            fiscal_year_end_month: fy_month,
            compiled_at: now_utc_string(),
            periods,
        }
    }

    #[test]
    fn strict_identity_failure_recovers_through_minority_interest_variant() {
        let balanced = record(
            "bs",
            12,
            vec![period(
                "2024-12-31",
                12,
                "annual_2024",
                vec![
                    ("total_assets", 1000.0),
                    ("total_equity", 600.0),
                    ("total_liabilities", 500.0),
                    ("minority_interest", -100.0),
                ],
            )],
        );
        let results = run_checks(&balanced, &ExceptionRegistry::empty(), &QcConfig::default());
        assert!(
            !results
                .iter()
                .any(|result| result.check == "accounting_identity"),
            "extended variant should balance: {results:?}"
        );
    }

    #[test]
    fn unbalanced_sheet_fails_with_the_closest_variant_reported() {
        let unbalanced = record(
            "bs",
            12,
            vec![period(
                "2024-12-31",
                12,
                "annual_2024",
                vec![
                    ("total_assets", 1000.0),
                    ("total_equity", 600.0),
                    ("total_liabilities", 500.0),
                ],
            )],
        );
        let results = run_checks(&unbalanced, &ExceptionRegistry::empty(), &QcConfig::default());
        let failure = results
            .iter()
            .find(|result| result.check == "accounting_identity")
            .expect("identity failure");
        assert_eq!(failure.status, QcStatus::Fail);
        assert_eq!(failure.discrepancy, Some(100.0));
    }

    #[test]
    fn net_profit_identity_uses_taxation_total() {
        let off = record(
            "pl",
            12,
            vec![period(
                "2024-12-31",
                12,
                "annual_2024",
                vec![
                    ("net_profit", 500.0),
                    ("profit_before_tax", 700.0),
                    ("taxation", -150.0),
                ],
            )],
        );
        let results = run_checks(&off, &ExceptionRegistry::empty(), &QcConfig::default());
        let failure = results
            .iter()
            .find(|result| result.check == "net_profit_identity")
            .expect("identity result");
        assert_eq!(failure.discrepancy, Some(50.0));

        let exact = record(
            "pl",
            12,
            vec![period(
                "2024-12-31",
                12,
                "annual_2024",
                vec![
                    ("net_profit", 550.0),
                    ("profit_before_tax", 700.0),
                    ("taxation", -150.0),
                ],
            )],
        );
        let results = run_checks(&exact, &ExceptionRegistry::empty(), &QcConfig::default());
        assert!(
            !results
                .iter()
                .any(|result| result.check == "net_profit_identity")
        );
    }

    #[test]
    fn two_tier_taxation_sums_its_components() {
        let mut values = BTreeMap::new();
        values.insert("taxation".to_string(), -50.0);
        values.insert("taxation_current".to_string(), -80.0);
        values.insert("taxation_deferred".to_string(), 10.0);
        values.insert("taxation_income_tax_total".to_string(), -70.0);
        assert_eq!(taxation_total(&values), Some(-120.0));

        let mut plain = BTreeMap::new();
        plain.insert("taxation".to_string(), -50.0);
        plain.insert("taxation_current".to_string(), -80.0);
        assert_eq!(taxation_total(&plain), Some(-50.0));
    }

    #[test]
    fn cumulative_decrease_fails_monotonicity() {
        // June year-end: 3M ends Sep, 6M ends Dec.
        let shrinking = record(
            "pl",
            6,
            vec![
                period(
                    "2023-09-30",
                    3,
                    "quarterly_2023-09-30",
                    vec![("revenue_net", 100.0)],
                ),
                period(
                    "2023-12-31",
                    6,
                    "quarterly_2023-12-31",
                    vec![("revenue_net", 90.0)],
                ),
            ],
        );
        let results = run_checks(&shrinking, &ExceptionRegistry::empty(), &QcConfig::default());
        let failure = results
            .iter()
            .find(|result| result.check == "monotonicity")
            .expect("monotonicity failure");
        assert_eq!(failure.status, QcStatus::Fail);
        assert_eq!(failure.subject, "FY2024_consolidated");
    }

    #[test]
    fn discrete_quarter_reporters_skip_monotonicity_entirely() {
        let registry = ExceptionRegistry::from_entries(
            vec![SkipEntry {
                ticker: "LUCK".into(),
                filing: "*".into(),
                check: "monotonicity".into(),
                reason: "reports discrete quarters".into(),
            }],
            vec![],
        );
        let shrinking = record(
            "pl",
            6,
            vec![
                period(
                    "2023-09-30",
                    3,
                    "quarterly_2023-09-30",
                    vec![("revenue_net", 100.0)],
                ),
                period(
                    "2023-12-31",
                    6,
                    "quarterly_2023-12-31",
                    vec![("revenue_net", 90.0)],
                ),
            ],
        );
        let results = run_checks(&shrinking, &registry, &QcConfig::default());
        assert!(
            !results.iter().any(|result| result.check == "monotonicity"),
            "no monotonicity result should be emitted at all"
        );
    }

    #[test]
    fn negative_cumulative_values_are_not_monotonicity_failures() {
        let lossmaking = record(
            "pl",
            6,
            vec![
                period(
                    "2023-09-30",
                    3,
                    "quarterly_2023-09-30",
                    vec![("revenue_net", -10.0)],
                ),
                period(
                    "2023-12-31",
                    6,
                    "quarterly_2023-12-31",
                    vec![("revenue_net", -40.0)],
                ),
            ],
        );
        let results = run_checks(&lossmaking, &ExceptionRegistry::empty(), &QcConfig::default());
        assert!(!results.iter().any(|result| result.check == "monotonicity"));
    }

    #[test]
    fn missing_revenue_alias_fails_critical_fields_and_any_alias_passes() {
        let bank = record(
            "pl",
            12,
            vec![period(
                "2024-12-31",
                12,
                "annual_2024",
                vec![("net_interest_income", 900.0), ("net_profit", 200.0)],
            )],
        );
        let results = run_checks(&bank, &ExceptionRegistry::empty(), &QcConfig::default());
        assert!(
            !results
                .iter()
                .any(|result| result.check == "critical_fields")
        );

        let empty = record(
            "pl",
            12,
            vec![period(
                "2024-12-31",
                12,
                "annual_2024",
                vec![("cost_of_goods_sold", -500.0)],
            )],
        );
        let results = run_checks(&empty, &ExceptionRegistry::empty(), &QcConfig::default());
        assert_eq!(
            results
                .iter()
                .filter(|result| result.check == "critical_fields")
                .count(),
            2
        );
    }

    #[test]
    fn skip_tier_excludes_a_filing_from_one_check_only() {
        let registry = ExceptionRegistry::from_entries(
            vec![SkipEntry {
                ticker: "LUCK".into(),
                filing: "annual_2024".into(),
                check: "critical_fields".into(),
                reason: "ocr corruption under review".into(),
            }],
            vec![],
        );
        let empty = record(
            "pl",
            12,
            vec![period("2024-12-31", 12, "annual_2024", vec![])],
        );
        let results = run_checks(&empty, &registry, &QcConfig::default());
        assert!(
            !results
                .iter()
                .any(|result| result.check == "critical_fields")
        );
    }

    #[test]
    fn allowlist_annotates_identity_failures_without_suppressing() {
        let registry = ExceptionRegistry::from_entries(
            vec![],
            vec![crate::registry::AllowlistEntry {
                ticker: "LUCK".into(),
                subject: "2024-12-31".into(),
                check: "accounting_identity".into(),
                reason: "reviewed: revaluation presented outside equity".into(),
            }],
        );
        let unbalanced = record(
            "bs",
            12,
            vec![period(
                "2024-12-31",
                12,
                "annual_2024",
                vec![
                    ("total_assets", 1000.0),
                    ("total_equity", 600.0),
                    ("total_liabilities", 500.0),
                ],
            )],
        );
        let results = run_checks(&unbalanced, &registry, &QcConfig::default());
        let failure = results
            .iter()
            .find(|result| result.check == "accounting_identity")
            .expect("failure still produced");
        assert_eq!(failure.status, QcStatus::Fail);
        assert_eq!(
            failure.allowlisted.as_deref(),
            Some("reviewed: revaluation presented outside equity")
        );
    }

    #[test]
    fn quarter_sum_within_tolerance_passes_and_large_gaps_fail() {
        let annual = period(
            "2024-06-30",
            12,
            "annual_2024",
            vec![("revenue_net", 1000.0)],
        );
        let quarter = |number: u32, value: f64| DerivedQuarter {
            quarter: number,
            period_end: periods::quarter_end_date(6, 2024, number),
            fiscal_year: 2024,
            consolidation: "consolidated".into(),
            method: crate::model::DerivationMethod::Direct3M,
            sources: vec![],
            values: [("revenue_net".to_string(), value)].into_iter().collect(),
        };

        let close = [
            quarter(1, 250.0),
            quarter(2, 250.0),
            quarter(3, 260.0),
            quarter(4, 250.0),
        ];
        let refs: Vec<&DerivedQuarter> = close.iter().collect();
        let results =
            check_period_sum("LUCK", &refs, &annual, "revenue_net", &QcConfig::default());
        assert!(results.is_empty(), "2% off should pass: {results:?}");

        let wide = [
            quarter(1, 250.0),
            quarter(2, 250.0),
            quarter(3, 400.0),
            quarter(4, 250.0),
        ];
        let refs: Vec<&DerivedQuarter> = wide.iter().collect();
        let results =
            check_period_sum("LUCK", &refs, &annual, "revenue_net", &QcConfig::default());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].check, "period_sum");
    }
}
