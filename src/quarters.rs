use std::collections::BTreeMap;

use tracing::debug;

use crate::config::QcConfig;
use crate::model::{
    CompiledRecord, DerivationMethod, DerivedQuarter, PeriodEntry, PeriodOrigin, QcResult,
    QcStatus,
};
use crate::periods::{self, quarter_end_date, quarter_number};
use crate::qc::semantic;

pub struct DeriveOutput {
    pub quarters: Vec<DerivedQuarter>,
    pub issues: Vec<QcResult>,
}

/// Values plus the period identifiers they came from, so every derived
/// quarter can name the exact inputs it consumed.
struct Operand<'a> {
    values: &'a BTreeMap<String, f64>,
    sources: Vec<String>,
}

impl<'a> Operand<'a> {
    fn from_period(period: &'a PeriodEntry) -> Self {
        Self {
            values: &period.values,
            sources: vec![period.source_filing.clone()],
        }
    }

    fn from_quarter(quarter: &'a DerivedQuarter) -> Self {
        Self {
            values: &quarter.values,
            sources: quarter.sources.clone(),
        }
    }
}

/// Field-wise base minus subtrahends. A field missing from any operand
/// yields no value for that field rather than a wrong one.
fn subtract(base: &Operand<'_>, subtrahends: &[&Operand<'_>]) -> BTreeMap<String, f64> {
    let mut derived = BTreeMap::new();
    'field: for (field, base_value) in base.values {
        let mut value = *base_value;
        for operand in subtrahends {
            match operand.values.get(field) {
                Some(subtrahend) => value -= subtrahend,
                None => continue 'field,
            }
        }
        derived.insert(field.clone(), value);
    }
    derived
}

fn combined_sources(base: &Operand<'_>, subtrahends: &[&Operand<'_>]) -> Vec<String> {
    let mut sources = base.sources.clone();
    for operand in subtrahends {
        for source in &operand.sources {
            if !sources.contains(source) {
                sources.push(source.clone());
            }
        }
    }
    sources
}

fn anomaly_issue(
    ticker: &str,
    quarter: &DerivedQuarter,
    income_field: &str,
) -> Option<QcResult> {
    let income = quarter.values.get(income_field)?;
    if *income >= 0.0 {
        return None;
    }
    Some(
        QcResult::new(
            ticker,
            format!(
                "FY{}_Q{}_{}",
                quarter.fiscal_year, quarter.quarter, quarter.consolidation
            ),
            "derivation_anomaly",
            QcStatus::Warn,
            format!(
                "negative {income_field} {income:.0} derived via {} from {:?}; kept, may \
                 reflect a restatement",
                quarter.method.as_str(),
                quarter.sources
            ),
        )
        .with_discrepancy(*income),
    )
}

/// Donor plausibility for the cross-validation fallback. A comparative
/// value that looks like a captured note reference or a 1000x unit slip is
/// rejected; anything within the restatement band is interchangeable.
fn donor_acceptable(donor_income: Option<f64>, derived_income: Option<f64>) -> bool {
    let Some(donor) = donor_income else {
        return true;
    };
    if donor < 0.0 {
        return false;
    }
    let Some(derived) = derived_income else {
        return true;
    };
    if derived <= 0.0 || donor == 0.0 {
        return true;
    }
    let ratio = (derived / donor).max(donor / derived);
    // Note-reference-sized donors and classic thousands/millions slips.
    if donor.abs() <= 50.0 && ratio > 1000.0 {
        return false;
    }
    if (500.0..=2000.0).contains(&ratio) {
        return false;
    }
    true
}

struct ScopeContext<'a> {
    ticker: &'a str,
    scope: &'a str,
    periods: Vec<&'a PeriodEntry>,
    fy_end_month: u32,
    income_field: &'a str,
}

impl<'a> ScopeContext<'a> {
    fn find(&self, period_end: &str, duration: u32, origin: Option<PeriodOrigin>) -> Option<&'a PeriodEntry> {
        self.periods
            .iter()
            .copied()
            .find(|period| {
                period.period_end == period_end
                    && period.duration_months == duration
                    && origin.is_none_or(|wanted| period.origin == wanted)
            })
    }

    fn direct_quarter(&self, number: u32, period_end: &str, fiscal_year: i32) -> Option<DerivedQuarter> {
        let period = self.find(period_end, 3, Some(PeriodOrigin::Primary))?;
        Some(DerivedQuarter {
            quarter: number,
            period_end: period_end.to_string(),
            fiscal_year,
            consolidation: self.scope.to_string(),
            method: DerivationMethod::Direct3M,
            sources: vec![period.source_filing.clone()],
            values: period.values.clone(),
        })
    }

    fn derived_quarter(
        &self,
        number: u32,
        period_end: &str,
        fiscal_year: i32,
        method: DerivationMethod,
        base: &Operand<'_>,
        subtrahends: &[&Operand<'_>],
    ) -> DerivedQuarter {
        DerivedQuarter {
            quarter: number,
            period_end: period_end.to_string(),
            fiscal_year,
            consolidation: self.scope.to_string(),
            method,
            sources: combined_sources(base, subtrahends),
            values: subtract(base, subtrahends),
        }
    }

    /// Comparative-column donor for the cross-validation fallback. Donors
    /// are extraction-origin entries only; a cross-validated quarter never
    /// becomes a donor itself, which caps provenance chains at depth one.
    fn cross_validated_quarter(
        &self,
        number: u32,
        period_end: &str,
        fiscal_year: i32,
        rejected: Option<&DerivedQuarter>,
    ) -> Option<DerivedQuarter> {
        let donor = self.find(period_end, 3, Some(PeriodOrigin::Comparative))?;
        let donor_income = donor.values.get(self.income_field).copied();
        let derived_income =
            rejected.and_then(|quarter| quarter.values.get(self.income_field).copied());
        if !donor_acceptable(donor_income, derived_income) {
            debug!(
                ticker = self.ticker,
                scope = self.scope,
                period_end,
                donor = %donor.source_filing,
                "rejected implausible comparative donor"
            );
            return None;
        }
        Some(DerivedQuarter {
            quarter: number,
            period_end: period_end.to_string(),
            fiscal_year,
            consolidation: self.scope.to_string(),
            method: DerivationMethod::CrossValidated,
            sources: vec![donor.source_filing.clone()],
            values: donor.values.clone(),
        })
    }
}

/// Derives all standalone quarters for one compiled record. Fiscal years
/// are processed in ascending period-end order so subtraction always
/// consumes already-finalized earlier quarters; the method priority is
/// direct extraction, then single-step cumulative differences, then
/// multi-quarter fallbacks, then comparative-column cross-validation.
pub fn derive_record(
    record: &CompiledRecord,
    income_field: &str,
    config: &QcConfig,
) -> DeriveOutput {
    let mut quarters = Vec::new();
    let mut issues = Vec::new();
    let fy_end_month = record.fiscal_year_end_month;

    let mut scopes: Vec<&str> = record
        .periods
        .iter()
        .map(|period| period.consolidation.as_str())
        .collect();
    scopes.sort_unstable();
    scopes.dedup();

    for scope in scopes {
        let context = ScopeContext {
            ticker: &record.ticker,
            scope,
            periods: record
                .periods
                .iter()
                .filter(|period| period.consolidation == scope)
                .collect(),
            fy_end_month,
            income_field,
        };

        let mut scope_quarters = Vec::new();
        derive_fiscal_years(&context, config, &mut scope_quarters, &mut issues);
        derive_orphans(&context, &mut scope_quarters);

        for quarter in &scope_quarters {
            if !quarter.method.is_derived() || quarter.method == DerivationMethod::CrossValidated {
                continue;
            }
            if let Some(issue) = anomaly_issue(&record.ticker, quarter, income_field) {
                issues.push(issue);
            }
        }
        quarters.extend(scope_quarters);
    }

    quarters.sort_by(|a, b| {
        a.consolidation
            .cmp(&b.consolidation)
            .then(a.fiscal_year.cmp(&b.fiscal_year))
            .then(a.quarter.cmp(&b.quarter))
    });

    DeriveOutput { quarters, issues }
}

fn derive_fiscal_years(
    context: &ScopeContext<'_>,
    config: &QcConfig,
    quarters: &mut Vec<DerivedQuarter>,
    issues: &mut Vec<QcResult>,
) {
    let mut annuals: Vec<&PeriodEntry> = context
        .periods
        .iter()
        .copied()
        .filter(|period| {
            period.duration_months == 12
                && periods::parse_year_month(&period.period_end)
                    .map(|(_, month)| month == context.fy_end_month)
                    .unwrap_or(false)
        })
        .collect();
    annuals.sort_by(|a, b| a.period_end.cmp(&b.period_end));

    for annual in annuals {
        let Ok((fiscal_year, _)) = periods::parse_year_month(&annual.period_end) else {
            continue;
        };
        let ends: Vec<String> = (1..=4)
            .map(|quarter| quarter_end_date(context.fy_end_month, fiscal_year, quarter))
            .collect();

        let p6 = context.find(&ends[1], 6, None);
        let p9 = context.find(&ends[2], 9, None);
        let annual_operand = Operand::from_period(annual);

        // Q1 has no subtraction path; it is either extracted or absent.
        let mut q1 = context.direct_quarter(1, &ends[0], fiscal_year);
        let mut q2 = context.direct_quarter(2, &ends[1], fiscal_year);
        let mut q3 = context.direct_quarter(3, &ends[2], fiscal_year);
        let mut q4 = context.direct_quarter(4, &ends[3], fiscal_year);

        if q2.is_none() {
            if let (Some(p6), Some(q1_done)) = (p6, q1.as_ref()) {
                let base = Operand::from_period(p6);
                let minus_q1 = Operand::from_quarter(q1_done);
                q2 = Some(context.derived_quarter(
                    2,
                    &ends[1],
                    fiscal_year,
                    DerivationMethod::SixMinusQ1,
                    &base,
                    &[&minus_q1],
                ));
            } else if let (Some(p9), Some(q1_done), Some(q3_direct)) = (p9, q1.as_ref(), q3.as_ref())
            {
                let base = Operand::from_period(p9);
                let minus_q1 = Operand::from_quarter(q1_done);
                let minus_q3 = Operand::from_quarter(q3_direct);
                q2 = Some(context.derived_quarter(
                    2,
                    &ends[1],
                    fiscal_year,
                    DerivationMethod::NineMinusQ1Q3,
                    &base,
                    &[&minus_q1, &minus_q3],
                ));
            }
        }

        if q3.is_none() {
            if let (Some(p9), Some(p6)) = (p9, p6) {
                let base = Operand::from_period(p9);
                let minus_p6 = Operand::from_period(p6);
                q3 = Some(context.derived_quarter(
                    3,
                    &ends[2],
                    fiscal_year,
                    DerivationMethod::NineMinusSix,
                    &base,
                    &[&minus_p6],
                ));
            } else if let (Some(p9), Some(q1_done), Some(q2_done)) = (p9, q1.as_ref(), q2.as_ref())
            {
                let base = Operand::from_period(p9);
                let minus_q1 = Operand::from_quarter(q1_done);
                let minus_q2 = Operand::from_quarter(q2_done);
                q3 = Some(context.derived_quarter(
                    3,
                    &ends[2],
                    fiscal_year,
                    DerivationMethod::NineMinusQ1Q2,
                    &base,
                    &[&minus_q1, &minus_q2],
                ));
            }
        }

        if q4.is_none() {
            if let Some(p9) = p9 {
                let minus_p9 = Operand::from_period(p9);
                q4 = Some(context.derived_quarter(
                    4,
                    &ends[3],
                    fiscal_year,
                    DerivationMethod::TwelveMinusNine,
                    &annual_operand,
                    &[&minus_p9],
                ));
            } else if let (Some(q1_done), Some(q2_done), Some(q3_done)) =
                (q1.as_ref(), q2.as_ref(), q3.as_ref())
            {
                let minus_q1 = Operand::from_quarter(q1_done);
                let minus_q2 = Operand::from_quarter(q2_done);
                let minus_q3 = Operand::from_quarter(q3_done);
                q4 = Some(context.derived_quarter(
                    4,
                    &ends[3],
                    fiscal_year,
                    DerivationMethod::TwelveMinusQ1Q2Q3,
                    &annual_operand,
                    &[&minus_q1, &minus_q2, &minus_q3],
                ));
            } else if let (Some(p6), Some(q3_done)) = (p6, q3.as_ref()) {
                let minus_p6 = Operand::from_period(p6);
                let minus_q3 = Operand::from_quarter(q3_done);
                q4 = Some(context.derived_quarter(
                    4,
                    &ends[3],
                    fiscal_year,
                    DerivationMethod::TwelveMinusSixQ3,
                    &annual_operand,
                    &[&minus_p6, &minus_q3],
                ));
            }
        }

        // Cross-validation fallback: fill slots primary derivation could
        // not, and replace anomalous derivations, from later filings'
        // comparative columns.
        let slots = [&mut q1, &mut q2, &mut q3, &mut q4];
        for (index, slot) in slots.into_iter().enumerate() {
            let number = index as u32 + 1;
            let anomalous = slot.as_ref().is_some_and(|quarter| {
                quarter.method.is_derived()
                    && quarter
                        .values
                        .get(context.income_field)
                        .is_some_and(|income| *income < 0.0)
            });
            if slot.is_none() {
                *slot = context.cross_validated_quarter(number, &ends[index], fiscal_year, None);
            } else if anomalous {
                if let Some(replacement) =
                    context.cross_validated_quarter(number, &ends[index], fiscal_year, slot.as_ref())
                {
                    issues.push(QcResult::new(
                        context.ticker,
                        format!("FY{fiscal_year}_Q{number}_{}", context.scope),
                        "cross_validated",
                        QcStatus::Warn,
                        format!(
                            "replaced anomalous {} derivation with comparative column from {:?}",
                            slot.as_ref().map(|q| q.method.as_str()).unwrap_or(""),
                            replacement.sources
                        ),
                    ));
                    *slot = Some(replacement);
                }
            }
        }

        let fiscal_quarters: Vec<DerivedQuarter> =
            [q1, q2, q3, q4].into_iter().flatten().collect();

        if fiscal_quarters.len() == 4 {
            let refs: Vec<&DerivedQuarter> = fiscal_quarters.iter().collect();
            issues.extend(semantic::check_period_sum(
                context.ticker,
                &refs,
                annual,
                context.income_field,
                config,
            ));
        }
        quarters.extend(fiscal_quarters);
    }
}

/// Periods not covered by any annual (the current, still-open fiscal year)
/// yield quarters by the same rules.
fn derive_orphans(context: &ScopeContext<'_>, quarters: &mut Vec<DerivedQuarter>) {
    let covered = |quarters: &[DerivedQuarter], period_end: &str| {
        quarters.iter().any(|quarter| quarter.period_end == period_end)
    };

    // Standalone 3M periods first.
    for period in &context.periods {
        if period.duration_months != 3 || covered(quarters, &period.period_end) {
            continue;
        }
        if period.origin == PeriodOrigin::Comparative
            && !donor_acceptable(period.values.get(context.income_field).copied(), None)
        {
            continue;
        }
        let Ok((year, month)) = periods::parse_year_month(&period.period_end) else {
            continue;
        };
        let number = quarter_number(month, context.fy_end_month);
        let fiscal_year = if month > context.fy_end_month {
            year + 1
        } else {
            year
        };
        let method = match period.origin {
            PeriodOrigin::Primary => DerivationMethod::Direct3M,
            PeriodOrigin::Comparative => DerivationMethod::CrossValidated,
        };
        quarters.push(DerivedQuarter {
            quarter: number,
            period_end: period.period_end.clone(),
            fiscal_year,
            consolidation: context.scope.to_string(),
            method,
            sources: vec![period.source_filing.clone()],
            values: period.values.clone(),
        });
    }

    // Orphan 9M periods give Q3, orphan 6M periods give Q2.
    for (duration, number, method_single) in [
        (9_u32, 3_u32, DerivationMethod::NineMinusSix),
        (6, 2, DerivationMethod::SixMinusQ1),
    ] {
        for period in &context.periods {
            if period.duration_months != duration || covered(quarters, &period.period_end) {
                continue;
            }
            let Ok((year, month)) = periods::parse_year_month(&period.period_end) else {
                continue;
            };
            if quarter_number(month, context.fy_end_month) != number {
                continue;
            }
            let fiscal_year = if month > context.fy_end_month {
                year + 1
            } else {
                year
            };
            let base = Operand::from_period(period);

            let derived = if duration == 9 {
                let q2_end = quarter_end_date(context.fy_end_month, fiscal_year, 2);
                if let Some(p6) = context.find(&q2_end, 6, None) {
                    let minus_p6 = Operand::from_period(p6);
                    Some(context.derived_quarter(
                        number,
                        &period.period_end,
                        fiscal_year,
                        method_single,
                        &base,
                        &[&minus_p6],
                    ))
                } else {
                    let q1_end = quarter_end_date(context.fy_end_month, fiscal_year, 1);
                    let q1 = quarters
                        .iter()
                        .find(|quarter| quarter.period_end == q1_end)
                        .cloned();
                    let q2 = quarters
                        .iter()
                        .find(|quarter| quarter.period_end == q2_end)
                        .cloned();
                    if let (Some(q1), Some(q2)) = (q1, q2) {
                        let minus_q1 = Operand::from_quarter(&q1);
                        let minus_q2 = Operand::from_quarter(&q2);
                        Some(context.derived_quarter(
                            number,
                            &period.period_end,
                            fiscal_year,
                            DerivationMethod::NineMinusQ1Q2,
                            &base,
                            &[&minus_q1, &minus_q2],
                        ))
                    } else {
                        None
                    }
                }
            } else {
                let q1_end = quarter_end_date(context.fy_end_month, fiscal_year, 1);
                quarters
                    .iter()
                    .find(|quarter| quarter.period_end == q1_end)
                    .cloned()
                    .map(|q1| {
                        let minus_q1 = Operand::from_quarter(&q1);
                        context.derived_quarter(
                            number,
                            &period.period_end,
                            fiscal_year,
                            method_single,
                            &base,
                            &[&minus_q1],
                        )
                    })
            };

            if let Some(derived) = derived {
                quarters.push(derived);
            }
        }
    }
}
