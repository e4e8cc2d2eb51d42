use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::warn;

use crate::model::{
    CompiledRecord, ExtractedStatement, PeriodEntry, PeriodOrigin, RestatedValue,
};
use crate::qc::units;
use crate::util::now_utc_string;

pub fn parse_year_month(period_end: &str) -> Result<(i32, u32)> {
    let mut parts = period_end.splitn(3, '-');
    let year = parts
        .next()
        .and_then(|part| part.parse::<i32>().ok())
        .with_context(|| format!("invalid period end date: {period_end}"))?;
    let month = parts
        .next()
        .and_then(|part| part.parse::<u32>().ok())
        .filter(|month| (1..=12).contains(month))
        .with_context(|| format!("invalid period end date: {period_end}"))?;
    Ok((year, month))
}

/// Modal month across the record's annual periods; December when the entity
/// has no annual data yet.
pub fn fiscal_year_end_month(periods: &[PeriodEntry]) -> u32 {
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for period in periods {
        if period.duration_months != 12 {
            continue;
        }
        if let Ok((_, month)) = parse_year_month(&period.period_end) {
            *counts.entry(month).or_insert(0) += 1;
        }
    }

    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(month, _)| month)
        .unwrap_or(12)
}

/// The fiscal year a cumulative period rolls into: the calendar year of the
/// annual period end it would accumulate to.
pub fn fiscal_year_for(period_end: &str, duration_months: u32, fy_end_month: u32) -> Result<i32> {
    let (year, month) = parse_year_month(period_end)?;
    if duration_months == 12 {
        return Ok(year);
    }
    if month <= fy_end_month {
        Ok(year)
    } else {
        Ok(year + 1)
    }
}

/// Which standalone quarter a period ending in `period_month` belongs to.
pub fn quarter_number(period_month: u32, fy_end_month: u32) -> u32 {
    let mut months_after = (period_month + 12 - fy_end_month) % 12;
    if months_after == 0 {
        months_after = 12;
    }
    (months_after + 2) / 3
}

fn last_day_of_month(month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ => 28,
    }
}

/// End date of a fiscal quarter, e.g. Q1 of FY2024 for a June year-end is
/// 2023-09-30.
pub fn quarter_end_date(fy_end_month: u32, fy_year: i32, quarter: u32) -> String {
    let start_month = (fy_end_month % 12) + 1;
    let mut end_month = (start_month - 1 + quarter * 3) % 12;
    if end_month == 0 {
        end_month = 12;
    }
    let year = if end_month > fy_end_month {
        fy_year - 1
    } else {
        fy_year
    };
    format!("{year}-{end_month:02}-{:02}", last_day_of_month(end_month))
}

pub fn find_period<'a>(
    periods: &'a [PeriodEntry],
    period_end: &str,
    duration_months: u32,
    consolidation: &str,
) -> Option<&'a PeriodEntry> {
    periods.iter().find(|period| {
        period.period_end == period_end
            && period.duration_months == duration_months
            && period.consolidation == consolidation
    })
}

fn rank(origin: PeriodOrigin) -> u8 {
    match origin {
        PeriodOrigin::Primary => 2,
        PeriodOrigin::Comparative => 1,
    }
}

/// Folds the loser's values into the winner: missing fields are filled,
/// conflicting fields are recorded as restated alongside the kept value.
fn absorb(winner: &mut PeriodEntry, loser: PeriodEntry) {
    for (field, value) in loser.values {
        match winner.values.get(&field) {
            None => {
                winner.values.insert(field, value);
            }
            Some(kept) if *kept != value => {
                winner.restated.insert(
                    field,
                    RestatedValue {
                        value,
                        source_filing: loser.source_filing.clone(),
                    },
                );
            }
            Some(_) => {}
        }
    }
}

/// Merges all extracted statements of one entity and statement type into a
/// single compiled record. Every value is converted to the canonical
/// thousands scale using the statement's declared unit before merging; the
/// declared unit stays on the entry for diagnosis. Conflicts on a
/// (period-end, duration, scope, field) key resolve deterministically:
/// a filing's own reporting column beats a later filing's comparative
/// column, and between two comparatives the earlier filing wins.
pub fn merge_statements(
    ticker: &str,
    statement: &str,
    extractions: &[ExtractedStatement],
    fy_month_override: Option<u32>,
) -> Result<CompiledRecord> {
    let mut ordered: Vec<&ExtractedStatement> = extractions.iter().collect();
    ordered.sort_by(|a, b| {
        let key_a = a.columns.first().map(|column| column.period_end.as_str());
        let key_b = b.columns.first().map(|column| column.period_end.as_str());
        key_a.cmp(&key_b).then_with(|| a.filing.cmp(&b.filing))
    });

    let mut merged: BTreeMap<(String, u32, String), PeriodEntry> = BTreeMap::new();

    for extraction in ordered {
        for (column_index, column) in extraction.columns.iter().enumerate() {
            let origin = if column_index == 0 {
                PeriodOrigin::Primary
            } else {
                PeriodOrigin::Comparative
            };

            let mut values = BTreeMap::new();
            for row in &extraction.rows {
                if row.canonical.is_empty() {
                    continue;
                }
                if let Some(Some(value)) = row.values.get(column_index) {
                    let normalized =
                        units::normalize_value(*value, &extraction.unit_type, &row.canonical);
                    values.entry(row.canonical.clone()).or_insert(normalized);
                }
            }
            if values.is_empty() {
                continue;
            }

            let candidate = PeriodEntry {
                period_end: column.period_end.clone(),
                duration_months: column.duration_months,
                consolidation: extraction.consolidation.clone(),
                unit_type: extraction.unit_type.clone(),
                source_filing: extraction.filing.clone(),
                origin,
                values,
                restated: BTreeMap::new(),
            };

            let key = (
                column.period_end.clone(),
                column.duration_months,
                extraction.consolidation.clone(),
            );

            match merged.remove(&key) {
                None => {
                    merged.insert(key, candidate);
                }
                Some(existing) => {
                    if rank(candidate.origin) > rank(existing.origin) {
                        let mut winner = candidate;
                        absorb(&mut winner, existing);
                        merged.insert(key, winner);
                    } else {
                        if rank(candidate.origin) == rank(existing.origin)
                            && candidate.origin == PeriodOrigin::Primary
                        {
                            warn!(
                                ticker,
                                period_end = %existing.period_end,
                                first = %existing.source_filing,
                                second = %candidate.source_filing,
                                "two filings claim the same primary period, keeping the first"
                            );
                        }
                        let mut winner = existing;
                        absorb(&mut winner, candidate);
                        merged.insert(key, winner);
                    }
                }
            }
        }
    }

    let mut periods: Vec<PeriodEntry> = merged.into_values().collect();
    periods.sort_by(|a, b| {
        a.period_end
            .cmp(&b.period_end)
            .then(a.duration_months.cmp(&b.duration_months))
            .then(a.consolidation.cmp(&b.consolidation))
    });

    let fiscal_month = fy_month_override.unwrap_or_else(|| fiscal_year_end_month(&periods));

    Ok(CompiledRecord {
        ticker: ticker.to_string(),
        statement: statement.to_string(),
        fiscal_year_end_month: fiscal_month,
        compiled_at: now_utc_string(),
        periods,
    })
}
