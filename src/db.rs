use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, params};

use crate::model::{CompiledRecord, DerivedQuarterSet, QcResult};
use crate::util::{ensure_directory, now_utc_string};

/// Opens (creating if needed) the index database consumed by the publish
/// stage.
pub fn open_index(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }
    let connection = Connection::open(path)
        .with_context(|| format!("failed to open index database: {}", path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

pub fn open_index_read_only(path: &Path) -> Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open index database read-only: {}", path.display()))
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS periods (
          ticker TEXT NOT NULL,
          statement TEXT NOT NULL,
          period_end TEXT NOT NULL,
          duration_months INTEGER NOT NULL,
          consolidation TEXT NOT NULL,
          unit_type TEXT NOT NULL,
          source_filing TEXT NOT NULL,
          origin TEXT NOT NULL,
          PRIMARY KEY (ticker, statement, period_end, duration_months, consolidation)
        );

        CREATE TABLE IF NOT EXISTS period_values (
          ticker TEXT NOT NULL,
          statement TEXT NOT NULL,
          period_end TEXT NOT NULL,
          duration_months INTEGER NOT NULL,
          consolidation TEXT NOT NULL,
          field TEXT NOT NULL,
          value REAL NOT NULL,
          PRIMARY KEY (ticker, statement, period_end, duration_months, consolidation, field)
        );

        CREATE TABLE IF NOT EXISTS derived_quarters (
          ticker TEXT NOT NULL,
          statement TEXT NOT NULL,
          fiscal_year INTEGER NOT NULL,
          quarter INTEGER NOT NULL,
          consolidation TEXT NOT NULL,
          period_end TEXT NOT NULL,
          method TEXT NOT NULL,
          sources TEXT NOT NULL,
          PRIMARY KEY (ticker, statement, fiscal_year, quarter, consolidation)
        );

        CREATE TABLE IF NOT EXISTS derived_values (
          ticker TEXT NOT NULL,
          statement TEXT NOT NULL,
          fiscal_year INTEGER NOT NULL,
          quarter INTEGER NOT NULL,
          consolidation TEXT NOT NULL,
          field TEXT NOT NULL,
          value REAL NOT NULL,
          PRIMARY KEY (ticker, statement, fiscal_year, quarter, consolidation, field)
        );

        CREATE TABLE IF NOT EXISTS qc_results (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          stage TEXT NOT NULL,
          statement TEXT NOT NULL,
          ticker TEXT NOT NULL,
          subject TEXT NOT NULL,
          check_name TEXT NOT NULL,
          status TEXT NOT NULL,
          discrepancy REAL,
          diagnosis TEXT NOT NULL,
          allowlisted TEXT,
          recorded_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Replaces the indexed periods for one (ticker, statement) with the
/// freshly compiled record.
pub fn upsert_record(connection: &mut Connection, record: &CompiledRecord) -> Result<()> {
    let tx = connection.transaction()?;
    tx.execute(
        "DELETE FROM periods WHERE ticker = ?1 AND statement = ?2",
        params![record.ticker, record.statement],
    )?;
    tx.execute(
        "DELETE FROM period_values WHERE ticker = ?1 AND statement = ?2",
        params![record.ticker, record.statement],
    )?;

    for period in &record.periods {
        tx.execute(
            "
            INSERT INTO periods
              (ticker, statement, period_end, duration_months, consolidation,
               unit_type, source_filing, origin)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                record.ticker,
                record.statement,
                period.period_end,
                period.duration_months,
                period.consolidation,
                period.unit_type,
                period.source_filing,
                match period.origin {
                    crate::model::PeriodOrigin::Primary => "primary",
                    crate::model::PeriodOrigin::Comparative => "comparative",
                },
            ],
        )?;
        for (field, value) in &period.values {
            tx.execute(
                "
                INSERT INTO period_values
                  (ticker, statement, period_end, duration_months, consolidation, field, value)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    record.ticker,
                    record.statement,
                    period.period_end,
                    period.duration_months,
                    period.consolidation,
                    field,
                    value,
                ],
            )?;
        }
    }

    tx.commit()?;
    Ok(())
}

pub fn upsert_quarters(connection: &mut Connection, set: &DerivedQuarterSet) -> Result<()> {
    let tx = connection.transaction()?;
    tx.execute(
        "DELETE FROM derived_quarters WHERE ticker = ?1 AND statement = ?2",
        params![set.ticker, set.statement],
    )?;
    tx.execute(
        "DELETE FROM derived_values WHERE ticker = ?1 AND statement = ?2",
        params![set.ticker, set.statement],
    )?;

    for quarter in &set.quarters {
        tx.execute(
            "
            INSERT INTO derived_quarters
              (ticker, statement, fiscal_year, quarter, consolidation,
               period_end, method, sources)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                set.ticker,
                set.statement,
                quarter.fiscal_year,
                quarter.quarter,
                quarter.consolidation,
                quarter.period_end,
                quarter.method.as_str(),
                serde_json::to_string(&quarter.sources)?,
            ],
        )?;
        for (field, value) in &quarter.values {
            tx.execute(
                "
                INSERT INTO derived_values
                  (ticker, statement, fiscal_year, quarter, consolidation, field, value)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    set.ticker,
                    set.statement,
                    quarter.fiscal_year,
                    quarter.quarter,
                    quarter.consolidation,
                    field,
                    value,
                ],
            )?;
        }
    }

    tx.commit()?;
    Ok(())
}

/// QC results are append-only: each run appends its outcomes and downstream
/// consumers read the latest `recorded_at` per key.
pub fn append_qc_results(
    connection: &mut Connection,
    stage: &str,
    statement: &str,
    results: &[QcResult],
) -> Result<()> {
    let recorded_at = now_utc_string();
    let tx = connection.transaction()?;
    for result in results {
        tx.execute(
            "
            INSERT INTO qc_results
              (stage, statement, ticker, subject, check_name, status,
               discrepancy, diagnosis, allowlisted, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                stage,
                statement,
                result.ticker,
                result.subject,
                result.check,
                result.status.as_str(),
                result.discrepancy,
                result.diagnosis,
                result.allowlisted,
                recorded_at,
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn table_count(connection: &Connection, table: &str) -> Result<i64> {
    let count = connection.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DerivationMethod, DerivedQuarter, PeriodEntry, PeriodOrigin, QcStatus};
    use crate::util::now_utc_string;
    use std::collections::BTreeMap;

    fn sample_record() -> CompiledRecord {
        let mut values = BTreeMap::new();
        values.insert("revenue_net".to_string(), 1000.0);
        CompiledRecord {
            ticker: "LUCK".into(),
            statement: "pl".into(),
            fiscal_year_end_month: 6,
            compiled_at: now_utc_string(),
            periods: vec![PeriodEntry {
                period_end: "2024-06-30".into(),
                duration_months: 12,
                consolidation: "consolidated".into(),
                unit_type: "thousands".into(),
                source_filing: "annual_2024".into(),
                origin: PeriodOrigin::Primary,
                values,
                restated: BTreeMap::new(),
            }],
        }
    }

    #[test]
    fn record_upsert_replaces_prior_rows() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut connection = open_index(&tmp.path().join("index.sqlite")).expect("open");

        let record = sample_record();
        upsert_record(&mut connection, &record).expect("upsert");
        upsert_record(&mut connection, &record).expect("upsert again");

        assert_eq!(table_count(&connection, "periods").expect("count"), 1);
        assert_eq!(table_count(&connection, "period_values").expect("count"), 1);
    }

    #[test]
    fn quarters_round_trip_with_method_and_sources() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut connection = open_index(&tmp.path().join("index.sqlite")).expect("open");

        let set = DerivedQuarterSet {
            ticker: "LUCK".into(),
            statement: "pl".into(),
            fiscal_year_end_month: 6,
            generated_at: now_utc_string(),
            quarters: vec![DerivedQuarter {
                quarter: 4,
                period_end: "2024-06-30".into(),
                fiscal_year: 2024,
                consolidation: "consolidated".into(),
                method: DerivationMethod::TwelveMinusNine,
                sources: vec!["annual_2024".into(), "quarterly_2024-03-31".into()],
                values: [("revenue_net".to_string(), 250.0)].into_iter().collect(),
            }],
        };
        upsert_quarters(&mut connection, &set).expect("upsert");

        let method: String = connection
            .query_row(
                "SELECT method FROM derived_quarters WHERE ticker = 'LUCK' AND quarter = 4",
                [],
                |row| row.get(0),
            )
            .expect("method row");
        assert_eq!(method, "12M-9M");
    }

    #[test]
    fn qc_results_append_rather_than_replace() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut connection = open_index(&tmp.path().join("index.sqlite")).expect("open");

        let result = QcResult::new(
            "LUCK",
            "FY2024_consolidated",
            "period_sum",
            QcStatus::Fail,
            "sum off by 12%",
        );
        append_qc_results(&mut connection, "layer2", "pl", &[result.clone()]).expect("append");
        append_qc_results(&mut connection, "layer2", "pl", &[result]).expect("append");

        assert_eq!(table_count(&connection, "qc_results").expect("count"), 2);
    }
}
