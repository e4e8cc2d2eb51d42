use anyhow::{Result, bail};
use tracing::{error, info};

use crate::checkpoint::{CheckpointStore, Outcome};
use crate::cli::QcArgs;
use crate::commands::{CacheLayout, file_stem_string, list_json_files};
use crate::config::QcConfig;
use crate::db;
use crate::gate::{FsOutputStore, IncrementalGate};
use crate::model::{CompiledRecord, QcReport, QcResult, QcStatus};
use crate::qc::semantic;
use crate::registry::ExceptionRegistry;
use crate::util::{read_json, sha256_file, write_json_pretty};

/// Layer 2: semantic validation over compiled per-entity records
/// (critical fields, accounting identities, monotonicity, unit checks),
/// consulting the exception registry. One entity per work item.
pub fn run(args: QcArgs) -> Result<()> {
    let layout = CacheLayout::new(&args.cache_root)?;
    let config = QcConfig::load(layout.root())?;
    let statement = args.statement.as_str();
    let stage_key = format!("qc_{statement}");

    let registry = ExceptionRegistry::load(&layout.exceptions_dir(), statement)?;
    let files = compiled_files(&layout, statement, args.ticker.as_deref())?;
    if files.is_empty() {
        bail!(
            "no compiled records for statement {statement} in {}",
            layout.compiled_dir().display()
        );
    }

    let store = CheckpointStore::new(layout.checkpoints_dir(), config.checkpoint_save_interval);
    let mut checkpoint = store.load(&stage_key)?;
    checkpoint.set_total(files.len());
    let mut gate = IncrementalGate::new(FsOutputStore::open(layout.fingerprints_path(&stage_key)));

    let items_dir = layout.stage_items_dir("layer2", statement);
    let mut connection = db::open_index(&layout.index_db_path())?;

    for path in &files {
        let stem = file_stem_string(path)?;
        let item_id = stem.split('_').next().unwrap_or(&stem).to_string();
        let out_path = items_dir.join(format!("{item_id}.json"));
        let fingerprint = sha256_file(path)?;

        if !gate.should_process(&item_id, &out_path, Some(&fingerprint))? {
            let outcome = if checkpoint.is_completed_item(&item_id) {
                Outcome::Skipped
            } else {
                Outcome::Completed
            };
            store.record_outcome(&mut checkpoint, &item_id, outcome)?;
            continue;
        }

        let record: CompiledRecord = match read_json(path) {
            Ok(record) => record,
            Err(err) => {
                error!(item = %item_id, error = %err, "unreadable compiled record");
                store.record_outcome(
                    &mut checkpoint,
                    &item_id,
                    Outcome::Failed(format!("{err:#}")),
                )?;
                continue;
            }
        };

        checkpoint.mark_in_progress(&item_id);
        let results = semantic::run_checks(&record, &registry, &config);

        if args.verbose || !results.is_empty() {
            info!(
                ticker = %item_id,
                periods = record.periods.len(),
                issues = results.len(),
                "semantic checks ran"
            );
        }
        for result in &results {
            if result.status == QcStatus::Fail && args.verbose {
                info!(
                    ticker = %result.ticker,
                    subject = %result.subject,
                    check = %result.check,
                    diagnosis = %result.diagnosis,
                    "qc failure"
                );
            }
        }

        match write_json_pretty(&out_path, &results) {
            Ok(()) => {
                db::append_qc_results(&mut connection, "layer2", statement, &results)?;
                gate.record_fingerprint(&item_id, &fingerprint)?;
                store.record_outcome(&mut checkpoint, &item_id, Outcome::Completed)?;
            }
            Err(err) => {
                error!(ticker = %item_id, error = %err, "failed to persist qc results");
                store.record_outcome(
                    &mut checkpoint,
                    &item_id,
                    Outcome::Failed(format!("{err:#}")),
                )?;
            }
        }
    }

    // The aggregate report always covers every entity, including ones
    // skipped this run, by folding their persisted per-entity artifacts
    // back in.
    let mut all_results: Vec<QcResult> = Vec::new();
    for path in &files {
        let stem = file_stem_string(path)?;
        let ticker = stem.split('_').next().unwrap_or(&stem).to_string();
        let artifact = items_dir.join(format!("{ticker}.json"));
        if let Ok(results) = read_json::<Vec<QcResult>>(&artifact) {
            all_results.extend(results);
        }
    }

    let report = QcReport::new("layer2", statement, all_results, files.len());
    let report_path = layout.stage_report_path("layer2", statement);
    write_json_pretty(&report_path, &report)?;
    store.finalize(&mut checkpoint)?;

    info!(
        report = %report_path.display(),
        entities = report.stats.entities_total,
        clean = report.stats.entities_clean,
        failed = report.stats.failed,
        warned = report.stats.warned,
        allowlisted = report.stats.allowlisted,
        "layer 2 qc completed"
    );

    Ok(())
}

pub fn compiled_files(
    layout: &CacheLayout,
    statement: &str,
    ticker: Option<&str>,
) -> Result<Vec<std::path::PathBuf>> {
    let suffix = format!("_{statement}");
    let files = list_json_files(&layout.compiled_dir(), ticker)?
        .into_iter()
        .filter(|path| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(|stem| stem.ends_with(&suffix))
                .unwrap_or(false)
        })
        .collect();
    Ok(files)
}
