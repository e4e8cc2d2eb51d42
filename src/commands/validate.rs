use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, Outcome};
use crate::cli::ValidateArgs;
use crate::commands::{CacheLayout, file_stem_string, list_json_files};
use crate::config::QcConfig;
use crate::gate::{FsOutputStore, IncrementalGate};
use crate::model::{
    ExtractedStatement, FileQcResult, FileStatus, Layer1Report, Layer1Stats, QcStatus,
};
use crate::qc::{formula, source_match};
use crate::registry::ExceptionRegistry;
use crate::util::{now_utc_string, read_json, sha256_file, write_json_pretty};

/// Layer 1: intra-statement formula validation plus source-fidelity
/// matching, one extraction file per work item, driven through the
/// checkpoint store and incremental gate.
pub fn run(args: ValidateArgs) -> Result<()> {
    let layout = CacheLayout::new(&args.cache_root)?;
    let config = QcConfig::load(layout.root())?;
    let statement = args.statement.as_str();
    let stage_key = format!("validate_{statement}");

    let registry = ExceptionRegistry::load(&layout.exceptions_dir(), statement)?;
    let input_dir = layout.extracted_dir(statement);
    let files = list_json_files(&input_dir, args.ticker.as_deref())?;
    if files.is_empty() {
        bail!("no extracted statements found in {}", input_dir.display());
    }

    let store = CheckpointStore::new(layout.checkpoints_dir(), config.checkpoint_save_interval);
    let mut checkpoint = store.load(&stage_key)?;
    checkpoint.set_total(files.len());
    let mut gate = IncrementalGate::new(FsOutputStore::open(layout.fingerprints_path(&stage_key)));

    let items_dir = layout.stage_items_dir("layer1", statement);
    let pages_dir = layout.pages_dir();

    for path in &files {
        let item_id = file_stem_string(path)?;
        let out_path = items_dir.join(format!("{item_id}.json"));
        let fingerprint = sha256_file(path)?;

        if !gate.should_process(&item_id, &out_path, Some(&fingerprint))? {
            let outcome = if checkpoint.is_completed_item(&item_id) {
                Outcome::Skipped
            } else {
                // Output already materialized by a run whose checkpoint was
                // lost; adopt it instead of redoing the work.
                Outcome::Completed
            };
            store.record_outcome(&mut checkpoint, &item_id, outcome)?;
            continue;
        }

        let extraction: ExtractedStatement = match read_json(path) {
            Ok(extraction) => extraction,
            Err(err) => {
                error!(item = %item_id, error = %err, "unreadable extraction file");
                store.record_outcome(
                    &mut checkpoint,
                    &item_id,
                    Outcome::Failed(format!("{err:#}")),
                )?;
                continue;
            }
        };

        if let Some(reason) = registry.skip_reason(&extraction.ticker, &extraction.filing, "layer1")
        {
            info!(item = %item_id, reason, "skipping filing per exception registry");
            store.record_outcome(&mut checkpoint, &item_id, Outcome::Skipped)?;
            continue;
        }

        checkpoint.mark_in_progress(&item_id);
        match validate_file(&item_id, &extraction, &pages_dir, &registry, &config) {
            Ok(result) => {
                if args.verbose || result.status != FileStatus::Pass {
                    info!(
                        item = %item_id,
                        status = result.status.as_str(),
                        formula_failed = result.formula_failed,
                        "validated"
                    );
                }
                write_json_pretty(&out_path, &result)?;
                gate.record_fingerprint(&item_id, &fingerprint)?;
                store.record_outcome(&mut checkpoint, &item_id, Outcome::Completed)?;
            }
            Err(err) => {
                // Structural violation: this item stops, the batch goes on.
                error!(item = %item_id, error = %err, "validation aborted for item");
                store.record_outcome(
                    &mut checkpoint,
                    &item_id,
                    Outcome::Failed(format!("{err:#}")),
                )?;
            }
        }
    }

    let report = build_report(statement, &files, &items_dir, &checkpoint)?;
    let report_path = layout.stage_report_path("layer1", statement);
    write_json_pretty(&report_path, &report)?;
    store.finalize(&mut checkpoint)?;

    info!(
        report = %report_path.display(),
        files_total = report.stats.files_total,
        files_passed = report.stats.files_passed,
        files_failed = report.stats.files_failed,
        files_error = report.stats.files_error,
        formula_failed = report.stats.formula_failed,
        "layer 1 validation completed"
    );

    Ok(())
}

fn validate_file(
    item_id: &str,
    extraction: &ExtractedStatement,
    pages_dir: &Path,
    registry: &ExceptionRegistry,
    config: &QcConfig,
) -> Result<FileQcResult> {
    let outcome = formula::validate(extraction, config)
        .with_context(|| format!("formula validation failed for {item_id}"))?;

    let source_match = match load_source_text(pages_dir, extraction)? {
        Some(text) => source_match::check_statement(extraction, &text, config),
        None => {
            warn!(item = item_id, "no source pages found, skipping source match");
            None
        }
    };

    let mut status = outcome.file_status;
    if status != FileStatus::Fail
        && source_match
            .as_ref()
            .is_some_and(|summary| summary.status == QcStatus::Fail)
    {
        status = FileStatus::Fail;
    }

    let allowlisted = if status == FileStatus::Fail {
        registry
            .allowlist_reason(&extraction.ticker, &extraction.filing, "layer1")
            .map(ToOwned::to_owned)
    } else {
        None
    };

    Ok(FileQcResult {
        file: format!("{item_id}.json"),
        ticker: extraction.ticker.clone(),
        filing: extraction.filing.clone(),
        consolidation: extraction.consolidation.clone(),
        status,
        formula_total: outcome.formula_total,
        formula_passed: outcome.formula_passed,
        formula_failed: outcome.formula_failed,
        incomplete_rows: outcome.incomplete_rows,
        formula_failures: outcome.failures,
        source_match,
        allowlisted,
    })
}

/// Concatenated text of the statement's cited pages. Pages that were never
/// OCR'd are simply absent; source matching then degrades to absent rather
/// than blocking validation.
fn load_source_text(pages_dir: &Path, extraction: &ExtractedStatement) -> Result<Option<String>> {
    if extraction.source_pages.is_empty() {
        return Ok(None);
    }

    let filing_dir = pages_dir.join(&extraction.ticker).join(&extraction.filing);
    let mut combined = String::new();
    for page in &extraction.source_pages {
        let page_path = filing_dir.join(format!("page_{page:03}.md"));
        if !page_path.exists() {
            continue;
        }
        let text = fs::read_to_string(&page_path)
            .with_context(|| format!("failed to read {}", page_path.display()))?;
        combined.push_str(&text);
        combined.push('\n');
    }

    if combined.is_empty() {
        Ok(None)
    } else {
        Ok(Some(combined))
    }
}

fn build_report(
    statement: &str,
    files: &[std::path::PathBuf],
    items_dir: &Path,
    checkpoint: &Checkpoint,
) -> Result<Layer1Report> {
    let mut stats = Layer1Stats::default();
    let mut results = Vec::new();

    for path in files {
        let item_id = file_stem_string(path)?;
        let artifact = items_dir.join(format!("{item_id}.json"));
        match read_json::<FileQcResult>(&artifact) {
            Ok(result) => {
                stats.files_total += 1;
                match result.status {
                    FileStatus::Pass => stats.files_passed += 1,
                    FileStatus::Fail => stats.files_failed += 1,
                    FileStatus::Incomplete => stats.files_incomplete += 1,
                    FileStatus::Error => stats.files_error += 1,
                }
                stats.formula_total += result.formula_total;
                stats.formula_passed += result.formula_passed;
                stats.formula_failed += result.formula_failed;
                if let Some(summary) = &result.source_match {
                    stats.source_checked += summary.checked;
                    stats.source_matched += summary.matched;
                }
                results.push(result);
            }
            Err(_) => {
                // No artifact: the item failed structurally or was skipped
                // by the registry; failures surface through the checkpoint.
                stats.files_total += 1;
                if checkpoint.failed_items().contains_key(&item_id) {
                    stats.files_error += 1;
                }
            }
        }
    }
    stats.files_skipped = checkpoint.progress.skipped;

    Ok(Layer1Report {
        manifest_version: 1,
        generated_at: now_utc_string(),
        statement: statement.to_string(),
        stats,
        files: results,
    })
}
