use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Result, bail};
use tracing::{error, info};

use crate::checkpoint::{CheckpointStore, Outcome};
use crate::cli::CompileArgs;
use crate::commands::{CacheLayout, file_stem_string, list_json_files};
use crate::config::QcConfig;
use crate::db;
use crate::gate::{FsOutputStore, IncrementalGate};
use crate::model::{CompiledRecord, EntityManifest, ExtractedStatement};
use crate::periods;
use crate::util::{read_json, sha256_file, sha256_string, write_json_pretty};

/// Compile stage: merge every filing's extraction into one per-entity
/// period record, normalized to the canonical scale, and index it for the
/// publish stage. One entity per work item.
pub fn run(args: CompileArgs) -> Result<()> {
    let layout = CacheLayout::new(&args.cache_root)?;
    let config = QcConfig::load(layout.root())?;
    let statement = args.statement.as_str();
    let stage_key = format!("compile_{statement}");

    let input_dir = layout.extracted_dir(statement);
    let files = list_json_files(&input_dir, args.ticker.as_deref())?;
    if files.is_empty() {
        bail!("no extracted statements found in {}", input_dir.display());
    }

    let entities: EntityManifest = if layout.entities_path().exists() {
        read_json(&layout.entities_path())?
    } else {
        EntityManifest::default()
    };

    // Group input files by entity; the per-entity fingerprint covers every
    // contributing file, so adding one filing recompiles that entity only.
    let mut by_ticker: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for path in files {
        let stem = file_stem_string(&path)?;
        let ticker = stem.split('_').next().unwrap_or(&stem).to_string();
        by_ticker.entry(ticker).or_default().push(path);
    }

    let store = CheckpointStore::new(layout.checkpoints_dir(), config.checkpoint_save_interval);
    let mut checkpoint = store.load(&stage_key)?;
    checkpoint.set_total(by_ticker.len());
    let mut gate = IncrementalGate::new(FsOutputStore::open(layout.fingerprints_path(&stage_key)));

    let mut connection = db::open_index(&layout.index_db_path())?;
    let compiled_dir = layout.compiled_dir();
    let mut compiled = 0_usize;

    for (ticker, paths) in &by_ticker {
        let out_path = compiled_dir.join(format!("{ticker}_{statement}.json"));
        let mut hashes = Vec::with_capacity(paths.len());
        for path in paths {
            hashes.push(format!("{}:{}", path.display(), sha256_file(path)?));
        }
        let fingerprint = sha256_string(&hashes.join("\n"));

        if !gate.should_process(ticker, &out_path, Some(&fingerprint))? {
            let outcome = if checkpoint.is_completed_item(ticker) {
                Outcome::Skipped
            } else {
                Outcome::Completed
            };
            store.record_outcome(&mut checkpoint, ticker, outcome)?;
            continue;
        }

        checkpoint.mark_in_progress(ticker);
        match compile_ticker(ticker, statement, paths, &entities) {
            Ok(record) => {
                write_json_pretty(&out_path, &record)?;
                db::upsert_record(&mut connection, &record)?;
                gate.record_fingerprint(ticker, &fingerprint)?;
                store.record_outcome(&mut checkpoint, ticker, Outcome::Completed)?;
                compiled += 1;
                info!(
                    ticker = %ticker,
                    periods = record.periods.len(),
                    fiscal_year_end_month = record.fiscal_year_end_month,
                    "compiled"
                );
            }
            Err(err) => {
                error!(ticker = %ticker, error = %err, "compile failed for entity");
                store.record_outcome(&mut checkpoint, ticker, Outcome::Failed(format!("{err:#}")))?;
            }
        }
    }

    store.finalize(&mut checkpoint)?;
    info!(
        entities = by_ticker.len(),
        compiled,
        failed = checkpoint.progress.failed,
        index = %layout.index_db_path().display(),
        "compile completed"
    );

    Ok(())
}

fn compile_ticker(
    ticker: &str,
    statement: &str,
    paths: &[PathBuf],
    entities: &EntityManifest,
) -> Result<CompiledRecord> {
    let mut extractions: Vec<ExtractedStatement> = Vec::with_capacity(paths.len());
    for path in paths {
        let extraction: ExtractedStatement = read_json(path)?;
        if extraction.statement != statement {
            bail!(
                "statement type mismatch in {}: expected {statement}, found {}",
                path.display(),
                extraction.statement
            );
        }
        if extraction.ticker != ticker {
            bail!(
                "ticker mismatch in {}: expected {ticker}, found {}",
                path.display(),
                extraction.ticker
            );
        }
        extractions.push(extraction);
    }

    let fy_override = entities
        .lookup(ticker)
        .and_then(|entity| entity.fiscal_year_end_month);
    periods::merge_statements(ticker, statement, &extractions, fy_override)
}
