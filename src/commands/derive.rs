use anyhow::{Result, bail};
use tracing::{error, info};

use crate::checkpoint::{CheckpointStore, Outcome};
use crate::cli::DeriveArgs;
use crate::commands::{CacheLayout, file_stem_string, qc::compiled_files};
use crate::config::QcConfig;
use crate::db;
use crate::gate::{FsOutputStore, IncrementalGate};
use crate::model::{
    CompiledRecord, DerivedQuarterSet, EntityManifest, QcReport, QcResult,
};
use crate::qc::semantic;
use crate::quarters;
use crate::registry::ExceptionRegistry;
use crate::util::{now_utc_string, read_json, sha256_file, write_json_pretty};

/// Quarter derivation stage: standalone 3-month values per fiscal year with
/// method and source provenance, plus the derivation QC issues. One entity
/// per work item.
pub fn run(args: DeriveArgs) -> Result<()> {
    let layout = CacheLayout::new(&args.cache_root)?;
    let config = QcConfig::load(layout.root())?;
    let statement = args.statement.as_str();
    let stage_key = format!("derive_{statement}");

    let registry = ExceptionRegistry::load(&layout.exceptions_dir(), statement)?;
    let files = compiled_files(&layout, statement, args.ticker.as_deref())?;
    if files.is_empty() {
        bail!(
            "no compiled records for statement {statement} in {}",
            layout.compiled_dir().display()
        );
    }

    let entities: EntityManifest = if layout.entities_path().exists() {
        read_json(&layout.entities_path())?
    } else {
        EntityManifest::default()
    };

    let store = CheckpointStore::new(layout.checkpoints_dir(), config.checkpoint_save_interval);
    let mut checkpoint = store.load(&stage_key)?;
    checkpoint.set_total(files.len());
    let mut gate = IncrementalGate::new(FsOutputStore::open(layout.fingerprints_path(&stage_key)));

    let items_dir = layout.stage_items_dir("derive", statement);
    let quarterly_dir = layout.quarterly_dir();
    let mut connection = db::open_index(&layout.index_db_path())?;
    let mut total_quarters = 0_usize;

    for path in &files {
        let stem = file_stem_string(path)?;
        let item_id = stem.split('_').next().unwrap_or(&stem).to_string();
        let out_path = quarterly_dir.join(format!("{item_id}_{statement}.json"));
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
        let industry = entities
            .lookup(&item_id)
            .and_then(|entity| entity.industry.as_deref());
        let income_field = semantic::income_field_for(industry);

        let mut output = quarters::derive_record(&record, income_field, &config);
        for issue in &mut output.issues {
            registry.annotate(issue);
        }

        let set = DerivedQuarterSet {
            ticker: record.ticker.clone(),
            statement: statement.to_string(),
            fiscal_year_end_month: record.fiscal_year_end_month,
            generated_at: now_utc_string(),
            quarters: output.quarters,
        };

        let persisted: Result<()> = (|| {
            write_json_pretty(&out_path, &set)?;
            write_json_pretty(
                &items_dir.join(format!("{item_id}.json")),
                &output.issues,
            )?;
            db::upsert_quarters(&mut connection, &set)?;
            db::append_qc_results(&mut connection, "derive", statement, &output.issues)?;
            Ok(())
        })();

        match persisted {
            Ok(()) => {
                gate.record_fingerprint(&item_id, &fingerprint)?;
                store.record_outcome(&mut checkpoint, &item_id, Outcome::Completed)?;
                total_quarters += set.quarters.len();
                info!(
                    ticker = %item_id,
                    quarters = set.quarters.len(),
                    issues = output.issues.len(),
                    income_field,
                    "derived"
                );
            }
            Err(err) => {
                error!(ticker = %item_id, error = %err, "derivation failed for entity");
                store.record_outcome(
                    &mut checkpoint,
                    &item_id,
                    Outcome::Failed(format!("{err:#}")),
                )?;
            }
        }
    }

    let mut all_issues: Vec<QcResult> = Vec::new();
    for path in &files {
        let stem = file_stem_string(path)?;
        let ticker = stem.split('_').next().unwrap_or(&stem).to_string();
        if let Ok(issues) = read_json::<Vec<QcResult>>(&items_dir.join(format!("{ticker}.json"))) {
            all_issues.extend(issues);
        }
    }

    let report = QcReport::new("derive", statement, all_issues, files.len());
    let report_path = layout.stage_report_path("derive", statement);
    write_json_pretty(&report_path, &report)?;
    store.finalize(&mut checkpoint)?;

    info!(
        report = %report_path.display(),
        entities = report.stats.entities_total,
        quarters = total_quarters,
        issues = report.stats.results_total,
        allowlisted = report.stats.allowlisted,
        "quarter derivation completed"
    );

    Ok(())
}
