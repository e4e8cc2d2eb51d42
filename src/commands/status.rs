use std::fs;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::checkpoint::Checkpoint;
use crate::cli::{StatementKind, StatusArgs};
use crate::commands::CacheLayout;
use crate::db;
use crate::registry::ExceptionRegistry;
use crate::util::read_json;

pub fn run(args: StatusArgs) -> Result<()> {
    let layout = CacheLayout::new(&args.cache_root)?;
    info!(cache_root = %layout.root().display(), "status requested");

    report_checkpoints(&layout)?;
    report_registries(&layout)?;
    report_index(&layout)?;

    Ok(())
}

fn report_checkpoints(layout: &CacheLayout) -> Result<()> {
    let dir = layout.checkpoints_dir();
    if !dir.exists() {
        warn!(path = %dir.display(), "no checkpoints recorded yet");
        return Ok(());
    }

    let mut paths: Vec<_> = fs::read_dir(&dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    for path in paths {
        match read_json::<Checkpoint>(&path) {
            Ok(checkpoint) => info!(
                stage = %checkpoint.stage_key,
                status = ?checkpoint.status,
                total = checkpoint.progress.total_items,
                completed = checkpoint.progress.completed,
                failed = checkpoint.progress.failed,
                skipped = checkpoint.progress.skipped,
                updated_at = %checkpoint.updated_at,
                "checkpoint"
            ),
            Err(err) => warn!(path = %path.display(), error = %err, "unreadable checkpoint"),
        }
    }
    Ok(())
}

fn report_registries(layout: &CacheLayout) -> Result<()> {
    for statement in StatementKind::all() {
        let registry = ExceptionRegistry::load(&layout.exceptions_dir(), statement.as_str())?;
        info!(
            statement = statement.as_str(),
            skips = registry.skip_count(),
            allowlist = registry.allowlist_count(),
            "exception registry"
        );
    }
    Ok(())
}

fn report_index(layout: &CacheLayout) -> Result<()> {
    let db_path = layout.index_db_path();
    if !db_path.exists() {
        warn!(path = %db_path.display(), "index database missing");
        return Ok(());
    }

    let connection = db::open_index_read_only(&db_path)?;
    let periods = db::table_count(&connection, "periods").unwrap_or(0);
    let derived = db::table_count(&connection, "derived_quarters").unwrap_or(0);
    let qc_results = db::table_count(&connection, "qc_results").unwrap_or(0);

    info!(
        path = %db_path.display(),
        periods,
        derived_quarters = derived,
        qc_results,
        "index database status"
    );
    Ok(())
}
