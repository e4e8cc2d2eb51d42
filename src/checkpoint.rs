use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::util::{now_utc_string, read_json, write_json_pretty};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    NotStarted,
    InProgress,
    Completed,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Completed,
    Failed(String),
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total_items: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Per-stage progress record. Mutation goes through [`CheckpointStore`] so
/// the completed/failed sets can never overlap and the counters can never
/// drift from the sets they summarize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage_key: String,
    pub status: CheckpointStatus,
    pub started_at: String,
    pub updated_at: String,
    pub progress: Progress,
    completed_items: BTreeSet<String>,
    failed_items: BTreeMap<String, String>,
    pub resume_from: Option<String>,
    #[serde(skip)]
    pending_saves: usize,
}

impl Checkpoint {
    fn fresh(stage_key: &str) -> Self {
        let now = now_utc_string();
        Self {
            stage_key: stage_key.to_string(),
            status: CheckpointStatus::NotStarted,
            started_at: now.clone(),
            updated_at: now,
            progress: Progress::default(),
            completed_items: BTreeSet::new(),
            failed_items: BTreeMap::new(),
            resume_from: None,
            pending_saves: 0,
        }
    }

    pub fn is_completed_item(&self, item_id: &str) -> bool {
        self.completed_items.contains(item_id)
    }

    pub fn completed_count(&self) -> usize {
        self.completed_items.len()
    }

    pub fn failed_items(&self) -> &BTreeMap<String, String> {
        &self.failed_items
    }

    pub fn set_total(&mut self, total: usize) {
        self.progress.total_items = total;
        if self.status == CheckpointStatus::NotStarted {
            self.status = CheckpointStatus::InProgress;
        }
    }

    pub fn mark_in_progress(&mut self, item_id: &str) {
        self.resume_from = Some(item_id.to_string());
    }

    fn apply(&mut self, item_id: &str, outcome: &Outcome) {
        match outcome {
            Outcome::Completed => {
                // An id leaves the failed map the moment it completes; the
                // two sets are disjoint by construction.
                self.failed_items.remove(item_id);
                self.completed_items.insert(item_id.to_string());
                self.progress.completed = self.completed_items.len();
                self.progress.failed = self.failed_items.len();
            }
            Outcome::Failed(reason) => {
                if self.completed_items.contains(item_id) {
                    warn!(
                        stage = %self.stage_key,
                        item = item_id,
                        "ignoring failure for an already-completed item"
                    );
                    return;
                }
                self.failed_items
                    .insert(item_id.to_string(), reason.clone());
                self.progress.failed = self.failed_items.len();
            }
            Outcome::Skipped => {
                self.progress.skipped += 1;
            }
        }

        if self.status == CheckpointStatus::NotStarted {
            self.status = CheckpointStatus::InProgress;
        }
        self.resume_from = None;
        self.updated_at = now_utc_string();
    }
}

/// Owns checkpoint persistence for one cache tree. Checkpoints are
/// per-stage singletons under single-writer discipline: workers report
/// outcomes back to the one driver holding the `Checkpoint`.
pub struct CheckpointStore {
    dir: PathBuf,
    save_interval: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, save_interval: usize) -> Self {
        Self {
            dir: dir.into(),
            save_interval: save_interval.max(1),
        }
    }

    fn path_for(&self, stage_key: &str) -> PathBuf {
        self.dir.join(format!("{stage_key}.json"))
    }

    /// Load the persisted checkpoint for a stage, or a fresh one when the
    /// file is absent, unreadable, belongs to a different stage, or records
    /// a prior completed run. An unreadable file is not fatal: the
    /// incremental gate still prevents redundant work.
    pub fn load(&self, stage_key: &str) -> Result<Checkpoint> {
        let path = self.path_for(stage_key);
        if !path.exists() {
            return Ok(Checkpoint::fresh(stage_key));
        }

        let mut checkpoint: Checkpoint = match read_json(&path) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "checkpoint unreadable, starting fresh"
                );
                return Ok(Checkpoint::fresh(stage_key));
            }
        };

        if checkpoint.stage_key != stage_key {
            warn!(
                path = %path.display(),
                found = %checkpoint.stage_key,
                expected = stage_key,
                "checkpoint belongs to a different stage, starting fresh"
            );
            return Ok(Checkpoint::fresh(stage_key));
        }

        if checkpoint.status == CheckpointStatus::Completed {
            return Ok(Checkpoint::fresh(stage_key));
        }

        checkpoint.status = CheckpointStatus::InProgress;
        info!(
            stage = stage_key,
            completed = checkpoint.progress.completed,
            total = checkpoint.progress.total_items,
            "resuming from checkpoint"
        );
        Ok(checkpoint)
    }

    /// Record one item outcome. Completions persist every
    /// `save_interval` outcomes to bound write amplification; failures
    /// persist immediately so their reasons survive a crash.
    pub fn record_outcome(
        &self,
        checkpoint: &mut Checkpoint,
        item_id: &str,
        outcome: Outcome,
    ) -> Result<()> {
        let failed = matches!(outcome, Outcome::Failed(_));
        checkpoint.apply(item_id, &outcome);

        checkpoint.pending_saves += 1;
        if failed || checkpoint.pending_saves >= self.save_interval {
            self.persist(checkpoint)?;
        }
        Ok(())
    }

    pub fn persist(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.pending_saves = 0;
        write_json_pretty(&self.path_for(&checkpoint.stage_key), checkpoint)
    }

    pub fn finalize(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.status = CheckpointStatus::Completed;
        checkpoint.updated_at = now_utc_string();
        checkpoint.resume_from = None;
        self.persist(checkpoint)?;
        info!(
            stage = %checkpoint.stage_key,
            completed = checkpoint.progress.completed,
            failed = checkpoint.progress.failed,
            skipped = checkpoint.progress.skipped,
            "stage finalized"
        );
        Ok(())
    }

    pub fn stage_path(&self, stage_key: &str) -> PathBuf {
        self.path_for(stage_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn store(dir: &Path) -> CheckpointStore {
        CheckpointStore::new(dir, 2)
    }

    #[test]
    fn fresh_checkpoint_for_missing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let checkpoint = store(tmp.path()).load("validate_pl").expect("load");
        assert_eq!(checkpoint.status, CheckpointStatus::NotStarted);
        assert_eq!(checkpoint.completed_count(), 0);
    }

    #[test]
    fn resume_keeps_completed_items_and_retries_failed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());

        let mut checkpoint = store.load("validate_pl").expect("load");
        checkpoint.set_total(3);
        store
            .record_outcome(&mut checkpoint, "a", Outcome::Completed)
            .expect("record");
        store
            .record_outcome(&mut checkpoint, "b", Outcome::Failed("bad input".into()))
            .expect("record");
        store.persist(&mut checkpoint).expect("persist");

        let resumed = store.load("validate_pl").expect("reload");
        assert_eq!(resumed.status, CheckpointStatus::InProgress);
        assert!(resumed.is_completed_item("a"));
        assert_eq!(
            resumed.failed_items().get("b").map(String::as_str),
            Some("bad input")
        );
    }

    #[test]
    fn completing_a_failed_item_removes_it_from_the_failed_set() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());

        let mut checkpoint = store.load("validate_pl").expect("load");
        store
            .record_outcome(&mut checkpoint, "a", Outcome::Failed("transient".into()))
            .expect("record");
        store
            .record_outcome(&mut checkpoint, "a", Outcome::Completed)
            .expect("record");

        assert!(checkpoint.is_completed_item("a"));
        assert!(checkpoint.failed_items().is_empty());
        assert_eq!(checkpoint.progress.completed, 1);
        assert_eq!(checkpoint.progress.failed, 0);
    }

    #[test]
    fn failing_a_completed_item_is_ignored() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());

        let mut checkpoint = store.load("validate_pl").expect("load");
        store
            .record_outcome(&mut checkpoint, "a", Outcome::Completed)
            .expect("record");
        store
            .record_outcome(&mut checkpoint, "a", Outcome::Failed("late".into()))
            .expect("record");

        assert!(checkpoint.is_completed_item("a"));
        assert!(checkpoint.failed_items().is_empty());
    }

    #[test]
    fn completed_count_always_tracks_the_set() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());

        let mut checkpoint = store.load("validate_pl").expect("load");
        store
            .record_outcome(&mut checkpoint, "a", Outcome::Completed)
            .expect("record");
        // Re-completing the same id must not inflate the counter.
        store
            .record_outcome(&mut checkpoint, "a", Outcome::Completed)
            .expect("record");
        assert_eq!(checkpoint.progress.completed, 1);
        assert_eq!(checkpoint.progress.completed, checkpoint.completed_count());
    }

    #[test]
    fn corrupted_checkpoint_falls_back_to_fresh() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());
        std::fs::write(store.stage_path("validate_pl"), b"{not json").expect("write");

        let checkpoint = store.load("validate_pl").expect("load");
        assert_eq!(checkpoint.status, CheckpointStatus::NotStarted);
        assert_eq!(checkpoint.completed_count(), 0);
    }

    #[test]
    fn wrong_stage_key_is_treated_as_absent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());

        let mut checkpoint = store.load("validate_pl").expect("load");
        store
            .record_outcome(&mut checkpoint, "a", Outcome::Completed)
            .expect("record");
        store.persist(&mut checkpoint).expect("persist");

        // Same file path, different stage identity.
        std::fs::copy(
            store.stage_path("validate_pl"),
            store.stage_path("validate_bs"),
        )
        .expect("copy");
        let other = store.load("validate_bs").expect("load");
        assert_eq!(other.completed_count(), 0);
    }

    #[test]
    fn completed_run_is_superseded_by_a_fresh_checkpoint() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store(tmp.path());

        let mut checkpoint = store.load("validate_pl").expect("load");
        store
            .record_outcome(&mut checkpoint, "a", Outcome::Completed)
            .expect("record");
        store.finalize(&mut checkpoint).expect("finalize");

        let next_run = store.load("validate_pl").expect("load");
        assert_eq!(next_run.status, CheckpointStatus::NotStarted);
        assert_eq!(next_run.completed_count(), 0);
    }
}
