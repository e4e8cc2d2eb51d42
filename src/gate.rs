use std::collections::BTreeMap;
#[cfg(test)]
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tracing::warn;

use crate::util::{read_json, write_json_pretty};

/// Storage backend the gate consults. The filesystem implementation is the
/// production one; the in-memory one backs tests.
pub trait OutputStore {
    fn output_exists(&self, location: &Path) -> bool;
    fn stored_fingerprint(&self, item_id: &str) -> Option<&str>;
    fn record_fingerprint(&mut self, item_id: &str, fingerprint: &str) -> Result<()>;
}

/// Fingerprints live in one JSON map per stage; outputs are ordinary files.
pub struct FsOutputStore {
    store_path: PathBuf,
    fingerprints: BTreeMap<String, String>,
}

impl FsOutputStore {
    pub fn open(store_path: impl Into<PathBuf>) -> Self {
        let store_path = store_path.into();
        let fingerprints = if store_path.exists() {
            match read_json(&store_path) {
                Ok(map) => map,
                Err(err) => {
                    warn!(
                        path = %store_path.display(),
                        error = %err,
                        "fingerprint store unreadable, starting empty"
                    );
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Self {
            store_path,
            fingerprints,
        }
    }
}

impl OutputStore for FsOutputStore {
    fn output_exists(&self, location: &Path) -> bool {
        location.exists()
    }

    fn stored_fingerprint(&self, item_id: &str) -> Option<&str> {
        self.fingerprints.get(item_id).map(String::as_str)
    }

    fn record_fingerprint(&mut self, item_id: &str, fingerprint: &str) -> Result<()> {
        self.fingerprints
            .insert(item_id.to_string(), fingerprint.to_string());
        write_json_pretty(&self.store_path, &self.fingerprints)
    }
}

/// In-memory fake backing the gate tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryOutputStore {
    outputs: BTreeSet<PathBuf>,
    fingerprints: BTreeMap<String, String>,
}

#[cfg(test)]
impl MemoryOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_output(&mut self, location: impl Into<PathBuf>) {
        self.outputs.insert(location.into());
    }
}

#[cfg(test)]
impl OutputStore for MemoryOutputStore {
    fn output_exists(&self, location: &Path) -> bool {
        self.outputs.contains(location)
    }

    fn stored_fingerprint(&self, item_id: &str) -> Option<&str> {
        self.fingerprints.get(item_id).map(String::as_str)
    }

    fn record_fingerprint(&mut self, item_id: &str, fingerprint: &str) -> Result<()> {
        self.fingerprints
            .insert(item_id.to_string(), fingerprint.to_string());
        Ok(())
    }
}

/// Decides whether an item needs (re)processing. Checkpoints are an
/// optimization; this gate is the correctness backstop that survives
/// checkpoint loss, so `should_process` must stay cheap and side-effect
/// free.
pub struct IncrementalGate<S: OutputStore> {
    store: S,
}

impl<S: OutputStore> IncrementalGate<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// `true` when no output exists at the expected location, or when a
    /// supplied fingerprint differs from the stored one (source changed).
    /// A relative expected-output path is a caller bug, not a data issue.
    pub fn should_process(
        &self,
        item_id: &str,
        expected_output: &Path,
        fingerprint: Option<&str>,
    ) -> Result<bool> {
        if expected_output.is_relative() {
            bail!(
                "incremental gate requires an absolute output location, got {}",
                expected_output.display()
            );
        }

        if !self.store.output_exists(expected_output) {
            return Ok(true);
        }

        match fingerprint {
            None => Ok(false),
            Some(fingerprint) => Ok(self.store.stored_fingerprint(item_id) != Some(fingerprint)),
        }
    }

    /// Called by the driver after an item's output has been materialized.
    pub fn record_fingerprint(&mut self, item_id: &str, fingerprint: &str) -> Result<()> {
        self.store.record_fingerprint(item_id, fingerprint)
    }
}
