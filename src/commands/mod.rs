use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::util::absolute_path;

pub mod compile;
pub mod derive;
pub mod qc;
pub mod status;
pub mod validate;

/// All on-disk locations the pipeline touches, rooted at `--cache-root`.
/// The root is absolutized up front so the incremental gate always sees
/// absolute output locations.
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: &Path) -> Result<Self> {
        Ok(Self {
            root: absolute_path(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Extracted statement JSON files, one per (entity, filing, scope).
    pub fn extracted_dir(&self, statement: &str) -> PathBuf {
        self.root.join("data").join("extracted").join(statement)
    }

    /// Raw OCR page text: `pages/<ticker>/<filing>/page_NNN.md`.
    pub fn pages_dir(&self) -> PathBuf {
        self.root.join("data").join("pages")
    }

    pub fn compiled_dir(&self) -> PathBuf {
        self.root.join("data").join("compiled")
    }

    pub fn quarterly_dir(&self) -> PathBuf {
        self.root.join("data").join("quarterly")
    }

    pub fn entities_path(&self) -> PathBuf {
        self.root.join("data").join("entities.json")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("artifacts").join("checkpoints")
    }

    pub fn fingerprints_path(&self, stage_key: &str) -> PathBuf {
        self.root
            .join("artifacts")
            .join("fingerprints")
            .join(format!("{stage_key}.json"))
    }

    pub fn exceptions_dir(&self) -> PathBuf {
        self.root.join("artifacts").join("exceptions")
    }

    pub fn qc_dir(&self) -> PathBuf {
        self.root.join("artifacts").join("qc")
    }

    /// Per-item artifacts for one stage, e.g. `artifacts/qc/layer1/pl/`.
    pub fn stage_items_dir(&self, stage: &str, statement: &str) -> PathBuf {
        self.qc_dir().join(stage).join(statement)
    }

    pub fn stage_report_path(&self, stage: &str, statement: &str) -> PathBuf {
        self.qc_dir().join(format!("{stage}_{statement}.json"))
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.root.join("filingqc_index.sqlite")
    }
}

pub fn file_stem_string(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(ToOwned::to_owned)
        .with_context(|| format!("invalid UTF-8 filename: {}", path.display()))
}

/// JSON files in a directory, sorted, optionally narrowed to one ticker's
/// `<TICKER>_…` files. A missing directory is just an empty listing.
pub fn list_json_files(dir: &Path, ticker: Option<&str>) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if !is_json {
            continue;
        }

        if let Some(ticker) = ticker {
            let stem = file_stem_string(&path)?;
            if stem != ticker && !stem.starts_with(&format!("{ticker}_")) {
                continue;
            }
        }
        files.push(path);
    }

    files.sort();
    Ok(files)
}
