//! On-disk layout of a data directory.
//!
//! ```text
//! <data_dir>/
//!   stages/<stage>.jsonl          output artifact
//!   stages/<stage>.jsonl.rebuild  staging file of a forced rebuild
//!   state/<stage>.ledger.json     per-unit ledger (append-only stages)
//!   state/<stage>.stamp.json      corpus stamp (recompute stages)
//!   cache/summary_embeddings.jsonl
//! ```

use std::path::{Path, PathBuf};

use crate::artifact::{remove_if_exists, Artifact};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact(&self, stage: &str) -> Artifact {
        Artifact::new(self.root.join("stages").join(format!("{}.jsonl", stage)))
    }

    pub fn rebuild_artifact(&self, stage: &str) -> Artifact {
        Artifact::new(
            self.root
                .join("stages")
                .join(format!("{}.jsonl.rebuild", stage)),
        )
    }

    pub fn ledger_path(&self, stage: &str) -> PathBuf {
        self.root.join("state").join(format!("{}.ledger.json", stage))
    }

    pub fn stamp_path(&self, stage: &str) -> PathBuf {
        self.root.join("state").join(format!("{}.stamp.json", stage))
    }

    pub fn embedding_cache_path(&self) -> PathBuf {
        self.root.join("cache").join("summary_embeddings.jsonl")
    }

    /// Whether `stage` has ever committed state (a ledger or a stamp).
    pub fn has_committed_state(&self, stage: &str) -> bool {
        self.ledger_path(stage).exists() || self.stamp_path(stage).exists()
    }

    /// Remove every piece of state owned by `stage`.
    pub fn clear_stage(&self, stage: &str) -> Result<()> {
        remove_if_exists(&self.ledger_path(stage))?;
        remove_if_exists(&self.stamp_path(stage))?;
        self.rebuild_artifact(stage).remove()?;
        self.artifact(stage).remove()
    }
}
