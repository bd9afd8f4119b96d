//! Persisted processing state for stages.
//!
//! Two shapes of state exist, one per recompute policy:
//!
//! - [`HashLedger`]: the per-unit set of identity hashes an append-only
//!   stage has processed, plus the byte watermark of its committed output.
//! - [`CorpusStamp`]: a single hash-of-hashes describing the corpus a
//!   full-recompute stage last aggregated over.
//!
//! Both are written with write-temp-then-rename, so a crash mid-commit leaves
//! the previous state in place. A file that exists but cannot be parsed is a
//! [`PipelineError::LedgerCorruption`]; it is never treated as empty.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::{remove_if_exists, write_atomic};
use crate::error::{PipelineError, Result};

const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    stage: String,
    hashes: Vec<String>,
    output_bytes: u64,
    updated_at: i64,
    #[serde(default)]
    rebuild_pending: bool,
}

/// Result of diffing candidate hashes against a ledger.
///
/// Both lists keep the order in which candidates were supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerDiff {
    pub new: Vec<String>,
    pub already_processed: Vec<String>,
}

/// Set of identity hashes an append-only stage has durably processed.
#[derive(Debug)]
pub struct HashLedger {
    path: PathBuf,
    stage: String,
    hashes: HashSet<String>,
    output_bytes: u64,
    updated_at: Option<i64>,
    rebuild_pending: bool,
}

impl HashLedger {
    /// Load the ledger for `stage`, or an empty one when the file is absent.
    pub fn load(path: impl Into<PathBuf>, stage: &str) -> Result<Self> {
        let path = path.into();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    stage: stage.to_string(),
                    hashes: HashSet::new(),
                    output_bytes: 0,
                    updated_at: None,
                    rebuild_pending: false,
                })
            }
            Err(e) => {
                return Err(PipelineError::LedgerCorruption {
                    path,
                    reason: format!("unreadable: {}", e),
                })
            }
        };

        let file: LedgerFile =
            serde_json::from_str(&content).map_err(|e| PipelineError::LedgerCorruption {
                path: path.clone(),
                reason: format!("malformed: {}", e),
            })?;

        if file.version != LEDGER_VERSION {
            return Err(PipelineError::LedgerCorruption {
                path,
                reason: format!("unsupported ledger version {}", file.version),
            });
        }
        if file.stage != stage {
            return Err(PipelineError::LedgerCorruption {
                path,
                reason: format!("belongs to stage '{}', expected '{}'", file.stage, stage),
            });
        }

        Ok(Self {
            path,
            stage: stage.to_string(),
            hashes: file.hashes.into_iter().collect(),
            output_bytes: file.output_bytes,
            updated_at: Some(file.updated_at),
            rebuild_pending: file.rebuild_pending,
        })
    }

    /// Split `candidates` into hashes not yet processed and hashes already in the ledger.
    pub fn diff<S: AsRef<str>>(&self, candidates: &[S]) -> LedgerDiff {
        let mut diff = LedgerDiff::default();
        for candidate in candidates {
            let h = candidate.as_ref();
            if self.hashes.contains(h) {
                diff.already_processed.push(h.to_string());
            } else {
                diff.new.push(h.to_string());
            }
        }
        diff
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    /// Persist the union of the current set and `newly_processed`.
    ///
    /// `output_bytes` is the length of the stage's artifact once the records
    /// for these hashes are durably written.
    pub fn commit<I, S>(&mut self, newly_processed: I, output_bytes: u64) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.persist(newly_processed, output_bytes, false)
    }

    /// Commit hashes whose records sit in a staged rebuild of the artifact.
    ///
    /// The ledger is marked `rebuild_pending` until [`HashLedger::finish_rebuild`]
    /// runs after the staging file has been renamed over the artifact. A run
    /// that finds the mark set rolls the rename forward before doing anything.
    pub fn commit_rebuild<I, S>(&mut self, newly_processed: I, output_bytes: u64) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.persist(newly_processed, output_bytes, true)
    }

    pub fn finish_rebuild(&mut self) -> Result<()> {
        self.persist(Vec::<String>::new(), self.output_bytes, false)
    }

    pub fn rebuild_pending(&self) -> bool {
        self.rebuild_pending
    }

    fn persist<I, S>(
        &mut self,
        newly_processed: I,
        output_bytes: u64,
        rebuild_pending: bool,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let before = self.hashes.len();
        let mut next = self.hashes.clone();
        next.extend(newly_processed.into_iter().map(Into::into));
        if next.len() < before {
            return Err(PipelineError::LedgerCorruption {
                path: self.path.clone(),
                reason: "commit would remove processed hashes".to_string(),
            });
        }

        let mut sorted: Vec<String> = next.iter().cloned().collect();
        sorted.sort_unstable();
        let now = Utc::now().timestamp();
        let file = LedgerFile {
            version: LEDGER_VERSION,
            stage: self.stage.clone(),
            hashes: sorted,
            output_bytes,
            updated_at: now,
            rebuild_pending,
        };
        write_atomic(&self.path, &serde_json::to_vec(&file)?)?;

        debug!(
            stage = %self.stage,
            added = next.len() - before,
            total = next.len(),
            output_bytes,
            rebuild_pending,
            "Committed ledger"
        );
        self.hashes = next;
        self.output_bytes = output_bytes;
        self.updated_at = Some(now);
        self.rebuild_pending = rebuild_pending;
        Ok(())
    }

    /// Empty the ledger and delete its file.
    pub fn clear(&mut self) -> Result<()> {
        remove_if_exists(&self.path)?;
        self.hashes.clear();
        self.output_bytes = 0;
        self.updated_at = None;
        self.rebuild_pending = false;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Processed hashes, sorted.
    pub fn hashes(&self) -> Vec<&str> {
        let mut hashes: Vec<&str> = self.hashes.iter().map(String::as_str).collect();
        hashes.sort_unstable();
        hashes
    }

    /// Whether this ledger has ever been committed.
    pub fn exists(&self) -> bool {
        self.updated_at.is_some()
    }

    /// Length of the stage's artifact at the last commit.
    pub fn output_bytes(&self) -> u64 {
        self.output_bytes
    }

    pub fn updated_at(&self) -> Option<i64> {
        self.updated_at
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Corpus-level state of a full-recompute stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorpusStamp {
    pub version: u32,
    pub stage: String,
    pub corpus_hash: String,
    pub unit_count: usize,
    pub computed_at: i64,
}

impl CorpusStamp {
    pub fn new(stage: &str, corpus_hash: String, unit_count: usize) -> Self {
        Self {
            version: LEDGER_VERSION,
            stage: stage.to_string(),
            corpus_hash,
            unit_count,
            computed_at: Utc::now().timestamp(),
        }
    }

    /// Read the stamp at `path`; `None` when the stage never computed.
    pub fn load(path: &Path, stage: &str) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PipelineError::LedgerCorruption {
                    path: path.to_path_buf(),
                    reason: format!("unreadable: {}", e),
                })
            }
        };
        let stamp: CorpusStamp =
            serde_json::from_str(&content).map_err(|e| PipelineError::LedgerCorruption {
                path: path.to_path_buf(),
                reason: format!("malformed stamp: {}", e),
            })?;
        if stamp.version != LEDGER_VERSION || stamp.stage != stage {
            return Err(PipelineError::LedgerCorruption {
                path: path.to_path_buf(),
                reason: format!(
                    "stamp for stage '{}' version {} does not match '{}'",
                    stamp.stage, stamp.version, stage
                ),
            });
        }
        Ok(Some(stamp))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_json::to_vec(self)?)
    }

    pub fn clear(path: &Path) -> Result<()> {
        remove_if_exists(path)
    }
}
