//! JSON Lines artifacts: the output sink of every stage.
//!
//! Append-only stages grow their artifact one batch at a time with
//! [`Artifact::append`]; recompute stages swap the whole file with
//! [`Artifact::replace`]. Both fsync before returning so that a ledger commit
//! that follows never points past data that is not on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PipelineError, Result};

/// One JSON Lines file on disk.
#[derive(Debug, Clone)]
pub struct Artifact {
    path: PathBuf,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Current size in bytes, `0` when the file does not exist.
    pub fn len_bytes(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(PipelineError::io(&self.path, e)),
        }
    }

    /// Read every record in the file.
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.read_prefix(None)
    }

    /// Read the records contained in the first `limit` bytes (all when `None`).
    ///
    /// Used to read only the committed part of an append-only artifact.
    pub fn read_prefix<T: DeserializeOwned>(&self, limit: Option<u64>) -> Result<Vec<T>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::io(&self.path, e)),
        };
        let reader: Box<dyn Read> = match limit {
            Some(n) => Box::new(file.take(n)),
            None => Box::new(file),
        };

        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(reader).lines().enumerate() {
            let line = line.map_err(|e| PipelineError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| {
                PipelineError::Serialization(format!(
                    "{} line {}: {}",
                    self.path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Append records and fsync. Returns the file length afterwards.
    pub fn append<T: Serialize>(&self, records: &[T]) -> Result<u64> {
        ensure_parent(&self.path)?;
        let buf = encode_lines(records)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PipelineError::io(&self.path, e))?;
        file.write_all(&buf)
            .and_then(|_| file.sync_all())
            .map_err(|e| PipelineError::io(&self.path, e))?;
        self.len_bytes()
    }

    /// Atomically replace the whole file. Returns the new length.
    pub fn replace<T: Serialize>(&self, records: &[T]) -> Result<u64> {
        let buf = encode_lines(records)?;
        write_atomic(&self.path, &buf)?;
        Ok(buf.len() as u64)
    }

    /// Cut the file back to `len` bytes (drops an uncommitted tail).
    pub fn truncate(&self, len: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| PipelineError::io(&self.path, e))?;
        file.set_len(len)
            .and_then(|_| file.sync_all())
            .map_err(|e| PipelineError::io(&self.path, e))
    }

    pub fn remove(&self) -> Result<()> {
        remove_if_exists(&self.path)
    }

    /// Rename this file over `target`, replacing it atomically.
    pub fn promote_to(&self, target: &Artifact) -> Result<()> {
        ensure_parent(&target.path)?;
        fs::rename(&self.path, &target.path).map_err(|e| PipelineError::io(&target.path, e))
    }
}

fn encode_lines<T: Serialize>(records: &[T]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Write `bytes` to `path` via a sibling temp file, fsync, then rename.
///
/// Readers observe either the old content or the new content, never a mix.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = File::create(&tmp).map_err(|e| PipelineError::io(&tmp, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| PipelineError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| PipelineError::io(path, e))?;
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
    }
    Ok(())
}
