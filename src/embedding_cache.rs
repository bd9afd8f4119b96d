//! Persistent cache of summary embeddings.
//!
//! `position` embeds every summary it lays out and appends the vectors it
//! had to compute here. `similarity` then reads the cache and only calls the
//! provider for summaries it does not find. Entries are keyed by summary hash
//! and only returned for the model they were computed with, so switching
//! models never mixes vector spaces.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub hash: String,
    pub model: String,
    pub vector: Vec<f32>,
}

pub struct EmbeddingCache {
    file: Artifact,
    model: String,
    entries: HashMap<String, Vec<f32>>,
}

impl EmbeddingCache {
    /// Load the cache at `path`, keeping only entries for `model`.
    pub fn load(path: impl Into<PathBuf>, model: &str) -> Result<Self> {
        let file = Artifact::new(path);
        let entries = file
            .read_all::<CacheEntry>()?
            .into_iter()
            .filter(|e| e.model == model)
            .map(|e| (e.hash, e.vector))
            .collect();
        Ok(Self {
            file,
            model: model.to_string(),
            entries,
        })
    }

    pub fn get(&self, hash: &str) -> Option<&[f32]> {
        self.entries.get(hash).map(Vec::as_slice)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Append vectors that are not cached yet (fsynced). Returns how many were added.
    pub fn insert_many(&mut self, items: Vec<(String, Vec<f32>)>) -> Result<usize> {
        let mut fresh = Vec::new();
        for (hash, vector) in items {
            if self.entries.contains_key(&hash) {
                continue;
            }
            self.entries.insert(hash.clone(), vector.clone());
            fresh.push(CacheEntry {
                hash,
                model: self.model.clone(),
                vector,
            });
        }
        if !fresh.is_empty() {
            self.file.append(&fresh)?;
        }
        Ok(fresh.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn entries_survive_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache/summary_embeddings.jsonl");
        let mut cache = EmbeddingCache::load(&path, "m1").unwrap();
        assert!(cache.is_empty());
        let added = cache
            .insert_many(vec![("a".into(), vec![1.0]), ("a".into(), vec![2.0])])
            .unwrap();
        assert_eq!(added, 1);

        let reloaded = EmbeddingCache::load(&path, "m1").unwrap();
        assert_eq!(reloaded.get("a"), Some(&[1.0][..]));
    }

    #[test]
    fn other_models_are_invisible() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("c.jsonl");
        let mut cache = EmbeddingCache::load(&path, "m1").unwrap();
        cache.insert_many(vec![("a".into(), vec![1.0])]).unwrap();

        let other = EmbeddingCache::load(&path, "m2").unwrap();
        assert!(!other.contains("a"));
    }
}
