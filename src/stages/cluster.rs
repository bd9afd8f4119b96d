//! `cluster`: k-means over every chunk embedding.
//!
//! The whole assignment set is recomputed whenever the embedding corpus
//! changes, so a chunk's cluster may move between runs. Cluster ids are
//! renumbered by first appearance in chunk-hash order, which keeps them
//! stable for an unchanged corpus.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::ClusteringConfig;
use crate::error::{HashingError, Result};
use crate::hashing::{ensure_finite, identity_hash};
use crate::kmeans::{default_k, kmeans};
use crate::models::{ChunkRecord, Cluster, ClusterAssignment, EmbeddingRecord};
use crate::stage::{RecomputeStage, Recomputed, StageContext, Unit};

use super::{CHUNK, CLUSTER, EMBED};

pub struct ClusterStage {
    config: ClusteringConfig,
}

impl ClusterStage {
    pub fn new(config: ClusteringConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RecomputeStage for ClusterStage {
    type Input = EmbeddingRecord;
    type Output = ClusterAssignment;

    fn name(&self) -> &'static str {
        CLUSTER
    }

    /// Embeddings of chunks that are still committed upstream.
    fn load_inputs(&self, ctx: &StageContext) -> Result<Vec<EmbeddingRecord>> {
        let chunks: HashSet<String> = ctx
            .read_committed_records::<ChunkRecord>(CHUNK)?
            .into_iter()
            .map(|c| c.chunk_hash)
            .collect();
        Ok(ctx
            .read_committed_records::<EmbeddingRecord>(EMBED)?
            .into_iter()
            .filter(|e| chunks.contains(&e.chunk_hash))
            .collect())
    }

    fn identity(&self, record: &EmbeddingRecord) -> std::result::Result<String, HashingError> {
        ensure_finite(&record.vector)?;
        identity_hash(record)
    }

    fn corpus_salt(&self) -> Option<String> {
        Some(format!(
            "k={:?}:seed={}:iterations={}",
            self.config.k, self.config.seed, self.config.max_iterations
        ))
    }

    async fn recompute(
        &self,
        _ctx: &StageContext,
        units: &[Unit<EmbeddingRecord>],
        _previous: Option<Vec<ClusterAssignment>>,
    ) -> Result<Recomputed<ClusterAssignment>> {
        // Vectors of another dimensionality (an older model) cannot share a space.
        let mut dims_count: BTreeMap<usize, usize> = BTreeMap::new();
        for unit in units {
            *dims_count.entry(unit.content.vector.len()).or_insert(0) += 1;
        }
        let dims = dims_count
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(d, _)| *d)
            .unwrap_or(0);

        let mut failed = Vec::new();
        let mut usable: Vec<&Unit<EmbeddingRecord>> = Vec::new();
        for unit in units {
            if unit.content.vector.len() == dims && dims > 0 {
                usable.push(unit);
            } else {
                failed.push(unit.hash.clone());
            }
        }
        if !failed.is_empty() {
            warn!(
                stage = CLUSTER,
                dims,
                excluded = failed.len(),
                "Embeddings with a different dimensionality left out"
            );
        }

        usable.sort_by(|a, b| {
            a.content
                .chunk_hash
                .cmp(&b.content.chunk_hash)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        // One vector per chunk; a chunk embedded twice keeps its first record.
        usable.dedup_by(|b, a| a.content.chunk_hash == b.content.chunk_hash);

        let vectors: Vec<Vec<f32>> = usable.iter().map(|u| u.content.vector.clone()).collect();
        let k = self.config.k.unwrap_or_else(|| default_k(vectors.len()));
        let result = kmeans(&vectors, k, self.config.seed, self.config.max_iterations);
        debug!(
            stage = CLUSTER,
            k,
            iterations = result.iterations,
            converged = result.converged,
            "k-means finished"
        );

        let mut renumber: HashMap<usize, usize> = HashMap::new();
        let records: Vec<ClusterAssignment> = usable
            .iter()
            .zip(&result.assignments)
            .map(|(unit, raw)| {
                let next = renumber.len();
                let cluster_id = *renumber.entry(*raw).or_insert(next);
                ClusterAssignment {
                    chunk_hash: unit.content.chunk_hash.clone(),
                    cluster_id,
                }
            })
            .collect();

        let mut out = Recomputed::new(records);
        out.failed = failed;
        out.metrics.insert("clusters".to_string(), renumber.len() as u64);
        out.metrics
            .insert("iterations".to_string(), result.iterations as u64);
        Ok(out)
    }
}

/// Group committed assignments into clusters, members sorted.
pub fn current_clusters(ctx: &StageContext) -> Result<Vec<Cluster>> {
    let assignments: Vec<ClusterAssignment> = ctx.read_committed_records(CLUSTER)?;
    Ok(group_assignments(&assignments))
}

pub fn group_assignments(assignments: &[ClusterAssignment]) -> Vec<Cluster> {
    let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for a in assignments {
        groups
            .entry(a.cluster_id)
            .or_default()
            .push(a.chunk_hash.clone());
    }
    groups
        .into_iter()
        .map(|(cluster_id, mut members)| {
            members.sort();
            members.dedup();
            Cluster {
                cluster_id,
                members,
                label_terms: Vec::new(),
            }
        })
        .collect()
}

/// Identity of a cluster's content: its member set.
///
/// Renumbering alone never changes it, so a cluster that kept its members
/// keeps its summary.
pub fn cluster_content_hash(members: &[String]) -> std::result::Result<String, HashingError> {
    identity_hash(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DataLayout;
    use crate::ledger::HashLedger;
    use crate::stage::{FullRecompute, RunOptions, Stage, StageOutcome, StoredRecord};

    fn unit(chunk: &str, vector: Vec<f32>) -> Unit<EmbeddingRecord> {
        let content = EmbeddingRecord {
            chunk_hash: chunk.to_string(),
            model: "m".to_string(),
            vector,
        };
        Unit {
            hash: identity_hash(&content).unwrap(),
            content,
        }
    }

    #[tokio::test]
    async fn ids_follow_chunk_order_and_odd_dims_fail() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ctx = StageContext::new(DataLayout::new(tmp.path()));
        let stage = ClusterStage::new(ClusteringConfig {
            k: Some(2),
            ..Default::default()
        });
        let units = vec![
            unit("d", vec![0.0, 1.0]),
            unit("a", vec![1.0, 0.0]),
            unit("c", vec![0.05, 0.95]),
            unit("b", vec![0.95, 0.05]),
            unit("e", vec![1.0, 0.0, 0.0]),
        ];
        let out = stage.recompute(&ctx, &units, None).await.unwrap();

        assert_eq!(out.failed, vec![units[4].hash.clone()]);
        let ids: Vec<(&str, usize)> = out
            .records
            .iter()
            .map(|r| (r.chunk_hash.as_str(), r.cluster_id))
            .collect();
        assert_eq!(ids, vec![("a", 0), ("b", 0), ("c", 1), ("d", 1)]);
        assert_eq!(out.metrics["clusters"], 2);
    }

    /// Commit chunk and embedding artifacts for `vectors`, keyed `chunk<i>`.
    fn seed_embeddings(layout: &DataLayout, vectors: &[Vec<f32>]) {
        let chunks: Vec<StoredRecord<ChunkRecord>> = vectors
            .iter()
            .enumerate()
            .map(|(i, _)| StoredRecord {
                source_hash: format!("chat{}", i),
                record: ChunkRecord {
                    chunk_hash: format!("chunk{}", i),
                    chat_hash: format!("chat{}", i),
                    chat_title: "t".to_string(),
                    message_index: 0,
                    chunk_index: 0,
                    role: "user".to_string(),
                    text: format!("text {}", i),
                },
            })
            .collect();
        let embeddings: Vec<StoredRecord<EmbeddingRecord>> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| StoredRecord {
                source_hash: format!("chunk{}", i),
                record: EmbeddingRecord {
                    chunk_hash: format!("chunk{}", i),
                    model: "m".to_string(),
                    vector: v.clone(),
                },
            })
            .collect();
        for (stage, bytes, hashes) in [
            (
                CHUNK,
                layout.artifact(CHUNK).replace(&chunks).unwrap(),
                chunks.iter().map(|c| c.source_hash.clone()).collect::<Vec<_>>(),
            ),
            (
                EMBED,
                layout.artifact(EMBED).replace(&embeddings).unwrap(),
                embeddings.iter().map(|e| e.source_hash.clone()).collect(),
            ),
        ] {
            HashLedger::load(layout.ledger_path(stage), stage)
                .unwrap()
                .commit(hashes, bytes)
                .unwrap();
        }
    }

    fn co_members(clusters: &[Cluster], chunk: &str) -> Vec<String> {
        clusters
            .iter()
            .find(|c| c.members.iter().any(|m| m == chunk))
            .map(|c| c.members.clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn new_embedding_can_move_old_chunks() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = DataLayout::new(tmp.path());
        let ctx = StageContext::new(layout.clone());
        let stage = FullRecompute(ClusterStage::new(ClusteringConfig {
            k: Some(2),
            ..Default::default()
        }));

        // Two chunks, two clusters: each chunk is alone.
        seed_embeddings(&layout, &[vec![1.0, 0.0], vec![0.0, 1.0]]);
        let report = stage.run(&ctx, RunOptions::default()).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Recomputed);
        let before = current_clusters(&ctx).unwrap();
        assert_eq!(co_members(&before, "chunk0"), vec!["chunk0".to_string()]);
        assert_eq!(co_members(&before, "chunk1"), vec!["chunk1".to_string()]);

        // A third chunk forces two of the three to share a cluster.
        seed_embeddings(&layout, &[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.6, 0.8]]);
        let report = stage.run(&ctx, RunOptions::default()).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Recomputed);
        assert_eq!(report.processed, 3);

        let stored: Vec<StoredRecord<ClusterAssignment>> =
            ctx.layout.artifact(CLUSTER).read_all().unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|r| r.source_hash == stored[0].source_hash));

        let after = current_clusters(&ctx).unwrap();
        let moved = ["chunk0", "chunk1"]
            .iter()
            .any(|chunk| co_members(&after, chunk) != co_members(&before, chunk));
        assert!(moved, "old chunks kept their clusters: {:?}", after);

        let report = stage.run(&ctx, RunOptions::default()).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::UpToDate);
    }

    #[tokio::test]
    async fn changed_settings_trigger_a_recompute() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = DataLayout::new(tmp.path());
        let ctx = StageContext::new(layout.clone());
        seed_embeddings(&layout, &[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.6, 0.8]]);

        let one = FullRecompute(ClusterStage::new(ClusteringConfig {
            k: Some(1),
            ..Default::default()
        }));
        one.run(&ctx, RunOptions::default()).await.unwrap();
        assert_eq!(current_clusters(&ctx).unwrap().len(), 1);

        let two = FullRecompute(ClusterStage::new(ClusteringConfig {
            k: Some(2),
            ..Default::default()
        }));
        let report = two.run(&ctx, RunOptions::default()).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Recomputed);
        assert_eq!(current_clusters(&ctx).unwrap().len(), 2);
    }

    #[test]
    fn grouping_sorts_members() {
        let assignments = vec![
            ClusterAssignment {
                chunk_hash: "z".into(),
                cluster_id: 1,
            },
            ClusterAssignment {
                chunk_hash: "b".into(),
                cluster_id: 0,
            },
            ClusterAssignment {
                chunk_hash: "a".into(),
                cluster_id: 1,
            },
        ];
        let clusters = group_assignments(&assignments);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[1].members, vec!["a".to_string(), "z".to_string()]);
    }
}
