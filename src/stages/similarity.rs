//! `similarity`: nearest-neighbour edges between chat summaries.
//!
//! Vectors come from the embedding cache `position` maintains. Summaries
//! the cache lacks are embedded here and used in memory only; the cache
//! belongs to `position`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::SimilarityConfig;
use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::embedding_cache::EmbeddingCache;
use crate::error::{HashingError, Result};
use crate::models::{SimilarityEdge, SummaryKind, SummaryRecord};
use crate::stage::{RecomputeStage, Recomputed, StageContext, Unit};

use super::position::embed_summaries;
use super::{SIMILARITY, SUMMARIZE_CHATS};

pub struct SimilarityStage {
    provider: Arc<dyn EmbeddingProvider>,
    config: SimilarityConfig,
}

impl SimilarityStage {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: SimilarityConfig) -> Self {
        Self { provider, config }
    }
}

/// Top-`top_k` neighbours per node with `score >= threshold`, as undirected
/// edges (`source < target`) sorted by score descending.
pub fn nearest_edges(
    nodes: &[(String, Vec<f32>)],
    top_k: usize,
    threshold: f32,
) -> Vec<SimilarityEdge> {
    let mut edges: BTreeMap<(String, String), f32> = BTreeMap::new();
    for (i, (id, vector)) in nodes.iter().enumerate() {
        let mut scored: Vec<(f32, &str)> = nodes
            .iter()
            .enumerate()
            .filter(|(j, (other, _))| *j != i && other != id)
            .map(|(_, (other, v))| (cosine_similarity(vector, v), other.as_str()))
            .filter(|(score, _)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        for (score, other) in scored.into_iter().take(top_k) {
            let key = if id.as_str() < other {
                (id.clone(), other.to_string())
            } else {
                (other.to_string(), id.clone())
            };
            edges.insert(key, score);
        }
    }

    let mut out: Vec<SimilarityEdge> = edges
        .into_iter()
        .map(|((source, target), score)| SimilarityEdge {
            source,
            target,
            score,
        })
        .collect();
    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.target.cmp(&b.target))
    });
    out
}

#[async_trait]
impl RecomputeStage for SimilarityStage {
    type Input = SummaryRecord;
    type Output = SimilarityEdge;

    fn name(&self) -> &'static str {
        SIMILARITY
    }

    fn load_inputs(&self, ctx: &StageContext) -> Result<Vec<SummaryRecord>> {
        Ok(ctx
            .read_committed_records::<SummaryRecord>(SUMMARIZE_CHATS)?
            .into_iter()
            .filter(|s| s.kind == SummaryKind::Chat)
            .collect())
    }

    fn identity(&self, summary: &SummaryRecord) -> std::result::Result<String, HashingError> {
        Ok(summary.summary_hash.clone())
    }

    fn corpus_salt(&self) -> Option<String> {
        Some(format!(
            "{}:{}:{}:{}",
            self.provider.model_name(),
            self.provider.dims(),
            self.config.threshold,
            self.config.top_k
        ))
    }

    async fn recompute(
        &self,
        ctx: &StageContext,
        units: &[Unit<SummaryRecord>],
        _previous: Option<Vec<SimilarityEdge>>,
    ) -> Result<Recomputed<SimilarityEdge>> {
        let cache = EmbeddingCache::load(
            ctx.layout.embedding_cache_path(),
            self.provider.model_name(),
        )?;
        let missing: Vec<&Unit<SummaryRecord>> =
            units.iter().filter(|u| !cache.contains(&u.hash)).collect();
        let hits = units.len() - missing.len();
        let (computed, failed) = if missing.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            embed_summaries(self.provider.as_ref(), &missing, ctx.batch_size).await
        };
        let computed: HashMap<String, Vec<f32>> = computed.into_iter().collect();

        let mut nodes: Vec<(String, Vec<f32>)> = units
            .iter()
            .filter_map(|u| {
                let vector = cache
                    .get(&u.hash)
                    .map(<[f32]>::to_vec)
                    .or_else(|| computed.get(&u.hash).cloned())?;
                Some((u.content.subject_hash.clone(), vector))
            })
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));

        let edges = nearest_edges(&nodes, self.config.top_k, self.config.threshold);
        info!(
            stage = SIMILARITY,
            nodes = nodes.len(),
            edges = edges.len(),
            cache_hits = hits,
            cache_misses = missing.len(),
            "Similarity graph computed"
        );

        let edge_count = edges.len() as u64;
        let mut out = Recomputed::new(edges);
        out.failed = failed;
        out.metrics.insert("cache_hits".to_string(), hits as u64);
        out.metrics
            .insert("cache_misses".to_string(), missing.len() as u64);
        out.metrics.insert("edges".to_string(), edge_count);
        Ok(out)
    }
}
