//! `position`: 2D coordinates for every chat and cluster summary.
//!
//! Summaries are embedded cache-first. Vectors the cache lacks are computed,
//! appended to the cache, and then every vector is projected onto the plane
//! and scaled into `[-1, 1]`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::embedding::EmbeddingProvider;
use crate::embedding_cache::EmbeddingCache;
use crate::error::{HashingError, Result};
use crate::hashing::ensure_finite;
use crate::layout::DataLayout;
use crate::models::{PositionRecord, SummaryKind, SummaryRecord};
use crate::projection::{normalize_unit_square, Projector};
use crate::stage::{RecomputeStage, Recomputed, StageContext, Unit};

use super::cluster::{cluster_content_hash, current_clusters};
use super::{POSITION, SUMMARIZE_CHATS, SUMMARIZE_CLUSTERS};

/// The text embedded for a summary.
pub fn summary_text(summary: &SummaryRecord) -> String {
    format!("{}\n\n{}", summary.title, summary.summary)
}

/// Embed `missing` summaries with one provider request per `request_size`.
///
/// Returns the vectors that came back and the hashes whose request failed.
pub(crate) async fn embed_summaries(
    provider: &dyn EmbeddingProvider,
    missing: &[&Unit<SummaryRecord>],
    request_size: usize,
) -> (Vec<(String, Vec<f32>)>, Vec<String>) {
    let mut vectors = Vec::with_capacity(missing.len());
    let mut failed = Vec::new();
    for request in missing.chunks(request_size.max(1)) {
        let texts: Vec<String> = request.iter().map(|u| summary_text(&u.content)).collect();
        match provider.embed(&texts).await {
            Ok(batch) if batch.len() == request.len() => {
                for (unit, vector) in request.iter().zip(batch) {
                    if ensure_finite(&vector).is_ok() {
                        vectors.push((unit.hash.clone(), vector));
                    } else {
                        failed.push(unit.hash.clone());
                    }
                }
            }
            Ok(batch) => {
                warn!(
                    expected = request.len(),
                    got = batch.len(),
                    "Embedding response size mismatch"
                );
                failed.extend(request.iter().map(|u| u.hash.clone()));
            }
            Err(e) => {
                warn!(error = %e, units = request.len(), "Summary embedding request failed");
                failed.extend(request.iter().map(|u| u.hash.clone()));
            }
        }
    }
    (vectors, failed)
}

pub struct PositionStage {
    provider: Arc<dyn EmbeddingProvider>,
    projector: Arc<dyn Projector>,
}

impl PositionStage {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, projector: Arc<dyn Projector>) -> Self {
        Self {
            provider,
            projector,
        }
    }
}

#[async_trait]
impl RecomputeStage for PositionStage {
    type Input = SummaryRecord;
    type Output = PositionRecord;

    fn name(&self) -> &'static str {
        POSITION
    }

    /// Chat summaries plus the summaries of clusters that still exist.
    fn load_inputs(&self, ctx: &StageContext) -> Result<Vec<SummaryRecord>> {
        let mut summaries: Vec<SummaryRecord> = ctx.read_committed_records(SUMMARIZE_CHATS)?;
        let live: HashSet<String> = current_clusters(ctx)?
            .iter()
            .filter_map(|c| cluster_content_hash(&c.members).ok())
            .collect();
        summaries.extend(
            ctx.read_committed_records::<SummaryRecord>(SUMMARIZE_CLUSTERS)?
                .into_iter()
                .filter(|s| s.kind == SummaryKind::Cluster && live.contains(&s.subject_hash)),
        );
        Ok(summaries)
    }

    fn identity(&self, summary: &SummaryRecord) -> std::result::Result<String, HashingError> {
        Ok(summary.summary_hash.clone())
    }

    fn corpus_salt(&self) -> Option<String> {
        Some(format!(
            "{}:{}",
            self.provider.model_name(),
            self.provider.dims()
        ))
    }

    async fn recompute(
        &self,
        ctx: &StageContext,
        units: &[Unit<SummaryRecord>],
        _previous: Option<Vec<PositionRecord>>,
    ) -> Result<Recomputed<PositionRecord>> {
        let mut cache = EmbeddingCache::load(
            ctx.layout.embedding_cache_path(),
            self.provider.model_name(),
        )?;
        let missing: Vec<&Unit<SummaryRecord>> =
            units.iter().filter(|u| !cache.contains(&u.hash)).collect();
        let hits = units.len() - missing.len();

        let (fresh, mut failed) =
            embed_summaries(self.provider.as_ref(), &missing, ctx.batch_size).await;
        let added = cache.insert_many(fresh)?;
        info!(
            stage = POSITION,
            cache_hits = hits,
            cache_misses = missing.len(),
            cached = added,
            "Summary vectors resolved"
        );

        let mut placed: Vec<&Unit<SummaryRecord>> = units
            .iter()
            .filter(|u| cache.contains(&u.hash))
            .collect();
        placed.sort_by(|a, b| a.hash.cmp(&b.hash));

        // The cache only holds vectors of the active model, but a provider can
        // still change its output size; keep the dominant one.
        let mut dims_count: HashMap<usize, usize> = HashMap::new();
        for unit in &placed {
            if let Some(v) = cache.get(&unit.hash) {
                *dims_count.entry(v.len()).or_insert(0) += 1;
            }
        }
        let dims = dims_count
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(d, _)| d)
            .unwrap_or(0);

        let mut vectors = Vec::with_capacity(placed.len());
        let mut kept = Vec::with_capacity(placed.len());
        for unit in placed {
            match cache.get(&unit.hash) {
                Some(v) if v.len() == dims => {
                    vectors.push(v.to_vec());
                    kept.push(unit);
                }
                _ => failed.push(unit.hash.clone()),
            }
        }

        let mut points = self.projector.project(&vectors);
        normalize_unit_square(&mut points);
        let records = kept
            .iter()
            .zip(points)
            .map(|(unit, [x, y])| PositionRecord {
                summary_hash: unit.content.summary_hash.clone(),
                kind: unit.content.kind,
                subject_hash: unit.content.subject_hash.clone(),
                x,
                y,
            })
            .collect();

        let mut out = Recomputed::new(records);
        out.failed = failed;
        out.metrics.insert("cache_hits".to_string(), hits as u64);
        out.metrics
            .insert("cache_misses".to_string(), missing.len() as u64);
        Ok(out)
    }

    fn owned_paths(&self, layout: &DataLayout) -> Vec<PathBuf> {
        vec![layout.embedding_cache_path()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedProvider;
    use crate::projection::PcaProjector;

    fn summary(hash: &str, text: &str) -> Unit<SummaryRecord> {
        Unit {
            hash: hash.to_string(),
            content: SummaryRecord {
                summary_hash: hash.to_string(),
                kind: SummaryKind::Chat,
                subject_hash: format!("chat-{}", hash),
                title: "t".to_string(),
                summary: text.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn second_recompute_is_served_from_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ctx = StageContext::new(DataLayout::new(tmp.path()));
        let stage = PositionStage::new(
            Arc::new(HashedProvider::new(32)),
            Arc::new(PcaProjector::default()),
        );
        let units = vec![
            summary("a", "rust lifetimes and borrowing"),
            summary("b", "sourdough bread baking"),
            summary("c", "async rust executors"),
        ];

        let first = stage.recompute(&ctx, &units, None).await.unwrap();
        assert_eq!(first.metrics["cache_misses"], 3);
        assert_eq!(first.records.len(), 3);
        assert!(first
            .records
            .iter()
            .all(|r| (-1.0..=1.0).contains(&r.x) && (-1.0..=1.0).contains(&r.y)));

        let second = stage.recompute(&ctx, &units, None).await.unwrap();
        assert_eq!(second.metrics["cache_hits"], 3);
        assert_eq!(second.metrics["cache_misses"], 0);
        assert_eq!(first.records, second.records);
    }
}
