//! `load`: deliver the knowledge graph to the sink.
//!
//! Graph records are rebuilt from every committed artifact on each run and
//! hashed as a whole, so a record whose content changed upstream (a chat's
//! coordinates after a re-layout, say) is a new unit and is upserted again,
//! while unchanged records are skipped by the ledger.
//!
//! Cluster nodes, `in_cluster` edges and `similar` edges come from
//! recomputed aggregates. After every run they are handed to the sink as a
//! complete set, which deletes whatever the previous aggregate left behind.
//!
//! Node ids: chats and chunks use their hashes, tags are `tag:<name>`,
//! clusters are `cluster:<content hash>`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::error::{PipelineError, ProcessingError, Result};
use crate::models::{
    Chat, ChunkRecord, EmbeddingRecord, GraphRecord, LoadReceipt, PositionRecord,
    SimilarityEdge, SummaryKind, SummaryRecord, TagRecord,
};
use crate::sink::GraphSink;
use crate::stage::{AppendStage, StageContext, Unit, UnitResult};

use super::cluster::{cluster_content_hash, current_clusters};
use super::{
    CHUNK, EMBED, INGEST, LOAD, POSITION, SIMILARITY, SUMMARIZE_CHATS, SUMMARIZE_CLUSTERS, TAG,
};

const LABEL_CHARS: usize = 80;

/// Node and edge kinds replaced as a whole on every run.
const DERIVED_NODE_KINDS: &[&str] = &["cluster"];
const DERIVED_EDGE_KINDS: &[&str] = &["in_cluster", "similar"];

fn is_derived(record: &GraphRecord) -> bool {
    match record {
        GraphRecord::Node { kind, .. } => DERIVED_NODE_KINDS.contains(&kind.as_str()),
        GraphRecord::Edge { kind, .. } => DERIVED_EDGE_KINDS.contains(&kind.as_str()),
        GraphRecord::Vector { .. } => false,
    }
}

pub struct LoadStage {
    sink: Arc<dyn GraphSink>,
}

impl LoadStage {
    pub fn new(sink: Arc<dyn GraphSink>) -> Self {
        Self { sink }
    }
}

fn label(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    match line.char_indices().nth(LABEL_CHARS) {
        Some((idx, _)) => format!("{}…", &line[..idx]),
        None => line.to_string(),
    }
}

fn edge(source: &str, target: &str, kind: &str, weight: f32) -> GraphRecord {
    GraphRecord::Edge {
        source: source.to_string(),
        target: target.to_string(),
        kind: kind.to_string(),
        weight,
    }
}

/// Assemble the graph from everything committed upstream.
pub fn build_graph(ctx: &StageContext) -> Result<Vec<GraphRecord>> {
    let chats: Vec<Chat> = ctx.read_committed_records(INGEST)?;
    let chunks: Vec<ChunkRecord> = ctx.read_committed_records(CHUNK)?;
    let embeddings: Vec<EmbeddingRecord> = ctx.read_committed_records(EMBED)?;
    let tags: Vec<TagRecord> = ctx.read_committed_records(TAG)?;
    let mut summaries: Vec<SummaryRecord> = ctx.read_committed_records(SUMMARIZE_CHATS)?;
    summaries.extend(ctx.read_committed_records::<SummaryRecord>(SUMMARIZE_CLUSTERS)?);
    let positions: Vec<PositionRecord> = ctx.read_committed_records(POSITION)?;
    let similar: Vec<SimilarityEdge> = ctx.read_committed_records(SIMILARITY)?;
    let clusters = current_clusters(ctx)?;

    let summary_of: HashMap<(SummaryKind, &str), &SummaryRecord> = summaries
        .iter()
        .map(|s| ((s.kind, s.subject_hash.as_str()), s))
        .collect();
    let position_of: HashMap<(SummaryKind, &str), &PositionRecord> = positions
        .iter()
        .map(|p| ((p.kind, p.subject_hash.as_str()), p))
        .collect();

    let mut records = Vec::new();

    for chat in &chats {
        let key = (SummaryKind::Chat, chat.chat_hash.as_str());
        let position = position_of.get(&key);
        records.push(GraphRecord::Node {
            id: chat.chat_hash.clone(),
            kind: "chat".to_string(),
            label: chat.title.clone(),
            properties: json!({
                "source_file": chat.source_file,
                "created_at": chat.created_at,
                "messages": chat.messages.len(),
                "summary": summary_of.get(&key).map(|s| s.summary.as_str()),
                "x": position.map(|p| p.x),
                "y": position.map(|p| p.y),
            }),
        });
    }

    for chunk in &chunks {
        records.push(GraphRecord::Node {
            id: chunk.chunk_hash.clone(),
            kind: "chunk".to_string(),
            label: label(&chunk.text),
            properties: json!({
                "role": chunk.role,
                "message_index": chunk.message_index,
                "chunk_index": chunk.chunk_index,
                "text": chunk.text,
            }),
        });
        records.push(edge(&chunk.chunk_hash, &chunk.chat_hash, "part_of", 1.0));
    }

    let mut tag_names = BTreeSet::new();
    for record in &tags {
        for tag in &record.tags {
            let id = format!("tag:{}", tag);
            records.push(edge(&record.chunk_hash, &id, "tagged", 1.0));
            tag_names.insert(tag.clone());
        }
    }
    for tag in tag_names {
        records.push(GraphRecord::Node {
            id: format!("tag:{}", tag),
            kind: "tag".to_string(),
            label: tag,
            properties: json!({}),
        });
    }

    for cluster in &clusters {
        let Ok(content_hash) = cluster_content_hash(&cluster.members) else {
            continue;
        };
        let key = (SummaryKind::Cluster, content_hash.as_str());
        let summary = summary_of.get(&key);
        let position = position_of.get(&key);
        let id = format!("cluster:{}", content_hash);
        records.push(GraphRecord::Node {
            id: id.clone(),
            kind: "cluster".to_string(),
            label: summary
                .map(|s| s.title.clone())
                .unwrap_or_else(|| format!("Cluster {}", cluster.cluster_id)),
            properties: json!({
                "cluster_id": cluster.cluster_id,
                "size": cluster.members.len(),
                "summary": summary.map(|s| s.summary.as_str()),
                "x": position.map(|p| p.x),
                "y": position.map(|p| p.y),
            }),
        });
        for member in &cluster.members {
            records.push(edge(member, &id, "in_cluster", 1.0));
        }
    }

    for e in &similar {
        records.push(edge(&e.source, &e.target, "similar", e.score));
    }

    for embedding in embeddings {
        records.push(GraphRecord::Vector {
            id: embedding.chunk_hash,
            model: embedding.model,
            vector: embedding.vector,
        });
    }

    Ok(records)
}

#[async_trait]
impl AppendStage for LoadStage {
    type Input = GraphRecord;
    type Output = LoadReceipt;

    fn name(&self) -> &'static str {
        LOAD
    }

    fn load_inputs(&self, ctx: &StageContext) -> Result<Vec<GraphRecord>> {
        build_graph(ctx)
    }

    async fn process(&self, _ctx: &StageContext, unit: &Unit<GraphRecord>) -> UnitResult<LoadReceipt> {
        self.sink
            .upsert(std::slice::from_ref(&unit.content))
            .await
            .map_err(|e| ProcessingError::new(&unit.hash, e))?;
        Ok(vec![receipt(unit)])
    }

    /// One sink transaction per batch. A sink error fails the whole batch.
    async fn process_batch(
        &self,
        _ctx: &StageContext,
        units: &[Unit<GraphRecord>],
    ) -> Result<Vec<UnitResult<LoadReceipt>>> {
        let batch: Vec<GraphRecord> = units.iter().map(|u| u.content.clone()).collect();
        self.sink
            .upsert(&batch)
            .await
            .map_err(|e| PipelineError::batch(LOAD, e))?;
        Ok(units.iter().map(|u| Ok(vec![receipt(u)])).collect())
    }

    async fn finish(&self, ctx: &StageContext) -> Result<()> {
        let derived: Vec<GraphRecord> = build_graph(ctx)?
            .into_iter()
            .filter(is_derived)
            .collect();
        let removed = self
            .sink
            .replace_derived(DERIVED_NODE_KINDS, DERIVED_EDGE_KINDS, &derived)
            .await
            .map_err(|e| PipelineError::batch(LOAD, e))?;
        if removed > 0 {
            info!(stage = LOAD, removed, "Retracted records of the previous aggregates");
        }
        Ok(())
    }
}

fn receipt(unit: &Unit<GraphRecord>) -> LoadReceipt {
    LoadReceipt {
        record_hash: unit.hash.clone(),
        key: unit.content.key(),
        kind: unit.content.kind_name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DataLayout;
    use crate::sink::SqliteGraphSink;
    use crate::stage::{AppendOnly, RunOptions, Stage};
    use crate::stages::CLUSTER;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        calls: AtomicUsize,
        records: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl GraphSink for Recording {
        fn name(&self) -> &str {
            "recording"
        }
        async fn upsert(&self, batch: &[GraphRecord]) -> Result<()> {
            if self.fail {
                return Err(PipelineError::Sink("unreachable".to_string()));
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.records.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        }

        async fn replace_derived(
            &self,
            _node_kinds: &[&str],
            _edge_kinds: &[&str],
            _records: &[GraphRecord],
        ) -> Result<u64> {
            Ok(0)
        }
    }

    fn seed_chunks(layout: &DataLayout) {
        let chunks: Vec<crate::stage::StoredRecord<ChunkRecord>> = (0..3)
            .map(|i| crate::stage::StoredRecord {
                source_hash: "chat".to_string(),
                record: ChunkRecord {
                    chunk_hash: format!("chunk{}", i),
                    chat_hash: "chat".to_string(),
                    chat_title: "t".to_string(),
                    message_index: i,
                    chunk_index: 0,
                    role: "user".to_string(),
                    text: format!("text {}", i),
                },
            })
            .collect();
        let bytes = layout.artifact(CHUNK).append(&chunks).unwrap();
        crate::ledger::HashLedger::load(layout.ledger_path(CHUNK), CHUNK)
            .unwrap()
            .commit(vec!["chat".to_string()], bytes)
            .unwrap();
    }

    #[tokio::test]
    async fn one_upsert_per_batch_then_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = DataLayout::new(tmp.path());
        seed_chunks(&layout);
        let sink = Arc::new(Recording {
            calls: AtomicUsize::new(0),
            records: AtomicUsize::new(0),
            fail: false,
        });
        let ctx = StageContext::new(layout).with_batch_size(4);
        let stage = AppendOnly(LoadStage::new(sink.clone()));

        // 3 chunk nodes + 3 part_of edges
        let report = stage.run(&ctx, RunOptions::default()).await.unwrap();
        assert_eq!(report.processed, 6);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.records.load(Ordering::SeqCst), 6);

        let report = stage.run(&ctx, RunOptions::default()).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    fn write_clusters(layout: &DataLayout, groups: &[&[usize]]) {
        let records: Vec<crate::stage::StoredRecord<crate::models::ClusterAssignment>> = groups
            .iter()
            .enumerate()
            .flat_map(|(cluster_id, members)| {
                members.iter().map(move |i| crate::stage::StoredRecord {
                    source_hash: "corpus".to_string(),
                    record: crate::models::ClusterAssignment {
                        chunk_hash: format!("chunk{}", i),
                        cluster_id,
                    },
                })
            })
            .collect();
        layout.artifact(CLUSTER).replace(&records).unwrap();
        crate::ledger::CorpusStamp::new(CLUSTER, format!("{:?}", groups), records.len())
            .write(&layout.stamp_path(CLUSTER))
            .unwrap();
    }

    async fn memberships(sink: &SqliteGraphSink) -> Vec<(String, String)> {
        sqlx::query_as(
            "SELECT source, target FROM edges WHERE kind = 'in_cluster' ORDER BY source",
        )
        .fetch_all(sink.pool())
        .await
        .unwrap()
    }

    async fn cluster_nodes(sink: &SqliteGraphSink) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM nodes WHERE kind = 'cluster'")
            .fetch_one(sink.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reclustering_leaves_one_membership_per_chunk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = DataLayout::new(tmp.path().join("data"));
        seed_chunks(&layout);
        let sink = Arc::new(
            SqliteGraphSink::open(&tmp.path().join("graph.sqlite"))
                .await
                .unwrap(),
        );
        let ctx = StageContext::new(layout.clone());
        let stage = AppendOnly(LoadStage::new(sink.clone()));

        write_clusters(&layout, &[&[0, 1], &[2]]);
        stage.run(&ctx, RunOptions::default()).await.unwrap();
        let first = memberships(&sink).await;
        assert_eq!(first.len(), 3);
        assert_eq!(cluster_nodes(&sink).await, 2);

        write_clusters(&layout, &[&[0], &[1, 2]]);
        stage.run(&ctx, RunOptions::default()).await.unwrap();
        let second = memberships(&sink).await;
        assert_eq!(second.len(), 3);
        assert_ne!(second, first);
        assert_eq!(cluster_nodes(&sink).await, 2);

        // The first grouping comes back: its records are already in the
        // load ledger, yet they must reappear in the graph.
        write_clusters(&layout, &[&[0, 1], &[2]]);
        let report = stage.run(&ctx, RunOptions::default()).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(memberships(&sink).await, first);
        assert_eq!(cluster_nodes(&sink).await, 2);
    }

    #[tokio::test]
    async fn sink_failure_aborts_without_commit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = DataLayout::new(tmp.path());
        seed_chunks(&layout);
        let sink = Arc::new(Recording {
            calls: AtomicUsize::new(0),
            records: AtomicUsize::new(0),
            fail: true,
        });
        let ctx = StageContext::new(layout);
        let stage = AppendOnly(LoadStage::new(sink));

        let err = stage.run(&ctx, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::BatchFailure { .. }));
        let ledger = crate::ledger::HashLedger::load(ctx.layout.ledger_path(LOAD), LOAD).unwrap();
        assert!(ledger.is_empty());
    }
}
