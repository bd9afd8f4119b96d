//! `summarize-chats` and `summarize-clusters`.
//!
//! Both write [`SummaryRecord`]s. A summary's hash covers its kind, its
//! subject and its text, and is the key under which `position` caches the
//! summary's embedding.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{HashingError, ProcessingError, Result};
use crate::hashing::identity_hash;
use crate::llm::{top_terms, Annotator};
use crate::models::{Chat, ChunkRecord, Cluster, SummaryKind, SummaryRecord};
use crate::stage::{AppendStage, StageContext, Unit, UnitResult};

use super::cluster::{cluster_content_hash, current_clusters};
use super::{CHUNK, INGEST, SUMMARIZE_CHATS, SUMMARIZE_CLUSTERS};

/// Text handed to the annotator is cut at this many characters.
const MAX_INPUT_CHARS: usize = 12_000;
const LABEL_TERMS: usize = 5;

#[derive(Serialize)]
struct SummaryIdentity<'a> {
    kind: SummaryKind,
    subject_hash: &'a str,
    summary: &'a str,
}

fn summary_record(
    kind: SummaryKind,
    subject_hash: &str,
    title: String,
    summary: String,
) -> std::result::Result<SummaryRecord, HashingError> {
    let summary_hash = identity_hash(&SummaryIdentity {
        kind,
        subject_hash,
        summary: &summary,
    })?;
    Ok(SummaryRecord {
        summary_hash,
        kind,
        subject_hash: subject_hash.to_string(),
        title,
        summary,
    })
}

fn capped(text: String) -> String {
    match text.char_indices().nth(MAX_INPUT_CHARS) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text,
    }
}

pub struct ChatSummaryStage {
    annotator: Arc<dyn Annotator>,
}

impl ChatSummaryStage {
    pub fn new(annotator: Arc<dyn Annotator>) -> Self {
        Self { annotator }
    }
}

#[async_trait]
impl AppendStage for ChatSummaryStage {
    type Input = Chat;
    type Output = SummaryRecord;

    fn name(&self) -> &'static str {
        SUMMARIZE_CHATS
    }

    fn load_inputs(&self, ctx: &StageContext) -> Result<Vec<Chat>> {
        ctx.read_committed_records(INGEST)
    }

    fn identity(&self, chat: &Chat) -> std::result::Result<String, HashingError> {
        identity_hash(&chat.messages)
    }

    async fn process(&self, _ctx: &StageContext, unit: &Unit<Chat>) -> UnitResult<SummaryRecord> {
        let chat = &unit.content;
        let transcript = chat
            .messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let summary = self
            .annotator
            .summarize(&chat.title, &capped(transcript))
            .await
            .map_err(|e| ProcessingError::new(&unit.hash, e))?;
        let record = summary_record(
            SummaryKind::Chat,
            &chat.chat_hash,
            chat.title.clone(),
            summary,
        )
        .map_err(|e| ProcessingError::new(&unit.hash, e))?;
        Ok(vec![record])
    }

    fn keyed_outputs(&self) -> bool {
        true
    }

    fn output_key(&self, record: &SummaryRecord) -> Option<String> {
        Some(record.subject_hash.clone())
    }
}

/// A cluster together with the text of its members.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterInput {
    pub cluster: Cluster,
    pub texts: Vec<String>,
}

pub struct ClusterSummaryStage {
    annotator: Arc<dyn Annotator>,
}

impl ClusterSummaryStage {
    pub fn new(annotator: Arc<dyn Annotator>) -> Self {
        Self { annotator }
    }
}

#[async_trait]
impl AppendStage for ClusterSummaryStage {
    type Input = ClusterInput;
    type Output = SummaryRecord;

    fn name(&self) -> &'static str {
        SUMMARIZE_CLUSTERS
    }

    fn load_inputs(&self, ctx: &StageContext) -> Result<Vec<ClusterInput>> {
        let chunks: HashMap<String, String> = ctx
            .read_committed_records::<ChunkRecord>(CHUNK)?
            .into_iter()
            .map(|c| (c.chunk_hash, c.text))
            .collect();
        Ok(current_clusters(ctx)?
            .into_iter()
            .map(|mut cluster| {
                let texts: Vec<String> = cluster
                    .members
                    .iter()
                    .filter_map(|h| chunks.get(h).cloned())
                    .collect();
                cluster.label_terms = top_terms(texts.iter().map(String::as_str), LABEL_TERMS);
                ClusterInput { cluster, texts }
            })
            .collect())
    }

    /// The member set. A cluster whose members changed is a new cluster.
    fn identity(&self, input: &ClusterInput) -> std::result::Result<String, HashingError> {
        cluster_content_hash(&input.cluster.members)
    }

    async fn process(
        &self,
        _ctx: &StageContext,
        unit: &Unit<ClusterInput>,
    ) -> UnitResult<SummaryRecord> {
        let cluster = &unit.content.cluster;
        let title = if cluster.label_terms.is_empty() {
            format!("Cluster {}", cluster.cluster_id)
        } else {
            format!("Cluster: {}", cluster.label_terms.join(", "))
        };
        let summary = self
            .annotator
            .summarize(&title, &capped(unit.content.texts.join("\n\n")))
            .await
            .map_err(|e| ProcessingError::new(&unit.hash, e))?;
        let record = summary_record(SummaryKind::Cluster, &unit.hash, title, summary)
            .map_err(|e| ProcessingError::new(&unit.hash, e))?;
        Ok(vec![record])
    }

    fn keyed_outputs(&self) -> bool {
        true
    }

    fn output_key(&self, record: &SummaryRecord) -> Option<String> {
        Some(record.subject_hash.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DataLayout;
    use crate::llm::ExtractiveAnnotator;
    use crate::models::Message;

    #[tokio::test]
    async fn chat_summary_hash_tracks_text() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ctx = StageContext::new(DataLayout::new(tmp.path()));
        let stage = ChatSummaryStage::new(Arc::new(ExtractiveAnnotator));
        let chat = Chat {
            chat_hash: "c1".to_string(),
            title: "Rust".to_string(),
            source_file: "a.json".to_string(),
            created_at: None,
            messages: vec![Message {
                role: "user".to_string(),
                text: "How do lifetimes work? Tell me more.".to_string(),
                timestamp: None,
            }],
        };
        let unit = Unit {
            hash: stage.identity(&chat).unwrap(),
            content: chat,
        };
        let out = stage.process(&ctx, &unit).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, SummaryKind::Chat);
        assert_eq!(out[0].subject_hash, "c1");
        assert!(out[0].summary.contains("lifetimes"));

        let again = summary_record(
            SummaryKind::Chat,
            "c1",
            "Rust".to_string(),
            out[0].summary.clone(),
        )
        .unwrap();
        assert_eq!(again.summary_hash, out[0].summary_hash);
        let other = summary_record(SummaryKind::Chat, "c1", "Rust".to_string(), "x".into()).unwrap();
        assert_ne!(other.summary_hash, out[0].summary_hash);
    }

    #[test]
    fn cluster_identity_ignores_numbering() {
        let stage = ClusterSummaryStage::new(Arc::new(ExtractiveAnnotator));
        let input = |id| ClusterInput {
            cluster: Cluster {
                cluster_id: id,
                members: vec!["a".into(), "b".into()],
                label_terms: Vec::new(),
            },
            texts: Vec::new(),
        };
        assert_eq!(
            stage.identity(&input(0)).unwrap(),
            stage.identity(&input(3)).unwrap()
        );
    }
}
