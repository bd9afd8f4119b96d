//! Core data models used throughout ChatMind.
//!
//! These are the records that flow between stages. Each stage writes one of
//! them per artifact line (wrapped in [`crate::stage::StoredRecord`]).

use serde::{Deserialize, Serialize};

/// One message of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub text: String,
    /// Unix seconds, when the export carries one.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// A normalized conversation produced by `ingest`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    /// Identity hash over the messages only, so re-exports deduplicate.
    pub chat_hash: String,
    pub title: String,
    pub source_file: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    pub messages: Vec<Message>,
}

/// A piece of one message's text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub chunk_hash: String,
    pub chat_hash: String,
    pub chat_title: String,
    pub message_index: usize,
    pub chunk_index: usize,
    pub role: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingRecord {
    pub chunk_hash: String,
    pub model: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterAssignment {
    pub chunk_hash: String,
    pub cluster_id: usize,
}

/// A cluster with its member chunks, as seen by `summarize-clusters`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub cluster_id: usize,
    /// Chunk hashes, sorted.
    pub members: Vec<String>,
    #[serde(default)]
    pub label_terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagRecord {
    pub chunk_hash: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    Chat,
    Cluster,
}

impl std::fmt::Display for SummaryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SummaryKind::Chat => write!(f, "chat"),
            SummaryKind::Cluster => write!(f, "cluster"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryRecord {
    /// Hash of `kind`, `subject_hash` and `summary`; the embedding cache key.
    pub summary_hash: String,
    pub kind: SummaryKind,
    /// The chat hash or the cluster content hash being summarized.
    pub subject_hash: String,
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionRecord {
    pub summary_hash: String,
    pub kind: SummaryKind,
    pub subject_hash: String,
    pub x: f32,
    pub y: f32,
}

/// Undirected edge between two chat summaries; `source < target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarityEdge {
    pub source: String,
    pub target: String,
    pub score: f32,
}

/// A record handed to the graph sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum GraphRecord {
    Node {
        id: String,
        kind: String,
        label: String,
        properties: serde_json::Value,
    },
    Edge {
        source: String,
        target: String,
        kind: String,
        weight: f32,
    },
    Vector {
        id: String,
        model: String,
        vector: Vec<f32>,
    },
}

impl GraphRecord {
    /// Sink key: node id, `source->target:kind` for edges, `vector:id` for vectors.
    pub fn key(&self) -> String {
        match self {
            GraphRecord::Node { id, .. } => id.clone(),
            GraphRecord::Edge {
                source,
                target,
                kind,
                ..
            } => format!("{}->{}:{}", source, target, kind),
            GraphRecord::Vector { id, .. } => format!("vector:{}", id),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            GraphRecord::Node { .. } => "node",
            GraphRecord::Edge { .. } => "edge",
            GraphRecord::Vector { .. } => "vector",
        }
    }
}

/// Proof that one graph record reached the sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadReceipt {
    pub record_hash: String,
    pub key: String,
    pub kind: String,
}
