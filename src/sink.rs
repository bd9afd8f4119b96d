//! Graph sink: where the `load` stage delivers nodes, edges and vectors.
//!
//! [`GraphSink`] is the seam; [`SqliteGraphSink`] is the store that ships.
//! Every write is an upsert keyed by identity hashes, so replaying a batch
//! after a crash leaves the store unchanged. Records derived from recomputed
//! aggregates (cluster nodes, cluster membership and similarity edges) are
//! replaced as a set through [`GraphSink::replace_derived`], so a recompute
//! never leaves the previous aggregate behind.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;

use crate::db;
use crate::embedding::vec_to_blob;
use crate::error::Result;
use crate::migrate;
use crate::models::GraphRecord;

/// Destination for graph records.
#[async_trait]
pub trait GraphSink: Send + Sync {
    fn name(&self) -> &str;

    /// Write one batch. Either the whole batch lands or an error is returned.
    async fn upsert(&self, batch: &[GraphRecord]) -> Result<()>;

    /// Make `records` the complete set of nodes of `node_kinds` and edges of
    /// `edge_kinds`: upsert them and delete every other row of those kinds.
    /// Returns the number of rows deleted.
    async fn replace_derived(
        &self,
        node_kinds: &[&str],
        edge_kinds: &[&str],
        records: &[GraphRecord],
    ) -> Result<u64>;
}

/// Row counts of the SQLite graph store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkCounts {
    pub nodes: i64,
    pub edges: i64,
    pub vectors: i64,
}

pub struct SqliteGraphSink {
    pool: SqlitePool,
}

impl SqliteGraphSink {
    /// Connect and create the schema when missing.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn counts(&self) -> Result<SinkCounts> {
        let nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?;
        let edges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edges")
            .fetch_one(&self.pool)
            .await?;
        let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(SinkCounts {
            nodes,
            edges,
            vectors,
        })
    }
}

/// Upsert one record on an open connection or transaction.
async fn write_record(conn: &mut SqliteConnection, record: &GraphRecord, now: i64) -> Result<()> {
    match record {
        GraphRecord::Node {
            id,
            kind,
            label,
            properties,
        } => {
            sqlx::query(
                r#"
                INSERT INTO nodes (id, kind, label, properties_json, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    label = excluded.label,
                    properties_json = excluded.properties_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(id)
            .bind(kind)
            .bind(label)
            .bind(properties.to_string())
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        GraphRecord::Edge {
            source,
            target,
            kind,
            weight,
        } => {
            sqlx::query(
                r#"
                INSERT INTO edges (source, target, kind, weight, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(source, target, kind) DO UPDATE SET
                    weight = excluded.weight,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(source)
            .bind(target)
            .bind(kind)
            .bind(f64::from(*weight))
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        GraphRecord::Vector { id, model, vector } => {
            sqlx::query(
                r#"
                INSERT INTO vectors (id, model, dims, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(id)
            .bind(model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl GraphSink for SqliteGraphSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, batch: &[GraphRecord]) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for record in batch {
            write_record(&mut *tx, record, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_derived(
        &self,
        node_kinds: &[&str],
        edge_kinds: &[&str],
        records: &[GraphRecord],
    ) -> Result<u64> {
        let now = Utc::now().timestamp();
        let mut keep_nodes = HashSet::new();
        let mut keep_edges = HashSet::new();
        for record in records {
            match record {
                GraphRecord::Node { id, .. } => {
                    keep_nodes.insert(id.as_str());
                }
                GraphRecord::Edge {
                    source,
                    target,
                    kind,
                    ..
                } => {
                    keep_edges.insert((source.as_str(), target.as_str(), kind.as_str()));
                }
                GraphRecord::Vector { .. } => {}
            }
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            write_record(&mut *tx, record, now).await?;
        }

        let mut removed = 0u64;
        for kind in node_kinds {
            let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM nodes WHERE kind = ?")
                .bind(*kind)
                .fetch_all(&mut *tx)
                .await?;
            for id in ids.iter().filter(|id| !keep_nodes.contains(id.as_str())) {
                removed += sqlx::query("DELETE FROM nodes WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
        }
        for kind in edge_kinds {
            let pairs: Vec<(String, String)> =
                sqlx::query_as("SELECT source, target FROM edges WHERE kind = ?")
                    .bind(*kind)
                    .fetch_all(&mut *tx)
                    .await?;
            for (source, target) in pairs
                .iter()
                .filter(|(s, t)| !keep_edges.contains(&(s.as_str(), t.as_str(), *kind)))
            {
                removed += sqlx::query(
                    "DELETE FROM edges WHERE source = ? AND target = ? AND kind = ?",
                )
                .bind(source)
                .bind(target)
                .bind(*kind)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
        }

        tx.commit().await?;
        Ok(removed)
    }
}

/// A [`SqliteGraphSink`] opened on first write.
///
/// Runs that have nothing to load never create the database file.
pub struct LazySqliteSink {
    path: PathBuf,
    cell: OnceCell<SqliteGraphSink>,
}

impl LazySqliteSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cell: OnceCell::new(),
        }
    }

    async fn get(&self) -> Result<&SqliteGraphSink> {
        self.cell
            .get_or_try_init(|| SqliteGraphSink::open(&self.path))
            .await
    }
}

#[async_trait]
impl GraphSink for LazySqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, batch: &[GraphRecord]) -> Result<()> {
        self.get().await?.upsert(batch).await
    }

    async fn replace_derived(
        &self,
        node_kinds: &[&str],
        edge_kinds: &[&str],
        records: &[GraphRecord],
    ) -> Result<u64> {
        if records.is_empty() && self.cell.get().is_none() && !self.path.exists() {
            return Ok(0);
        }
        self.get()
            .await?
            .replace_derived(node_kinds, edge_kinds, records)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn node(id: &str, label: &str) -> GraphRecord {
        GraphRecord::Node {
            id: id.to_string(),
            kind: "chat".to_string(),
            label: label.to_string(),
            properties: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let sink = SqliteGraphSink::open(&tmp.path().join("g.sqlite"))
            .await
            .unwrap();
        let batch = vec![
            node("a", "A"),
            node("b", "B"),
            GraphRecord::Edge {
                source: "a".to_string(),
                target: "b".to_string(),
                kind: "similar".to_string(),
                weight: 0.9,
            },
            GraphRecord::Vector {
                id: "a".to_string(),
                model: "m".to_string(),
                vector: vec![0.1, 0.2],
            },
        ];
        sink.upsert(&batch).await.unwrap();
        sink.upsert(&batch).await.unwrap();
        assert_eq!(
            sink.counts().await.unwrap(),
            SinkCounts {
                nodes: 2,
                edges: 1,
                vectors: 1
            }
        );
    }

    #[tokio::test]
    async fn upsert_updates_labels() {
        let tmp = TempDir::new().unwrap();
        let sink = SqliteGraphSink::open(&tmp.path().join("g.sqlite"))
            .await
            .unwrap();
        sink.upsert(&[node("a", "old")]).await.unwrap();
        sink.upsert(&[node("a", "new")]).await.unwrap();
        let label: String = sqlx::query_scalar("SELECT label FROM nodes WHERE id = 'a'")
            .fetch_one(sink.pool())
            .await
            .unwrap();
        assert_eq!(label, "new");
    }

    fn edge(source: &str, target: &str, kind: &str) -> GraphRecord {
        GraphRecord::Edge {
            source: source.to_string(),
            target: target.to_string(),
            kind: kind.to_string(),
            weight: 1.0,
        }
    }

    #[tokio::test]
    async fn replace_derived_drops_rows_missing_from_the_new_set() {
        let tmp = TempDir::new().unwrap();
        let sink = SqliteGraphSink::open(&tmp.path().join("g.sqlite"))
            .await
            .unwrap();
        let cluster = |id: &str| GraphRecord::Node {
            id: id.to_string(),
            kind: "cluster".to_string(),
            label: id.to_string(),
            properties: serde_json::json!({}),
        };
        sink.upsert(&[
            node("chunk1", "c1"),
            cluster("cluster:old"),
            edge("chunk1", "cluster:old", "in_cluster"),
            edge("chunk1", "chat", "part_of"),
        ])
        .await
        .unwrap();

        let removed = sink
            .replace_derived(
                &["cluster"],
                &["in_cluster"],
                &[
                    cluster("cluster:new"),
                    edge("chunk1", "cluster:new", "in_cluster"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let memberships: Vec<String> =
            sqlx::query_scalar("SELECT target FROM edges WHERE kind = 'in_cluster'")
                .fetch_all(sink.pool())
                .await
                .unwrap();
        assert_eq!(memberships, vec!["cluster:new".to_string()]);
        let clusters: Vec<String> = sqlx::query_scalar("SELECT id FROM nodes WHERE kind = 'cluster'")
            .fetch_all(sink.pool())
            .await
            .unwrap();
        assert_eq!(clusters, vec!["cluster:new".to_string()]);
        // Kinds outside the derived set are untouched.
        assert_eq!(
            sink.counts().await.unwrap(),
            SinkCounts {
                nodes: 2,
                edges: 2,
                vectors: 0
            }
        );
    }

    #[tokio::test]
    async fn lazy_sink_skips_an_empty_replace_before_any_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("graph.sqlite");
        let sink = LazySqliteSink::new(&path);
        let removed = sink
            .replace_derived(&["cluster"], &["in_cluster"], &[])
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn lazy_sink_creates_database_on_first_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("graph.sqlite");
        let sink = LazySqliteSink::new(&path);
        assert!(!path.exists());
        sink.upsert(&[node("a", "A")]).await.unwrap();
        assert!(path.exists());
    }
}
