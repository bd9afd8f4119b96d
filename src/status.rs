//! Data directory overview for `chatmind status`.
//!
//! Shows, per stage, what has been committed: ledger size or corpus stamp,
//! artifact records and bytes, and how long ago the stage last committed.
//! Gives confidence that incremental runs are picking up where they left off.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::layout::DataLayout;
use crate::ledger::{CorpusStamp, HashLedger};
use crate::orchestrator::StageSpec;
use crate::sink::{SinkCounts, SqliteGraphSink};
use crate::stage::{RecomputePolicy, StoredRecord};

/// Committed state of one stage.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StageStatus {
    pub stage: String,
    pub policy: RecomputePolicy,
    /// Ledger entries (append-only) or stamped unit count (recompute).
    pub units: usize,
    pub records: usize,
    pub artifact_bytes: u64,
    /// Bytes past the ledger watermark, dropped on the next run.
    pub uncommitted_bytes: u64,
    pub last_commit: Option<i64>,
    pub rebuild_pending: bool,
}

pub fn stage_status(layout: &DataLayout, spec: &StageSpec) -> crate::error::Result<StageStatus> {
    let artifact = layout.artifact(spec.name);
    let artifact_bytes = artifact.len_bytes()?;
    let mut status = StageStatus {
        stage: spec.name.to_string(),
        policy: spec.policy,
        units: 0,
        records: 0,
        artifact_bytes,
        uncommitted_bytes: 0,
        last_commit: None,
        rebuild_pending: false,
    };

    match spec.policy {
        RecomputePolicy::AppendOnly => {
            let ledger = HashLedger::load(layout.ledger_path(spec.name), spec.name)?;
            let committed = ledger.output_bytes();
            status.units = ledger.len();
            status.last_commit = ledger.updated_at();
            status.rebuild_pending = ledger.rebuild_pending();
            status.uncommitted_bytes = artifact_bytes.saturating_sub(committed);
            status.records = artifact
                .read_prefix::<StoredRecord<serde_json::Value>>(Some(committed))?
                .len();
        }
        RecomputePolicy::FullRecomputeOnDelta => {
            if let Some(stamp) = CorpusStamp::load(&layout.stamp_path(spec.name), spec.name)? {
                status.units = stamp.unit_count;
                status.last_commit = Some(stamp.computed_at);
                status.records = artifact.read_all::<serde_json::Value>()?.len();
            }
        }
    }
    Ok(status)
}

/// Run the status command: inspect the data directory and print a summary.
pub async fn run_status(config: &Config, specs: &[StageSpec], json: bool) -> Result<()> {
    let layout = DataLayout::new(&config.data.dir);
    let mut stages = Vec::with_capacity(specs.len());
    for spec in specs {
        stages.push(stage_status(&layout, spec)?);
    }

    let sqlite_path = config.sqlite_path();
    let sink = if sqlite_path.exists() {
        Some(SqliteGraphSink::open(&sqlite_path).await?.counts().await?)
    } else {
        None
    };

    if json {
        let out = serde_json::json!({
            "data_dir": config.data.dir,
            "stages": stages,
            "graph": sink.map(|c: SinkCounts| serde_json::json!({
                "path": sqlite_path,
                "nodes": c.nodes,
                "edges": c.edges,
                "vectors": c.vectors,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("ChatMind Pipeline Status");
    println!("========================");
    println!();
    println!("  Data dir:    {}", config.data.dir.display());
    println!();
    println!(
        "  {:<20} {:<10} {:>8} {:>8} {:>10}   {}",
        "STAGE", "POLICY", "UNITS", "RECORDS", "SIZE", "LAST COMMIT"
    );
    println!("  {}", "-".repeat(80));
    for s in &stages {
        let policy = match s.policy {
            RecomputePolicy::AppendOnly => "append",
            RecomputePolicy::FullRecomputeOnDelta => "recompute",
        };
        let last = match s.last_commit {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        };
        let mut notes = String::new();
        if s.uncommitted_bytes > 0 {
            notes.push_str(&format!(
                "  ({} uncommitted)",
                format_bytes(s.uncommitted_bytes)
            ));
        }
        if s.rebuild_pending {
            notes.push_str("  (rebuild pending)");
        }
        println!(
            "  {:<20} {:<10} {:>8} {:>8} {:>10}   {}{}",
            s.stage,
            policy,
            s.units,
            s.records,
            format_bytes(s.artifact_bytes),
            last,
            notes
        );
    }

    println!();
    match sink {
        Some(c) => {
            println!("  Graph:       {}", sqlite_path.display());
            println!("  Nodes:       {}", c.nodes);
            println!("  Edges:       {}", c.edges);
            println!("  Vectors:     {}", c.vectors);
        }
        None => println!("  Graph:       not loaded yet"),
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
