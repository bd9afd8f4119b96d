use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

fn chatmind_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_chatmind"))
}

const RUST_CHAT: &str = r#"{
  "title": "Borrow checker questions",
  "create_time": 1700000000,
  "messages": [
    {"role": "user", "content": "Why does the borrow checker reject two mutable references?"},
    {"role": "assistant", "content": "Rust forbids aliasing mutable references so data races cannot happen. Use scopes or RefCell when you need interior mutability."}
  ]
}"#;

const BREAD_CHAT: &str = r#"{
  "title": "Sourdough starter",
  "messages": [
    {"role": "user", "content": "My sourdough starter smells like acetone. Is it dead?"},
    {"role": "assistant", "content": "An acetone smell means the starter is hungry. Feed it more often and keep it warm."}
  ]
}"#;

const MAPPING_CHAT: &str = r#"{
  "title": "Async runtimes",
  "create_time": 1700000500,
  "mapping": {
    "root": {"id": "root", "message": null, "parent": null, "children": ["m1"]},
    "m1": {"id": "m1", "parent": "root", "children": ["m2"],
           "message": {"author": {"role": "user"}, "create_time": 1700000501,
                       "content": {"content_type": "text", "parts": ["How does tokio schedule async tasks?"]}}},
    "m2": {"id": "m2", "parent": "m1", "children": [],
           "message": {"author": {"role": "assistant"}, "create_time": 1700000502,
                       "content": {"content_type": "text", "parts": ["Tokio uses a work-stealing scheduler across worker threads."]}}}
  }
}"#;

const GARDEN_CHAT: &str = r#"{
  "title": "Tomato plants",
  "messages": [
    {"role": "user", "content": "Why are the leaves on my tomato plants turning yellow?"},
    {"role": "assistant", "content": "Yellow tomato leaves usually point to overwatering or a nitrogen deficiency."}
  ]
}"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let exports = root.join("exports");
    fs::create_dir_all(&exports).unwrap();

    fs::write(
        exports.join("conversations.json"),
        format!("[{},{}]", RUST_CHAT, BREAD_CHAT),
    )
    .unwrap();
    fs::write(exports.join("async.json"), MAPPING_CHAT).unwrap();

    let config_content = format!(
        r#"[data]
dir = "{root}/data"

[ingest]
export_dir = "{root}/exports"

[pipeline]
batch_size = 2
concurrency = 2

[chunking]
max_tokens = 64

[embedding]
provider = "hashed"
dims = 64

[llm]
provider = "extractive"

[clustering]
seed = 7

[similarity]
threshold = 0.0
top_k = 2
"#,
        root = root.display()
    );

    let config_path = config_dir.join("chatmind.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_chatmind(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = chatmind_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "chatmind=info")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run chatmind binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

fn run_json(config_path: &Path, args: &[&str]) -> (Value, String, Option<i32>) {
    let mut full = vec!["run", "--json", "--progress", "off"];
    full.extend_from_slice(args);
    let (stdout, stderr, code) = run_chatmind(config_path, &full);
    let report: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|e| panic!("report is not JSON ({}): {}\nstderr: {}", e, stdout, stderr));
    (report, stderr, code)
}

fn stage<'a>(report: &'a Value, name: &str) -> &'a Value {
    report["stages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["stage"] == name)
        .unwrap_or_else(|| panic!("stage {} missing from report: {}", name, report))
}

fn data_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("data")
}

#[test]
fn test_full_run_builds_graph() {
    let (_tmp, config) = setup_test_env();
    let (report, stderr, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0), "stderr: {}", stderr);

    let names: Vec<&str> = report["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["stage"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec![
            "ingest",
            "chunk",
            "embed",
            "cluster",
            "tag",
            "summarize-chats",
            "summarize-clusters",
            "position",
            "similarity",
            "load"
        ]
    );
    assert_eq!(stage(&report, "ingest")["records_written"], 3);
    assert_eq!(stage(&report, "cluster")["outcome"], "recomputed");
    assert!(stage(&report, "load")["processed"].as_u64().unwrap() > 0);
    assert!(data_dir(&config).join("graph.sqlite").exists());
    assert!(data_dir(&config)
        .join("cache/summary_embeddings.jsonl")
        .exists());
}

#[test]
fn test_rerun_is_noop() {
    let (_tmp, config) = setup_test_env();
    let (_, _, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0));

    let (report, _, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0));
    for s in report["stages"].as_array().unwrap() {
        assert_eq!(s["outcome"], "up_to_date", "stage not skipped: {}", s);
        assert_eq!(s["processed"], 0);
    }

    let (stdout, _, code) = run_chatmind(&config, &["run", "--progress", "off"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("Nothing to do"));
}

#[test]
fn test_new_export_is_incremental() {
    let (tmp, config) = setup_test_env();
    let (_, _, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0));

    fs::write(tmp.path().join("exports/garden.json"), GARDEN_CHAT).unwrap();
    let (report, _, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0));

    let ingest = stage(&report, "ingest");
    assert_eq!(ingest["processed"], 1);
    assert_eq!(ingest["skipped"], 2);
    assert_eq!(ingest["records_written"], 1);
    assert_eq!(stage(&report, "summarize-chats")["processed"], 1);
    assert_eq!(stage(&report, "cluster")["outcome"], "recomputed");
    assert_eq!(stage(&report, "position")["outcome"], "recomputed");
}

#[tokio::test]
async fn test_graph_follows_reclustering() {
    let (tmp, config) = setup_test_env();
    let (_, _, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0));

    fs::write(tmp.path().join("exports/garden.json"), GARDEN_CHAT).unwrap();
    let (report, stderr, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0), "stderr: {}", stderr);
    assert_eq!(stage(&report, "cluster")["outcome"], "recomputed");

    let assignments = fs::read_to_string(data_dir(&config).join("stages/cluster.jsonl"))
        .unwrap()
        .lines()
        .count() as i64;
    let sink = chatmind::sink::SqliteGraphSink::open(&data_dir(&config).join("graph.sqlite"))
        .await
        .unwrap();
    let (edges, chunks): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COUNT(DISTINCT source) FROM edges WHERE kind = 'in_cluster'",
    )
    .fetch_one(sink.pool())
    .await
    .unwrap();
    assert_eq!(edges, assignments);
    assert_eq!(chunks, assignments);

    let (clusters, targets): (i64, i64) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM nodes WHERE kind = 'cluster'), \
                (SELECT COUNT(DISTINCT target) FROM edges WHERE kind = 'in_cluster')",
    )
    .fetch_one(sink.pool())
    .await
    .unwrap();
    assert_eq!(clusters, targets);
}

#[test]
fn test_unreadable_export_is_reported() {
    let (tmp, config) = setup_test_env();
    let (_, _, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0));

    fs::write(tmp.path().join("exports/truncated.json"), "[{\"title\": ").unwrap();
    let (report, _, code) = run_json(&config, &["ingest"]);
    assert_eq!(code, Some(0));
    assert_eq!(stage(&report, "ingest")["outcome"], "up_to_date");
    assert_eq!(stage(&report, "ingest")["hash_errors"], 1);

    let (stdout, _, code) = run_chatmind(&config, &["run", "ingest", "--progress", "off"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("hash errors 1"), "stdout: {}", stdout);
    assert!(!stdout.contains("Nothing to do"));
}

#[test]
fn test_check_only_writes_nothing() {
    let (tmp, config) = setup_test_env();
    let (_, _, code) = run_json(&config, &["ingest"]);
    assert_eq!(code, Some(0));

    let ledger_path = data_dir(&config).join("state/ingest.ledger.json");
    let before = fs::read(&ledger_path).unwrap();

    fs::write(tmp.path().join("exports/garden.json"), GARDEN_CHAT).unwrap();
    let (report, _, code) = run_json(&config, &["--check-only"]);
    assert_eq!(code, Some(0));
    assert_eq!(report["check_only"], true);

    let ingest = stage(&report, "ingest");
    assert_eq!(ingest["outcome"], "would_process");
    assert_eq!(ingest["pending"], 1);
    assert_eq!(stage(&report, "chunk")["outcome"], "would_process");
    assert_eq!(stage(&report, "chunk")["pending"], 3);

    assert_eq!(fs::read(&ledger_path).unwrap(), before);
    assert!(!data_dir(&config).join("state/chunk.ledger.json").exists());

    // embed alone: its dependency is neither planned nor committed.
    let (report, _, code) = run_json(&config, &["embed", "--check-only"]);
    assert_eq!(code, Some(0));
    assert_eq!(stage(&report, "embed")["outcome"], "blocked");

    // Safe to repeat.
    let (again, _, _) = run_json(&config, &["--check-only"]);
    assert_eq!(stage(&again, "ingest")["pending"], 1);
}

#[test]
fn test_force_reprocesses_and_keeps_downstream_clean() {
    let (_tmp, config) = setup_test_env();
    let (_, _, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0));

    let (report, _, code) = run_json(&config, &["chunk", "--force"]);
    assert_eq!(code, Some(0));
    let chunk = stage(&report, "chunk");
    assert_eq!(chunk["outcome"], "processed");
    assert_eq!(chunk["processed"], 3);

    let (report, _, code) = run_json(&config, &["--force-reprocess", "cluster"]);
    assert_eq!(code, Some(0));
    assert_eq!(stage(&report, "cluster")["outcome"], "recomputed");

    // Same content came out, so nothing downstream is new.
    let (report, _, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0));
    for s in report["stages"].as_array().unwrap() {
        assert_eq!(s["outcome"], "up_to_date", "stage not skipped: {}", s);
    }
}

#[test]
fn test_clear_state_reprocesses_stage() {
    let (_tmp, config) = setup_test_env();
    let (_, _, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0));

    let (report, _, code) = run_json(&config, &["tag", "--clear-state"]);
    assert_eq!(code, Some(0));
    let tag = stage(&report, "tag");
    assert_eq!(tag["outcome"], "processed");
    assert_eq!(tag["skipped"], 0);
    assert!(tag["processed"].as_u64().unwrap() > 0);

    let (report, _, _) = run_json(&config, &["position", "--clear-state"]);
    let position = stage(&report, "position");
    assert_eq!(position["outcome"], "recomputed");
    assert_eq!(position["metrics"]["cache_hits"], 0);
}

#[test]
fn test_skip_flags() {
    let (_tmp, config) = setup_test_env();
    let (report, _, code) = run_json(&config, &["--skip-load", "--skip-tag"]);
    assert_eq!(code, Some(0));
    let names: Vec<&str> = report["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["stage"].as_str().unwrap())
        .collect();
    assert!(!names.contains(&"load"));
    assert!(!names.contains(&"tag"));
    assert!(!data_dir(&config).join("graph.sqlite").exists());
}

#[test]
fn test_steps_are_reordered() {
    let (_tmp, config) = setup_test_env();
    let (report, stderr, code) = run_json(&config, &["chunk", "ingest"]);
    assert_eq!(code, Some(0));
    let names: Vec<&str> = report["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["stage"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["ingest", "chunk"]);
    assert!(stderr.contains("reordered"), "stderr: {}", stderr);
}

#[test]
fn test_unknown_stage_is_config_error() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, code) = run_chatmind(&config, &["run", "embedd"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("embedd"));
    assert!(stderr.contains("summarize-chats"));
}

#[test]
fn test_missing_dependency_fails_fast() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, code) = run_chatmind(&config, &["run", "chunk", "--progress", "off"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("'chunk'"), "stderr: {}", stderr);
    assert!(stderr.contains("'ingest'"), "stderr: {}", stderr);
    assert!(!data_dir(&config).join("state/chunk.ledger.json").exists());
}

#[test]
fn test_missing_config_exits_2() {
    let tmp = TempDir::new().unwrap();
    let (_, _, code) = run_chatmind(&tmp.path().join("nope.toml"), &["run"]);
    assert_eq!(code, Some(2));
}

#[test]
fn test_stages_and_status() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, code) = run_chatmind(&config, &["stages"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("summarize-clusters"));
    assert!(stdout.contains("full_recompute_on_delta"));

    let (_, _, code) = run_json(&config, &[]);
    assert_eq!(code, Some(0));
    let (stdout, _, code) = run_chatmind(&config, &["status", "--json"]);
    assert_eq!(code, Some(0));
    let status: Value = serde_json::from_str(&stdout).unwrap();
    let ingest = status["stages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["stage"] == "ingest")
        .unwrap();
    assert_eq!(ingest["units"], 2);
    assert_eq!(ingest["records"], 3);
    assert!(status["graph"]["nodes"].as_i64().unwrap() > 0);
}
