//! Chat export discovery and parsing.
//!
//! Walks `ingest.export_dir` with `walkdir`, filters paths through the
//! include/exclude `globset`s, and parses each JSON file into [`Chat`]s.
//!
//! A file holds either one conversation or an array of them. Two
//! conversation shapes are understood:
//!
//! - a flat `messages` array of `{ role, content | text, timestamp }`;
//! - the ChatGPT export `mapping` tree, linearised by following the first
//!   child from the root node.

use chrono::DateTime;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::error::{PipelineError, ProcessingError, Result};
use crate::hashing::identity_hash;
use crate::models::{Chat, Message};

/// One export file: its path relative to the export root and its parsed JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ExportFile {
    pub source_file: String,
    pub content: Value,
    /// Why the file could not be read or parsed; `content` is null then.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Find and parse every export file under the configured root.
///
/// Files that cannot be read or are not valid JSON are returned with their
/// `error` set, so the stage can count them. Results are sorted by relative
/// path.
pub fn scan_exports(config: &IngestConfig) -> Result<Vec<ExportFile>> {
    let root = &config.export_dir;
    if !root.exists() {
        return Err(PipelineError::Config(format!(
            "ingest.export_dir does not exist: {}",
            root.display()
        )));
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut default_excludes = vec!["**/.git/**".to_string()];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();
    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root.as_path()).to_path_buf();
            PipelineError::io(path, std::io::Error::from(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        match read_json(path) {
            Ok(content) => files.push(ExportFile {
                source_file: rel_str,
                content,
                error: None,
            }),
            Err(reason) => {
                warn!(file = %rel_str, %reason, "Unreadable export file");
                files.push(ExportFile {
                    source_file: rel_str,
                    content: Value::Null,
                    error: Some(reason),
                });
            }
        }
    }

    files.sort_by(|a, b| a.source_file.cmp(&b.source_file));
    Ok(files)
}

fn read_json(path: &Path) -> std::result::Result<Value, String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| PipelineError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| PipelineError::Config(e.to_string()))
}

/// Parse one export file into chats. Conversations without any text are dropped.
pub fn parse_export(file: &ExportFile) -> std::result::Result<Vec<Chat>, ProcessingError> {
    let conversations: Vec<&Map<String, Value>> = match &file.content {
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        Value::Object(obj) => vec![obj],
        _ => {
            return Err(ProcessingError::new(
                &file.source_file,
                "expected a conversation object or an array of them",
            ))
        }
    };

    let mut chats = Vec::new();
    for conversation in conversations {
        let messages = if let Some(Value::Object(mapping)) = conversation.get("mapping") {
            linearise_mapping(mapping)
        } else if let Some(Value::Array(items)) = conversation.get("messages") {
            items.iter().filter_map(parse_message).collect()
        } else {
            continue;
        };
        if messages.is_empty() {
            continue;
        }

        let chat_hash = identity_hash(&messages)
            .map_err(|e| ProcessingError::new(&file.source_file, e))?;
        let title = conversation
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("Untitled")
            .to_string();
        let created_at = conversation
            .get("create_time")
            .or_else(|| conversation.get("created_at"))
            .and_then(parse_timestamp)
            .or_else(|| messages.iter().find_map(|m| m.timestamp));

        chats.push(Chat {
            chat_hash,
            title,
            source_file: file.source_file.clone(),
            created_at,
            messages,
        });
    }
    Ok(chats)
}

fn parse_message(value: &Value) -> Option<Message> {
    let obj = value.as_object()?;
    let role = obj
        .get("role")
        .and_then(Value::as_str)
        .or_else(|| obj.get("author").and_then(|a| a.get("role")).and_then(Value::as_str))
        .or_else(|| obj.get("sender").and_then(Value::as_str))
        .unwrap_or("unknown")
        .to_string();
    let text = obj
        .get("content")
        .or_else(|| obj.get("text"))
        .map(content_text)
        .unwrap_or_default();
    if text.trim().is_empty() {
        return None;
    }
    let timestamp = obj
        .get("timestamp")
        .or_else(|| obj.get("create_time"))
        .or_else(|| obj.get("created_at"))
        .and_then(parse_timestamp);
    Some(Message {
        role,
        text: text.trim().to_string(),
        timestamp,
    })
}

/// Text of a `content` field: a plain string, `{ parts: [...] }`, or `{ text }`.
fn content_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(obj) => {
            if let Some(Value::Array(parts)) = obj.get("parts") {
                parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                obj.get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            }
        }
        Value::Array(parts) => parts
            .iter()
            .map(content_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp())
            .or_else(|| s.parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    }
}

/// Walk a ChatGPT `mapping` tree from its root along first children.
fn linearise_mapping(mapping: &Map<String, Value>) -> Vec<Message> {
    let is_root = |node: &Value| match node.get("parent") {
        None | Some(Value::Null) => true,
        Some(Value::String(p)) => !mapping.contains_key(p),
        _ => false,
    };
    // Several roots can appear in damaged exports; take the earliest-keyed one.
    let mut roots: Vec<&String> = mapping
        .iter()
        .filter(|(_, node)| is_root(node))
        .map(|(id, _)| id)
        .collect();
    roots.sort();
    let Some(mut current) = roots.first().copied() else {
        return Vec::new();
    };

    let mut messages = Vec::new();
    let mut visited = std::collections::HashSet::new();
    while visited.insert(current.clone()) {
        let Some(node) = mapping.get(current) else {
            break;
        };
        if let Some(message) = node.get("message").and_then(parse_message) {
            messages.push(message);
        }
        let next = node
            .get("children")
            .and_then(Value::as_array)
            .and_then(|children| children.first())
            .and_then(Value::as_str);
        match next.and_then(|id| mapping.get_key_value(id)) {
            Some((id, _)) => current = id,
            None => break,
        }
    }

    if messages.iter().all(|m| m.timestamp.is_some()) {
        messages.sort_by_key(|m| m.timestamp);
    }
    messages
}
