//! Tagging and summarization providers.
//!
//! [`Annotator`] is what the `tag` and `summarize-*` stages call. Two kinds
//! ship:
//!
//! - [`ExtractiveAnnotator`]: offline: keyword frequency for tags, leading
//!   sentences for summaries. Deterministic, so reruns hash identically.
//! - [`GenerativeAnnotator`]: prompts a [`GenerationBackend`] (Ollama
//!   `/api/chat` or an OpenAI-compatible `/v1/chat/completions`).

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::embedding::post_json_with_retry;

/// Longest input passed to a model, in characters.
const MAX_PROMPT_CHARS: usize = 8_000;
const MAX_SUMMARY_CHARS: usize = 480;

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "been", "but", "by", "can", "could", "did", "do", "does", "for", "from", "get", "had", "has",
    "have", "he", "her", "here", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just",
    "like", "me", "more", "my", "no", "not", "of", "on", "one", "or", "our", "out", "she", "so",
    "some", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "to", "up", "us", "use", "was", "we", "what", "when", "which", "while", "who", "will", "with",
    "would", "you", "your",
];

/// Text generation backend.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate text with system context.
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Produces tags and summaries for the pipeline.
#[async_trait]
pub trait Annotator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn summarize(&self, title: &str, text: &str) -> Result<String>;

    /// At most `max` lowercase tags.
    async fn tags(&self, text: &str, max: usize) -> Result<Vec<String>>;
}

// ============ Extractive ============

pub struct ExtractiveAnnotator;

#[async_trait]
impl Annotator for ExtractiveAnnotator {
    fn model_name(&self) -> &str {
        "extractive"
    }

    async fn summarize(&self, title: &str, text: &str) -> Result<String> {
        let lead = leading_sentences(text, 2, MAX_SUMMARY_CHARS);
        if lead.is_empty() {
            return Ok(title.to_string());
        }
        Ok(lead)
    }

    async fn tags(&self, text: &str, max: usize) -> Result<Vec<String>> {
        Ok(top_terms([text], max))
    }
}

/// The `n` most frequent non-stopword terms across `texts`.
///
/// Ties break alphabetically, so the result is deterministic.
pub fn top_terms<'a, I>(texts: I, n: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let stop: HashSet<&str> = STOPWORDS.iter().copied().collect();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for text in texts {
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            let token = token.to_lowercase();
            if token.chars().count() < 3
                || token.chars().all(|c| c.is_ascii_digit())
                || stop.contains(token.as_str())
            {
                continue;
            }
            *counts.entry(token).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(term, _)| term).collect()
}

/// First `count` sentences of `text`, whitespace-collapsed and capped at `max_chars`.
pub fn leading_sentences(text: &str, count: usize, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut end = collapsed.len();
    let mut seen = 0;
    for (i, c) in collapsed.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            seen += 1;
            if seen == count {
                end = i + c.len_utf8();
                break;
            }
        }
    }
    truncate_chars(&collapsed[..end], max_chars)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

// ============ Generative ============

const SUMMARY_SYSTEM: &str = "You summarize conversations for a personal knowledge base. \
Reply with two or three plain sentences and nothing else.";

const TAG_SYSTEM: &str = "You label text with short topical tags. \
Reply with a comma-separated list of lowercase tags and nothing else.";

pub struct GenerativeAnnotator {
    backend: Box<dyn GenerationBackend>,
}

impl GenerativeAnnotator {
    pub fn new(backend: Box<dyn GenerationBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Annotator for GenerativeAnnotator {
    fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    async fn summarize(&self, title: &str, text: &str) -> Result<String> {
        let prompt = format!(
            "Title: {}\n\n{}",
            title,
            truncate_chars(text, MAX_PROMPT_CHARS)
        );
        let summary = self
            .backend
            .generate_with_system(SUMMARY_SYSTEM, &prompt)
            .await?;
        let summary = summary.trim();
        if summary.is_empty() {
            bail!("model returned an empty summary");
        }
        Ok(summary.to_string())
    }

    async fn tags(&self, text: &str, max: usize) -> Result<Vec<String>> {
        let prompt = format!(
            "Give at most {} tags for:\n\n{}",
            max,
            truncate_chars(text, MAX_PROMPT_CHARS)
        );
        let reply = self.backend.generate_with_system(TAG_SYSTEM, &prompt).await?;
        Ok(parse_tags(&reply, max))
    }
}

/// Parse a comma or newline separated tag list.
pub fn parse_tags(reply: &str, max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    reply
        .split([',', '\n'])
        .map(|t| {
            t.trim()
                .trim_start_matches(['-', '*', '#'])
                .trim()
                .trim_matches('"')
                .to_lowercase()
        })
        .filter(|t| !t.is_empty() && t.len() <= 48)
        .filter(|t| seen.insert(t.clone()))
        .take(max)
        .collect()
}

#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

fn chat_messages(system: &str, prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if !system.is_empty() {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: system.to_string(),
        });
    }
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: prompt.to_string(),
    });
    messages
}

fn client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn log_generation(start: Instant, response_len: usize, prompt_len: usize) {
    let elapsed = start.elapsed().as_millis() as u64;
    debug!(response_len, duration_ms = elapsed, "Generation complete");
    if elapsed > 30_000 {
        warn!(
            duration_ms = elapsed,
            prompt_len,
            slow = true,
            "Slow generation operation"
        );
    }
}

/// Ollama `/api/chat`, non-streaming.
pub struct OllamaChat {
    model: String,
    base_url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for Ollama provider"))?;
        Ok(Self {
            model,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.max_retries,
            client: client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl GenerationBackend for OllamaChat {
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<String> {
        let start = Instant::now();
        let body = serde_json::json!({
            "model": self.model,
            "messages": chat_messages(system, prompt),
            "stream": false,
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/api/chat", self.base_url.trim_end_matches('/')),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        let content = json
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing message content"))?
            .to_string();
        log_generation(start, content.len(), prompt.len());
        Ok(content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// OpenAI-compatible `/v1/chat/completions`. Reads `OPENAI_API_KEY`.
pub struct OpenAIChat {
    model: String,
    base_url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            max_retries: config.max_retries,
            client: client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl GenerationBackend for OpenAIChat {
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<String> {
        let start = Instant::now();
        let body = serde_json::json!({
            "model": self.model,
            "messages": chat_messages(system, prompt),
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/')),
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices"))?
            .to_string();
        log_generation(start, content.len(), prompt.len());
        Ok(content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Create the [`Annotator`] named by `llm.provider`.
pub fn create_annotator(config: &LlmConfig) -> Result<Box<dyn Annotator>> {
    match config.provider.as_str() {
        "extractive" => Ok(Box::new(ExtractiveAnnotator)),
        "ollama" => Ok(Box::new(GenerativeAnnotator::new(Box::new(
            OllamaChat::new(config)?,
        )))),
        "openai" => Ok(Box::new(GenerativeAnnotator::new(Box::new(
            OpenAIChat::new(config)?,
        )))),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_terms_skips_stopwords_and_ranks() {
        let terms = top_terms(
            ["The borrow checker and the borrow rules", "borrow lifetimes rules"],
            2,
        );
        assert_eq!(terms, vec!["borrow", "rules"]);
    }

    #[test]
    fn leading_sentences_stops_at_count() {
        let s = leading_sentences("One.  Two!\nThree? Four.", 2, 100);
        assert_eq!(s, "One. Two!");
    }

    #[test]
    fn leading_sentences_caps_length() {
        let s = leading_sentences(&"word ".repeat(200), 2, 20);
        assert!(s.chars().count() <= 21);
        assert!(s.ends_with('…'));
    }

    #[test]
    fn parse_tags_normalises() {
        let tags = parse_tags("- Rust, async\n\"Tokio\", rust, ", 5);
        assert_eq!(tags, vec!["rust", "async", "tokio"]);
    }

    struct Echo;

    #[async_trait]
    impl GenerationBackend for Echo {
        async fn generate_with_system(&self, _system: &str, _prompt: &str) -> Result<String> {
            Ok("  A short summary.  ".to_string())
        }
        fn model_name(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn generative_summary_is_trimmed() {
        let annotator = GenerativeAnnotator::new(Box::new(Echo));
        let summary = annotator.summarize("t", "body").await.unwrap();
        assert_eq!(summary, "A short summary.");
        assert_eq!(annotator.model_name(), "echo");
    }

    #[tokio::test]
    async fn extractive_falls_back_to_title() {
        let summary = ExtractiveAnnotator.summarize("Title", "   ").await.unwrap();
        assert_eq!(summary, "Title");
    }
}
