use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data: DataConfig,
    pub ingest: IngestConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    pub export_dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_pipeline_batch_size(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_pipeline_batch_size() -> usize {
    32
}
fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            min_chars: default_min_chars(),
        }
    }
}

fn default_max_tokens() -> usize {
    256
}
fn default_min_chars() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL (Ollama, or an OpenAI-compatible endpoint).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "hashed".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
            max_tags: default_max_tags(),
        }
    }
}

fn default_llm_provider() -> String {
    "extractive".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_max_tags() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    /// Number of clusters; derived from the corpus size when unset.
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            k: None,
            seed: default_seed(),
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_seed() -> u64 {
    42
}
fn default_max_iterations() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimilarityConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            top_k: default_top_k(),
        }
    }
}

fn default_threshold() -> f32 {
    0.5
}
fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SinkConfig {
    /// SQLite graph database; defaults to `<data.dir>/graph.sqlite`.
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

impl Config {
    pub fn sqlite_path(&self) -> PathBuf {
        self.sink
            .sqlite_path
            .clone()
            .unwrap_or_else(|| self.data.dir.join("graph.sqlite"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.pipeline.batch_size == 0 {
        anyhow::bail!("pipeline.batch_size must be > 0");
    }
    if config.pipeline.concurrency == 0 {
        anyhow::bail!("pipeline.concurrency must be > 0");
    }

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.ingest.include_globs.is_empty() {
        anyhow::bail!("ingest.include_globs must not be empty");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hashed" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashed, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.is_none() {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Validate llm
    match config.llm.provider.as_str() {
        "extractive" => {}
        "openai" | "ollama" => {
            if config.llm.model.is_none() {
                anyhow::bail!(
                    "llm.model must be specified when provider is '{}'",
                    config.llm.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be extractive, openai, or ollama.",
            other
        ),
    }
    if config.llm.max_tags == 0 {
        anyhow::bail!("llm.max_tags must be > 0");
    }

    if config.clustering.k == Some(0) {
        anyhow::bail!("clustering.k must be >= 1");
    }
    if config.clustering.max_iterations == 0 {
        anyhow::bail!("clustering.max_iterations must be > 0");
    }

    if !(-1.0..=1.0).contains(&config.similarity.threshold) {
        anyhow::bail!("similarity.threshold must be in [-1.0, 1.0]");
    }
    if config.similarity.top_k == 0 {
        anyhow::bail!("similarity.top_k must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    const MINIMAL: &str = r#"
[data]
dir = "./data"

[ingest]
export_dir = "./exports"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.ingest.include_globs, vec!["**/*.json"]);
        assert_eq!(config.pipeline.batch_size, 32);
        assert_eq!(config.embedding.provider, "hashed");
        assert_eq!(config.llm.provider, "extractive");
        assert_eq!(config.clustering.k, None);
        assert_eq!(config.sqlite_path(), PathBuf::from("./data/graph.sqlite"));
    }

    #[test]
    fn unknown_embedding_provider_is_rejected() {
        let src = format!("{}\n[embedding]\nprovider = \"magic\"\n", MINIMAL);
        let err = parse(&src).unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn remote_embedding_requires_model_and_dims() {
        let src = format!("{}\n[embedding]\nprovider = \"openai\"\n", MINIMAL);
        assert!(parse(&src).is_err());
        let src = format!(
            "{}\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
            MINIMAL
        );
        assert!(parse(&src).is_ok());
    }

    #[test]
    fn shipped_example_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/chatmind.example.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.embedding.provider, "hashed");
        assert_eq!(config.clustering.seed, 42);
    }

    #[test]
    fn similarity_threshold_range_is_checked() {
        let src = format!("{}\n[similarity]\nthreshold = 1.5\n", MINIMAL);
        assert!(parse(&src).is_err());
    }
}
