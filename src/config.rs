use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: None,
            table: default_table(),
        }
    }
}

fn default_table() -> String {
    "messages".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchingConfig {
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,
    #[serde(default = "default_per_item_overhead")]
    pub per_item_overhead: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            context_budget: default_context_budget(),
            per_item_overhead: default_per_item_overhead(),
        }
    }
}

fn default_context_budget() -> usize {
    180_000
}
fn default_per_item_overhead() -> usize {
    400
}

/// Which generation backend drives extraction.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Deterministic offline extractor, no network.
    #[default]
    Stub,
    /// OpenAI-compatible chat/completions endpoint.
    Chat,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_primary_model")]
    pub primary_model: String,
    #[serde(default = "default_fallback_model")]
    pub fallback_model: Option<String>,
    /// Overrides `FACTS_API_BASE` when set.
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub dotenv_path: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub hints: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            primary_model: default_primary_model(),
            fallback_model: default_fallback_model(),
            api_base: None,
            dotenv_path: None,
            timeout_secs: default_timeout_secs(),
            hints: String::new(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f64 {
    0.2
}
fn default_top_p() -> f64 {
    0.95
}
fn default_primary_model() -> String {
    "openai/gpt-oss-120b".to_string()
}
fn default_fallback_model() -> Option<String> {
    Some("Qwen/Qwen3-235B-A22B-Instruct-2507".to_string())
}
fn default_timeout_secs() -> u64 {
    60
}

/// Transport-level backoff applied to every HTTP call.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            factor: default_factor(),
        }
    }
}

fn default_attempts() -> u32 {
    2
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_factor() -> f64 {
    1.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            state_dir: default_state_dir(),
            state_file: default_state_file(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("out")
}
fn default_state_dir() -> PathBuf {
    PathBuf::from(".state")
}
fn default_state_file() -> String {
    "checkpoint.json".to_string()
}

impl OutputConfig {
    pub fn raw_dir(&self) -> PathBuf {
        self.output_dir.join("raw")
    }

    pub fn knowledge_path(&self) -> PathBuf {
        self.output_dir.join("knowledge.jsonl")
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(&self.state_file)
    }
}

/// Load a config file, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse config file")?
        }
        None => Config::default(),
    };

    validate(&config)?;
    Ok(config)
}

/// Check value ranges. Called again after CLI overrides are applied.
pub fn validate(config: &Config) -> Result<()> {
    if config.batching.context_budget == 0 {
        anyhow::bail!("batching.context_budget must be > 0");
    }

    let gen = &config.generation;
    if gen.max_tokens == 0 {
        anyhow::bail!("generation.max_tokens must be > 0");
    }
    if !(0.0..=2.0).contains(&gen.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }
    if !(gen.top_p > 0.0 && gen.top_p <= 1.0) {
        anyhow::bail!("generation.top_p must be in (0.0, 1.0]");
    }
    if gen.primary_model.trim().is_empty() {
        anyhow::bail!("generation.primary_model must not be empty");
    }

    if gen.retry.attempts == 0 {
        anyhow::bail!("generation.retry.attempts must be >= 1");
    }
    if !gen.retry.factor.is_finite() || gen.retry.factor < 1.0 {
        anyhow::bail!("generation.retry.factor must be a finite number >= 1.0");
    }

    if config.output.state_file.trim().is_empty() {
        anyhow::bail!("output.state_file must not be empty");
    }

    Ok(())
}
