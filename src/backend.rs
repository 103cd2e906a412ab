//! Generation backend abstraction and implementations.
//!
//! Defines the [`GenerationBackend`] trait and its two implementations:
//! - **[`StubBackend`]** — deterministic offline extractor, one first-sentence
//!   fact per source; no network.
//! - **[`ChatBackend`]** — an OpenAI-compatible chat model driven through the
//!   [`Orchestrator`](crate::orchestrator::Orchestrator) retry/repair stages.
//!
//! `generate` never fails: total failure degrades to `{"facts": []}`.
//!
//! # Backend Selection
//!
//! ```rust
//! # use fact_harness::config::GenerationConfig;
//! # use fact_harness::backend::create_backend;
//! let config = GenerationConfig::default(); // backend = "stub"
//! let backend = create_backend(&config).unwrap();
//! assert_eq!(backend.name(), "stub");
//! ```

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

use crate::chat::{ChatClient, HttpChatClient};
use crate::config::{BackendKind, GenerationConfig};
use crate::models::{ChatMessage, GenParams, SourceText};
use crate::orchestrator::Orchestrator;

/// Turns a batch of sources plus a prompt into a candidate-facts structure.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Produce `{"facts": [...]}` for the batch. Never fails.
    async fn generate(
        &self,
        sources: &[SourceText],
        messages: &[ChatMessage],
        params: GenParams,
    ) -> Value;
}

// ============ Stub Backend ============

/// Maximum words kept from a source's first sentence.
const STUB_MAX_WORDS: usize = 60;
/// Maximum characters quoted from a source.
const STUB_QUOTE_CHARS: usize = 200;

fn sentence_split() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]\s+").expect("valid sentence regex"))
}

/// Offline extractor that cites each source's first sentence.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubBackend;

impl StubBackend {
    fn first_sentence(text: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            return String::new();
        }
        let sentence = sentence_split().split(text).next().unwrap_or(text).trim();
        let words: Vec<&str> = sentence.split_whitespace().collect();
        if words.len() > STUB_MAX_WORDS {
            words[..STUB_MAX_WORDS].join(" ")
        } else {
            sentence.to_string()
        }
    }

    fn extract(sources: &[SourceText]) -> Value {
        let facts: Vec<Value> = sources
            .iter()
            .filter_map(|src| {
                let statement = Self::first_sentence(&src.text);
                if statement.is_empty() || src.source_id.is_empty() {
                    return None;
                }
                let quote: String = src.text.chars().take(STUB_QUOTE_CHARS).collect();
                let quote = quote.trim();
                let source = if quote.is_empty() {
                    serde_json::json!({ "source_id": src.source_id })
                } else {
                    serde_json::json!({ "source_id": src.source_id, "quote": quote })
                };
                Some(serde_json::json!({ "statement": statement, "sources": [source] }))
            })
            .collect();
        serde_json::json!({ "facts": facts })
    }
}

#[async_trait]
impl GenerationBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    async fn generate(
        &self,
        sources: &[SourceText],
        _messages: &[ChatMessage],
        _params: GenParams,
    ) -> Value {
        Self::extract(sources)
    }
}

// ============ Chat Backend ============

/// Chat-model backend with primary and optional fallback model.
pub struct ChatBackend<C: ChatClient = HttpChatClient> {
    client: C,
    primary_model: String,
    fallback_model: Option<String>,
}

impl<C: ChatClient> ChatBackend<C> {
    pub fn new(client: C, primary_model: impl Into<String>, fallback_model: Option<String>) -> Self {
        Self {
            client,
            primary_model: primary_model.into(),
            fallback_model,
        }
    }
}

#[async_trait]
impl<C: ChatClient> GenerationBackend for ChatBackend<C> {
    fn name(&self) -> &str {
        &self.primary_model
    }

    async fn generate(
        &self,
        _sources: &[SourceText],
        messages: &[ChatMessage],
        params: GenParams,
    ) -> Value {
        let outcome = Orchestrator::new(
            &self.client,
            &self.primary_model,
            self.fallback_model.as_deref(),
        )
        .run(messages, params)
        .await;
        debug!(stage = ?outcome.stage, "generation finished");
        outcome.output
    }
}

/// Create the configured [`GenerationBackend`].
///
/// # Errors
///
/// The chat backend fails to build without an API key.
pub fn create_backend(config: &GenerationConfig) -> Result<Box<dyn GenerationBackend>> {
    match config.backend {
        BackendKind::Stub => Ok(Box::new(StubBackend)),
        BackendKind::Chat => Ok(Box::new(ChatBackend::new(
            HttpChatClient::from_config(config)?,
            config.primary_model.clone(),
            config.fallback_model.clone(),
        ))),
    }
}
