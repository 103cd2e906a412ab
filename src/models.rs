//! Core data models used throughout the extraction pipeline.
//!
//! Items flow in from the corpus reader, are grouped into batches, and come
//! back out of the acceptor as [`Fact`]s written to the fact log.

use serde::{Deserialize, Serialize};

/// One corpus record surfaced for extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub id: i64,
    pub text: String,
    /// Citation key, always `msg:<id>`.
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_title: Option<String>,
}

impl Item {
    pub fn new(id: i64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            source_id: source_id_for(id),
            date: None,
            topic_id: None,
            topic_title: None,
        }
    }
}

/// Build the citation key for a corpus row id.
pub fn source_id_for(id: i64) -> String {
    format!("msg:{}", id)
}

/// What the backend sees for each item of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct SourceText {
    pub source_id: String,
    pub text: String,
}

impl From<&Item> for SourceText {
    fn from(item: &Item) -> Self {
        Self {
            source_id: item.source_id.clone(),
            text: item.text.clone(),
        }
    }
}

/// A chat message sent to the generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenParams {
    #[serde(rename = "gen_max_tokens")]
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

/// A validated citation attached to an accepted fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSource {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
}

/// Descriptive metadata derived from the cited items. Never affects
/// acceptance or hashing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactMeta {
    pub ts: String,
    pub source_ids_csv: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dates: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_max: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_ids: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_titles: Option<Vec<String>>,
}

/// An accepted fact, one line of `knowledge.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub statement: String,
    pub sources: Vec<FactSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub hash: String,
    pub meta: FactMeta,
}

/// Counters and artifact paths written at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub batches: u64,
    pub accepted_facts: u64,
    pub empty_batches: u64,
    pub errors: u64,
    pub last_id: i64,
    pub output_dir: String,
    pub raw_dir: String,
    pub knowledge_path: String,
    pub state_path: String,
}
