//! Fact validation, deduplication, and persistence.
//!
//! Candidates from the model are untrusted. Each one is checked field by
//! field and dropped on the first failure:
//!
//! 1. `statement` must be a non-blank string, `sources` a non-empty array.
//! 2. Each source must cite `msg:<digits>` for an item in the current batch;
//!    bad entries are dropped one by one.
//! 3. A `quote` that is not a verbatim substring of the cited text is removed
//!    but its source is kept.
//! 4. At least one source must survive.
//!
//! Survivors are hashed with [`hash_fact`] and skipped if the hash was already
//! emitted, either in an earlier batch (checkpoint) or earlier in the same
//! answer. New facts are appended to the log in one synced write, then their
//! hashes are added to the in-memory checkpoint; the caller persists it.

use anyhow::Result;
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

use crate::artifacts::{now_ts, FactLog};
use crate::checkpoint::Checkpoint;
use crate::models::{Fact, FactMeta, FactSource, Item};

fn source_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^msg:\d+$").expect("valid source id regex"))
}

/// Content hash of a fact.
///
/// Depends only on the trimmed statement, the category (empty when absent),
/// and the sorted, de-duplicated source ids, so source order never matters.
pub fn hash_fact<S: AsRef<str>>(statement: &str, category: Option<&str>, source_ids: &[S]) -> String {
    let ids: BTreeSet<&str> = source_ids.iter().map(|s| s.as_ref()).collect();
    let basis = format!(
        "{}|{}|{}",
        statement.trim(),
        category.unwrap_or(""),
        ids.into_iter().collect::<Vec<_>>().join(",")
    );
    let mut hasher = Sha256::new();
    hasher.update(basis.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A candidate that passed validation, before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidFact {
    pub statement: String,
    pub sources: Vec<FactSource>,
    pub category: Option<String>,
}

impl ValidFact {
    pub fn hash(&self) -> String {
        let ids: Vec<&str> = self.sources.iter().map(|s| s.source_id.as_str()).collect();
        hash_fact(&self.statement, self.category.as_deref(), &ids)
    }
}

/// Check one source entry against the batch.
fn validate_source(entry: &Value, texts: &HashMap<&str, &str>) -> Option<FactSource> {
    let obj = entry.as_object()?;
    let source_id = obj.get("source_id")?.as_str()?;
    if !source_id_pattern().is_match(source_id) {
        return None;
    }
    let text = texts.get(source_id)?;

    let quote = match obj.get("quote") {
        None | Some(Value::Null) => None,
        Some(Value::String(q)) => {
            let trimmed = q.trim();
            if trimmed.is_empty() || !text.contains(trimmed) {
                None
            } else {
                Some(q.clone())
            }
        }
        Some(_) => return None,
    };

    Some(FactSource {
        source_id: source_id.to_string(),
        quote,
    })
}

fn validate_candidate(candidate: &Map<String, Value>, texts: &HashMap<&str, &str>) -> Option<ValidFact> {
    let statement = candidate.get("statement")?.as_str()?.trim();
    if statement.is_empty() {
        return None;
    }
    let sources = candidate.get("sources")?.as_array()?;
    if sources.is_empty() {
        return None;
    }

    let valid: Vec<FactSource> = sources
        .iter()
        .filter_map(|s| validate_source(s, texts))
        .collect();
    if valid.is_empty() {
        return None;
    }

    let category = candidate
        .get("category")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    Some(ValidFact {
        statement: statement.to_string(),
        sources: valid,
        category,
    })
}

/// Validate every candidate in a generation result against `batch`.
///
/// Anything other than an object with a `facts` array yields nothing.
pub fn validate_candidates(output: &Value, batch: &[Item]) -> Vec<ValidFact> {
    let Some(facts) = output.get("facts").and_then(Value::as_array) else {
        return Vec::new();
    };
    let texts: HashMap<&str, &str> = batch
        .iter()
        .map(|it| (it.source_id.as_str(), it.text.as_str()))
        .collect();

    facts
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|c| validate_candidate(c, &texts))
        .collect()
}

/// Collapse distinct values to a scalar when there is exactly one.
fn one_or_many<T: Ord + Clone>(values: BTreeSet<T>) -> (Option<T>, Option<Vec<T>>) {
    match values.len() {
        0 => (None, None),
        1 => (values.into_iter().next(), None),
        _ => (None, Some(values.into_iter().collect())),
    }
}

/// Descriptive metadata drawn from the cited items.
pub fn build_meta(sources: &[FactSource], batch: &[Item], ts: &str) -> FactMeta {
    let by_sid: HashMap<&str, &Item> = batch.iter().map(|it| (it.source_id.as_str(), it)).collect();

    let mut ids = BTreeSet::new();
    let mut dates = BTreeSet::new();
    let mut topic_ids = BTreeSet::new();
    let mut topic_titles = BTreeSet::new();

    for src in sources {
        if let Some(n) = src
            .source_id
            .split_once(':')
            .and_then(|(_, n)| n.parse::<i64>().ok())
        {
            ids.insert(n);
        }
        let Some(item) = by_sid.get(src.source_id.as_str()) else {
            continue;
        };
        if let Some(date) = item.date.as_ref().filter(|d| !d.is_empty()) {
            dates.insert(date.clone());
        }
        if let Some(topic) = item.topic_id {
            topic_ids.insert(topic);
        }
        if let Some(title) = item.topic_title.as_ref().filter(|t| !t.is_empty()) {
            topic_titles.insert(title.clone());
        }
    }

    let mut meta = FactMeta {
        ts: ts.to_string(),
        source_ids_csv: ids.iter().map(i64::to_string).collect::<Vec<_>>().join(","),
        ..Default::default()
    };
    if !dates.is_empty() {
        meta.date_min = dates.iter().next().cloned();
        meta.date_max = dates.iter().next_back().cloned();
        meta.dates = Some(dates.into_iter().collect());
    }
    (meta.topic_id, meta.topic_ids) = one_or_many(topic_ids);
    (meta.topic_title, meta.topic_titles) = one_or_many(topic_titles);
    meta
}

/// Facts from `output` that are valid and not yet emitted.
pub fn select_new_facts(output: &Value, batch: &[Item], checkpoint: &Checkpoint) -> Vec<Fact> {
    let ts = now_ts();
    let mut this_call = HashSet::new();
    let mut accepted = Vec::new();

    for candidate in validate_candidates(output, batch) {
        let hash = candidate.hash();
        if checkpoint.has_seen(&hash) || !this_call.insert(hash.clone()) {
            continue;
        }
        let meta = build_meta(&candidate.sources, batch, &ts);
        accepted.push(Fact {
            statement: candidate.statement,
            sources: candidate.sources,
            category: candidate.category,
            hash,
            meta,
        });
    }

    accepted
}

/// Validate, append new facts to the log, then record their hashes.
///
/// Returns the number of newly accepted facts. Hashes are only added to
/// `checkpoint` once the log append is on disk; saving the checkpoint is
/// left to the caller, so a crash can duplicate log lines but never lose them.
pub fn accept_facts(
    output: &Value,
    batch: &[Item],
    checkpoint: &mut Checkpoint,
    log: &FactLog,
) -> Result<usize> {
    let facts = select_new_facts(output, batch, checkpoint);
    if facts.is_empty() {
        return Ok(0);
    }

    log.append(&facts)?;

    checkpoint
        .seen_hashes
        .extend(facts.iter().map(|f| f.hash.clone()));

    Ok(facts.len())
}
