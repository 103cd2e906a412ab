//! On-disk artifacts: the fact log, raw-output records, and run summaries.
//!
//! Everything except the fact log is written through [`save_json_atomic`]
//! (temp file + rename), so readers never see a half-written JSON file.
//! Fact-log appends are synced before returning, so a checkpoint saved
//! afterwards can never get ahead of the log.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::models::{ChatMessage, Fact, GenParams, RunSummary};

/// Local timestamp used in artifact names and fact metadata.
pub fn now_ts() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Write pretty JSON to `<path>.tmp`, then rename over `path`.
pub fn save_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let json = serde_json::to_vec_pretty(value)?;
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    sync_parent(path)
}

/// Persist the directory entry created by a rename.
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::File::open(parent)
        .and_then(|dir| dir.sync_all())
        .with_context(|| format!("Failed to sync directory {}", parent.display()))
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}

/// `<dir>/<stem>.json`, or `<stem>_2.json`, `<stem>_3.json`, ... if taken.
fn unused_json_path(dir: &Path, stem: &str) -> PathBuf {
    let first = dir.join(format!("{}.json", stem));
    if !first.exists() {
        return first;
    }
    (2u32..)
        .map(|n| dir.join(format!("{}_{}.json", stem, n)))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// Append one JSON line per item in a single write.
pub fn append_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    ensure_parent(path)?;

    let mut buf = Vec::new();
    for item in items {
        serde_json::to_writer(&mut buf, item)?;
        buf.push(b'\n');
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open fact log {}", path.display()))?;
    file.write_all(&buf)?;
    file.sync_data()
        .with_context(|| format!("Failed to sync fact log {}", path.display()))?;
    Ok(())
}

/// The append-only `knowledge.jsonl` log.
#[derive(Debug, Clone)]
pub struct FactLog {
    path: PathBuf,
}

impl FactLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, facts: &[Fact]) -> Result<()> {
        append_jsonl(&self.path, facts)
    }

    /// Read every fact back. Missing log reads as empty.
    pub fn read_all(&self) -> Result<Vec<Fact>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Ok(serde_json::from_str::<Fact>(l)?))
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct IdRange {
    first_id: i64,
    last_id: i64,
}

/// Full context of one top-level generate call, kept for audit.
#[derive(Debug, Serialize)]
pub struct RawRecord<'a> {
    ts: String,
    range: IdRange,
    messages: &'a [ChatMessage],
    model_params: GenParams,
    output: &'a serde_json::Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retry: bool,
}

impl<'a> RawRecord<'a> {
    pub fn new(
        first_id: i64,
        last_id: i64,
        messages: &'a [ChatMessage],
        model_params: GenParams,
        output: &'a serde_json::Value,
        retry: bool,
    ) -> Self {
        Self {
            ts: now_ts(),
            range: IdRange { first_id, last_id },
            messages,
            model_params,
            output,
            retry,
        }
    }
}

/// Directory of one-file-per-call raw records.
#[derive(Debug, Clone)]
pub struct RawOutputDir {
    dir: PathBuf,
}

impl RawOutputDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Persist a record as `<ts>_<first>-<last>[_retry].json`, numbering
    /// the name when one from the same second already exists.
    pub fn write(&self, record: &RawRecord<'_>) -> Result<PathBuf> {
        let suffix = if record.retry { "_retry" } else { "" };
        let stem = format!(
            "{}_{}-{}{}",
            record.ts, record.range.first_id, record.range.last_id, suffix
        );
        let path = unused_json_path(&self.dir, &stem);
        save_json_atomic(&path, record)?;
        Ok(path)
    }
}

/// Write `summary_<ts>.json` into the output directory.
pub fn write_summary(output_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let path = unused_json_path(output_dir, &format!("summary_{}", now_ts()));
    save_json_atomic(&path, summary)?;
    Ok(path)
}
