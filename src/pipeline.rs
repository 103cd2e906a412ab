//! Extraction run orchestration.
//!
//! Coordinates one full run: checkpoint → corpus stream → batch assembly →
//! generation → fact acceptance → checkpoint, strictly one batch at a time.
//! Supports resuming after the last finalized item id. A failure while
//! finalizing a batch is counted and skipped; it never aborts the run.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

use crate::accept::accept_facts;
use crate::artifacts::{write_summary, FactLog, RawOutputDir, RawRecord};
use crate::backend::GenerationBackend;
use crate::batch::BatchAssembler;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::Config;
use crate::corpus::{self, CorpusQuery};
use crate::db;
use crate::models::{GenParams, Item, RunSummary, SourceText};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::prompt::{build_messages, escalation_hints};

/// Per-invocation options not stored in the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub resume: bool,
    pub limit: Option<u64>,
    pub topic_id: Option<i64>,
    pub topic_title_contains: Option<String>,
    pub min_text_len: Option<i64>,
}

impl RunOptions {
    pub fn resuming() -> Self {
        Self {
            resume: true,
            ..Default::default()
        }
    }

    /// Corpus query for this run, starting after `start_after`.
    pub fn query(&self, table: &str, start_after: i64) -> CorpusQuery {
        CorpusQuery {
            table: table.to_string(),
            start_after_id: start_after,
            limit: self.limit,
            topic_id: self.topic_id,
            topic_title_contains: self.topic_title_contains.clone(),
            min_text_len: self.min_text_len,
        }
    }
}

/// Counters aggregated over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub batches: u64,
    pub accepted_facts: u64,
    pub empty_batches: u64,
    pub errors: u64,
    pub processed_items: u64,
}

/// Mutable run state threaded through every stage.
#[derive(Debug)]
pub struct RunState {
    pub checkpoint: Checkpoint,
    pub counters: RunCounters,
    pub total: u64,
    /// Set after the first failed batch: `last_id` stays put so a resume
    /// comes back to the failed batch.
    pub held_at: Option<i64>,
    started: Instant,
}

impl RunState {
    pub fn new(checkpoint: Checkpoint, total: u64) -> Self {
        Self {
            checkpoint,
            counters: RunCounters::default(),
            total,
            held_at: None,
            started: Instant::now(),
        }
    }

    fn eta_secs(&self) -> f64 {
        let done = self.counters.processed_items.min(self.total);
        if done == 0 {
            return 0.0;
        }
        let remaining = self.total - done;
        self.started.elapsed().as_secs_f64() / done as f64 * remaining as f64
    }
}

/// Where a run writes its artifacts.
#[derive(Debug, Clone)]
pub struct Sinks {
    pub output_dir: PathBuf,
    pub store: CheckpointStore,
    pub log: FactLog,
    pub raw: RawOutputDir,
}

impl Sinks {
    pub fn from_config(config: &Config) -> Self {
        let out = &config.output;
        Self {
            output_dir: out.output_dir.clone(),
            store: CheckpointStore::new(out.state_path()),
            log: FactLog::new(out.knowledge_path()),
            raw: RawOutputDir::new(out.raw_dir()),
        }
    }

    fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(self.raw.path()).with_context(|| {
            format!("Failed to create output directory {}", self.raw.path().display())
        })?;
        if let Some(state_dir) = self.store.path().parent() {
            std::fs::create_dir_all(state_dir)?;
        }
        Ok(())
    }
}

/// Everything a batch needs that does not change during a run.
pub struct Extractor<'a> {
    pub config: &'a Config,
    pub backend: &'a dyn GenerationBackend,
    pub sinks: Sinks,
    pub reporter: &'a dyn ProgressReporter,
}

impl<'a> Extractor<'a> {
    pub fn new(
        config: &'a Config,
        backend: &'a dyn GenerationBackend,
        reporter: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            config,
            backend,
            sinks: Sinks::from_config(config),
            reporter,
        }
    }

    fn params(&self) -> GenParams {
        let gen = &self.config.generation;
        GenParams {
            max_tokens: gen.max_tokens,
            temperature: gen.temperature,
            top_p: gen.top_p,
        }
    }

    /// Load the checkpoint, resetting it first on a non-resume run.
    pub fn open_checkpoint(&self, resume: bool) -> Result<Checkpoint> {
        let mut checkpoint = self.sinks.store.load()?;
        if !resume {
            checkpoint.reset();
            self.sinks.store.save(&checkpoint)?;
        }
        Ok(checkpoint)
    }

    /// One generate call plus its raw record, then fact acceptance.
    async fn extract_pass(
        &self,
        state: &mut RunState,
        batch: &[Item],
        hints: &str,
        retry: bool,
    ) -> Result<u64> {
        let first_id = batch[0].id;
        let last_id = batch[batch.len() - 1].id;
        let sources: Vec<SourceText> = batch.iter().map(SourceText::from).collect();
        let messages = build_messages(&sources, hints);
        let params = self.params();

        let output = self.backend.generate(&sources, &messages, params).await;

        self.sinks.raw.write(&RawRecord::new(
            first_id, last_id, &messages, params, &output, retry,
        ))?;

        let accepted =
            accept_facts(&output, batch, &mut state.checkpoint, &self.sinks.log)? as u64;
        // Counted as soon as they are in the log, even if the batch fails later.
        state.counters.accepted_facts += accepted;
        Ok(accepted)
    }

    /// Generate, validate and checkpoint one batch.
    ///
    /// A batch that yields no facts gets exactly one escalation pass with
    /// hints asking for weakly-qualifying facts; its count is final.
    pub async fn process_batch(&self, state: &mut RunState, batch: &[Item]) -> Result<u64> {
        let Some(last) = batch.last() else {
            return Ok(0);
        };
        let first_id = batch[0].id;
        let last_id = last.id;
        info!(first_id, last_id, items = batch.len(), "processing batch");

        let hints = &self.config.generation.hints;
        let mut accepted = self.extract_pass(state, batch, hints, false).await?;
        if accepted == 0 {
            info!(first_id, last_id, "no facts accepted, escalating");
            accepted = self
                .extract_pass(state, batch, &escalation_hints(hints), true)
                .await?;
        }

        let mut next = state.checkpoint.clone();
        if state.held_at.is_none() {
            next.last_id = last_id;
        }
        self.sinks.store.save(&next)?;
        state.checkpoint = next;

        let counters = &mut state.counters;
        counters.batches += 1;
        if accepted == 0 {
            counters.empty_batches += 1;
        }
        counters.processed_items += batch.len() as u64;

        self.reporter.report(ProgressEvent::BatchDone {
            first_id,
            last_id,
            done: state.counters.processed_items,
            total: state.total,
            accepted,
            eta_secs: state.eta_secs(),
        });

        Ok(accepted)
    }

    /// Run [`Self::process_batch`], absorbing any failure into the counters.
    pub async fn finalize_batch(&self, state: &mut RunState, batch: Vec<Item>) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.process_batch(state, &batch).await {
            let first_id = batch[0].id;
            let last_id = batch[batch.len() - 1].id;
            warn!(first_id, last_id, error = %e, "batch failed");
            state.counters.errors += 1;
            if state.held_at.is_none() {
                state.held_at = Some(state.checkpoint.last_id);
            }
            self.reporter.report(ProgressEvent::BatchFailed {
                first_id,
                last_id,
                error: format!("{:#}", e),
            });
        }
    }

    fn summary(&self, state: &RunState) -> RunSummary {
        let c = &state.counters;
        RunSummary {
            batches: c.batches,
            accepted_facts: c.accepted_facts,
            empty_batches: c.empty_batches,
            errors: c.errors,
            last_id: state.checkpoint.last_id,
            output_dir: self.sinks.output_dir.display().to_string(),
            raw_dir: self.sinks.raw.path().display().to_string(),
            knowledge_path: self.sinks.log.path().display().to_string(),
            state_path: self.sinks.store.path().display().to_string(),
        }
    }

    /// Extract facts from every pending corpus item and write a run summary.
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        let corpus_path = self
            .config
            .corpus
            .path
            .as_ref()
            .context("No corpus database configured (set corpus.path or pass --db-path)")?;

        self.sinks.prepare()?;
        let checkpoint = self.open_checkpoint(options.resume)?;
        let start_after = checkpoint.last_id;

        let pool = db::connect(corpus_path).await?;
        let query = options.query(&self.config.corpus.table, start_after);
        let total = corpus::count_items(&pool, &query).await?;

        info!(total, start_after, backend = self.backend.name(), "starting extraction");
        self.reporter.report(ProgressEvent::Started {
            total,
            start_after,
            limit: options.limit,
        });

        let mut state = RunState::new(checkpoint, total);
        let batching = &self.config.batching;
        let mut assembler = BatchAssembler::new(batching.context_budget, batching.per_item_overhead);
        let mut stream = corpus::stream_items(&pool, query).await?;

        while let Some(item) = stream.next().await? {
            if let Some(batch) = assembler.push(item) {
                self.finalize_batch(&mut state, batch).await;
            }
        }
        if let Some(batch) = assembler.finish() {
            self.finalize_batch(&mut state, batch).await;
        }
        pool.close().await;

        let summary = self.summary(&state);
        let path = write_summary(&self.sinks.output_dir, &summary)?;
        info!(
            batches = summary.batches,
            accepted = summary.accepted_facts,
            errors = summary.errors,
            summary = %path.display(),
            "extraction finished"
        );
        Ok(summary)
    }
}

/// Run a full extraction with `backend`, reporting to `reporter`.
pub async fn run_extraction(
    config: &Config,
    backend: &dyn GenerationBackend,
    reporter: &dyn ProgressReporter,
    options: &RunOptions,
) -> Result<RunSummary> {
    Extractor::new(config, backend, reporter).run(options).await
}

/// Count pending items without calling any backend.
pub async fn count_pending(config: &Config, options: &RunOptions) -> Result<u64> {
    let corpus_path = config
        .corpus
        .path
        .as_ref()
        .context("No corpus database configured (set corpus.path or pass --db-path)")?;
    let start_after = if options.resume {
        CheckpointStore::new(config.output.state_path()).load()?.last_id
    } else {
        0
    };
    let pool = db::connect(corpus_path).await?;
    let total = corpus::count_items(&pool, &options.query(&config.corpus.table, start_after)).await;
    pool.close().await;
    total
}
