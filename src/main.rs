//! # Fact Harness CLI (`facts`)
//!
//! The `facts` binary drives extraction runs and inspects their state.
//!
//! ## Usage
//!
//! ```bash
//! facts [--config ./facts.toml] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `facts run` | Extract facts from every pending corpus item |
//! | `facts count` | Print how many items the next run would read |
//! | `facts status` | Print the checkpoint |
//!
//! ## Examples
//!
//! ```bash
//! # Offline dry pass with the stub backend
//! facts run --db-path ./corpus.db --limit 100
//!
//! # Chat model, starting from scratch, JSON progress on stderr
//! facts run --db-path ./corpus.db --backend chat --no-resume --progress json
//!
//! # Only one topic
//! facts count --db-path ./corpus.db --topic-id 42
//! ```
//!
//! Only the final JSON result goes to stdout; logs (`RUST_LOG`) and progress
//! go to stderr.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use fact_harness::backend::create_backend;
use fact_harness::checkpoint::CheckpointStore;
use fact_harness::config::{self, BackendKind, Config};
use fact_harness::pipeline::{count_pending, run_extraction, RunOptions};
use fact_harness::progress::ProgressMode;

/// Fact Harness CLI: resumable extraction of cited facts from a message corpus.
#[derive(Parser)]
#[command(
    name = "facts",
    about = "Fact Harness: resumable extraction of cited facts from a message corpus",
    version,
    long_about = "Fact Harness reads a SQLite message table in id order, batches items under a \
    token budget, asks a generation backend (offline stub or OpenAI-compatible chat model) for \
    cited facts, validates and deduplicates them, and appends them to a JSONL log. Runs resume \
    from a checkpoint."
)]
struct Cli {
    /// Path to configuration file (TOML). Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Corpus selection shared by `run` and `count`.
#[derive(Args)]
struct CorpusArgs {
    /// SQLite corpus file. Overrides `corpus.path`.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Table holding the items. Overrides `corpus.table`.
    #[arg(long)]
    table: Option<String>,

    /// Maximum number of items to read.
    #[arg(long)]
    limit: Option<u64>,

    /// Only items with this `topic_id`.
    #[arg(long)]
    topic_id: Option<i64>,

    /// Only items whose `topic_title` contains this substring.
    #[arg(long)]
    topic_title: Option<String>,

    /// Only items whose text is at least this many characters long.
    #[arg(long)]
    min_text_len: Option<i64>,

    /// Ignore the checkpoint and start from the first item.
    #[arg(long)]
    no_resume: bool,

    /// State directory. Overrides `output.state_dir`.
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

impl CorpusArgs {
    fn apply(&self, cfg: &mut Config) {
        if let Some(path) = &self.db_path {
            cfg.corpus.path = Some(path.clone());
        }
        if let Some(table) = &self.table {
            cfg.corpus.table = table.clone();
        }
        if let Some(dir) = &self.state_dir {
            cfg.output.state_dir = dir.clone();
        }
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            resume: !self.no_resume,
            limit: self.limit,
            topic_id: self.topic_id,
            topic_title_contains: self.topic_title.clone(),
            min_text_len: self.min_text_len,
        }
    }
}

/// Backend and batching overrides for `run`.
#[derive(Args)]
struct GenerationArgs {
    /// Generation backend.
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Primary chat model.
    #[arg(long)]
    model: Option<String>,

    /// Fallback chat model. Pass an empty string to disable.
    #[arg(long)]
    fallback_model: Option<String>,

    #[arg(long)]
    temperature: Option<f64>,

    #[arg(long)]
    top_p: Option<f64>,

    /// Completion token limit per call.
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Token budget per batch.
    #[arg(long)]
    budget: Option<usize>,

    /// Fixed token overhead added per item.
    #[arg(long)]
    overhead: Option<usize>,

    /// Extra instructions appended to the extraction prompt.
    #[arg(long)]
    hints: Option<String>,

    /// `.env` file to load API credentials from.
    #[arg(long)]
    dotenv: Option<PathBuf>,
}

impl GenerationArgs {
    fn apply(&self, cfg: &mut Config) {
        let gen = &mut cfg.generation;
        if let Some(backend) = self.backend {
            gen.backend = backend;
        }
        if let Some(model) = &self.model {
            gen.primary_model = model.clone();
        }
        if let Some(fallback) = &self.fallback_model {
            gen.fallback_model = Some(fallback.clone()).filter(|m| !m.trim().is_empty());
        }
        if let Some(t) = self.temperature {
            gen.temperature = t;
        }
        if let Some(p) = self.top_p {
            gen.top_p = p;
        }
        if let Some(n) = self.max_tokens {
            gen.max_tokens = n;
        }
        if let Some(hints) = &self.hints {
            gen.hints = hints.clone();
        }
        if let Some(path) = &self.dotenv {
            gen.dotenv_path = Some(path.clone());
        }
        if let Some(budget) = self.budget {
            cfg.batching.context_budget = budget;
        }
        if let Some(overhead) = self.overhead {
            cfg.batching.per_item_overhead = overhead;
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Extract facts from every pending corpus item.
    ///
    /// Resumes after the checkpoint unless `--no-resume` is given. Prints the
    /// run summary as JSON on stdout.
    Run {
        #[command(flatten)]
        corpus: CorpusArgs,

        #[command(flatten)]
        generation: GenerationArgs,

        /// Output directory. Overrides `output.output_dir`.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Progress on stderr: off, human, or json. Default: human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Print how many items the next run would read.
    Count {
        #[command(flatten)]
        corpus: CorpusArgs,
    },

    /// Print the checkpoint: last finalized id and number of emitted facts.
    Status {
        /// State directory. Overrides `output.state_dir`.
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Credentials may live in ./.env; a missing file is fine.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            corpus,
            generation,
            output_dir,
            progress,
        } => {
            corpus.apply(&mut cfg);
            generation.apply(&mut cfg);
            if let Some(dir) = output_dir {
                cfg.output.output_dir = dir;
            }
            config::validate(&cfg)?;

            let backend = create_backend(&cfg.generation)?;
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let summary =
                run_extraction(&cfg, backend.as_ref(), reporter.as_ref(), &corpus.options())
                    .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Count { corpus } => {
            corpus.apply(&mut cfg);
            let total = count_pending(&cfg, &corpus.options()).await?;
            println!("{}", total);
        }
        Commands::Status { state_dir } => {
            if let Some(dir) = state_dir {
                cfg.output.state_dir = dir;
            }
            let store = CheckpointStore::new(cfg.output.state_path());
            let checkpoint = store.load()?;
            let status = serde_json::json!({
                "state_path": store.path().display().to_string(),
                "last_id": checkpoint.last_id,
                "seen_hashes": checkpoint.seen_hashes.len(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
