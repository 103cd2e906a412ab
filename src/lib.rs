//! # Fact Harness
//!
//! Resumable, budget-batched extraction of cited facts from a message corpus.
//!
//! Fact Harness reads items from a SQLite table in ascending id order, groups
//! them into token-budget-bounded batches, asks a generation backend for
//! candidate facts, validates every citation against the batch, and appends
//! the survivors to a deduplicated JSONL log. A checkpoint makes every run
//! resumable after the last finalized item.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────────┐   ┌──────────────┐
//! │  SQLite  │──▶│  Batcher  │──▶│  Backend   │──▶│  Validator   │
//! │  corpus  │   │  (budget) │   │ stub/chat  │   │  + dedup     │
//! └──────────┘   └───────────┘   └─────┬──────┘   └──────┬───────┘
//!                                      │                 │
//!                                      ▼                 ▼
//!                                 raw/*.json     knowledge.jsonl
//!                                                checkpoint.json
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! facts run --db-path corpus.db                 # offline stub backend
//! facts run --db-path corpus.db --backend chat  # chat model, needs FACTS_API_KEY
//! facts status                                  # inspect the checkpoint
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`db`] | Read-only corpus connection |
//! | [`corpus`] | Schema introspection, filtered streaming and counting |
//! | [`batch`] | Token estimation and batch assembly |
//! | [`prompt`] | Extraction, repair and escalation prompts |
//! | [`chat`] | OpenAI-compatible chat transport with backoff |
//! | [`orchestrator`] | Primary/repair/fallback stage sequence |
//! | [`backend`] | Generation backends (stub, chat) |
//! | [`accept`] | Fact validation, hashing and deduplication |
//! | [`checkpoint`] | Resumption state |
//! | [`artifacts`] | Fact log, raw records, run summaries |
//! | [`pipeline`] | Run controller |
//! | [`progress`] | Progress reporting on stderr |

pub mod accept;
pub mod artifacts;
pub mod backend;
pub mod batch;
pub mod chat;
pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod db;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompt;
