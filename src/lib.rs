//! # ChatMind
//!
//! An incremental pipeline that turns exported chat conversations into a
//! browsable knowledge graph.
//!
//! Every stage tracks the content hashes of the units it has already
//! processed, so rerunning the pipeline after adding a new export only does
//! the work the new conversations require. Corpus-wide aggregates
//! (clustering, layout, similarity) are recomputed when, and only when,
//! their input set changed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────────┐   ┌──────────┐
//! │ exports  │──▶│ ingest → chunk → embed → ... │──▶│  SQLite  │
//! │ (*.json) │   │   stages/<stage>.jsonl       │   │  graph   │
//! └──────────┘   │   state/<stage>.ledger.json  │   └──────────┘
//!                └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chatmind run                       # everything that is new
//! chatmind run embed cluster         # a subset, in dependency order
//! chatmind run --check-only          # what would run, without writing
//! chatmind run position --force      # recompute regardless of state
//! chatmind status                    # committed state per stage
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`hashing`] | Canonical content hashing |
//! | [`ledger`] | Per-stage hash ledger and corpus stamp |
//! | [`artifact`] | JSON Lines stage artifacts |
//! | [`stage`] | Stage traits and the append-only / recompute runners |
//! | [`orchestrator`] | Stage graph, run planning and execution |
//! | [`stages`] | The ChatMind stages |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`embedding_cache`] | Summary embedding reuse cache |
//! | [`llm`] | Summaries and tags |
//! | [`sink`] | Graph sink (SQLite) |
//! | [`config`] | TOML configuration parsing |

pub mod artifact;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod embedding_cache;
pub mod error;
pub mod hashing;
pub mod import;
pub mod kmeans;
pub mod layout;
pub mod ledger;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod projection;
pub mod sink;
pub mod stage;
pub mod stages;
pub mod status;
