//! # mdkb
//!
//! A local-first Markdown knowledge base: a tree of documents indexed
//! into SQLite for hybrid retrieval with exact line-level provenance.
//!
//! The engine turns raw Markdown into queryable, citation-bearing
//! chunks, keeps the index consistent under incremental edits and
//! deletions, and answers queries by fusing lexical (FTS5 bm25) and
//! semantic (embedding cosine) recall.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌───────────────┐
//! │  kb/ tree │──▶│   Indexer     │──▶│    SQLite      │
//! │ *.md docs │   │ chunk + embed │   │ FTS5 + vectors │
//! └───────────┘   └──────────────┘   └──────┬────────┘
//!                                           │
//!                            ┌──────────────┴───┐
//!                            ▼                  ▼
//!                      ┌──────────┐      ┌──────────┐
//!                      │ Retriever │      │  Repair   │
//!                      │  (hybrid) │      │ (rebuild) │
//!                      └──────────┘      └──────────┘
//! ```
//!
//! ## Quick start
//!
//! ```bash
//! kb init ~/notes                 # scaffold a KB root
//! kb index --kb-root ~/notes      # build the index
//! kb search "ownership" --kb-root ~/notes --mode hybrid
//! kb repair --kb-root ~/notes     # verify and rebuild if divergent
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`chunker`] | Heading-aware Markdown chunking |
//! | [`indexer`] | Incremental index convergence |
//! | [`search`] | Lexical / semantic / hybrid retrieval |
//! | [`repair`] | Consistency checks and full rebuild |
//! | [`store`] | Row-level SQLite operations |
//! | [`capability`] | Embed/chat HTTP capability |
//! | [`dir_meta`] | Per-directory metadata for structural recall |
//! | [`config`] | `kb.toml` parsing |
//! | [`doctor`] | Capability health checks |

pub mod bootstrap;
pub mod capability;
pub mod chunker;
pub mod config;
pub mod db;
pub mod dir_meta;
pub mod doctor;
pub mod error;
pub mod indexer;
pub mod models;
pub mod repair;
pub mod schema;
pub mod search;
pub mod store;
pub mod util;
