//! # Knowledge base CLI (`kb`)
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init <root>` | Scaffold a KB root (document tree, index dir, config) |
//! | `kb index` | Build or incrementally update the index |
//! | `kb search "<query>"` | Hybrid retrieval with line-level citations |
//! | `kb repair` | Check index consistency and rebuild if divergent |
//! | `kb doctor` | Exercise the embed/chat capability endpoints |
//!
//! All commands except `init` take `--kb-root`; `--json` switches the
//! output to machine-readable records.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mdkb::models::{IndexOptions, RepairOptions, SearchMode};
use mdkb::{bootstrap, doctor, indexer, repair, search};

/// A local-first Markdown knowledge base with hybrid retrieval and
/// line-level citations.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Local-first Markdown knowledge base with hybrid retrieval",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a knowledge base root directory.
    Init {
        /// Path of the KB root to create.
        kb_root: PathBuf,

        /// Overwrite an existing kb.toml with the defaults.
        #[arg(long)]
        force: bool,

        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Build or incrementally update the index.
    ///
    /// Unchanged documents (by content fingerprint) are skipped;
    /// changed documents have their chunk set replaced atomically;
    /// documents whose file vanished are cascade-deleted.
    Index {
        /// KB root directory.
        #[arg(long)]
        kb_root: PathBuf,

        /// Discard the index and reprocess every document.
        #[arg(long)]
        rebuild: bool,

        /// Compute embeddings for new chunks (requires capability config).
        #[arg(long)]
        embed: bool,

        /// Only index these relative paths (repeatable).
        #[arg(long)]
        only: Vec<String>,

        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Search the index.
    Search {
        /// The query text.
        query: String,

        /// KB root directory.
        #[arg(long)]
        kb_root: PathBuf,

        /// Retrieval mode: lexical (FTS5), semantic (vectors), or hybrid.
        #[arg(long, default_value = "lexical")]
        mode: String,

        /// Number of results to return.
        #[arg(long, default_value_t = 10)]
        top: usize,

        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Check index consistency against the document tree; rebuild when
    /// divergent.
    Repair {
        /// KB root directory.
        #[arg(long)]
        kb_root: PathBuf,

        /// Recompute embeddings during the rebuild.
        #[arg(long)]
        embed: bool,

        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Exercise the embed/chat capability endpoints.
    Doctor {
        /// KB root directory.
        #[arg(long)]
        kb_root: PathBuf,

        /// Only check the embeddings endpoint.
        #[arg(long, conflicts_with = "chat_only")]
        embed_only: bool,

        /// Only check the chat endpoint.
        #[arg(long)]
        chat_only: bool,

        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            kb_root,
            force,
            json,
        } => {
            let out = bootstrap::init_kb(&kb_root, force)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("initialized {}", out.root);
                for item in &out.created {
                    println!("  created {item}");
                }
            }
        }

        Commands::Index {
            kb_root,
            rebuild,
            embed,
            only,
            json,
        } => {
            let summary = indexer::index(
                &kb_root,
                &IndexOptions {
                    rebuild,
                    with_embeddings: embed,
                    only,
                },
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("updated documents: {}", summary.documents_changed);
                println!("deleted documents: {}", summary.documents_deleted);
                println!("unchanged documents: {}", summary.documents_unchanged);
                println!("chunks written: {}", summary.chunks_written);
                if embed {
                    println!("chunks embedded: {}", summary.chunks_embedded);
                }
                for issue in &summary.errors {
                    println!("error: {}: {}", issue.rel_path, issue.message);
                }
            }
        }

        Commands::Search {
            query,
            kb_root,
            mode,
            top,
            json,
        } => {
            let mode: SearchMode = mode.parse()?;
            let outcome = search::search(&kb_root, &query, mode, top).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                for note in &outcome.notes {
                    println!("note: {note}");
                }
                if outcome.results.is_empty() {
                    println!("No results.");
                }
                for (i, hit) in outcome.results.iter().enumerate() {
                    println!(
                        "{}. [{:.3}] {}:{}-{}  ({})",
                        i + 1,
                        hit.score,
                        hit.path,
                        hit.line_range[0],
                        hit.line_range[1],
                        hit.source
                    );
                    if !hit.heading_path.is_empty() {
                        println!("    {}", hit.heading_path);
                    }
                    let excerpt: String =
                        hit.text.replace('\n', " ").trim().chars().take(160).collect();
                    println!("    excerpt: \"{excerpt}\"");
                }
            }
        }

        Commands::Repair {
            kb_root,
            embed,
            json,
        } => {
            let report = repair::repair(
                &kb_root,
                RepairOptions {
                    with_embeddings: embed,
                },
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("rebuilt: {}", report.rebuilt);
                println!("issues found: {}", report.issues_found);
                println!("issues fixed: {}", report.issues_fixed);
                for issue in &report.issues {
                    println!("  - {issue}");
                }
            }
        }

        Commands::Doctor {
            kb_root,
            embed_only,
            chat_only,
            json,
        } => {
            let report = doctor::doctor(
                &kb_root,
                doctor::DoctorOptions {
                    check_embed: embed_only,
                    check_chat: chat_only,
                },
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", doctor::format_report(&report));
            }
            if !report.ok {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
