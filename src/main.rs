//! # rag-index CLI (`ragx`)
//!
//! Administration and query interface for the local index.
//!
//! ## Usage
//!
//! ```bash
//! ragx --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragx init` | Create the SQLite database and schema |
//! | `ragx policy show` | Print the active directory policy |
//! | `ragx policy set` | Replace and persist the directory policy |
//! | `ragx index <path>` | Index a file or directory |
//! | `ragx remove <path>` | Drop a file or directory from the index |
//! | `ragx search "<query>"` | Ranked hybrid search |
//! | `ragx context "<query>"` | Context items for a prompt |
//! | `ragx stats` | Index statistics |
//! | `ragx health` | Database and embedding backend check |

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rag_index::config;
use rag_index::context::{export, format_for_prompt, ExportFormat};
use rag_index::models::SearchFilters;
use rag_index::pipeline::DirectoryOptions;
use rag_index::progress::ProgressMode;
use rag_index::search::{dedupe_similar, group_by_file};
use rag_index::stats;
use rag_index::RagEngine;

/// Local RAG index: policy-gated file indexing with hybrid search.
#[derive(Parser)]
#[command(name = "ragx", version, about = "Local RAG indexing and hybrid search")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    /// Debug-level logging (overrides RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema. Idempotent.
    Init,

    /// Show or replace the directory policy.
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Index a file or a directory tree.
    Index {
        path: PathBuf,

        /// Reprocess files even when their content hash is unchanged.
        #[arg(long)]
        force: bool,

        /// Only index the top level of a directory.
        #[arg(long)]
        no_recursive: bool,

        /// Restrict to these extensions (repeatable, e.g. `--ext md`).
        #[arg(long = "ext")]
        extensions: Vec<String>,

        /// Worker count (default from config).
        #[arg(long)]
        workers: Option<usize>,

        /// Progress on stderr: human, json or off (default: human on a TTY).
        #[arg(long)]
        progress: Option<String>,

        /// Print the batch report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove a file, or every file under a directory, from the index.
    Remove { path: PathBuf },

    /// Search the index.
    Search {
        query: String,

        /// `hybrid`, `keyword` or `vector`.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        #[arg(long)]
        limit: Option<usize>,

        /// Only these file types (repeatable, e.g. `--type md`).
        #[arg(long = "type")]
        file_types: Vec<String>,

        /// Only files under this directory.
        #[arg(long)]
        path_prefix: Option<PathBuf>,

        #[arg(long)]
        no_rerank: bool,

        /// Group results by file.
        #[arg(long)]
        group: bool,

        /// Drop neighbouring chunks and near-duplicate text.
        #[arg(long)]
        dedupe: bool,

        #[arg(long)]
        json: bool,
    },

    /// Assemble context items for a prompt.
    Context {
        query: String,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long = "type")]
        file_types: Vec<String>,

        /// `prompt`, `json`, `csv` or `markdown`.
        #[arg(long, default_value = "prompt")]
        format: String,
    },

    /// Print index statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Check the database and the embedding backend. Fails when unhealthy.
    Health {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    Show,
    Set {
        /// Allowed root (repeatable).
        #[arg(long = "allow", required = true)]
        allowed: Vec<PathBuf>,

        /// Excluded root (repeatable).
        #[arg(long = "exclude")]
        excluded: Vec<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    let engine = RagEngine::open(cfg)
        .await
        .context("Failed to open index")?;

    let result = run(&engine, cli.command).await;
    engine.close().await;
    result
}

async fn run(engine: &RagEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            println!("Database initialized at {}", engine.db_path().display());
        }
        Commands::Policy { action } => match action {
            PolicyAction::Show => {
                let policy = engine.directory_policy();
                println!("allowed:");
                print_roots(policy.allowed_roots());
                println!("excluded:");
                print_roots(policy.excluded_roots());
            }
            PolicyAction::Set { allowed, excluded } => {
                engine.set_directory_policy(&allowed, &excluded).await?;
                println!("policy updated");
            }
        },
        Commands::Index {
            path,
            force,
            no_recursive,
            extensions,
            workers,
            progress,
            json,
        } => {
            let mode = match progress {
                Some(p) => p.parse::<ProgressMode>().map_err(anyhow::Error::msg)?,
                None => ProgressMode::default_for_tty(),
            };
            let options = DirectoryOptions {
                recursive: !no_recursive,
                extensions,
                force,
                max_workers: workers.unwrap_or(0),
                ..Default::default()
            };

            let cancel = options.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("cancelling...");
                    cancel.cancel();
                }
            });

            let reporter = mode.reporter();
            let report = engine
                .reindex_with(&path, &options, reporter.as_ref())
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("index {}", report.root.display());
                println!("  files: {}", report.total);
                println!("  succeeded: {}", report.succeeded);
                println!("  skipped: {}", report.skipped);
                println!("  failed: {}", report.failed);
                if report.cancelled > 0 {
                    println!("  cancelled: {}", report.cancelled);
                }
                println!("  chunks written: {}", report.chunks_written);
                for failure in report.failures() {
                    println!(
                        "    {}: {}",
                        failure.path.display(),
                        failure.reason.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            if let Some(reason) = report.aborted {
                bail!("indexing aborted: {}", reason);
            }
            if !json {
                println!("ok");
            }
        }
        Commands::Remove { path } => {
            let removed = engine.remove_path(&path).await?;
            println!("removed {} file(s)", removed);
        }
        Commands::Search {
            query,
            mode,
            limit,
            file_types,
            path_prefix,
            no_rerank,
            group,
            dedupe,
            json,
        } => {
            let mut params = engine.default_params();
            match mode.as_str() {
                "hybrid" => {}
                "keyword" => {
                    params.vector_weight = 0.0;
                    params.keyword_weight = 1.0;
                }
                "vector" => {
                    params.vector_weight = 1.0;
                    params.keyword_weight = 0.0;
                }
                other => bail!(
                    "Unknown search mode: {}. Use hybrid, keyword, or vector.",
                    other
                ),
            }
            if let Some(limit) = limit {
                params.top_k = limit;
            }
            params.rerank = params.rerank && !no_rerank;
            params.filters = SearchFilters {
                file_types,
                path_prefix,
                file_ids: Vec::new(),
            };

            let mut results = engine.search(&query, &params).await?;
            if dedupe {
                results = dedupe_similar(results, engine.config().retrieval.dedupe_threshold);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
                return Ok(());
            }
            if results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            if group {
                for (i, g) in group_by_file(&results).iter().enumerate() {
                    println!("{}. [{:.2}] {}", i + 1, g.best_score, g.file_path.display());
                    for r in &g.results {
                        println!("    chunk {} [{:.2}] {}", r.chunk_index, r.score, r.snippet);
                    }
                    println!();
                }
                return Ok(());
            }
            for (i, r) in results.iter().enumerate() {
                let date = chrono::DateTime::from_timestamp(r.modified_time, 0)
                    .map(|dt| dt.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                println!(
                    "{}. [{:.2}] {} {} (chunk {})",
                    i + 1,
                    r.score,
                    r.match_type,
                    r.file_path.display(),
                    r.chunk_index
                );
                println!("    type: {}", r.file_type);
                println!("    modified: {}", date);
                println!("    excerpt: \"{}\"", r.snippet.trim());
                println!("    id: {}", r.chunk_id);
                println!();
            }
        }
        Commands::Context {
            query,
            limit,
            file_types,
            format,
        } => {
            let limit = limit.unwrap_or(engine.config().retrieval.final_limit);
            let filters = SearchFilters {
                file_types,
                ..Default::default()
            };
            let items = engine.context().get_context(&query, limit, filters).await?;
            match format.as_str() {
                "prompt" => println!("{}", format_for_prompt(&items)),
                other => {
                    let fmt = other.parse::<ExportFormat>().map_err(anyhow::Error::msg)?;
                    println!("{}", export(&items, fmt)?);
                }
            }
        }
        Commands::Stats { json } => {
            let s = engine.index_statistics().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&s)?);
            } else {
                print!("{}", stats::render(&s, engine.db_path()));
            }
        }
        Commands::Health { json } => {
            let report = engine.health_check().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.healthy {
                println!("healthy");
            } else {
                println!("unhealthy:");
                for issue in &report.issues {
                    println!("  {}", issue);
                }
            }
            if !report.healthy {
                bail!("index health check failed");
            }
        }
    }
    Ok(())
}

fn print_roots(roots: &[PathBuf]) {
    if roots.is_empty() {
        println!("  (none)");
    }
    for root in roots {
        println!("  {}", root.display());
    }
}
