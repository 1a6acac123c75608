//! # Docdex CLI
//!
//! The `docdex` binary drives the document indexing pipeline: project
//! management, ingestion, embedding generation, index maintenance, semantic
//! search, and filesystem watching.
//!
//! ## Usage
//!
//! ```bash
//! docdex --config ./config/docdex.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docdex init` | Create the SQLite database and run schema migrations |
//! | `docdex project add` | Create a project |
//! | `docdex project list` | List projects |
//! | `docdex ingest <project> <path>` | Ingest a file or directory |
//! | `docdex embed document <id>` | Embed a document's pending chunks |
//! | `docdex embed project <id>` | Embed every pending chunk in a project |
//! | `docdex rebuild <project>` | Rebuild the ANN index from stored embeddings |
//! | `docdex search <project> "<query>"` | Semantic search within a project |
//! | `docdex stats <project>` | Show vector index statistics |
//! | `docdex watch <project>` | Watch the project root and auto-ingest |
//! | `docdex health` | Check the embedding service |

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use docdex::config;
use docdex::models::ProjectSettings;
use docdex::service::{PipelineEvent, Services};
use docdex::{db, migrate};

/// Docdex CLI, a local-first document indexing pipeline with semantic
/// search.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docdex.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docdex",
    about = "Docdex: a local-first document indexing pipeline with semantic search",
    version,
    long_about = "Docdex ingests files into per-project collections, chunks and embeds them \
    through a local embedding service, and maintains one approximate nearest neighbor index \
    per project for semantic retrieval."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docdex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (projects,
    /// documents, chunks, embeddings). Idempotent: running it multiple
    /// times is safe.
    Init,

    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Ingest a file or directory into a project.
    ///
    /// Parses each supported file, splits it into chunks, stores them, and
    /// generates embeddings in the background before the command exits.
    /// Re-ingesting a path replaces the document's chunks and embeddings.
    Ingest {
        /// Project UUID.
        project: String,
        /// File or directory to ingest.
        path: PathBuf,
    },

    /// Generate embeddings.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Rebuild a project's vector index from stored embeddings.
    ///
    /// The index is a derived cache; this discards it and rebuilds it from
    /// the embeddings table. Useful after index file corruption or loss.
    Rebuild {
        /// Project UUID.
        project: String,
    },

    /// Semantic search within a project.
    ///
    /// Embeds the query and returns the nearest chunks by cosine distance.
    Search {
        /// Project UUID.
        project: String,
        /// The search query string.
        query: String,
        /// Maximum number of results to return.
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Show vector index statistics for a project.
    Stats {
        /// Project UUID.
        project: String,
    },

    /// Watch a directory and auto-ingest file changes into a project.
    ///
    /// Runs until interrupted. New and modified files are ingested and
    /// embedded once they settle.
    Watch {
        /// Project UUID.
        project: String,
        /// Directory to watch. Defaults to the project's root_path.
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Check the embedding service.
    Health,
}

/// Project management subcommands.
#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project.
    Add {
        /// Human-readable project name.
        #[arg(long)]
        name: String,
        /// Directory this project mirrors (required for `watch`).
        #[arg(long)]
        root: Option<PathBuf>,
        /// Chunk size in characters.
        #[arg(long, default_value_t = 1000)]
        chunk_size: usize,
        /// Overlap between consecutive chunks in characters.
        #[arg(long, default_value_t = 200)]
        chunk_overlap: usize,
    },
    /// List all projects.
    List,
}

/// Embedding subcommands.
#[derive(Subcommand)]
enum EmbedAction {
    /// Embed a document's chunks that have no embedding yet.
    Document {
        /// Document UUID.
        id: String,
    },
    /// Embed every pending chunk across a project.
    Project {
        /// Project UUID.
        id: String,
    },
}

/// Log pipeline events until the channel closes.
async fn log_events(mut events: mpsc::Receiver<PipelineEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::IngestFailed {
                project_id,
                path,
                error,
            } => {
                warn!(project_id, path, error, "ingestion failed");
            }
            PipelineEvent::EmbeddingFailed { document_id, error } => {
                warn!(document_id, error, "embedding failed");
            }
            PipelineEvent::ProjectEmbeddingFailed { project_id, error } => {
                warn!(project_id, error, "project embedding failed");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let pool = db::connect(&cfg).await?;
        migrate::run_migrations(&pool).await?;
        pool.close().await;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let (services, events_rx) = Services::new(cfg).await?;
    let event_logger = tokio::spawn(log_events(events_rx));

    let result = run_command(&services, cli.command).await;

    services.shutdown().await;
    event_logger.abort();
    result
}

async fn run_command(services: &Arc<Services>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => unreachable!("handled before service construction"),

        Commands::Project { action } => match action {
            ProjectAction::Add {
                name,
                root,
                chunk_size,
                chunk_overlap,
            } => {
                let root = root.map(|p| p.display().to_string());
                let project = services
                    .create_project(
                        &name,
                        root.as_deref(),
                        &ProjectSettings {
                            chunk_size,
                            chunk_overlap,
                        },
                    )
                    .await?;
                println!("Created project {} ({})", project.name, project.id);
            }
            ProjectAction::List => {
                let projects = services.list_projects().await?;
                if projects.is_empty() {
                    println!("No projects.");
                }
                for project in projects {
                    println!(
                        "{}  {}  root={}",
                        project.id,
                        project.name,
                        project.root_path.as_deref().unwrap_or("-")
                    );
                }
            }
        },

        Commands::Ingest { project, path } => {
            let summary = services.ingest_path(&project, &path).await?;
            println!(
                "Ingested {} file(s), {} failed, {} skipped.",
                summary.ingested, summary.failed, summary.skipped
            );
            services.wait_for_background_jobs().await;
        }

        Commands::Embed { action } => match action {
            EmbedAction::Document { id } => match services.embed_document(&id).await? {
                Some(report) => println!(
                    "Embedded {}/{} chunks ({} failed), status {:?}.",
                    report.completed, report.total, report.failed, report.status
                ),
                None => println!("An embedding job for this document is already running."),
            },
            EmbedAction::Project { id } => match services.embed_project(&id).await? {
                Some(report) => println!(
                    "Embedded {}/{} chunks ({} failed), status {:?}.",
                    report.completed, report.total, report.failed, report.status
                ),
                None => println!("An embedding job for this project is already running."),
            },
        },

        Commands::Rebuild { project } => {
            let count = services.rebuild_index(&project).await?;
            println!("Rebuilt index with {} vector(s).", count);
        }

        Commands::Search {
            project,
            query,
            limit,
        } => {
            let results = services.search(&project, &query, limit).await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, result) in results.iter().enumerate() {
                let snippet: String = result.content.chars().take(120).collect();
                println!(
                    "{}. [{:.4}] chunk {} (document {})\n   {}",
                    i + 1,
                    result.distance,
                    result.chunk_id,
                    result.document_id,
                    snippet
                );
            }
        }

        Commands::Stats { project } => {
            let stats = services.index_stats(&project).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Watch { project, path } => {
            services.watch_project(&project, path.as_deref()).await?;
            println!("Watching project {}. Press Ctrl-C to stop.", project);
            tokio::signal::ctrl_c().await?;
            services.unwatch_project(&project);
        }

        Commands::Health => {
            let health = services.health().await;
            println!(
                "{}: {}",
                if health.healthy { "healthy" } else { "unhealthy" },
                health.message
            );
        }
    }

    Ok(())
}
