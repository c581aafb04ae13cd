use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use artifact_index::config::{load_config, IndexConfig};
use artifact_index::models::SearchOptions;
use artifact_index::progress::ProgressMode;
use artifact_index::service::{default_db_path, IndexService};
use artifact_index::store::Store;

/// Artifact Index CLI — a per-project semantic index and hybrid search for
/// XML integration artifacts.
#[derive(Parser)]
#[command(
    name = "arti",
    about = "Semantic index and hybrid search for XML integration artifacts",
    version
)]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project root. Defaults to the current directory.
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the project's store and schema.
    ///
    /// Idempotent; the store lives under the user data directory, never in
    /// the project tree.
    Init,

    /// Index the project once and exit.
    ///
    /// Incremental: unchanged files are skipped via the warm-started
    /// scanner, unchanged chunks keep their embeddings.
    Index {
        /// Emit machine-readable progress (one JSON object per line on stderr).
        #[arg(long)]
        json_progress: bool,
    },

    /// Search the project index.
    Search {
        /// The query string.
        query: String,

        /// Maximum number of results (capped at 50).
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum hybrid score for a result.
        #[arg(long)]
        threshold: Option<f32>,

        /// Restrict to one semantic type (api, sequence, mediator, …).
        #[arg(long)]
        semantic_type: Option<String>,
    },

    /// Index the project and keep watching for changes until interrupted.
    Watch,

    /// Print chunk counts for the project's store.
    Stats,
}

fn resolve_config(cli: &Cli) -> Result<IndexConfig> {
    match &cli.config {
        Some(path) => load_config(path),
        None => Ok(IndexConfig::default()),
    }
}

fn resolve_project(cli: &Cli) -> Result<PathBuf> {
    let root = match &cli.project {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    Ok(root.canonicalize().unwrap_or(root))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let project = resolve_project(&cli)?;

    match cli.command {
        Commands::Init => {
            let db_path = match &config.db.path {
                Some(path) => path.clone(),
                None => default_db_path(&project)?,
            };
            let store = Store::open(&db_path).await.map_err(anyhow::Error::new)?;
            store.close().await;
            println!("initialized {}", db_path.display());
        }
        Commands::Index { json_progress } => {
            let mode = if json_progress {
                ProgressMode::Json
            } else {
                ProgressMode::default_for_tty()
            };
            let service = IndexService::for_project(&project, config);
            service.set_progress(mode);
            if !service.start().await {
                anyhow::bail!("index initialization failed (see log output)");
            }
            println!("indexed {} chunks", service.chunk_count().await);
            service.stop().await;
        }
        Commands::Search {
            query,
            top_k,
            threshold,
            semantic_type,
        } => {
            let service = IndexService::for_project(&project, config);
            if !service.start().await {
                anyhow::bail!("index initialization failed (see log output)");
            }
            let response = service
                .search(
                    &query,
                    &SearchOptions {
                        top_k,
                        score_threshold: threshold,
                        semantic_type,
                    },
                )
                .await;

            if let Some(message) = &response.message {
                eprintln!("{}", message);
            }
            if response.results.is_empty() {
                println!("No results.");
            }
            for (i, result) in response.results.iter().enumerate() {
                println!(
                    "{}. [{:.4}] {}:{}-{}",
                    i + 1,
                    result.score,
                    result.file_path,
                    result.line_range[0],
                    result.line_range[1]
                );
                println!("    {}", result.xml_element_hierarchy.join(" > "));
            }
            println!("latency: {} ms", response.query_latency_ms);
            service.stop().await;
        }
        Commands::Watch => {
            let service = IndexService::for_project(&project, config);
            if !service.start().await {
                anyhow::bail!("index initialization failed (see log output)");
            }
            println!(
                "watching {} ({} chunks indexed); ctrl-c to stop",
                project.display(),
                service.chunk_count().await
            );
            tokio::signal::ctrl_c().await?;
            service.stop().await;
        }
        Commands::Stats => {
            let service = IndexService::for_project(&project, config);
            if !service.start().await {
                anyhow::bail!("index initialization failed (see log output)");
            }
            println!("chunks: {}", service.chunk_count().await);
            service.stop().await;
        }
    }

    Ok(())
}
