mod cli;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use memento::{config, engine, search, store, tools};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "memento", version, about = "Long-term memory MCP server for coding assistants")]
struct Cli {
    /// Config file (defaults to ~/.memento/config.toml)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server (stdio transport)
    Serve,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Search stored memories
    Search {
        /// Query text. Omit to list recent records.
        query: Option<String>,
        /// Restrict to one project
        #[arg(long)]
        project: Option<String>,
        /// all, observations, sessions or prompts
        #[arg(long = "type", default_value = "all")]
        search_type: String,
        #[arg(long)]
        limit: Option<usize>,
        /// Print content, not just titles
        #[arg(long)]
        full: bool,
    },
    /// Show record counts and vector index status
    Stats {
        #[arg(long)]
        project: Option<String>,
    },
    /// Run retention passes now
    Cleanup {
        #[arg(long)]
        project: Option<String>,
    },
    /// Re-embed vectors written by a previous embedding model
    Reembed,
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to the configured cache directory
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::MementoConfig::load_from(path)?,
        None => config::MementoConfig::load()?,
    };

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let default_project = config.storage.default_project.clone();

    match cli.command {
        Command::Serve => {
            server::serve_stdio(config).await?;
        }
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config.embedding).await?;
            }
        },
        Command::Search {
            query,
            project,
            search_type,
            limit,
            full,
        } => {
            let search_type: search::SearchType = search_type.parse()?;
            let engine = engine::MemoryEngine::open(&config)?;
            cli::search::search(&engine, query, project, search_type, limit, full).await?;
            engine.shutdown().await;
        }
        Command::Stats { project } => {
            let engine = engine::MemoryEngine::open(&config)?;
            cli::stats::stats(&engine, project.as_deref().unwrap_or(&default_project)).await?;
        }
        Command::Cleanup { project } => {
            let engine = engine::MemoryEngine::open(&config)?;
            cli::cleanup::cleanup(&engine, project.as_deref().unwrap_or(&default_project)).await?;
        }
        Command::Reembed => {
            let engine = engine::MemoryEngine::open(&config)?;
            cli::reembed::reembed(&engine).await?;
        }
    }

    Ok(())
}
