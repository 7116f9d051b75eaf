use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use memkeep_config::{MemkeepConfig, Transport};
use memkeep_mcp::{MemoryServer, MemoryTools};
use memkeep_memory::{DEFAULT_SEARCH_LIMIT, MemoryEngine};

#[derive(Parser)]
#[command(name = "memkeep", about = "Long-term memory MCP server")]
struct Cli {
    /// User whose memories are read and written (overrides config)
    #[arg(short, long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP server
    Serve {
        /// Transport to serve on: stdio or http
        #[arg(short, long)]
        transport: Option<Transport>,

        /// Host to bind for the HTTP transport
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on for the HTTP transport
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Save a memory
    Save {
        /// Content to remember
        text: String,
    },
    /// List all memories, newest first
    List,
    /// Search memories by meaning
    Search {
        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(short, long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// Export memories to a JSON file
    Export {
        /// Output file (defaults to memories_export_<timestamp>.json)
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Import memories from a JSON export file
    Import {
        /// Export file to read
        file: String,
    },
    /// Show collection statistics
    Stats,
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout belongs to the stdio transport and command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = memkeep_config::load_config()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli, config))
}

async fn run(cli: Cli, mut config: MemkeepConfig) -> anyhow::Result<()> {
    let user_id = cli.user.unwrap_or_else(|| config.default_user_id.clone());
    let engine = Arc::new(MemoryEngine::open(&config.memory).await?);
    let tools = MemoryTools::new(engine.clone(), user_id.clone());

    match cli.command {
        Commands::Serve {
            transport,
            host,
            port,
        } => {
            if let Some(transport) = transport {
                config.server.transport = transport;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            let server = MemoryServer::new(engine.clone(), user_id);
            match config.server.transport {
                Transport::Stdio => memkeep_mcp::serve_stdio(server).await?,
                Transport::Http => {
                    memkeep_mcp::serve_http(server, &config.server.host, config.server.port)
                        .await?
                }
            }
        }
        Commands::Save { text } => println!("{}", tools.save_memory(&text).await),
        Commands::List => println!("{}", tools.get_all_memories().await),
        Commands::Search { query, limit } => {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            println!("{}", tools.search_memories(&query, limit).await)
        }
        Commands::Export { file } => println!("{}", tools.export_memories(file.as_deref()).await),
        Commands::Import { file } => println!("{}", tools.import_memories(&file).await),
        Commands::Stats => println!("{}", tools.get_memory_stats().await),
    }

    engine.shutdown().await;
    info!("memkeep exiting");
    Ok(())
}
