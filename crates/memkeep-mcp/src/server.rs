//! MCP server: exposes [`MemoryTools`] over stdio or streamable HTTP.

use std::sync::Arc;

use anyhow::Result;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, ServerCapabilities, ServerInfo};
use rmcp::transport::streamable_http_server::StreamableHttpService;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::{ErrorData, ServerHandler, ServiceExt, schemars, tool, tool_handler, tool_router};
use serde::Deserialize;
use tracing::info;

use memkeep_memory::{DEFAULT_SEARCH_LIMIT, MemoryEngine};

use crate::tools::MemoryTools;

/// Server name advertised during initialization.
pub const SERVER_NAME: &str = "memkeep";

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SaveMemoryParams {
    /// The content to remember.
    pub text: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchMemoriesParams {
    /// What to look for.
    pub query: String,
    /// Maximum number of results (default 3). Values below 1 are reported as an error.
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    DEFAULT_SEARCH_LIMIT as i64
}

#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
pub struct ExportMemoriesParams {
    /// Output file. Defaults to `memories_export_<timestamp>.json`.
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ImportMemoriesParams {
    /// Export file to read.
    pub filename: String,
}

/// The rmcp handler. Cheap to clone; every HTTP session gets a clone.
#[derive(Clone)]
pub struct MemoryServer {
    tools: MemoryTools,
    tool_router: ToolRouter<Self>,
}

fn text(body: String) -> Result<CallToolResult, ErrorData> {
    Ok(CallToolResult::success(vec![Content::text(body)]))
}

#[tool_router]
impl MemoryServer {
    pub fn new(engine: Arc<MemoryEngine>, user_id: impl Into<String>) -> Self {
        Self {
            tools: MemoryTools::new(engine, user_id),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Save information to long-term memory. Use this for facts, preferences or context worth recalling in later conversations."
    )]
    async fn save_memory(
        &self,
        Parameters(params): Parameters<SaveMemoryParams>,
    ) -> Result<CallToolResult, ErrorData> {
        text(self.tools.save_memory(&params.text).await)
    }

    #[tool(description = "Get every stored memory for the current user, newest first.")]
    async fn get_all_memories(&self) -> Result<CallToolResult, ErrorData> {
        text(self.tools.get_all_memories().await)
    }

    #[tool(description = "Search long-term memory for the entries most relevant to a query.")]
    async fn search_memories(
        &self,
        Parameters(params): Parameters<SearchMemoriesParams>,
    ) -> Result<CallToolResult, ErrorData> {
        text(
            self.tools
                .search_memories(&params.query, params.limit)
                .await,
        )
    }

    #[tool(description = "Export all memories of the current user to a JSON backup file.")]
    async fn export_memories(
        &self,
        Parameters(params): Parameters<ExportMemoriesParams>,
    ) -> Result<CallToolResult, ErrorData> {
        text(self.tools.export_memories(params.filename.as_deref()).await)
    }

    #[tool(description = "Import memories from a JSON backup file into the current user's memory.")]
    async fn import_memories(
        &self,
        Parameters(params): Parameters<ImportMemoriesParams>,
    ) -> Result<CallToolResult, ErrorData> {
        text(self.tools.import_memories(&params.filename).await)
    }

    #[tool(description = "Get statistics about the memory collection.")]
    async fn get_memory_stats(&self) -> Result<CallToolResult, ErrorData> {
        text(self.tools.get_memory_stats().await)
    }
}

#[tool_handler]
impl ServerHandler for MemoryServer {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info.server_info.name = SERVER_NAME.into();
        info.server_info.version = env!("CARGO_PKG_VERSION").into();
        info.instructions = Some(
            "Long-term memory for the current user: save, search, list, export and import memories."
                .into(),
        );
        info
    }
}

/// Serve over stdin/stdout until the client disconnects.
pub async fn serve_stdio(server: MemoryServer) -> Result<()> {
    info!(user_id = server.tools.user_id(), "Serving MCP over stdio");
    let running = server.serve(rmcp::transport::stdio()).await?;
    running.waiting().await?;
    Ok(())
}

/// Build the HTTP router: MCP at `/mcp`, liveness at `/health`.
pub fn http_router(server: MemoryServer) -> axum::Router {
    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    axum::Router::new()
        .nest_service("/mcp", service)
        .route("/health", axum::routing::get(|| async { "ok" }))
}

/// Serve streamable HTTP on `host:port` until Ctrl-C.
pub async fn serve_http(server: MemoryServer, host: &str, port: u16) -> Result<()> {
    let user_id = server.tools.user_id().to_string();
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!(addr = %listener.local_addr()?, %user_id, "Serving MCP over HTTP at /mcp");

    axum::serve(listener, http_router(server))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}
