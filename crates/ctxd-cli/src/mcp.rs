//! Model Context Protocol server.
//!
//! Serves three tools over stdio:
//! - `ctx_search`: search the index with the same filters as `ctxd search`
//! - `ctx_status`: index statistics
//! - `ctx_index`: index a path under the project root
//!
//! The embedding provider is built on first use and shared by later calls.
//! A background task warms it up once the server starts.

use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ctxd_index::{ChunkStore, EmbeddingProvider, IndexStats, SearchMode, SearchResult};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, ListToolsResult, PaginatedRequestParam,
    ProtocolVersion, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::transport::stdio;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::commands::{run_index, run_search_with, SearchOptions};
use crate::workspace::Workspace;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Arguments of `ctx_search`.
#[derive(Debug, Default, Deserialize, JsonSchema)]
#[schemars(description = "Parameters for searching the code index")]
pub struct SearchArgs {
    #[schemars(description = "Natural language or keyword query")]
    pub query: String,
    #[schemars(description = "Maximum number of results (defaults to search.default_limit)")]
    #[serde(default)]
    pub limit: Option<usize>,
    #[schemars(description = "Only paths containing this substring")]
    #[serde(default)]
    pub file_filter: Option<String>,
    #[schemars(description = "Only chunks tagged with this git branch")]
    #[serde(default)]
    pub branch: Option<String>,
    #[schemars(description = "File extensions such as [\".py\", \".rs\"]")]
    #[serde(default)]
    pub extensions: Vec<String>,
    #[schemars(description = "Directory prefixes such as [\"src/\"]")]
    #[serde(default)]
    pub directories: Vec<String>,
    #[schemars(description = "Chunk types such as [\"function\", \"class\"]")]
    #[serde(default)]
    pub chunk_types: Vec<String>,
    #[schemars(description = "Languages such as [\"python\"]")]
    #[serde(default)]
    pub languages: Vec<String>,
    #[schemars(description = "vector, fts or hybrid (defaults to search.mode)")]
    #[serde(default)]
    pub mode: Option<String>,
    #[schemars(description = "Include surrounding source lines")]
    #[serde(default)]
    pub expand_context: Option<bool>,
    #[schemars(description = "Drop results overlapping a better one from the same file")]
    #[serde(default)]
    pub deduplicate: Option<bool>,
}

/// Arguments of `ctx_status`.
#[derive(Debug, Default, Deserialize, JsonSchema)]
#[schemars(description = "No parameters")]
pub struct StatusArgs {}

/// Arguments of `ctx_index`.
#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(description = "Parameters for indexing a file or directory")]
pub struct IndexArgs {
    #[schemars(description = "Path relative to the project root")]
    #[serde(default = "default_index_path")]
    pub path: String,
    #[schemars(description = "Re-index files even when unchanged")]
    #[serde(default)]
    pub force: bool,
    #[schemars(description = "Branch to tag chunks with (auto-detected if not given)")]
    #[serde(default)]
    pub branch: Option<String>,
}

fn default_index_path() -> String {
    ".".to_string()
}

/// One search hit as returned to MCP clients.
#[derive(Debug, Serialize)]
struct Hit<'a> {
    path: &'a str,
    start_line: usize,
    end_line: usize,
    code: &'a str,
    score: f32,
    language: &'a str,
    chunk_type: String,
    name: Option<&'a str>,
    branch: Option<&'a str>,
}

impl<'a> From<&'a SearchResult> for Hit<'a> {
    fn from(result: &'a SearchResult) -> Self {
        let chunk = &result.chunk;
        Self {
            path: &chunk.path,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            code: &chunk.text,
            score: (result.score * 1000.0).round() / 1000.0,
            language: &chunk.language,
            chunk_type: chunk.chunk_type.to_string(),
            name: chunk.name.as_deref(),
            branch: chunk.branch.as_deref(),
        }
    }
}

fn stats_json(stats: &IndexStats) -> Value {
    json!({
        "total_files": stats.total_files,
        "total_chunks": stats.total_chunks,
        "total_size_mb": ((stats.total_size_bytes as f64 / BYTES_PER_MB) * 100.0).round() / 100.0,
        "languages": stats.languages,
        "last_indexed": stats.last_indexed,
    })
}

/// MCP handler over one project workspace.
#[derive(Clone)]
pub struct CtxdServer {
    workspace: Arc<Workspace>,
    embedder: Arc<OnceCell<Arc<dyn EmbeddingProvider>>>,
}

impl CtxdServer {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace: Arc::new(workspace),
            embedder: Arc::new(OnceCell::new()),
        }
    }

    /// Shared embedding provider, created on first call.
    async fn embedder(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        let embedder = self
            .embedder
            .get_or_try_init(|| async {
                info!("Creating embedding provider for {}", self.workspace.config.embeddings.model);
                self.workspace.embedder()
            })
            .await?;
        Ok(Arc::clone(embedder))
    }

    /// Load the embedding model in the background so the first search
    /// does not pay for it. Failures only matter once a tool needs it.
    pub fn warm_up(&self) {
        let server = self.clone();
        tokio::spawn(async move {
            let result = match server.embedder().await {
                Ok(embedder) => embedder.warm_up().await.map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!("Embedding model warmed up"),
                Err(e) => debug!("Background warm-up failed: {:#}", e),
            }
        });
    }

    pub async fn search(&self, args: SearchArgs) -> Result<Value> {
        if args.query.trim().is_empty() {
            anyhow::bail!("query must not be empty");
        }
        let mode = match &args.mode {
            Some(mode) => Some(mode.parse::<SearchMode>()?),
            None => None,
        };
        let options = SearchOptions {
            limit: args.limit,
            mode,
            file: args.file_filter,
            branch: args.branch,
            extensions: args.extensions,
            directories: args.directories,
            chunk_types: args.chunk_types,
            languages: args.languages,
            no_dedup: args.deduplicate == Some(false),
            expand: args.expand_context == Some(true),
        };
        let mode = match options.mode {
            Some(mode) => mode,
            None => self.workspace.default_mode()?,
        };

        let embedder = if mode.needs_vector() {
            Some(self.embedder().await?)
        } else {
            None
        };
        let results = run_search_with(&self.workspace, embedder, &args.query, &options).await?;
        info!("Search for {:?} ({} mode) returned {} results", args.query, mode, results.len());

        let hits: Vec<Hit<'_>> = results.iter().map(Hit::from).collect();
        Ok(json!({
            "query": args.query,
            "mode": mode.to_string(),
            "count": hits.len(),
            "results": hits,
        }))
    }

    pub async fn status(&self) -> Result<Value> {
        if !self.workspace.has_index() {
            return Ok(json!({ "indexed": false, "total_files": 0, "total_chunks": 0 }));
        }
        let stats = self
            .workspace
            .store
            .get_stats()
            .await
            .context("Failed to read index")?;
        let mut value = stats_json(&stats);
        value["indexed"] = json!(stats.total_chunks > 0);
        Ok(value)
    }

    pub async fn index(&self, args: IndexArgs) -> Result<Value> {
        let target = self.resolve(&args.path)?;
        info!(
            "Indexing {:?} (force={}, branch={})",
            target,
            args.force,
            args.branch.as_deref().unwrap_or("auto-detect")
        );

        let embedder = self.embedder().await?;
        let stats = run_index(&self.workspace, embedder, &target, args.force, args.branch, None).await?;
        self.workspace
            .store
            .flush()
            .await
            .context("Failed to persist chunk table")?;

        let mut value = stats_json(&stats);
        value["path"] = json!(args.path);
        Ok(value)
    }

    /// `path` relative to the project root; it must exist and stay inside it.
    fn resolve(&self, path: &str) -> Result<std::path::PathBuf> {
        let root = &self.workspace.root;
        let target = root
            .join(Path::new(path))
            .canonicalize()
            .with_context(|| format!("Path does not exist: {}", path))?;
        if !target.starts_with(root) {
            anyhow::bail!("{} is outside the project root", path);
        }
        Ok(target)
    }
}

fn tool(name: &'static str, description: &'static str, schema: schemars::Schema) -> Result<Tool, McpError> {
    let schema = serde_json::to_value(schema).map_err(|e| McpError::internal_error(e.to_string(), None))?;
    let input_schema = schema
        .as_object()
        .ok_or_else(|| McpError::internal_error(format!("Schema for {} is not an object", name), None))?
        .clone();

    Ok(Tool {
        name: Cow::Borrowed(name),
        title: None,
        description: Some(Cow::Borrowed(description)),
        input_schema: Arc::new(input_schema),
        output_schema: None,
        annotations: None,
        icons: None,
        meta: Default::default(),
    })
}

/// Every tool the server offers.
pub fn tool_list() -> Result<Vec<Tool>, McpError> {
    Ok(vec![
        tool(
            "ctx_search",
            "Search indexed code semantically, by keywords, or both",
            schemars::schema_for!(SearchArgs),
        )?,
        tool(
            "ctx_status",
            "Statistics about the indexed codebase",
            schemars::schema_for!(StatusArgs),
        )?,
        tool(
            "ctx_index",
            "Index a file or directory under the project root",
            schemars::schema_for!(IndexArgs),
        )?,
    ])
}

fn parse_args<T: serde::de::DeserializeOwned>(request: &CallToolRequestParam) -> Result<T, McpError> {
    let value = Value::Object(request.arguments.clone().unwrap_or_default());
    serde_json::from_value(value).map_err(|e| McpError::invalid_params(format!("Invalid arguments: {}", e), None))
}

/// Tool failures are reported to the client as error results, not
/// protocol errors.
fn to_result(name: &str, outcome: Result<Value>) -> Result<CallToolResult, McpError> {
    match outcome {
        Ok(value) => {
            let text =
                serde_json::to_string_pretty(&value).map_err(|e| McpError::internal_error(e.to_string(), None))?;
            Ok(CallToolResult::success(vec![Content::text(text)]))
        }
        Err(e) => {
            error!("{} failed: {:#}", name, e);
            Ok(CallToolResult::error(vec![Content::text(format!("{:#}", e))]))
        }
    }
}

impl ServerHandler for CtxdServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "ctxd".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "ctxd - local semantic code search\n\n\
                 Tools:\n\
                 - ctx_search: search the index\n\
                 - ctx_status: index statistics\n\
                 - ctx_index: index a path under the project root\n"
                    .to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _pagination: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: tool_list()?,
            meta: Default::default(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Tool call: {}", request.name);
        match request.name.as_ref() {
            "ctx_search" => {
                let args = parse_args::<SearchArgs>(&request)?;
                to_result("ctx_search", self.search(args).await)
            }
            "ctx_status" => to_result("ctx_status", self.status().await),
            "ctx_index" => {
                let args = parse_args::<IndexArgs>(&request)?;
                to_result("ctx_index", self.index(args).await)
            }
            other => Err(McpError::invalid_params(format!("Unknown tool: {}", other), None)),
        }
    }
}

/// Serve `workspace` over stdin/stdout until the client disconnects or
/// Ctrl-C is pressed.
pub async fn serve(workspace: Workspace) -> Result<()> {
    let server = CtxdServer::new(workspace);
    server.warm_up();

    info!("Starting MCP server on stdio");
    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP service: {}", e))?;

    tokio::select! {
        result = service.waiting() => {
            result.context("MCP service stopped with an error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }
    info!("MCP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxd_config::Config;
    use std::fs;
    use tempfile::tempdir;

    fn hash_server(root: &Path) -> CtxdServer {
        let mut config = Config::default();
        config.embeddings.provider = "hash".to_string();
        config.embeddings.dimensions = 64;
        config.git.enabled = false;
        CtxdServer::new(Workspace::with_config(root, config))
    }

    #[test]
    fn test_tool_list_names_and_schemas() {
        let tools = tool_list().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec!["ctx_search", "ctx_status", "ctx_index"]);

        let search = &tools[0];
        let properties = search.input_schema.get("properties").unwrap();
        assert!(properties.get("query").is_some());
        assert!(properties.get("chunk_types").is_some());
    }

    #[test]
    fn test_search_args_defaults() {
        let args: SearchArgs = serde_json::from_value(json!({ "query": "parse" })).unwrap();
        assert_eq!(args.query, "parse");
        assert_eq!(args.limit, None);
        assert!(args.extensions.is_empty());

        let index: IndexArgs = serde_json::from_value(json!({})).unwrap();
        assert_eq!(index.path, ".");
        assert!(!index.force);
    }

    #[tokio::test]
    async fn test_status_without_index() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let status = hash_server(&root).status().await.unwrap();
        assert_eq!(status["indexed"], json!(false));
    }

    #[tokio::test]
    async fn test_index_then_search_and_status() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir(root.join("src")).unwrap();
        fs::write(root.join("src/math.py"), "def multiply(a, b):\n    return a * b\n").unwrap();
        let server = hash_server(&root);

        let indexed = server
            .index(IndexArgs {
                path: "src".to_string(),
                force: false,
                branch: None,
            })
            .await
            .unwrap();
        assert_eq!(indexed["total_files"], json!(1));
        assert_eq!(indexed["path"], json!("src"));

        let found = server
            .search(SearchArgs {
                query: "multiply".to_string(),
                mode: Some("fts".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found["mode"], json!("fts"));
        assert!(found["count"].as_u64().unwrap() >= 1);
        assert_eq!(found["results"][0]["path"], json!("src/math.py"));

        let status = server.status().await.unwrap();
        assert_eq!(status["indexed"], json!(true));
        assert_eq!(status["total_files"], json!(1));
    }

    #[tokio::test]
    async fn test_index_rejects_paths_outside_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir(root.join("inner")).unwrap();
        let server = hash_server(&root.join("inner"));

        let missing = server
            .index(IndexArgs {
                path: "nope".to_string(),
                force: false,
                branch: None,
            })
            .await;
        assert!(missing.is_err());

        let escaped = server
            .index(IndexArgs {
                path: "..".to_string(),
                force: false,
                branch: None,
            })
            .await;
        assert!(escaped.is_err());
    }

    #[tokio::test]
    async fn test_search_rejects_bad_mode_and_empty_query() {
        let dir = tempdir().unwrap();
        let server = hash_server(dir.path());

        let bad_mode = server
            .search(SearchArgs {
                query: "x".to_string(),
                mode: Some("semantic".to_string()),
                ..Default::default()
            })
            .await;
        assert!(bad_mode.is_err());

        let empty = server
            .search(SearchArgs {
                query: "   ".to_string(),
                ..Default::default()
            })
            .await;
        assert!(empty.is_err());
    }
}
