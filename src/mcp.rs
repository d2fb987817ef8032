use std::sync::Arc;

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    data_dir::DataDir,
    embedding::Embedder,
    error,
    events::CollectionStatus,
    retrieval::RetrievalResult,
    service::{IndexService, IndexerHandle, ServiceOptions},
};

const DEFAULT_RETRIEVE_LIMIT: usize = 10;
const DEFAULT_SNIPPET_MAX_CHARS: usize = 400;

#[derive(Clone)]
pub struct LocalDocsMcpServer {
    index: IndexerHandle,
    tool_router: ToolRouter<Self>,
}

impl LocalDocsMcpServer {
    pub fn new(index: IndexerHandle) -> Self {
        Self {
            index,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router(router = tool_router)]
impl LocalDocsMcpServer {
    /// Retrieve the chunks closest to a query.
    #[tool(
        name = "localdocs_retrieve",
        description = "Retrieve passages from locally indexed documents that are semantically closest to a query. Restrict to collections when possible."
    )]
    pub async fn localdocs_retrieve(
        &self,
        params: Parameters<RetrieveParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let collections = match params.collections {
            Some(collections) if !collections.is_empty() => collections,
            _ => self
                .all_collection_names()
                .await
                .map_err(|e| mcp_error("failed to list collections", e))?,
        };

        let results = self
            .index
            .retrieve(
                collections,
                &params.query,
                params.limit.unwrap_or(DEFAULT_RETRIEVE_LIMIT),
            )
            .await
            .map_err(|e| mcp_error("retrieval failed", e))?;

        let include_text = params.include_text.unwrap_or(true);
        let items: Vec<RetrieveResultItem> = results
            .into_iter()
            .enumerate()
            .map(|(rank, r)| RetrieveResultItem::new(rank + 1, r, include_text))
            .collect();

        let summary = format_retrieve_summary(&items, &params.query);
        let structured = serde_json::to_value(RetrieveResponse {
            query: params.query,
            result_count: items.len(),
            results: items,
        })
        .map_err(|e| mcp_error("failed to serialize results", e))?;

        Ok(CallToolResult {
            content: vec![Content::text(summary)],
            structured_content: Some(structured),
            is_error: Some(false),
            meta: None,
        })
    }

    /// List collections, their folders and indexing progress.
    #[tool(
        name = "localdocs_collections",
        description = "List indexed collections with their folders, embedding model and indexing progress."
    )]
    pub async fn localdocs_collections(
        &self,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let collections = self
            .index
            .collections()
            .await
            .map_err(|e| mcp_error("failed to list collections", e))?;

        let summary = format_collections_summary(&collections);
        let structured = serde_json::to_value(CollectionsResponse {
            collection_count: collections.len(),
            collections,
        })
        .map_err(|e| mcp_error("failed to serialize collections", e))?;

        Ok(CallToolResult {
            content: vec![Content::text(summary)],
            structured_content: Some(structured),
            is_error: Some(false),
            meta: None,
        })
    }
}

impl LocalDocsMcpServer {
    async fn all_collection_names(&self) -> error::Result<Vec<String>> {
        let mut names: Vec<String> = self
            .index
            .collections()
            .await?
            .into_iter()
            .map(|status| status.entry.collection)
            .collect();
        names.dedup();
        Ok(names)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for LocalDocsMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "localdocs".to_string(),
                title: Some("LocalDocs MCP".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Use localdocs_collections to see what is indexed, then localdocs_retrieve to fetch relevant passages."
                    .to_string(),
            ),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveParams {
    /// Natural-language query.
    pub query: String,
    /// Collections to search (default: all).
    pub collections: Option<Vec<String>>,
    /// Maximum number of passages (default: 10).
    pub limit: Option<usize>,
    /// Include passage text (default: true).
    pub include_text: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResponse {
    query: String,
    result_count: usize,
    results: Vec<RetrieveResultItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResultItem {
    rank: usize,
    chunk_id: u64,
    file: String,
    title: String,
    author: String,
    date: String,
    page: Option<i32>,
    text: Option<String>,
}

impl RetrieveResultItem {
    fn new(rank: usize, result: RetrievalResult, include_text: bool) -> Self {
        Self {
            rank,
            chunk_id: result.chunk_id,
            file: result.file,
            title: result.title,
            author: result.author,
            date: result.date,
            page: (result.page > 0).then_some(result.page),
            text: include_text.then(|| truncate_text(result.text)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CollectionsResponse {
    collection_count: usize,
    collections: Vec<CollectionStatus>,
}

fn truncate_text(mut text: String) -> String {
    if text.len() > DEFAULT_SNIPPET_MAX_CHARS {
        let mut end = DEFAULT_SNIPPET_MAX_CHARS;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("...");
    }
    text
}

fn format_retrieve_summary(results: &[RetrieveResultItem], query: &str) -> String {
    if results.is_empty() {
        return format!("No passages found for \"{query}\"");
    }

    let mut lines = Vec::with_capacity(results.len() + 1);
    let suffix = if results.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} passage{} for \"{query}\":",
        results.len(),
        suffix
    ));

    for item in results {
        match item.page {
            Some(page) => lines.push(format!(
                "{}. {} (page {page}, {})",
                item.rank, item.file, item.date
            )),
            None => lines.push(format!("{}. {} ({})", item.rank, item.file, item.date)),
        }
    }

    lines.join("\n")
}

fn format_collections_summary(collections: &[CollectionStatus]) -> String {
    if collections.is_empty() {
        return "No collections indexed.".to_string();
    }
    collections
        .iter()
        .map(|c| {
            let state = if c.entry.force_indexing {
                "needs reindex"
            } else if c.progress.is_busy() {
                "indexing"
            } else {
                "ready"
            };
            format!(
                "{}\t{}\t{} docs\t{}",
                c.entry.collection,
                c.entry.folder_path,
                c.progress.total_docs,
                state
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

/// Serve MCP over stdio, indexing and watching in the background.
pub fn run_mcp(
    data_dir: DataDir,
    embedder: Arc<dyn Embedder>,
) -> error::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            error::Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    runtime.block_on(async move {
        let mut options = ServiceOptions::new(data_dir, embedder);
        options.watch = true;
        let service = IndexService::spawn(options).await?;
        let server = LocalDocsMcpServer::new(service.handle());

        let transport = rmcp::transport::stdio();
        let served = async {
            let running = server.serve(transport).await.map_err(|e| {
                error::Error::Config(format!(
                    "MCP server initialization failed: {e}"
                ))
            })?;
            running.waiting().await.map_err(|e| {
                error::Error::Config(format!("MCP server error: {e}"))
            })?;
            Ok(())
        }
        .await;

        service.shutdown().await;
        served
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    struct LengthEmbedder;

    impl Embedder for LengthEmbedder {
        fn model_name(&self) -> &str {
            "length"
        }

        fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }

        fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            texts.iter().map(|t| self.embed_query(t)).collect()
        }
    }

    #[tokio::test]
    async fn retrieve_tool_returns_structured_results() {
        let tmp = tempfile::tempdir().unwrap();
        let notes = tmp.path().join("notes");
        std::fs::create_dir_all(&notes).unwrap();
        std::fs::write(
            notes.join("rust.md"),
            "Rust is fast. Ownership keeps memory safe.",
        )
        .unwrap();

        let data_dir =
            DataDir::resolve(Some(&tmp.path().join("data"))).unwrap();
        let service = IndexService::spawn(ServiceOptions::new(
            data_dir,
            Arc::new(LengthEmbedder),
        ))
        .await
        .unwrap();
        let handle = service.handle();
        handle.add_folder("notes", &notes).await.unwrap();
        handle.wait_idle().await.unwrap();

        let server = LocalDocsMcpServer::new(handle);
        let result = server
            .localdocs_retrieve(Parameters(RetrieveParams {
                query: "Rust".to_string(),
                collections: None,
                limit: Some(5),
                include_text: Some(true),
            }))
            .await
            .unwrap();

        let structured = result.structured_content.expect("structured");
        let results = structured
            .get("results")
            .and_then(|v| v.as_array())
            .expect("results array");
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].get("file").and_then(|v| v.as_str()),
            Some("rust.md")
        );
        assert_eq!(results[0].get("rank").and_then(|v| v.as_u64()), Some(1));
        assert!(
            results[0]
                .get("text")
                .and_then(|v| v.as_str())
                .is_some_and(|t| t.contains("Ownership"))
        );

        let listed = server.localdocs_collections().await.unwrap();
        let structured = listed.structured_content.expect("structured");
        assert_eq!(
            structured.get("collectionCount").and_then(|v| v.as_u64()),
            Some(1)
        );

        service.shutdown().await;
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "é".repeat(DEFAULT_SNIPPET_MAX_CHARS);
        let truncated = truncate_text(text);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= DEFAULT_SNIPPET_MAX_CHARS + 3);
    }

    #[test]
    fn empty_summary_mentions_query() {
        assert_eq!(
            format_retrieve_summary(&[], "ownership"),
            "No passages found for \"ownership\""
        );
    }
}
