use anyhow::Result;
use clap::{Parser, Subcommand};

mod orchestrate;

#[derive(Parser, Debug)]
#[command(name = "exagate")]
#[command(about = "Exa tool gateway (MCP stdio server)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server (for Cursor / MCP clients).
    McpStdio,
    /// Diagnose configuration/launch issues (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format. Allowed: json, text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format. Allowed: json, text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    // stdout belongs to the MCP transport; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(feature = "stdio")]
mod mcp {
    use crate::orchestrate;
    use exagate_core::{
        params, Error as CoreError, ExaBackend, ResearchCreate, Result as CoreResult,
        SearchRequest, SubpageBundle, SubpageRequest,
    };
    use exagate_exa::ExaClient;
    use rmcp::{
        handler::server::router::tool::ToolRouter as RmcpToolRouter,
        handler::server::wrapper::Parameters,
        model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
        tool, tool_handler, tool_router,
        transport::stdio,
        ErrorData as McpError, ServiceExt,
    };
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::Arc;
    use std::time::Instant;

    const SCHEMA_VERSION: u64 = 1;

    mod envelope;
    use envelope::*;

    fn tool_result(payload: serde_json::Value) -> CallToolResult {
        // Always attach structured content for machine consumers, and include a text fallback
        // for older clients/tests that only read `content[0].text`.
        let mut r = CallToolResult::structured(payload.clone());
        r.content = vec![Content::text(payload.to_string())];
        r
    }

    fn error_payload(err: &CoreError) -> serde_json::Value {
        match err {
            CoreError::Validation { .. } => error_obj(
                ErrorCode::InvalidParams,
                err,
                "Fix the argument and retry; no upstream call was made.",
            ),
            CoreError::Auth => error_obj(
                ErrorCode::NotConfigured,
                err,
                "Set EXAGATE_EXA_API_KEY (or EXA_API_KEY) in the server environment.",
            ),
            CoreError::Upstream { status: 429, .. } => error_obj(
                ErrorCode::UpstreamError,
                err,
                "Exa is rate-limiting. Retry later, or reduce num_results/batch size.",
            ),
            CoreError::Upstream { .. } => error_obj(
                ErrorCode::UpstreamError,
                err,
                "Exa rejected the request. Check the URL and arguments.",
            ),
            CoreError::NotFound(_) => error_obj(
                ErrorCode::TaskNotFound,
                err,
                "Use the task_id returned by exa_research_start.",
            ),
            CoreError::Fetch(_) => error_obj(
                ErrorCode::FetchFailed,
                err,
                "Transient failure after bounded retries; retry later.",
            ),
        }
    }

    fn finish(kind: &str, t0: Instant, r: CoreResult<serde_json::Value>) -> CallToolResult {
        let mut payload = match r {
            Ok(mut data) => {
                data["ok"] = serde_json::json!(true);
                data
            }
            Err(e) => serde_json::json!({ "ok": false, "error": error_payload(&e) }),
        };
        add_envelope_fields(&mut payload, kind, t0.elapsed().as_millis());
        tool_result(payload)
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct WebSearchArgs {
        /// The search query (required).
        #[serde(default)]
        query: Option<String>,
        /// Maximum number of results to return (default: 3).
        #[serde(default)]
        num_results: Option<usize>,
        /// Include full page text in each result instead of a snippet (default: false).
        #[serde(default)]
        include_text: Option<bool>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct FetchContentArgs {
        /// The URL of the page to fetch (required).
        #[serde(default)]
        url: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct FetchContentsArgs {
        /// URLs to fetch; must contain at least one (required).
        #[serde(default)]
        urls: Option<Vec<String>>,
        /// Livecrawl mode: always, preferred, or never.
        #[serde(default)]
        livecrawl: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct FetchSubpagesArgs {
        /// The root URL to crawl subpages from (required).
        #[serde(default)]
        url: Option<String>,
        /// Maximum number of subpages to crawl (default: 5).
        #[serde(default)]
        subpages: Option<usize>,
        /// Keywords used by the provider to prioritize which subpages to fetch.
        #[serde(default)]
        subpage_target: Option<Vec<String>>,
        /// Livecrawl mode: always, preferred, or never.
        #[serde(default)]
        livecrawl: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct FindSimilarArgs {
        /// The URL to find similar links for (required).
        #[serde(default)]
        url: Option<String>,
        /// Include page text in each result (default: false).
        #[serde(default)]
        include_text: Option<bool>,
        /// Maximum number of similar results to return (default: 3).
        #[serde(default)]
        num_results: Option<usize>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct AnswerArgs {
        /// The question to answer (required).
        #[serde(default)]
        query: Option<String>,
        /// Include full text of supporting sources (default: false).
        #[serde(default)]
        include_text: Option<bool>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct ResearchStartArgs {
        /// Natural-language instructions for the research task (required).
        #[serde(default)]
        instructions: Option<String>,
        /// Model to use (e.g. "exa-research" or "exa-research-pro").
        #[serde(default)]
        model: Option<String>,
        /// JSON Schema object describing the desired structured output.
        #[serde(default)]
        output_schema: Option<serde_json::Value>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct ResearchPollArgs {
        /// The task id returned by exa_research_start (required).
        #[serde(default)]
        task_id: Option<String>,
    }

    #[derive(Clone)]
    pub(crate) struct ExagateMcp {
        tool_router: RmcpToolRouter<Self>,
        backend: Option<Arc<dyn ExaBackend>>,
    }

    #[tool_router]
    impl ExagateMcp {
        pub(crate) fn new() -> Result<Self, McpError> {
            let http = reqwest::Client::builder()
                .user_agent("exagate-mcp/0.1")
                .build()
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            // Credential resolved once per process lifetime. Without it the
            // server still starts; every tool surfaces the same
            // not_configured error until restarted with a key.
            let backend = ExaClient::from_env(http)
                .ok()
                .map(|c| Arc::new(c) as Arc<dyn ExaBackend>);
            Ok(Self {
                tool_router: Self::tool_router(),
                backend,
            })
        }

        #[cfg(test)]
        fn with_backend(backend: Arc<dyn ExaBackend>) -> Self {
            Self {
                tool_router: Self::tool_router(),
                backend: Some(backend),
            }
        }

        fn backend(&self) -> CoreResult<Arc<dyn ExaBackend>> {
            self.backend.clone().ok_or(CoreError::Auth)
        }

        #[tool(
            description = "Real-time web search via Exa. Returns title/url and a snippet, or full page text when include_text=true."
        )]
        async fn exa_web_search(
            &self,
            params: Parameters<Option<WebSearchArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let t0 = Instant::now();
            let r: CoreResult<serde_json::Value> = async {
                let query = params::require_str("query", args.query)?;
                let num_results = params::num_results(args.num_results);
                let include_text = params::include_text(args.include_text);
                let backend = self.backend()?;
                let results = backend
                    .search(&SearchRequest {
                        query: query.clone(),
                        num_results,
                        include_text,
                    })
                    .await?;
                Ok(serde_json::json!({ "query": query, "results": results }))
            }
            .await;
            Ok(finish("exa_web_search", t0, r))
        }

        #[tool(
            description = "Retrieve the full text content of a single URL via Exa's contents API."
        )]
        async fn exa_fetch_content(
            &self,
            params: Parameters<Option<FetchContentArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let t0 = Instant::now();
            let r: CoreResult<serde_json::Value> = async {
                let url = params::require_str("url", args.url)?;
                let backend = self.backend()?;
                let page = backend.fetch_content(&url, None).await?;
                Ok(serde_json::json!({ "page": page }))
            }
            .await;
            Ok(finish("exa_fetch_content", t0, r))
        }

        #[tool(
            description = "Fetch the contents of multiple URLs concurrently. Results come back in request order; a failed URL keeps its slot with an error marker."
        )]
        async fn exa_fetch_contents(
            &self,
            params: Parameters<Option<FetchContentsArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let t0 = Instant::now();
            let prepared: CoreResult<_> = (|| {
                let urls = params::require_urls("urls", args.urls)?;
                let livecrawl = params::livecrawl("livecrawl", args.livecrawl)?;
                Ok((urls, livecrawl))
            })();
            let (urls, livecrawl) = match prepared {
                Ok(v) => v,
                Err(e) => return Ok(finish("exa_fetch_contents", t0, Err(e))),
            };
            let backend = match self.backend() {
                Ok(b) => b,
                Err(e) => return Ok(finish("exa_fetch_contents", t0, Err(e))),
            };

            let slots = match orchestrate::fetch_all(backend, &urls, livecrawl).await {
                Ok(s) => s,
                Err(e) => return Ok(finish("exa_fetch_contents", t0, Err(e))),
            };

            let mut results = Vec::with_capacity(slots.len());
            let mut succeeded = 0usize;
            for (url, outcome) in slots {
                match outcome {
                    Ok(page) => {
                        succeeded += 1;
                        results.push(serde_json::json!({ "ok": true, "page": page }));
                    }
                    Err(e) => results.push(serde_json::json!({
                        "ok": false,
                        "url": url,
                        "error": error_payload(&e)
                    })),
                }
            }
            let failed = results.len() - succeeded;
            let mut payload = if succeeded == 0 {
                serde_json::json!({
                    "ok": false,
                    "results": results,
                    "error": error_obj(
                        ErrorCode::AllUrlsFailed,
                        format!("all {failed} URLs failed"),
                        "Check the URLs or retry later; per-URL detail is in `results`."
                    ),
                })
            } else {
                serde_json::json!({
                    "ok": true,
                    "results": results,
                    "succeeded": succeeded,
                    "failed": failed,
                })
            };
            add_envelope_fields(&mut payload, "exa_fetch_contents", t0.elapsed().as_millis());
            Ok(tool_result(payload))
        }

        #[tool(
            description = "Crawl a website: fetch the root page plus up to `subpages` linked pages, optionally prioritized by `subpage_target` keywords."
        )]
        async fn exa_fetch_subpages(
            &self,
            params: Parameters<Option<FetchSubpagesArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let t0 = Instant::now();
            let r: CoreResult<serde_json::Value> = async {
                let url = params::require_str("url", args.url)?;
                let subpages = params::subpage_count(args.subpages);
                let target_keywords = params::target_keywords(args.subpage_target);
                let livecrawl = params::livecrawl("livecrawl", args.livecrawl)?;
                let backend = self.backend()?;
                let bundle = backend
                    .fetch_subpages(&SubpageRequest {
                        url,
                        subpages,
                        target_keywords,
                        livecrawl,
                    })
                    .await?;
                // Re-apply the cap: the invariant is part of the tool contract,
                // not something we trust any backend to uphold.
                let bundle =
                    SubpageBundle::new(bundle.root, bundle.subpages, subpages, bundle.target_keywords);
                serde_json::to_value(&bundle).map_err(|e| CoreError::Fetch(e.to_string()))
            }
            .await;
            Ok(finish("exa_fetch_subpages", t0, r))
        }

        #[tool(
            description = "Find links semantically similar to a given URL via Exa's findSimilar API."
        )]
        async fn exa_find_similar_links(
            &self,
            params: Parameters<Option<FindSimilarArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let t0 = Instant::now();
            let r: CoreResult<serde_json::Value> = async {
                let url = params::require_str("url", args.url)?;
                let include_text = params::include_text(args.include_text);
                let num_results = params::num_results(args.num_results);
                let backend = self.backend()?;
                let results = backend.find_similar(&url, include_text, num_results).await?;
                Ok(serde_json::json!({ "url": url, "results": results }))
            }
            .await;
            Ok(finish("exa_find_similar_links", t0, r))
        }

        #[tool(
            description = "Ask a natural-language question and get a direct answer with citations via Exa's Answer API."
        )]
        async fn exa_answer_question(
            &self,
            params: Parameters<Option<AnswerArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let t0 = Instant::now();
            let r: CoreResult<serde_json::Value> = async {
                let query = params::require_str("query", args.query)?;
                let include_text = params::include_text(args.include_text);
                let backend = self.backend()?;
                let answer = backend.answer(&query, include_text).await?;
                Ok(serde_json::json!({
                    "query": query,
                    "answer": answer.answer,
                    "citations": answer.citations,
                }))
            }
            .await;
            Ok(finish("exa_answer_question", t0, r))
        }

        #[tool(
            description = "Start an asynchronous Exa research task. Returns a task_id immediately; poll it with exa_research_poll."
        )]
        async fn exa_research_start(
            &self,
            params: Parameters<Option<ResearchStartArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let t0 = Instant::now();
            let r: CoreResult<serde_json::Value> = async {
                let instructions = params::require_str("instructions", args.instructions)?;
                let model = args.model.map(|m| m.trim().to_string()).filter(|m| !m.is_empty());
                let output_schema = params::output_schema("output_schema", args.output_schema)?;
                let backend = self.backend()?;
                let task_id = backend
                    .research_create(&ResearchCreate {
                        instructions,
                        model,
                        output_schema,
                    })
                    .await?;
                Ok(serde_json::json!({ "task_id": task_id }))
            }
            .await;
            Ok(finish("exa_research_start", t0, r))
        }

        #[tool(
            description = "Poll a research task. Non-terminal tasks report pending/running; terminal tasks return the result or error. Polling is idempotent."
        )]
        async fn exa_research_poll(
            &self,
            params: Parameters<Option<ResearchPollArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let t0 = Instant::now();
            let r: CoreResult<serde_json::Value> = async {
                let task_id = params::require_str("task_id", args.task_id)?;
                let backend = self.backend()?;
                let task = backend.research_get(&task_id).await?;
                let terminal = task.state.is_terminal();
                Ok(serde_json::json!({ "task": task, "terminal": terminal }))
            }
            .await;
            Ok(finish("exa_research_poll", t0, r))
        }
    }

    #[tool_handler]
    impl rmcp::ServerHandler for ExagateMcp {
        fn get_info(&self) -> ServerInfo {
            ServerInfo {
                instructions: Some(
                    "Exa tool gateway: web search, page/bulk/subpage fetch, similar links, answers, and async research tasks. Outputs are JSON and schema-versioned."
                        .to_string(),
                ),
                capabilities: ServerCapabilities::builder().enable_tools().build(),
                ..Default::default()
            }
        }
    }

    pub(crate) async fn serve_stdio() -> Result<(), McpError> {
        let svc = ExagateMcp::new()?;
        let running = svc
            .serve(stdio())
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        // Keep the stdio server alive until the client closes.
        running
            .waiting()
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(())
    }

    #[cfg(test)]
    mod tests;
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "stdio")]
        Commands::McpStdio => {
            mcp::serve_stdio()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        #[cfg(not(feature = "stdio"))]
        Commands::McpStdio => {
            anyhow::bail!("mcp-stdio requires feature `stdio` (rebuild with: --features stdio)");
        }
        Commands::Doctor(args) => {
            let payload = serde_json::json!({
                "schema_version": 1,
                "kind": "doctor",
                "ok": true,
                "configured": {
                    "exa_api_key": exagate_exa::exa_api_key_from_env().is_some(),
                    "base_url": exagate_exa::exa_base_url_from_env(),
                },
                "retry": {
                    "attempts": exagate_exa::RETRY_ATTEMPTS,
                    "base_delay_ms": exagate_exa::RETRY_BASE_DELAY_MS,
                },
                "batch": {
                    "max_concurrent_fetches": orchestrate::MAX_CONCURRENT_FETCHES,
                    "deadline_s": orchestrate::BATCH_DEADLINE_S,
                },
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => {
                    println!(
                        "exa_api_key: {}",
                        if payload["configured"]["exa_api_key"].as_bool().unwrap_or(false) {
                            "configured"
                        } else {
                            "missing"
                        }
                    );
                    println!("base_url: {}", payload["configured"]["base_url"]);
                }
                _ => println!("{payload}"),
            }
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "exagate",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("exagate {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }

    Ok(())
}
