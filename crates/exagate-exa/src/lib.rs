use exagate_core::{
    Answer, Error, ExaBackend, Livecrawl, PageContent, ResearchCreate, ResearchTask, Result,
    SearchRequest, SearchResult, SubpageBundle, SubpageRequest, TaskState,
};
use serde::Deserialize;
use std::time::Duration;

/// Total attempts per request, counting the first. Transport errors and HTTP
/// 5xx are retried; 4xx never is (retrying a client error cannot succeed).
pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 250;
pub const REQUEST_TIMEOUT_MS: u64 = 60_000;

pub const DEFAULT_BASE_URL: &str = "https://api.exa.ai";

const SEARCH_PATH: &str = "/search";
const CONTENTS_PATH: &str = "/contents";
const FIND_SIMILAR_PATH: &str = "/findSimilar";
const ANSWER_PATH: &str = "/answer";
const RESEARCH_TASKS_PATH: &str = "/research/v0/tasks";

pub fn exa_api_key_from_env() -> Option<String> {
    std::env::var("EXAGATE_EXA_API_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("EXA_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
}

pub fn exa_base_url_from_env() -> String {
    // For tests / enterprise proxies, allow overriding the API base URL.
    std::env::var("EXAGATE_EXA_BASE_URL")
        .ok()
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

#[derive(Debug, Clone)]
pub struct ExaClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ExaClient {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            api_key: api_key.into(),
            base_url,
        }
    }

    /// Credential is resolved here, once; callers without a key get
    /// `Error::Auth` before any request could be issued.
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = exa_api_key_from_env().ok_or(Error::Auth)?;
        Ok(Self::new(client, api_key, exa_base_url_from_env()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = self.url(path);
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("x-api-key", &self.api_key)
                .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS));
            if let Some(b) = body {
                req = req.json(b);
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json().await.map_err(|e| Error::Fetch(e.to_string()));
                    }
                    if status.is_server_error() && attempt < RETRY_ATTEMPTS {
                        tracing::debug!(%url, %status, attempt, "transient upstream failure, backing off");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        continue;
                    }
                    let message = resp.text().await.unwrap_or_default();
                    let message = if message.trim().is_empty() {
                        status
                            .canonical_reason()
                            .unwrap_or("upstream error")
                            .to_string()
                    } else {
                        message
                    };
                    return Err(Error::Upstream {
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(e) => {
                    if attempt < RETRY_ATTEMPTS {
                        tracing::debug!(%url, attempt, error = %e, "request failed, backing off");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        continue;
                    }
                    return Err(Error::Fetch(e.to_string()));
                }
            }
        }
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        tracing::debug!(path, %body, "exa request");
        self.request_json(reqwest::Method::POST, path, Some(&body))
            .await
    }

    async fn contents(
        &self,
        body: serde_json::Value,
        requested_url: &str,
    ) -> Result<ResultItem> {
        let data: ResultsEnvelope =
            parse(self.post_json(CONTENTS_PATH, body).await?)?;
        data.results.into_iter().next().ok_or_else(|| {
            Error::Fetch(format!("no content returned from exa for {requested_url}"))
        })
    }
}

fn now_epoch_s() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn parse<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> Result<T> {
    serde_json::from_value(v).map_err(|e| Error::Fetch(format!("unexpected exa payload: {e}")))
}

#[derive(Debug, Deserialize)]
struct ResultsEnvelope {
    #[serde(default)]
    results: Vec<ResultItem>,
}

#[derive(Debug, Default, Deserialize)]
struct ResultItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    subpages: Vec<ResultItem>,
}

impl ResultItem {
    /// Snippet text falls back to the provider summary, matching upstream behavior.
    fn snippet(&self) -> String {
        self.text
            .clone()
            .or_else(|| self.summary.clone())
            .unwrap_or_default()
    }

    fn into_search_result(self, include_text: bool) -> SearchResult {
        let body = if include_text {
            exagate_core::ResultText::FullText(self.snippet())
        } else {
            exagate_core::ResultText::Snippet(self.snippet())
        };
        SearchResult {
            url: self.url.unwrap_or_default(),
            title: self.title,
            body,
            score: self.score,
        }
    }

    fn into_page(self, requested_url: &str) -> PageContent {
        PageContent {
            url: self.url.unwrap_or_else(|| requested_url.to_string()),
            title: self.title,
            text: self.text.unwrap_or_default(),
            fetched_at_epoch_s: Some(now_epoch_s()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnswerDoc {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    citations: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ResearchCreated {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResearchDoc {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    citations: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait::async_trait]
impl ExaBackend for ExaClient {
    async fn search(&self, req: &SearchRequest) -> Result<Vec<SearchResult>> {
        let body = serde_json::json!({
            "query": req.query,
            "num_results": req.num_results,
            "text": req.include_text,
        });
        let data: ResultsEnvelope = parse(self.post_json(SEARCH_PATH, body).await?)?;
        Ok(data
            .results
            .into_iter()
            .take(req.num_results)
            .map(|r| r.into_search_result(req.include_text))
            .collect())
    }

    async fn fetch_content(&self, url: &str, livecrawl: Option<Livecrawl>) -> Result<PageContent> {
        let mut body = serde_json::json!({ "urls": [url], "text": true });
        if let Some(lc) = livecrawl {
            body["livecrawl"] = serde_json::json!(lc.as_str());
        }
        Ok(self.contents(body, url).await?.into_page(url))
    }

    async fn fetch_subpages(&self, req: &SubpageRequest) -> Result<SubpageBundle> {
        let mut body = serde_json::json!({
            "urls": [req.url],
            "text": true,
            "subpages": req.subpages,
        });
        if !req.target_keywords.is_empty() {
            body["subpage_target"] = serde_json::json!(req.target_keywords);
        }
        if let Some(lc) = req.livecrawl {
            body["livecrawl"] = serde_json::json!(lc.as_str());
        }
        let mut root = self.contents(body, &req.url).await?;
        let subpages: Vec<PageContent> = std::mem::take(&mut root.subpages)
            .into_iter()
            .map(|s| {
                let u = s.url.clone().unwrap_or_default();
                s.into_page(&u)
            })
            .collect();
        Ok(SubpageBundle::new(
            root.into_page(&req.url),
            subpages,
            req.subpages,
            req.target_keywords.clone(),
        ))
    }

    async fn find_similar(
        &self,
        url: &str,
        include_text: bool,
        num_results: usize,
    ) -> Result<Vec<SearchResult>> {
        let body = serde_json::json!({ "url": url, "text": include_text });
        let data: ResultsEnvelope = parse(self.post_json(FIND_SIMILAR_PATH, body).await?)?;
        Ok(data
            .results
            .into_iter()
            .take(num_results)
            .map(|r| r.into_search_result(include_text))
            .collect())
    }

    async fn answer(&self, query: &str, include_text: bool) -> Result<Answer> {
        let body = serde_json::json!({ "query": query, "text": include_text });
        let doc: AnswerDoc = parse(self.post_json(ANSWER_PATH, body).await?)?;
        Ok(Answer {
            answer: doc.answer,
            citations: doc.citations,
        })
    }

    async fn research_create(&self, req: &ResearchCreate) -> Result<String> {
        let mut body = serde_json::json!({ "instructions": req.instructions });
        if let Some(model) = &req.model {
            body["model"] = serde_json::json!(model);
        }
        if let Some(schema) = &req.output_schema {
            body["output"] = serde_json::json!({ "schema": schema });
        }
        let created: ResearchCreated = parse(self.post_json(RESEARCH_TASKS_PATH, body).await?)?;
        created
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::Fetch("exa research create returned no task id".to_string()))
    }

    async fn research_get(&self, task_id: &str) -> Result<ResearchTask> {
        let path = format!("{RESEARCH_TASKS_PATH}/{task_id}");
        let raw = self
            .request_json(reqwest::Method::GET, &path, None)
            .await
            .map_err(|e| match e {
                Error::Upstream { status: 404, .. } => Error::NotFound(task_id.to_string()),
                other => other,
            })?;
        let doc: ResearchDoc = parse(raw)?;
        let state = TaskState::from_status(&doc.status);
        Ok(ResearchTask {
            task_id: doc.id.unwrap_or_else(|| task_id.to_string()),
            state,
            status: doc.status,
            instructions: doc.instructions,
            model: doc.model,
            result: doc.data,
            citations: doc.citations,
            error: doc.error,
        })
    }
}
