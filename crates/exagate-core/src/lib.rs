use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub mod params;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument `{field}`: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("missing EXAGATE_EXA_API_KEY (or EXA_API_KEY)")]
    Auth,
    #[error("exa returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("unknown research task: {0}")]
    NotFound(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
}

impl Error {
    pub fn validation(field: &'static str, reason: impl ToString) -> Self {
        Self::Validation {
            field,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Hint controlling whether the provider serves cached or freshly crawled content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Livecrawl {
    Always,
    Preferred,
    Never,
}

impl Livecrawl {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "always" => Some(Self::Always),
            "preferred" => Some(Self::Preferred),
            "never" => Some(Self::Never),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Preferred => "preferred",
            Self::Never => "never",
        }
    }
}

/// Result body: a short snippet, or the full extracted page text.
///
/// Tagged so clients never have to guess which one they got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum ResultText {
    Snippet(String),
    FullText(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub body: ResultText,
    /// Provider relevance score. Number or absent, never any other type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at_epoch_s: Option<u64>,
}

/// Root page plus the subpages the provider yielded, capped at the requested count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubpageBundle {
    pub root: PageContent,
    pub subpages: Vec<PageContent>,
    pub requested_count: usize,
    pub target_keywords: BTreeSet<String>,
}

impl SubpageBundle {
    /// Invariant: `subpages.len() <= requested_count`, even when the provider overshoots.
    pub fn new(
        root: PageContent,
        mut subpages: Vec<PageContent>,
        requested_count: usize,
        target_keywords: BTreeSet<String>,
    ) -> Self {
        subpages.truncate(requested_count);
        Self {
            root,
            subpages,
            requested_count,
            target_keywords,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    #[serde(default)]
    pub citations: serde_json::Value,
}

/// Task state as reported by the provider. Mirrored, never computed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// Map a provider status string onto the four states. Unknown non-empty
    /// statuses are treated as "still working" (the verbatim string is kept
    /// alongside on the task view, so nothing is lost).
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "pending" | "created" | "queued" => Self::Pending,
            "completed" | "complete" | "finished" => Self::Completed,
            "failed" | "error" | "canceled" | "cancelled" => Self::Failed,
            _ => Self::Running,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// View of an asynchronous research task, built from the provider document on
/// every poll. The provider is the system of record; nothing here is cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchTask {
    pub task_id: String,
    pub state: TaskState,
    /// Provider status string, verbatim.
    pub status: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub num_results: usize,
    pub include_text: bool,
}

#[derive(Debug, Clone)]
pub struct SubpageRequest {
    pub url: String,
    pub subpages: usize,
    pub target_keywords: BTreeSet<String>,
    pub livecrawl: Option<Livecrawl>,
}

#[derive(Debug, Clone)]
pub struct ResearchCreate {
    pub instructions: String,
    pub model: Option<String>,
    pub output_schema: Option<serde_json::Map<String, serde_json::Value>>,
}

/// One method per upstream capability, so orchestration can be exercised
/// against an in-memory double without touching the network.
#[async_trait::async_trait]
pub trait ExaBackend: Send + Sync {
    async fn search(&self, req: &SearchRequest) -> Result<Vec<SearchResult>>;
    async fn fetch_content(&self, url: &str, livecrawl: Option<Livecrawl>) -> Result<PageContent>;
    async fn fetch_subpages(&self, req: &SubpageRequest) -> Result<SubpageBundle>;
    async fn find_similar(
        &self,
        url: &str,
        include_text: bool,
        num_results: usize,
    ) -> Result<Vec<SearchResult>>;
    async fn answer(&self, query: &str, include_text: bool) -> Result<Answer>;
    /// Returns the provider-assigned task id; does not block on completion.
    async fn research_create(&self, req: &ResearchCreate) -> Result<String>;
    async fn research_get(&self, task_id: &str) -> Result<ResearchTask>;
}
