use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::ToolError;
use crate::tools::{DependencyMap, ToolOutcome, ToolSpec, string_arg};

const DEFAULT_API_BASE_URL: &str = "https://api.tavily.com";
const TOOL_NAME: &str = "web_search";

#[derive(Debug, Clone)]
pub struct TavilyConfig {
    pub api_key: String,
    pub api_base_url: Option<String>,
    pub max_results: u32,
    /// `basic` or `advanced`.
    pub search_depth: String,
}

impl TavilyConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base_url: None,
            max_results: 2,
            search_depth: "basic".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, ToolError> {
        let api_key = std::env::var("TAVILY_API_KEY")
            .map_err(|_| ToolError::Execution("TAVILY_API_KEY is not set".to_string()))?;
        Ok(Self::new(api_key))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing)]
    pub score: Option<f64>,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    max_results: u32,
    search_depth: &'a str,
    include_answer: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

/// Tavily search client shared with the `web_search` tool via [`DependencyMap`].
#[derive(Debug, Clone)]
pub struct WebSearchClient {
    client: Client,
    config: TavilyConfig,
}

impl WebSearchClient {
    pub fn new(config: TavilyConfig) -> Result<Self, ToolError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ToolError::Execution(err.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, ToolError> {
        Self::new(TavilyConfig::from_env()?)
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/search")
    }

    fn request<'a>(&'a self, query: &'a str) -> SearchRequest<'a> {
        SearchRequest {
            query,
            max_results: self.config.max_results,
            search_depth: &self.config.search_depth,
            include_answer: false,
        }
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ToolError> {
        debug!(%query, max_results = self.config.max_results, "tavily search");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&self.request(query))
            .send()
            .await
            .map_err(|err| ToolError::Execution(format!("search request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Execution(format!(
                "search api responded {status}: {body}"
            )));
        }

        let payload = response
            .json::<SearchResponse>()
            .await
            .map_err(|err| ToolError::Execution(format!("search response invalid: {err}")))?;

        Ok(payload.results)
    }
}

fn render_hits(query: &str, hits: &[SearchHit]) -> String {
    json!({
        "query": query,
        "results": hits,
    })
    .to_string()
}

pub fn web_search_tool() -> ToolSpec {
    ToolSpec::new(
        TOOL_NAME,
        "Search the web and return the top results with title, url and content",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "query": {"type": "string", "description": "Search query"}
        },
        "required": ["query"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(|args, deps: &DependencyMap| {
        let query = string_arg(TOOL_NAME, &args, "query");
        let client = deps.get::<WebSearchClient>();

        async move {
            let query = query?;
            let client = client.ok_or(ToolError::MissingDependency("WebSearchClient"))?;
            let hits = client.search(&query).await?;
            Ok(ToolOutcome::Text(render_hits(&query, &hits)))
        }
    })
}
