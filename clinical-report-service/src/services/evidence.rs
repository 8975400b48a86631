use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// One web search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub score: f64,
}

#[async_trait]
pub trait EvidenceSearch: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str) -> anyhow::Result<Vec<SearchHit>>;
}

const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";

/// Tavily web search at advanced depth.
pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

impl TavilySearch {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: TAVILY_SEARCH_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl EvidenceSearch for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str) -> anyhow::Result<Vec<SearchHit>> {
        let response: TavilyResponse = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "query": query,
                "search_depth": "advanced",
            }))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Tavily request failed: {}", e))?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse Tavily response: {}", e))?;
        Ok(response.results)
    }
}
