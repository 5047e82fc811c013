//! Tavily web search client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{extract_price, SearchCategory, SearchError, SearchProvider, SearchResult};
use crate::config::service_for_host;
use crate::model::RetryPolicy;

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";

/// Tavily client configuration.
#[derive(Debug, Clone)]
pub struct TavilyConfig {
    pub api_key: String,
    pub endpoint: String,
    pub max_results: usize,
    pub search_depth: String,
    pub request_timeout_secs: u64,
}

impl Default for TavilyConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: TAVILY_ENDPOINT.to_string(),
            max_results: 5,
            search_depth: "basic".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl TavilyConfig {
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyHit>,
}

#[derive(Debug, Deserialize)]
struct TavilyHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: f64,
}

/// Search provider backed by the Tavily API.
pub struct TavilySearch {
    config: TavilyConfig,
    client: Client,
    retry: RetryPolicy,
}

impl TavilySearch {
    pub fn new(config: TavilyConfig, retry: RetryPolicy) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            config,
            client,
            retry,
        }
    }

    /// Domains searched for a category, if the category has preferred sites.
    fn include_domains(category: SearchCategory) -> &'static [&'static str] {
        match category {
            SearchCategory::Product => &["amazon.co.jp", "rakuten.co.jp", "kakaku.com"],
            SearchCategory::Train => &["smart-ex.jp", "jr-central.co.jp"],
            SearchCategory::Bus => &["willer.co.jp", "bus.com"],
            _ => &[],
        }
    }

    async fn send_request(&self, category: SearchCategory, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let body = json!({
            "api_key": self.config.api_key,
            "query": query,
            "search_depth": self.config.search_depth,
            "max_results": self.config.max_results,
            "include_answer": false,
            "include_raw_content": false,
            "include_domains": Self::include_domains(category),
        });

        let response = self.client.post(&self.config.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| SearchError::ParseError(e.to_string()))?;

        let mut results: Vec<SearchResult> = parsed
            .results
            .into_iter()
            .take(self.config.max_results)
            .enumerate()
            .map(|(i, hit)| to_result(category, i, hit))
            .collect();

        if category == SearchCategory::Product {
            results.sort_by_key(|r| r.price.unwrap_or(u64::MAX));
        }
        Ok(results)
    }
}

fn to_result(category: SearchCategory, index: usize, hit: TavilyHit) -> SearchResult {
    let mut result = SearchResult::new(format!("tavily_{}", index), category, hit.title.clone())
        .with_detail("content", hit.content.clone())
        .with_detail("score", hit.score)
        .with_detail("source", "tavily");
    if !hit.url.is_empty() {
        result = result.with_url(hit.url);
    }
    if let Some(price) = extract_price(&hit.title).or_else(|| extract_price(&hit.content)) {
        result = result.with_price(price);
    }
    if let Some(service) = result.host().as_deref().and_then(service_for_host) {
        result = result.with_detail("service", service);
    }
    result
}

#[async_trait]
impl SearchProvider for TavilySearch {
    async fn search(&self, category: SearchCategory, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        tracing::debug!(%category, query, "searching with tavily");
        self.retry
            .run("search.tavily", || self.send_request(category, query))
            .await
    }
}
