//! Search capability: candidate options for a wish.

mod tavily;

pub use tavily::{TavilyConfig, TavilySearch};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::Retryable;

/// Search errors.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Search API error ({status}): {body}")]
    ApiError { status: u16, body: String },
    #[error("Failed to parse search response: {0}")]
    ParseError(String),
}

impl Retryable for SearchError {
    fn is_retryable(&self) -> bool {
        match self {
            SearchError::RequestFailed(_) => true,
            SearchError::ApiError { status, .. } => *status == 429 || *status >= 500,
            SearchError::ParseError(_) => false,
        }
    }
}

/// What kind of thing a search looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchCategory {
    Train,
    Bus,
    Flight,
    Product,
    Restaurant,
    Professional,
    #[default]
    General,
}

impl SearchCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchCategory::Train => "train",
            SearchCategory::Bus => "bus",
            SearchCategory::Flight => "flight",
            SearchCategory::Product => "product",
            SearchCategory::Restaurant => "restaurant",
            SearchCategory::Professional => "professional",
            SearchCategory::General => "general",
        }
    }
}

impl std::fmt::Display for SearchCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate produced by a search. Prices are in yen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub category: SearchCategory,
    pub title: String,
    pub url: Option<String>,
    pub price: Option<u64>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl SearchResult {
    pub fn new(id: impl Into<String>, category: SearchCategory, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category,
            title: title.into(),
            url: None,
            price: None,
            details: Map::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_price(mut self, price: u64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// A string detail, if present.
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }

    /// Host part of the result URL.
    pub fn host(&self) -> Option<String> {
        self.url.as_deref().and_then(url_host)
    }
}

/// Search capability.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Search for candidates. An empty list is a successful result.
    async fn search(
        &self,
        category: SearchCategory,
        query: &str,
    ) -> Result<Vec<SearchResult>, SearchError>;
}

/// Provider used when no search backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySearch;

#[async_trait]
impl SearchProvider for EmptySearch {
    async fn search(&self, category: SearchCategory, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        tracing::debug!(%category, query, "no search provider configured");
        Ok(Vec::new())
    }
}

static PRICE_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"[¥￥]\s*([0-9][0-9,]*)|([0-9][0-9,]*)\s*円").ok());

/// Extract a yen price such as `¥3,000` or `2,480円` from free text.
pub fn extract_price(text: &str) -> Option<u64> {
    let re = PRICE_PATTERN.as_ref()?;
    let caps = re.captures(text)?;
    let digits: String = caps
        .get(1)
        .or_else(|| caps.get(2))?
        .as_str()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Format a yen price with thousands separators, e.g. `¥3,000`.
pub fn format_price(price: u64) -> String {
    let digits = price.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    format!("¥{}", out)
}

/// Lowercased host of an `http(s)://host[:port]/...` URL.
pub fn url_host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}
