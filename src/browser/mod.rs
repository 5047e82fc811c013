//! Browser automation capability used by executors.

mod webdriver;

pub use webdriver::{WebDriverBrowser, WebDriverConfig, WebDriverProvider};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Retryable;

/// Browser errors.
#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("WebDriver error {error} ({status}): {message}")]
    Protocol {
        status: u16,
        error: String,
        message: String,
    },
    #[error("Element not found: {0}")]
    ElementNotFound(String),
    #[error("Browser operation {operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    #[error("Unexpected browser response: {0}")]
    InvalidResponse(String),
    #[error("Failed to store screenshot: {0}")]
    Screenshot(String),
}

impl Retryable for BrowserError {
    fn is_retryable(&self) -> bool {
        match self {
            BrowserError::RequestFailed(_) => true,
            BrowserError::Protocol { status, .. } => *status >= 500,
            BrowserError::Timeout { .. } => true,
            BrowserError::ElementNotFound(_) => false,
            BrowserError::InvalidResponse(_) => false,
            BrowserError::Screenshot(_) => false,
        }
    }
}

/// Condition awaited by [`Browser::wait_for`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    /// An element matching the CSS selector is present.
    Selector(String),
    /// The document has finished loading.
    Loaded,
}

impl WaitCondition {
    pub fn selector(selector: impl Into<String>) -> Self {
        WaitCondition::Selector(selector.into())
    }
}

/// One browser session.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Replace the value of the input matching `selector`.
    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError>;

    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    /// Wait until `condition` holds. Returns `false` on timeout.
    async fn wait_for(&self, condition: &WaitCondition, timeout: Duration) -> Result<bool, BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Capture the page and return a reference to the stored image.
    async fn screenshot(&self) -> Result<String, BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;

    /// Whether an element matching `selector` is present right now.
    async fn is_present(&self, selector: &str) -> Result<bool, BrowserError> {
        self.wait_for(&WaitCondition::selector(selector), Duration::ZERO)
            .await
    }
}

/// Opens browser sessions.
#[async_trait]
pub trait BrowserProvider: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Browser>, BrowserError>;
}
