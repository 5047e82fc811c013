//! Browser sessions over the W3C WebDriver HTTP protocol
//! (chromedriver, geckodriver, Selenium).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};

use super::{Browser, BrowserError, BrowserProvider, WaitCondition};

/// Key of an element reference in WebDriver responses.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// WebDriver connection configuration.
#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    /// Remote end URL, e.g. `http://localhost:9515`.
    pub url: String,
    pub browser_name: String,
    pub headless: bool,
    /// Directory screenshots are written to.
    pub screenshot_dir: PathBuf,
    pub request_timeout_secs: u64,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9515".to_string(),
            browser_name: "chrome".to_string(),
            headless: true,
            screenshot_dir: std::env::temp_dir().join("wish-agent-screenshots"),
            request_timeout_secs: 60,
        }
    }
}

impl WebDriverConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_screenshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.screenshot_dir = dir.into();
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    fn capabilities(&self) -> Value {
        let mut always_match = json!({ "browserName": self.browser_name });
        if self.headless {
            match self.browser_name.as_str() {
                "chrome" | "chromium" => {
                    always_match["goog:chromeOptions"] = json!({ "args": ["--headless=new", "--disable-gpu"] });
                }
                "firefox" => {
                    always_match["moz:firefoxOptions"] = json!({ "args": ["-headless"] });
                }
                _ => {}
            }
        }
        json!({ "capabilities": { "alwaysMatch": always_match } })
    }
}

/// Opens WebDriver sessions.
pub struct WebDriverProvider {
    config: WebDriverConfig,
    client: Client,
}

impl WebDriverProvider {
    pub fn new(config: WebDriverConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { config, client }
    }
}

#[async_trait]
impl BrowserProvider for WebDriverProvider {
    async fn open(&self) -> Result<Box<dyn Browser>, BrowserError> {
        let base = self.config.url.trim_end_matches('/').to_string();
        let value = send(&self.client, Method::POST, &format!("{}/session", base), Some(self.config.capabilities())).await?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::InvalidResponse("missing sessionId".to_string()))?
            .to_string();
        tracing::info!(session_id = %session_id, "opened webdriver session");

        Ok(Box::new(WebDriverBrowser {
            client: self.client.clone(),
            session_url: format!("{}/session/{}", base, session_id),
            session_id,
            screenshot_dir: self.config.screenshot_dir.clone(),
            screenshots: AtomicU32::new(0),
        }))
    }
}

/// A live WebDriver session.
pub struct WebDriverBrowser {
    client: Client,
    session_id: String,
    session_url: String,
    screenshot_dir: PathBuf,
    screenshots: AtomicU32,
}

impl WebDriverBrowser {
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, BrowserError> {
        send(&self.client, method, &format!("{}{}", self.session_url, path), body).await
    }

    async fn find_element(&self, selector: &str) -> Result<String, BrowserError> {
        let value = self
            .command(
                Method::POST,
                "/element",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await
            .map_err(|e| match e {
                BrowserError::Protocol { ref error, .. } if error == "no such element" => {
                    BrowserError::ElementNotFound(selector.to_string())
                }
                other => other,
            })?;

        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BrowserError::InvalidResponse("missing element reference".to_string()))
    }

    async fn condition_holds(&self, condition: &WaitCondition) -> Result<bool, BrowserError> {
        match condition {
            WaitCondition::Selector(selector) => match self.find_element(selector).await {
                Ok(_) => Ok(true),
                Err(BrowserError::ElementNotFound(_)) => Ok(false),
                Err(e) => Err(e),
            },
            WaitCondition::Loaded => {
                let state = self
                    .command(
                        Method::POST,
                        "/execute/sync",
                        Some(json!({ "script": "return document.readyState", "args": [] })),
                    )
                    .await?;
                Ok(state.as_str() == Some("complete"))
            }
        }
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        tracing::debug!(session_id = %self.session_id, url, "navigate");
        self.command(Method::POST, "/url", Some(json!({ "url": url }))).await?;
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let element = self.find_element(selector).await?;
        self.command(Method::POST, &format!("/element/{}/clear", element), Some(json!({})))
            .await?;
        self.command(
            Method::POST,
            &format!("/element/{}/value", element),
            Some(json!({ "text": value })),
        )
        .await?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self.find_element(selector).await?;
        self.command(Method::POST, &format!("/element/{}/click", element), Some(json!({})))
            .await?;
        Ok(())
    }

    async fn wait_for(&self, condition: &WaitCondition, timeout: Duration) -> Result<bool, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.condition_holds(condition).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let value = self.command(Method::GET, "/url", None).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BrowserError::InvalidResponse("url is not a string".to_string()))
    }

    async fn screenshot(&self) -> Result<String, BrowserError> {
        let value = self.command(Method::GET, "/screenshot", None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| BrowserError::InvalidResponse("screenshot is not a string".to_string()))?;
        let png = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| BrowserError::InvalidResponse(format!("screenshot is not base64: {}", e)))?;

        tokio::fs::create_dir_all(&self.screenshot_dir)
            .await
            .map_err(|e| BrowserError::Screenshot(e.to_string()))?;
        let n = self.screenshots.fetch_add(1, Ordering::SeqCst);
        let path = self
            .screenshot_dir
            .join(format!("{}-{:03}.png", self.session_id, n));
        tokio::fs::write(&path, png)
            .await
            .map_err(|e| BrowserError::Screenshot(e.to_string()))?;

        Ok(path.display().to_string())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.command(Method::DELETE, "", None).await?;
        tracing::info!(session_id = %self.session_id, "closed webdriver session");
        Ok(())
    }
}

/// Send a WebDriver command and unwrap the `value` member of the response.
async fn send(client: &Client, method: Method, url: &str, body: Option<Value>) -> Result<Value, BrowserError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await?;
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .map_err(|e| BrowserError::InvalidResponse(e.to_string()))?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if !status.is_success() {
        return Err(protocol_error(status.as_u16(), &value));
    }
    Ok(value)
}

fn protocol_error(status: u16, value: &Value) -> BrowserError {
    BrowserError::Protocol {
        status,
        error: value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
        message: value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_chrome_capabilities() {
        let caps = WebDriverConfig::default().capabilities();
        let always = &caps["capabilities"]["alwaysMatch"];
        assert_eq!(always["browserName"], "chrome");
        assert_eq!(always["goog:chromeOptions"]["args"][0], "--headless=new");
    }

    #[test]
    fn test_protocol_error_parsing() {
        let value = json!({ "error": "no such element", "message": "Unable to locate element" });
        match protocol_error(404, &value) {
            BrowserError::Protocol { status, error, .. } => {
                assert_eq!(status, 404);
                assert_eq!(error, "no such element");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
