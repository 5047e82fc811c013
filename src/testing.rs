//! Test doubles for the capability traits.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::browser::{Browser, BrowserError, BrowserProvider, WaitCondition};
use crate::executor::{ExecutorContext, ExecutorSettings, SessionLocks};
use crate::ledger::ProgressLedger;
use crate::model::{ChatMessage, LanguageModel, ModelError, RetryPolicy};
use crate::otp::{OneTimeCodeBroker, OtpSettings};
use crate::search::{SearchCategory, SearchError, SearchProvider, SearchResult};
use crate::store::Store;
use crate::vault::{CredentialVault, EnvelopeCipher, DEFAULT_KDF_SALT};

/// A raw 32-byte key, so tests skip key stretching.
pub(crate) fn test_key() -> String {
    URL_SAFE_NO_PAD.encode([7u8; 32])
}

pub(crate) fn test_cipher() -> EnvelopeCipher {
    EnvelopeCipher::from_key(&test_key(), DEFAULT_KDF_SALT).unwrap()
}

/// Fast timeouts, no retries.
pub(crate) fn test_executor_settings() -> ExecutorSettings {
    ExecutorSettings {
        retry: RetryPolicy::none(),
        operation_timeout: Duration::from_millis(500),
        otp_timeout: Duration::from_millis(300),
        otp_poll_interval: Duration::from_millis(20),
    }
}

/// Executor services over an in-memory store.
pub(crate) fn executor_context(browsers: Arc<dyn BrowserProvider>) -> ExecutorContext {
    let store = Store::in_memory();
    ExecutorContext {
        ledger: Arc::new(ProgressLedger::new(&store).unwrap()),
        vault: Arc::new(CredentialVault::new(&store, test_cipher()).unwrap()),
        otp: Arc::new(OneTimeCodeBroker::new(&store, OtpSettings::default()).unwrap()),
        browsers,
        locks: SessionLocks::new(),
        settings: test_executor_settings(),
    }
}

/// Model that replays scripted replies, then repeats the fallback reply.
pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A model whose every call fails.
    pub fn failing() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_fallback(mut self, reply: &str) -> Self {
        self.fallback = Some(reply.to_string());
        self
    }

    pub fn then_fail(self) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err("scripted failure".to_string()));
        self
    }

    /// Last user message of every call so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, _system_prompt: &str, messages: &[ChatMessage]) -> Result<String, ModelError> {
        if let Some(last) = messages.last() {
            self.prompts.lock().unwrap().push(last.content.clone());
        }
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(ModelError::ParseError(e)),
            None => self.fallback.clone().ok_or(ModelError::EmptyCompletion),
        }
    }
}

/// Search that returns fixed results, or fails.
pub(crate) struct StaticSearch {
    results: Vec<SearchResult>,
    fail: bool,
    queries: Mutex<Vec<(SearchCategory, String)>>,
}

impl StaticSearch {
    pub fn new(results: Vec<SearchResult>) -> Self {
        Self {
            results,
            fail: false,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            results: Vec::new(),
            fail: true,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<(SearchCategory, String)> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchProvider for StaticSearch {
    async fn search(&self, category: SearchCategory, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        self.queries
            .lock()
            .unwrap()
            .push((category, query.to_string()));
        if self.fail {
            return Err(SearchError::ApiError {
                status: 400,
                body: "scripted failure".to_string(),
            });
        }
        Ok(self.results.clone())
    }
}

/// Page behaviour for [`RecordingBrowser`].
#[derive(Debug, Clone, Default)]
pub(crate) struct BrowserScript {
    present: HashSet<String>,
    reveals: HashMap<String, Vec<String>>,
    failing_clicks: HashSet<String>,
    stalled_clicks: HashMap<String, Duration>,
    panic_on_open: bool,
    open_delay: Option<Duration>,
}

impl BrowserScript {
    /// `selector` is on the page from the start.
    pub fn present(mut self, selector: &str) -> Self {
        self.present.insert(selector.to_string());
        self
    }

    /// Clicking `clicked` makes `selector` appear.
    pub fn reveal_on_click(mut self, clicked: &str, selector: &str) -> Self {
        self.reveals
            .entry(clicked.to_string())
            .or_default()
            .push(selector.to_string());
        self
    }

    /// Clicking `selector` fails.
    pub fn fail_click(mut self, selector: &str) -> Self {
        self.failing_clicks.insert(selector.to_string());
        self
    }

    /// Clicking `selector` takes effect, then the response hangs for `delay`.
    pub fn stall_after_click(mut self, selector: &str, delay: Duration) -> Self {
        self.stalled_clicks.insert(selector.to_string(), delay);
        self
    }

    pub fn panic_on_open(mut self) -> Self {
        self.panic_on_open = true;
        self
    }

    pub fn stall_on_open(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }
}

/// Provider of scripted browsers that logs every call.
pub(crate) struct RecordingBrowserProvider {
    script: BrowserScript,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingBrowserProvider {
    pub fn new(script: BrowserScript) -> Self {
        Self {
            script,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Calls made so far, e.g. `open`, `navigate <url>`, `click <selector>`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserProvider for RecordingBrowserProvider {
    async fn open(&self) -> Result<Box<dyn Browser>, BrowserError> {
        if self.script.panic_on_open {
            panic!("scripted browser crash");
        }
        if let Some(delay) = self.script.open_delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push("open".to_string());
        Ok(Box::new(RecordingBrowser {
            present: Mutex::new(self.script.present.clone()),
            script: self.script.clone(),
            calls: self.calls.clone(),
            url: Mutex::new(String::new()),
            screenshots: AtomicUsize::new(0),
        }))
    }
}

pub(crate) struct RecordingBrowser {
    present: Mutex<HashSet<String>>,
    script: BrowserScript,
    calls: Arc<Mutex<Vec<String>>>,
    url: Mutex<String>,
    screenshots: AtomicUsize,
}

impl RecordingBrowser {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn has(&self, selector: &str) -> bool {
        self.present.lock().unwrap().contains(selector)
    }
}

#[async_trait]
impl Browser for RecordingBrowser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.record(format!("navigate {}", url));
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn fill(&self, selector: &str, _value: &str) -> Result<(), BrowserError> {
        self.record(format!("fill {}", selector));
        if !self.has(selector) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.record(format!("click {}", selector));
        if self.script.failing_clicks.contains(selector) || !self.has(selector) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        if let Some(revealed) = self.script.reveals.get(selector) {
            self.present
                .lock()
                .unwrap()
                .extend(revealed.iter().cloned());
        }
        if let Some(delay) = self.script.stalled_clicks.get(selector) {
            tokio::time::sleep(*delay).await;
        }
        Ok(())
    }

    async fn wait_for(&self, condition: &WaitCondition, _timeout: Duration) -> Result<bool, BrowserError> {
        Ok(match condition {
            WaitCondition::Selector(selector) => self.has(selector),
            WaitCondition::Loaded => true,
        })
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn screenshot(&self) -> Result<String, BrowserError> {
        self.record("screenshot".to_string());
        let n = self.screenshots.fetch_add(1, Ordering::SeqCst);
        Ok(format!("memory://screenshot-{}.png", n))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.record("close".to_string());
        Ok(())
    }
}
