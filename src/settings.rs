//! Engine settings.
//! Persisted in the platform-specific config directory via `directories::ProjectDirs`,
//! with environment overrides applied on top.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{OrchestratorError, TaskOrchestrator};
use crate::browser::{BrowserProvider, WebDriverConfig, WebDriverProvider};
use crate::executor::{
    ExecutionPool, ExecutorContext, ExecutorRegistry, ExecutorSettings, SessionLocks,
    DEFAULT_MAX_CONCURRENT_RUNS,
};
use crate::ledger::ProgressLedger;
use crate::model::{ModelClient, ModelConfig, RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS};
use crate::otp::{OneTimeCodeBroker, OtpSettings};
use crate::search::{EmptySearch, SearchProvider, TavilyConfig, TavilySearch};
use crate::store::Store;
use crate::vault::{CredentialVault, EnvelopeCipher, DEFAULT_KDF_SALT};

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "moderras";
const APPLICATION: &str = "wish-agent";

/// Engine settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Model API base URL
    pub base_url: String,
    /// Model API key
    pub api_key: String,
    /// Model name
    pub model_name: String,
    /// Maximum retries for model, search and browser calls
    pub max_retries: u32,
    /// Retry delay in seconds
    pub retry_delay: u64,
    /// Search API key. Empty disables search.
    pub search_api_key: String,
    pub search_max_results: usize,
    /// WebDriver remote end URL
    pub webdriver_url: String,
    pub headless: bool,
    /// Data directory. Empty means the platform data directory.
    pub data_dir: String,
    /// Screenshot directory. Empty means `<data_dir>/screenshots`.
    pub screenshot_dir: String,
    /// Vault key: base64 of 32 raw bytes, or a passphrase.
    pub encryption_key: String,
    pub encryption_salt: String,
    /// Concurrent executor runs
    pub max_concurrent_runs: usize,
    /// Wall-clock limit for one execution, in seconds
    pub task_timeout_secs: u64,
    /// Limit for one browser operation, in seconds
    pub operation_timeout_secs: u64,
    /// How long an executor waits for a one-time code, in seconds
    pub otp_timeout_secs: u64,
    pub otp_poll_interval_ms: u64,
    /// Run unmapped wishes with the simulated generic executor
    pub allow_generic_fallback: bool,
    /// Owner used by the CLI
    pub default_owner: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY_SECS,
            search_api_key: String::new(),
            search_max_results: 5,
            webdriver_url: "http://localhost:9515".to_string(),
            headless: true,
            data_dir: String::new(),
            screenshot_dir: String::new(),
            encryption_key: String::new(),
            encryption_salt: DEFAULT_KDF_SALT.to_string(),
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            task_timeout_secs: 300,
            operation_timeout_secs: 30,
            otp_timeout_secs: 60,
            otp_poll_interval_ms: 5000,
            allow_generic_fallback: true,
            default_owner: "local".to_string(),
        }
    }
}

impl EngineSettings {
    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Load settings from the config file, then apply `.env` and
    /// environment overrides.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();

        let mut loaded: Self = Self::settings_path()
            .and_then(|path| fs::read_to_string(&path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        loaded.backfill();
        loaded.apply_overrides(|name| std::env::var(name).ok());
        loaded
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), String> {
        let dir = Self::config_dir().ok_or("Cannot determine config directory")?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        let path = dir.join("settings.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(&path, content)
            .map_err(|e| format!("Failed to write settings file: {}", e))?;

        Ok(())
    }

    // Older files may carry zeroes for fields added later
    fn backfill(&mut self) {
        let defaults = Self::default();
        if self.encryption_salt.is_empty() {
            self.encryption_salt = defaults.encryption_salt;
        }
        if self.max_concurrent_runs == 0 {
            self.max_concurrent_runs = defaults.max_concurrent_runs;
        }
        if self.task_timeout_secs == 0 {
            self.task_timeout_secs = defaults.task_timeout_secs;
        }
        if self.operation_timeout_secs == 0 {
            self.operation_timeout_secs = defaults.operation_timeout_secs;
        }
        if self.otp_timeout_secs == 0 {
            self.otp_timeout_secs = defaults.otp_timeout_secs;
        }
        if self.otp_poll_interval_ms == 0 {
            self.otp_poll_interval_ms = defaults.otp_poll_interval_ms;
        }
        if self.default_owner.is_empty() {
            self.default_owner = defaults.default_owner;
        }
    }

    /// Apply environment overrides read through `lookup`. Unparseable
    /// numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |name: &str, field: &mut String| {
            if let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) {
                *field = value.trim().to_string();
            }
        };
        text("MODEL_BASE_URL", &mut self.base_url);
        text("MODEL_API_KEY", &mut self.api_key);
        text("MODEL_NAME", &mut self.model_name);
        text("SEARCH_API_KEY", &mut self.search_api_key);
        text("WEBDRIVER_URL", &mut self.webdriver_url);
        text("WISH_ENCRYPTION_KEY", &mut self.encryption_key);
        text("WISH_ENCRYPTION_SALT", &mut self.encryption_salt);
        text("WISH_DATA_DIR", &mut self.data_dir);
        text("WISH_SCREENSHOT_DIR", &mut self.screenshot_dir);
        text("WISH_OWNER", &mut self.default_owner);

        if let Some(v) = lookup("MODEL_MAX_RETRIES").and_then(|s| s.trim().parse().ok()) {
            self.max_retries = v;
        }
        if let Some(v) = lookup("MODEL_RETRY_DELAY").and_then(|s| s.trim().parse().ok()) {
            self.retry_delay = v;
        }
        if let Some(v) = lookup("WISH_MAX_CONCURRENT_RUNS").and_then(|s| s.trim().parse().ok()) {
            self.max_concurrent_runs = v;
        }
        if let Some(v) = lookup("WISH_TASK_TIMEOUT").and_then(|s| s.trim().parse().ok()) {
            self.task_timeout_secs = v;
        }
        if let Some(v) = lookup("WISH_OTP_TIMEOUT").and_then(|s| s.trim().parse().ok()) {
            self.otp_timeout_secs = v;
        }
        if let Some(v) = lookup("WEBDRIVER_HEADLESS") {
            self.headless = matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("WISH_ALLOW_GENERIC_FALLBACK") {
            self.allow_generic_fallback = matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Data directory, falling back to the platform data directory.
    pub fn data_path(&self) -> Option<PathBuf> {
        if !self.data_dir.is_empty() {
            return Some(PathBuf::from(&self.data_dir));
        }
        directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    pub fn screenshot_path(&self) -> Option<PathBuf> {
        if !self.screenshot_dir.is_empty() {
            return Some(PathBuf::from(&self.screenshot_dir));
        }
        self.data_path().map(|dir| dir.join("screenshots"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.max_retries)
            .with_retry_delay(Duration::from_secs(self.retry_delay))
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::default()
            .with_base_url(&self.base_url)
            .with_api_key(&self.api_key)
            .with_model_name(&self.model_name)
            .with_max_retries(self.max_retries)
            .with_retry_delay(self.retry_delay)
    }

    pub fn otp_settings(&self) -> OtpSettings {
        OtpSettings {
            poll_interval: Duration::from_millis(self.otp_poll_interval_ms),
            wait_timeout: Duration::from_secs(self.otp_timeout_secs),
            ..OtpSettings::default()
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            retry: self.retry_policy(),
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            otp_timeout: Duration::from_secs(self.otp_timeout_secs),
            otp_poll_interval: Duration::from_millis(self.otp_poll_interval_ms),
        }
    }

    fn search_provider(&self) -> Arc<dyn SearchProvider> {
        if self.search_api_key.is_empty() {
            tracing::warn!("SEARCH_API_KEY is not set, proposals will have no candidates");
            return Arc::new(EmptySearch);
        }
        let config = TavilyConfig::default()
            .with_api_key(&self.search_api_key)
            .with_max_results(self.search_max_results);
        Arc::new(TavilySearch::new(config, self.retry_policy()))
    }

    fn browser_provider(&self) -> Arc<dyn BrowserProvider> {
        let mut config = WebDriverConfig::default()
            .with_url(&self.webdriver_url)
            .with_headless(self.headless);
        if let Some(dir) = self.screenshot_path() {
            config = config.with_screenshot_dir(dir);
        }
        Arc::new(WebDriverProvider::new(config))
    }

    /// Open the store under the data directory and assemble the engine.
    pub fn build_orchestrator(&self) -> Result<TaskOrchestrator, OrchestratorError> {
        let dir = self
            .data_path()
            .ok_or_else(|| OrchestratorError::Configuration("Cannot determine data directory".to_string()))?;
        let store = Store::open(dir)?;
        self.build_with(
            &store,
            Arc::new(ModelClient::new(self.model_config())),
            self.search_provider(),
            self.browser_provider(),
        )
    }

    /// Assemble the engine over the given store and capabilities.
    pub fn build_with(
        &self,
        store: &Store,
        model: Arc<dyn crate::model::LanguageModel>,
        search: Arc<dyn SearchProvider>,
        browsers: Arc<dyn BrowserProvider>,
    ) -> Result<TaskOrchestrator, OrchestratorError> {
        let cipher = EnvelopeCipher::from_key(&self.encryption_key, &self.encryption_salt)?;
        let context = ExecutorContext {
            ledger: Arc::new(ProgressLedger::new(store)?),
            vault: Arc::new(CredentialVault::new(store, cipher)?),
            otp: Arc::new(
                OneTimeCodeBroker::new(store, self.otp_settings())
                    .map_err(|e| OrchestratorError::Storage(e.to_string()))?,
            ),
            browsers,
            locks: SessionLocks::new(),
            settings: self.executor_settings(),
        };
        let pool = ExecutionPool::new(context, self.max_concurrent_runs)
            .with_task_timeout(Duration::from_secs(self.task_timeout_secs));

        tracing::info!(
            model = %self.model_name,
            max_concurrent_runs = self.max_concurrent_runs,
            generic_fallback = self.allow_generic_fallback,
            "engine assembled"
        );
        Ok(TaskOrchestrator::new(model, search, Arc::new(pool), store)?
            .with_registry(ExecutorRegistry::new(self.allow_generic_fallback)))
    }
}
