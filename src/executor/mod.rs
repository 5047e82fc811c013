//! Executors: the automation that carries out a confirmed task.
//!
//! Every executor follows the same lifecycle:
//!
//! 1. the run is recorded in the [`ProgressLedger`];
//! 2. credentials are looked up when the site needs a login, and the run
//!    suspends (without opening a browser) when none are stored;
//! 3. the variant's step driver runs against a browser session, recording
//!    a checkpoint after every step;
//! 4. purchase and reservation flows stop at the last confirmation screen
//!    and return a staging reference instead of committing;
//! 5. failures capture a screenshot when possible and are recorded in the
//!    ledger before an unsuccessful [`ExecutionResult`] is returned.

mod generic;
mod login;
mod marketplace;
mod pool;
mod registry;
mod reservation;
mod transfer;

pub use marketplace::MarketplaceSite;
pub use pool::{ExecutionPool, SessionLocks, DEFAULT_MAX_CONCURRENT_RUNS, DEFAULT_TASK_TIMEOUT};
pub use registry::{infer_service, ExecutorRegistry, RegistryError};
pub use reservation::ReservationSite;
pub use transfer::TransferKind;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::browser::{Browser, BrowserError, BrowserProvider, WaitCondition};
use crate::ledger::{CheckpointStep, LedgerError, ProgressLedger};
use crate::model::{RetryPolicy, Retryable};
use crate::otp::{CodeSource, OneTimeCodeBroker, OtpError};
use crate::search::SearchResult;
use crate::vault::{AuthOptions, CredentialVault, Secrets, VaultError};

/// Default timeout for a single browser operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time granted to a wait on top of the wait's own timeout.
const WAIT_SLACK: Duration = Duration::from_secs(5);

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    OtpTimeout,
    LoginRejected,
    StepFailed,
    Cancelled,
    TimedOut,
    /// The engine is misconfigured, e.g. the vault key cannot decrypt
    /// stored credentials.
    Configuration,
    Unexpected,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::OtpTimeout => "otp_timeout",
            FailureKind::LoginRejected => "login_rejected",
            FailureKind::StepFailed => "step_failed",
            FailureKind::Cancelled => "cancelled",
            FailureKind::TimedOut => "timed_out",
            FailureKind::Configuration => "configuration",
            FailureKind::Unexpected => "unexpected",
        };
        f.write_str(s)
    }
}

/// Outcome of one executor run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Staging or simulation reference (`CART-`, `RSV-`, `SIM-`, `GEN-`).
    pub confirmation_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    /// Set when the run suspended waiting for credentials for this service.
    #[serde(default)]
    pub awaiting_service: Option<String>,
}

impl ExecutionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            confirmation_id: None,
            message: message.into(),
            details: Map::new(),
            failure: None,
            awaiting_service: None,
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            confirmation_id: None,
            message: message.into(),
            details: Map::new(),
            failure: Some(kind),
            awaiting_service: None,
        }
    }

    pub fn awaiting_credentials(service: &str) -> Self {
        Self {
            success: false,
            confirmation_id: None,
            message: format!("Credentials for {} are required to continue", service),
            details: Map::new(),
            failure: None,
            awaiting_service: Some(service.to_string()),
        }
    }

    pub fn with_confirmation_id(mut self, id: impl Into<String>) -> Self {
        self.confirmation_id = Some(id.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_awaiting_credentials(&self) -> bool {
        self.awaiting_service.is_some()
    }

    /// Whether the run failed on engine configuration rather than on the site.
    pub fn is_configuration_error(&self) -> bool {
        self.failure == Some(FailureKind::Configuration)
    }
}

/// Errors raised inside a step driver.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("No one-time code for {service} arrived in time")]
    OtpTimeout { service: String },
    #[error("Login rejected: {0}")]
    LoginRejected(String),
    #[error("Step {step} failed: {message}")]
    StepFailed { step: CheckpointStep, message: String },
    #[error("Run cancelled")]
    Cancelled,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Otp(#[from] OtpError),
}

impl DriverError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DriverError::Browser(_) | DriverError::StepFailed { .. } => FailureKind::StepFailed,
            DriverError::OtpTimeout { .. } => FailureKind::OtpTimeout,
            DriverError::LoginRejected(_) => FailureKind::LoginRejected,
            DriverError::Cancelled => FailureKind::Cancelled,
            DriverError::Ledger(_) | DriverError::Otp(_) => FailureKind::Unexpected,
        }
    }

    fn step_failed(step: CheckpointStep, message: impl Into<String>) -> Self {
        DriverError::StepFailed {
            step,
            message: message.into(),
        }
    }
}

/// Cooperative cancellation flag, checked at every checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Timeouts and retry behaviour for executor runs.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub retry: RetryPolicy,
    pub operation_timeout: Duration,
    pub otp_timeout: Duration,
    pub otp_poll_interval: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            otp_timeout: crate::otp::DEFAULT_WAIT_TIMEOUT,
            otp_poll_interval: crate::otp::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Services shared by all runs.
#[derive(Clone)]
pub struct ExecutorContext {
    pub ledger: Arc<ProgressLedger>,
    pub vault: Arc<CredentialVault>,
    pub otp: Arc<OneTimeCodeBroker>,
    pub browsers: Arc<dyn BrowserProvider>,
    pub locks: SessionLocks,
    pub settings: ExecutorSettings,
}

/// One request to run an executor.
#[derive(Debug)]
pub struct RunRequest {
    pub task_id: String,
    pub owner: String,
    pub target: SearchResult,
    /// Credentials supplied for this invocation only.
    pub credentials: Option<Secrets>,
    pub cancel: CancelFlag,
}

impl RunRequest {
    pub fn new(task_id: impl Into<String>, owner: impl Into<String>, target: SearchResult) -> Self {
        Self {
            task_id: task_id.into(),
            owner: owner.into(),
            target,
            credentials: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: Secrets) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The closed set of executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executor {
    /// Simulates the standard steps without touching any site.
    Generic,
    Marketplace(MarketplaceSite),
    Reservation(ReservationSite),
    Transfer(TransferKind),
}

impl Executor {
    /// Service key used for credentials and session locks.
    pub fn service_name(&self) -> &'static str {
        match self {
            Executor::Generic => "generic",
            Executor::Marketplace(site) => site.service(),
            Executor::Reservation(site) => site.service(),
            Executor::Transfer(kind) => kind.service(),
        }
    }

    /// Checkpoint sequence the executor declares.
    pub fn steps(&self) -> &'static [CheckpointStep] {
        match self {
            Executor::Reservation(_) => CheckpointStep::RESERVATION,
            _ => CheckpointStep::STANDARD,
        }
    }

    pub fn requires_login(&self) -> bool {
        matches!(self, Executor::Marketplace(_) | Executor::Reservation(_))
    }

    /// Whether the run only simulates its steps.
    pub fn is_simulation(&self) -> bool {
        matches!(self, Executor::Generic | Executor::Transfer(_))
    }

    /// Execute the task. Never returns an error: failures are recorded in
    /// the ledger and reported through the result.
    pub async fn run(&self, cx: &ExecutorContext, request: RunRequest) -> ExecutionResult {
        let RunRequest {
            task_id,
            owner,
            target,
            credentials,
            cancel,
        } = request;
        let service = self.service_name();
        let required_service = self.requires_login().then_some(service);

        tracing::info!(task_id = %task_id, owner = %owner, service, "starting executor run");
        if let Err(e) = cx
            .ledger
            .start(&task_id, &owner, self.steps(), required_service)
            .await
        {
            tracing::error!(task_id = %task_id, error = %e, "failed to record execution start");
            return ExecutionResult::failure(
                FailureKind::Unexpected,
                format!("Failed to record execution start: {}", e),
            );
        }

        let mut credentials = credentials;
        if self.requires_login() && credentials.is_none() {
            match cx.vault.get(&owner, service).await {
                Ok(Some(stored)) => credentials = Some(stored),
                Ok(None) => return self.suspend_for_credentials(cx, &task_id).await,
                Err(e) => {
                    let kind = match e {
                        VaultError::Storage(_) => FailureKind::Unexpected,
                        _ => FailureKind::Configuration,
                    };
                    tracing::error!(task_id = %task_id, service, error = %e, "failed to read stored credentials");
                    let result =
                        ExecutionResult::failure(kind, format!("Failed to read stored credentials: {}", e));
                    return finish(cx, &task_id, result).await;
                }
            }
        }

        let scx = StepContext {
            cx,
            task_id: &task_id,
            owner: &owner,
            service,
            target: &target,
            credentials: credentials.as_ref(),
            cancel: &cancel,
        };
        let result = self.drive(&scx).await;
        finish(cx, &task_id, result).await
    }

    async fn suspend_for_credentials(&self, cx: &ExecutorContext, task_id: &str) -> ExecutionResult {
        let service = self.service_name();
        match cx
            .ledger
            .await_credentials(task_id, service, AuthOptions::for_service(service))
            .await
        {
            Ok(_) => ExecutionResult::awaiting_credentials(service),
            Err(e) => {
                let result = ExecutionResult::failure(
                    FailureKind::Unexpected,
                    format!("Failed to suspend for credentials: {}", e),
                );
                finish(cx, task_id, result).await
            }
        }
    }

    async fn drive(&self, scx: &StepContext<'_>) -> ExecutionResult {
        match self {
            Executor::Generic => generic::simulate(scx)
                .await
                .unwrap_or_else(|e| failed(scx, e, None)),
            Executor::Transfer(kind) => transfer::simulate(scx, *kind)
                .await
                .unwrap_or_else(|e| failed(scx, e, None)),
            Executor::Marketplace(site) => {
                let session = match Session::open(scx).await {
                    Ok(session) => session,
                    Err(e) => return failed(scx, e, None),
                };
                let outcome = marketplace::drive(scx, session.browser(), *site).await;
                session.finish(scx, outcome).await
            }
            Executor::Reservation(site) => {
                let session = match Session::open(scx).await {
                    Ok(session) => session,
                    Err(e) => return failed(scx, e, None),
                };
                let outcome = reservation::drive(scx, session.browser(), *site).await;
                session.finish(scx, outcome).await
            }
        }
    }
}

/// Record the final result in the ledger.
async fn finish(cx: &ExecutorContext, task_id: &str, result: ExecutionResult) -> ExecutionResult {
    if let Err(e) = cx.ledger.complete(task_id, &result).await {
        tracing::error!(task_id, error = %e, "failed to record execution result");
    }
    result
}

fn failed(scx: &StepContext<'_>, error: DriverError, screenshot: Option<String>) -> ExecutionResult {
    tracing::warn!(
        task_id = scx.task_id,
        service = scx.service,
        error = %error,
        "executor run failed"
    );
    let mut result = ExecutionResult::failure(error.failure_kind(), error.to_string());
    if let Some(screenshot) = screenshot {
        result = result.with_detail("screenshot", screenshot);
    }
    result
}

/// Staging or simulation reference, e.g. `CART-20250101120000-3f9a1c`.
pub(crate) fn staging_reference(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        prefix,
        Utc::now().format("%Y%m%d%H%M%S"),
        &suffix[..6]
    )
}

/// A browser session held under the per-account session lock.
struct Session {
    browser: Box<dyn Browser>,
    _guard: OwnedMutexGuard<()>,
}

impl Session {
    async fn open(scx: &StepContext<'_>) -> Result<Self, DriverError> {
        scx.ensure_not_cancelled()?;
        let guard = scx.cx.locks.acquire(scx.owner, scx.service).await;
        let provider = scx.cx.browsers.as_ref();
        let browser = scx.browse("open_session", move || provider.open()).await?;
        Ok(Self {
            browser,
            _guard: guard,
        })
    }

    fn browser(&self) -> &dyn Browser {
        self.browser.as_ref()
    }

    /// Turn the driver outcome into a result and close the session.
    async fn finish(
        self,
        scx: &StepContext<'_>,
        outcome: Result<ExecutionResult, DriverError>,
    ) -> ExecutionResult {
        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                let screenshot = match self.browser.screenshot().await {
                    Ok(reference) => {
                        if let Err(e) = scx.cx.ledger.attach_screenshot(scx.task_id, &reference).await {
                            tracing::warn!(task_id = scx.task_id, error = %e, "failed to attach screenshot");
                        }
                        Some(reference)
                    }
                    Err(e) => {
                        tracing::debug!(task_id = scx.task_id, error = %e, "no failure screenshot");
                        None
                    }
                };
                failed(scx, error, screenshot)
            }
        };

        if let Err(e) = self.browser.close().await {
            tracing::warn!(task_id = scx.task_id, error = %e, "failed to close browser session");
        }
        result
    }
}

/// Per-run view handed to step drivers.
pub(crate) struct StepContext<'a> {
    pub cx: &'a ExecutorContext,
    pub task_id: &'a str,
    pub owner: &'a str,
    pub service: &'static str,
    pub target: &'a SearchResult,
    pub credentials: Option<&'a Secrets>,
    pub cancel: &'a CancelFlag,
}

impl StepContext<'_> {
    /// Record a checkpoint, then honour a pending cancellation.
    pub async fn checkpoint(&self, step: CheckpointStep, details: Value) -> Result<(), DriverError> {
        self.cx.ledger.advance(self.task_id, step, details).await?;
        self.ensure_not_cancelled()
    }

    pub fn ensure_not_cancelled(&self) -> Result<(), DriverError> {
        if self.cancel.is_raised() {
            tracing::info!(task_id = self.task_id, "run cancelled at checkpoint");
            return Err(DriverError::Cancelled);
        }
        Ok(())
    }

    /// Run a browser operation under the retry policy and the per-operation
    /// timeout.
    pub async fn browse<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrowserError>>,
    {
        self.browse_within(operation, self.cx.settings.operation_timeout, op)
            .await
    }

    async fn browse_within<T, F, Fut>(
        &self,
        operation: &str,
        timeout: Duration,
        mut op: F,
    ) -> Result<T, DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrowserError>>,
    {
        let value = self
            .cx
            .settings
            .retry
            .run(operation, || {
                let attempt = op();
                async move {
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(BrowserError::Timeout {
                            operation: operation.to_string(),
                            timeout,
                        }),
                    }
                }
            })
            .await?;
        Ok(value)
    }

    /// Wait up to one operation timeout for `condition`.
    pub async fn wait_until(&self, browser: &dyn Browser, condition: WaitCondition) -> Result<bool, DriverError> {
        let timeout = self.cx.settings.operation_timeout;
        let condition = &condition;
        self.browse_within("wait_for", timeout + WAIT_SLACK, move || {
            browser.wait_for(condition, timeout)
        })
        .await
    }

    pub async fn is_present(&self, browser: &dyn Browser, selector: &str) -> Result<bool, DriverError> {
        self.browse("is_present", move || browser.is_present(selector))
            .await
    }

    pub async fn navigate(&self, browser: &dyn Browser, url: &str) -> Result<(), DriverError> {
        self.browse("navigate", move || browser.navigate(url)).await?;
        self.wait_until(browser, WaitCondition::Loaded).await?;
        Ok(())
    }

    pub async fn fill(&self, browser: &dyn Browser, selector: &str, value: &str) -> Result<(), DriverError> {
        self.browse("fill", move || browser.fill(selector, value)).await
    }

    pub async fn click(&self, browser: &dyn Browser, selector: &str) -> Result<(), DriverError> {
        self.browse("click", move || browser.click(selector)).await
    }

    /// Click a control that changes state on the site. A failed attempt is
    /// only repeated when none of the `landed` selectors, which the click
    /// produces, are on the page.
    pub async fn click_to_commit(
        &self,
        browser: &dyn Browser,
        selector: &str,
        landed: &[&str],
    ) -> Result<(), DriverError> {
        let policy = self.cx.settings.retry;
        let timeout = self.cx.settings.operation_timeout;
        let max_attempts = policy.max_retries + 1;
        let mut attempt = 1;

        loop {
            let outcome = match tokio::time::timeout(timeout, browser.click(selector)).await {
                Ok(result) => result,
                Err(_) => Err(BrowserError::Timeout {
                    operation: "click".to_string(),
                    timeout,
                }),
            };
            let error = match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e.into()),
            };

            tokio::time::sleep(policy.delay_for(attempt)).await;
            for marker in landed {
                if self.is_present(browser, marker).await? {
                    tracing::info!(
                        task_id = self.task_id,
                        selector,
                        marker = *marker,
                        error = %error,
                        "click landed despite the error"
                    );
                    return Ok(());
                }
            }
            if attempt >= max_attempts {
                return Err(error.into());
            }
            tracing::warn!(
                task_id = self.task_id,
                selector,
                attempt,
                max_attempts,
                error = %error,
                "click did not land, retrying"
            );
            attempt += 1;
        }
    }

    /// Wait for a second-factor code and claim it.
    pub async fn await_code(&self, source: CodeSource) -> Result<String, DriverError> {
        let settings = &self.cx.settings;
        let code = self
            .cx
            .otp
            .await_code(
                self.owner,
                self.service,
                source,
                settings.otp_timeout,
                settings.otp_poll_interval,
            )
            .await?;
        code.map(|c| c.code).ok_or_else(|| DriverError::OtpTimeout {
            service: self.service.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::ledger::ExecutionStatus;
    use crate::otp::InboundMessage;
    use crate::search::SearchCategory;
    use crate::testing::{executor_context, BrowserScript, RecordingBrowserProvider};

    #[test]
    fn test_executor_shape() {
        let amazon = Executor::Marketplace(MarketplaceSite::Amazon);
        assert!(amazon.requires_login());
        assert!(!amazon.is_simulation());
        assert_eq!(amazon.service_name(), "amazon");
        assert_eq!(amazon.steps(), CheckpointStep::STANDARD);

        let willer = Executor::Reservation(ReservationSite::Willer);
        assert!(willer.steps().contains(&CheckpointStep::SelectedItem));

        assert!(!Executor::Generic.requires_login());
        assert!(Executor::Transfer(TransferKind::Simulation).is_simulation());
    }

    #[test]
    fn test_staging_reference_format() {
        let id = staging_reference("CART");
        assert!(id.starts_with("CART-"));
        assert_eq!(id.split('-').count(), 3);
        assert_ne!(staging_reference("CART"), id);
    }

    #[test]
    fn test_failure_kind_mapping() {
        let e = DriverError::OtpTimeout {
            service: "amazon".to_string(),
        };
        assert_eq!(e.failure_kind(), FailureKind::OtpTimeout);
        assert_eq!(DriverError::Cancelled.failure_kind(), FailureKind::Cancelled);
        let e = DriverError::Browser(BrowserError::ElementNotFound("#x".to_string()));
        assert_eq!(e.failure_kind(), FailureKind::StepFailed);
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.raise();
        assert!(flag.is_raised());
    }

    fn step_context<'a>(cx: &'a ExecutorContext, target: &'a SearchResult, cancel: &'a CancelFlag) -> StepContext<'a> {
        StepContext {
            cx,
            task_id: "task-step",
            owner: "alice",
            service: "amazon",
            target,
            credentials: None,
            cancel,
        }
    }

    fn quick_retries() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(2)
            .with_retry_delay(Duration::from_millis(5))
            .with_backoff_factor(1)
    }

    #[tokio::test]
    async fn test_browse_retries_transient_errors() {
        let mut cx = executor_context(Arc::new(RecordingBrowserProvider::new(BrowserScript::default())));
        cx.settings.retry = quick_retries();
        let target = SearchResult::new("r0", SearchCategory::Product, "Kettle");
        let cancel = CancelFlag::new();
        let scx = step_context(&cx, &target, &cancel);

        let attempts = AtomicUsize::new(0);
        let url = scx
            .browse("current_url", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(BrowserError::Protocol {
                            status: 502,
                            error: "bad gateway".to_string(),
                            message: "upstream closed".to_string(),
                        })
                    } else {
                        Ok("https://www.amazon.co.jp/".to_string())
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(url, "https://www.amazon.co.jp/");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        // Missing elements are not retried
        attempts.store(0, Ordering::SeqCst);
        let err = scx
            .browse("click", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BrowserError::ElementNotFound("#buy".to_string())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Browser(BrowserError::ElementNotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_click_to_commit_repeats_only_when_nothing_landed() {
        let script = BrowserScript::default()
            .present("#reserve")
            .stall_after_click("#reserve", Duration::from_secs(2));
        let provider = Arc::new(RecordingBrowserProvider::new(script));
        let mut cx = executor_context(provider.clone());
        cx.settings.retry = quick_retries();
        cx.settings.operation_timeout = Duration::from_millis(50);
        let target = SearchResult::new("r0", SearchCategory::Train, "Nozomi");
        let cancel = CancelFlag::new();
        let scx = step_context(&cx, &target, &cancel);

        let browser = provider.open().await.unwrap();
        let err = scx
            .click_to_commit(browser.as_ref(), "#reserve", &["#confirm"])
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::Browser(BrowserError::Timeout { .. })));
        let clicks = provider.calls().iter().filter(|c| *c == "click #reserve").count();
        assert_eq!(clicks, 3);
    }

    #[tokio::test]
    async fn test_missing_credentials_suspends_without_browser() {
        let provider = Arc::new(RecordingBrowserProvider::new(BrowserScript::default()));
        let cx = executor_context(provider.clone());
        let target = SearchResult::new("r0", SearchCategory::Product, "Kettle")
            .with_url("https://www.amazon.co.jp/dp/B0KETTLE");

        let result = Executor::Marketplace(MarketplaceSite::Amazon)
            .run(&cx, RunRequest::new("task-1", "alice", target))
            .await;

        assert!(!result.success);
        assert_eq!(result.awaiting_service.as_deref(), Some("amazon"));
        assert_eq!(provider.calls().len(), 0);

        let state = cx.ledger.status("task-1").await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::AwaitingCredentials);
        assert_eq!(state.required_service.as_deref(), Some("amazon"));
        let options = state.auth_options.unwrap();
        assert_eq!(options.display_name, "Amazon");
        assert!(options.generated_password.is_some());
    }

    #[tokio::test]
    async fn test_otp_timeout_fails_run_without_using_codes() {
        let site = MarketplaceSite::Amazon;
        let form = site.profile().login;
        let script = BrowserScript::default()
            .present(form.user_field)
            .present(form.password_field)
            .present(form.submit)
            .present(crate::otp::OTP_FIELD_SELECTORS[0]);
        let provider = Arc::new(RecordingBrowserProvider::new(script));
        let cx = executor_context(provider.clone());

        // A code from a sender outside the allowlist must not be used
        cx.otp
            .ingest(InboundMessage::new(
                "alice",
                CodeSource::Email,
                "noreply@phish.example",
                "Your verification code is 482913",
            ))
            .await;

        let target = SearchResult::new("r0", SearchCategory::Product, "Kettle")
            .with_url("https://www.amazon.co.jp/dp/B0KETTLE");
        let request = RunRequest::new("task-otp", "alice", target).with_credentials(
            Secrets::new()
                .with("email", "alice@example.com")
                .with("password", "hunter22"),
        );
        let result = Executor::Marketplace(site).run(&cx, request).await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::OtpTimeout));
        assert!(cx.otp.history("alice", 10).await.iter().all(|c| !c.used));

        let state = cx.ledger.status("task-otp").await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.steps_completed, vec![CheckpointStep::OpenedTarget]);
        assert!(state.screenshot_ref.is_some());
        assert!(provider.calls().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_before_browser_opens() {
        let provider = Arc::new(RecordingBrowserProvider::new(BrowserScript::default()));
        let cx = executor_context(provider.clone());
        let cancel = CancelFlag::new();
        cancel.raise();

        let target = SearchResult::new("r0", SearchCategory::Product, "Kettle")
            .with_url("https://www.amazon.co.jp/dp/B0KETTLE");
        let request = RunRequest::new("task-c", "alice", target)
            .with_credentials(Secrets::new().with("email", "a@b.c").with("password", "pw"))
            .with_cancel(cancel);
        let result = Executor::Marketplace(MarketplaceSite::Amazon).run(&cx, request).await;

        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert!(provider.calls().is_empty());
    }
}
