//! Bounded pool that runs executors off the request path.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinError;

use super::{CancelFlag, ExecutionResult, Executor, ExecutorContext, FailureKind, RunRequest};

/// Default number of executor runs allowed at once.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 2;

/// Default wall-clock limit for one run.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-(owner, service) locks so two automations never drive the same
/// account at once.
#[derive(Debug, Clone, Default)]
pub struct SessionLocks {
    locks: Arc<Mutex<HashMap<(String, String), Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, owner: &str, service: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry((owner.to_string(), service.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Runs executors on spawned tasks, bounded by a semaphore.
pub struct ExecutionPool {
    context: ExecutorContext,
    permits: Arc<Semaphore>,
    task_timeout: Duration,
    /// Cancel flags of registered runs. Held only briefly, never across an await.
    running: std::sync::Mutex<HashMap<String, CancelFlag>>,
}

impl ExecutionPool {
    pub fn new(context: ExecutorContext, max_concurrent_runs: usize) -> Self {
        Self {
            context,
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            task_timeout: DEFAULT_TASK_TIMEOUT,
            running: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_task_timeout(mut self, task_timeout: Duration) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    pub fn context(&self) -> &ExecutorContext {
        &self.context
    }

    /// Run `executor` and wait for its result.
    ///
    /// A run that outlives the task timeout is asked to stop at its next
    /// checkpoint, given one operation timeout of grace, then aborted.
    /// Panics and aborts come back as failed results.
    ///
    /// A task registered with [`ExecutionPool::register`] runs under the
    /// registered flag and stays registered afterwards.
    pub async fn dispatch(&self, executor: Executor, mut request: RunRequest) -> ExecutionResult {
        let task_id = request.task_id.clone();
        let owned = match self.running().entry(task_id.clone()) {
            Entry::Occupied(registered) => {
                request.cancel = registered.get().clone();
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(request.cancel.clone());
                true
            }
        };
        let cancel = request.cancel.clone();

        let permits = self.permits.clone();
        let context = self.context.clone();
        let mut handle = tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return ExecutionResult::failure(FailureKind::Unexpected, "execution pool is closed");
                }
            };
            executor.run(&context, request).await
        });

        let result = match tokio::time::timeout(self.task_timeout, &mut handle).await {
            Ok(joined) => self.joined(&task_id, joined).await,
            Err(_) => {
                tracing::warn!(task_id = %task_id, timeout = ?self.task_timeout, "execution timed out, cancelling");
                cancel.raise();

                let grace = self.context.settings.operation_timeout;
                let message = format!("Execution exceeded the {:?} time limit", self.task_timeout);
                match tokio::time::timeout(grace, &mut handle).await {
                    Ok(joined) => {
                        let partial = self.joined(&task_id, joined).await;
                        tracing::info!(task_id = %task_id, outcome = %partial.message, "run stopped after timeout");
                    }
                    Err(_) => {
                        tracing::error!(task_id = %task_id, "run ignored cancellation, aborting");
                        handle.abort();
                        let _ = handle.await;
                    }
                }
                self.fail_ledger(&task_id, &message).await;
                ExecutionResult::failure(FailureKind::TimedOut, message)
            }
        };

        if owned {
            self.release(&task_id);
        }
        result
    }

    /// Register a run before it is dispatched, so it can be cancelled from
    /// then on. Returns the flag already registered for the task, if any.
    pub fn register(&self, task_id: &str) -> CancelFlag {
        self.running()
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }

    pub fn release(&self, task_id: &str) {
        self.running().remove(task_id);
    }

    /// Raise the cancel flag of a registered run. Returns `false` when no
    /// run is registered for the task.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.running().get(task_id) {
            Some(flag) => {
                flag.raise();
                tracing::info!(task_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running().contains_key(task_id)
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, CancelFlag>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn joined(&self, task_id: &str, joined: Result<ExecutionResult, JoinError>) -> ExecutionResult {
        match joined {
            Ok(result) => result,
            Err(e) => {
                let message = if e.is_panic() {
                    "Execution panicked".to_string()
                } else {
                    "Execution was aborted".to_string()
                };
                tracing::error!(task_id, error = %e, "executor task did not finish");
                self.fail_ledger(task_id, &message).await;
                ExecutionResult::failure(FailureKind::Unexpected, message)
            }
        }
    }

    async fn fail_ledger(&self, task_id: &str, message: &str) {
        if let Err(e) = self.context.ledger.fail(task_id, message).await {
            tracing::error!(task_id, error = %e, "failed to record execution failure");
        }
    }
}
