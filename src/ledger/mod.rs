//! Durable, queryable record of each task's execution progress.
//!
//! Steps are cumulative checkpoints over a fixed sequence: the completed
//! steps are always a prefix of the sequence and `current_step` is the
//! first remaining one (`None` once every step is done). Every read
//! rebuilds both lists from `current_step`, so
//! `steps_completed ∪ steps_remaining == sequence` with an empty
//! intersection holds at every observation point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::executor::ExecutionResult;
use crate::store::{Collection, Store, StoreError};
use crate::vault::AuthOptions;

/// Ledger errors.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("No execution recorded for task {0}")]
    NotStarted(String),
    #[error("Step {step} is not part of the sequence for task {task_id}")]
    UnknownStep { task_id: String, step: CheckpointStep },
    #[error("Execution for task {task_id} is already {status}")]
    Finished { task_id: String, status: ExecutionStatus },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Checkpoints an executor passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStep {
    OpenedTarget,
    Authenticated,
    EnteredDetails,
    SelectedItem,
    Confirmed,
    Completed,
}

impl CheckpointStep {
    /// Sequence for flows without an item selection step.
    pub const STANDARD: &'static [CheckpointStep] = &[
        CheckpointStep::OpenedTarget,
        CheckpointStep::Authenticated,
        CheckpointStep::EnteredDetails,
        CheckpointStep::Confirmed,
        CheckpointStep::Completed,
    ];

    /// Sequence for reservation flows.
    pub const RESERVATION: &'static [CheckpointStep] = &[
        CheckpointStep::OpenedTarget,
        CheckpointStep::Authenticated,
        CheckpointStep::EnteredDetails,
        CheckpointStep::SelectedItem,
        CheckpointStep::Confirmed,
        CheckpointStep::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStep::OpenedTarget => "opened_target",
            CheckpointStep::Authenticated => "authenticated",
            CheckpointStep::EnteredDetails => "entered_details",
            CheckpointStep::SelectedItem => "selected_item",
            CheckpointStep::Confirmed => "confirmed",
            CheckpointStep::Completed => "completed",
        }
    }
}

impl std::fmt::Display for CheckpointStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Executing,
    AwaitingCredentials,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::AwaitingCredentials => "awaiting_credentials",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One entry of the append-only step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: CheckpointStep,
    pub details: Value,
    pub screenshot_ref: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Execution state of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub task_id: String,
    pub owner: String,
    pub status: ExecutionStatus,
    pub sequence: Vec<CheckpointStep>,
    pub current_step: Option<CheckpointStep>,
    pub steps_completed: Vec<CheckpointStep>,
    pub steps_remaining: Vec<CheckpointStep>,
    pub required_service: Option<String>,
    pub auth_options: Option<AuthOptions>,
    pub screenshot_ref: Option<String>,
    pub result: Option<ExecutionResult>,
    pub error_message: Option<String>,
    pub history: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    /// Rebuild the completed/remaining lists from `current_step`.
    fn reconcile(&mut self) {
        let position = self
            .current_step
            .and_then(|step| self.sequence.iter().position(|s| *s == step))
            .unwrap_or(self.sequence.len());
        self.current_step = self.sequence.get(position).copied();
        self.steps_completed = self.sequence[..position].to_vec();
        self.steps_remaining = self.sequence[position..].to_vec();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Durable execution ledger.
pub struct ProgressLedger {
    states: Collection<ExecutionState>,
}

impl ProgressLedger {
    /// Open the ledger's collection in `store`.
    pub fn new(store: &Store) -> Result<Self, LedgerError> {
        Ok(Self {
            states: store.collection("executions")?,
        })
    }

    /// Begin (or restart) execution of a task. History from earlier runs
    /// of the same task is kept.
    pub async fn start(
        &self,
        task_id: &str,
        owner: &str,
        sequence: &[CheckpointStep],
        required_service: Option<&str>,
    ) -> Result<ExecutionState, LedgerError> {
        let now = Utc::now();
        let state = self
            .states
            .update(|states| {
                let history = states
                    .get(task_id)
                    .map(|previous| previous.history.clone())
                    .unwrap_or_default();
                let mut state = ExecutionState {
                    task_id: task_id.to_string(),
                    owner: owner.to_string(),
                    status: ExecutionStatus::Executing,
                    sequence: sequence.to_vec(),
                    current_step: sequence.first().copied(),
                    steps_completed: Vec::new(),
                    steps_remaining: Vec::new(),
                    required_service: required_service.map(str::to_string),
                    auth_options: None,
                    screenshot_ref: None,
                    result: None,
                    error_message: None,
                    history,
                    started_at: now,
                    updated_at: now,
                    completed_at: None,
                };
                state.reconcile();
                states.insert(task_id.to_string(), state.clone());
                Ok::<_, LedgerError>(state)
            })
            .await?;

        tracing::info!(task_id, owner, required_service = ?required_service, "execution started");
        Ok(state)
    }

    /// Suspend the run until credentials for `service` are supplied.
    pub async fn await_credentials(
        &self,
        task_id: &str,
        service: &str,
        auth_options: AuthOptions,
    ) -> Result<ExecutionState, LedgerError> {
        let state = self
            .modify(task_id, |state| {
                ensure_open(state)?;
                state.status = ExecutionStatus::AwaitingCredentials;
                state.required_service = Some(service.to_string());
                state.auth_options = Some(auth_options);
                Ok(())
            })
            .await?;
        tracing::info!(task_id, service, "execution awaiting credentials");
        Ok(state)
    }

    /// Record that `step` has been reached. Earlier steps in the sequence
    /// are recorded as completed too. Re-recording a completed step is a
    /// no-op.
    pub async fn advance(
        &self,
        task_id: &str,
        step: CheckpointStep,
        details: Value,
    ) -> Result<ExecutionState, LedgerError> {
        let mut advanced = false;
        let state = self
            .modify(task_id, |state| {
                let Some(index) = state.sequence.iter().position(|s| *s == step) else {
                    return Err(LedgerError::UnknownStep {
                        task_id: task_id.to_string(),
                        step,
                    });
                };
                if state.steps_completed.contains(&step) {
                    return Ok(());
                }
                ensure_open(state)?;

                state.current_step = state.sequence.get(index + 1).copied();
                state.history.push(StepRecord {
                    step,
                    details,
                    screenshot_ref: None,
                    recorded_at: Utc::now(),
                });
                advanced = true;
                Ok(())
            })
            .await?;

        if advanced {
            tracing::info!(task_id, %step, remaining = state.steps_remaining.len(), "checkpoint reached");
        } else {
            tracing::debug!(task_id, %step, "checkpoint already recorded");
        }
        Ok(state)
    }

    /// Attach a screenshot reference to the state and the latest log entry.
    pub async fn attach_screenshot(
        &self,
        task_id: &str,
        screenshot_ref: &str,
    ) -> Result<ExecutionState, LedgerError> {
        self.modify(task_id, |state| {
            state.screenshot_ref = Some(screenshot_ref.to_string());
            if let Some(last) = state.history.last_mut() {
                last.screenshot_ref = Some(screenshot_ref.to_string());
            }
            Ok(())
        })
        .await
    }

    /// Record the final result. An unsuccessful result marks the run failed.
    pub async fn complete(
        &self,
        task_id: &str,
        result: &ExecutionResult,
    ) -> Result<ExecutionState, LedgerError> {
        let state = self
            .modify(task_id, |state| {
                let now = Utc::now();
                state.status = if result.success {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
                if !result.success {
                    state.error_message = Some(result.message.clone());
                }
                state.result = Some(result.clone());
                state.required_service = None;
                state.auth_options = None;
                state.completed_at = Some(now);
                Ok(())
            })
            .await?;
        tracing::info!(task_id, status = %state.status, "execution finished");
        Ok(state)
    }

    /// Mark the run failed with a diagnostic message.
    pub async fn fail(&self, task_id: &str, message: &str) -> Result<ExecutionState, LedgerError> {
        let state = self
            .modify(task_id, |state| {
                state.status = ExecutionStatus::Failed;
                state.error_message = Some(message.to_string());
                state.completed_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        tracing::warn!(task_id, error = message, "execution failed");
        Ok(state)
    }

    /// Current state, with the step lists rebuilt from `current_step`.
    pub async fn status(&self, task_id: &str) -> Result<Option<ExecutionState>, LedgerError> {
        Ok(self.states.get(task_id).await?.map(|mut state| {
            state.reconcile();
            state
        }))
    }

    /// Step log for a task, oldest first.
    pub async fn history(&self, task_id: &str) -> Result<Vec<StepRecord>, LedgerError> {
        Ok(self
            .status(task_id)
            .await?
            .map(|state| state.history)
            .unwrap_or_default())
    }

    async fn modify<F>(&self, task_id: &str, f: F) -> Result<ExecutionState, LedgerError>
    where
        F: FnOnce(&mut ExecutionState) -> Result<(), LedgerError>,
    {
        // Make sure a state written by another handle is visible
        if self.states.get(task_id).await?.is_none() {
            return Err(LedgerError::NotStarted(task_id.to_string()));
        }

        self.states
            .update(|states| {
                let state = states
                    .get_mut(task_id)
                    .ok_or_else(|| LedgerError::NotStarted(task_id.to_string()))?;
                f(state)?;
                state.reconcile();
                state.touch();
                Ok(state.clone())
            })
            .await
    }
}

fn ensure_open(state: &ExecutionState) -> Result<(), LedgerError> {
    if state.status.is_terminal() {
        return Err(LedgerError::Finished {
            task_id: state.task_id.clone(),
            status: state.status,
        });
    }
    Ok(())
}
