//! Task model and its state machine.
//!
//! A task is created from a wish and moves through a fixed set of states.
//! Every state change goes through [`TaskStatus::apply`], so an illegal
//! change is an error instead of a silent overwrite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::executor::ExecutionResult;
use crate::search::{SearchCategory, SearchResult};

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet analyzed.
    #[default]
    Pending,
    /// Being classified and searched.
    Analyzing,
    /// A proposal is waiting for the user.
    Proposed,
    /// The user confirmed the proposal.
    Confirmed,
    /// An executor is running.
    Executing,
    /// The executor needs credentials from the user.
    AwaitingCredentials,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::Proposed => "proposed",
            TaskStatus::Confirmed => "confirmed",
            TaskStatus::Executing => "executing",
            TaskStatus::AwaitingCredentials => "awaiting_credentials",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// The state reached by applying `event`, if the change is allowed.
    pub fn apply(self, event: TaskEvent) -> Result<TaskStatus, InvalidTransition> {
        use TaskEvent as E;
        use TaskStatus as S;

        let next = match (self, event) {
            (S::Pending, E::Analyze) => S::Analyzing,
            (S::Analyzing | S::Proposed, E::Propose) => S::Proposed,
            (S::Proposed, E::Confirm) => S::Confirmed,
            (S::Confirmed | S::AwaitingCredentials, E::StartExecution) => S::Executing,
            (S::Executing, E::AwaitCredentials) => S::AwaitingCredentials,
            (S::Executing, E::Complete) => S::Completed,
            (S::Analyzing | S::Confirmed | S::Executing | S::AwaitingCredentials, E::Fail) => S::Failed,
            (
                S::Pending | S::Proposed | S::Confirmed | S::Executing | S::AwaitingCredentials,
                E::Cancel,
            ) => S::Cancelled,
            (S::Proposed | S::Failed, E::Revise) => S::Analyzing,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named task state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Analyze,
    Propose,
    Confirm,
    StartExecution,
    AwaitCredentials,
    Complete,
    Fail,
    Cancel,
    Revise,
}

/// A state change that is not allowed from the current state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot apply {event:?} to a task that is {from}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub event: TaskEvent,
}

/// What a wish asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Purchase,
    Travel,
    Payment,
    Email,
    Messaging,
    Research,
    #[default]
    Other,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 7] = [
        TaskCategory::Purchase,
        TaskCategory::Travel,
        TaskCategory::Payment,
        TaskCategory::Email,
        TaskCategory::Messaging,
        TaskCategory::Research,
        TaskCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Purchase => "purchase",
            TaskCategory::Travel => "travel",
            TaskCategory::Payment => "payment",
            TaskCategory::Email => "email",
            TaskCategory::Messaging => "messaging",
            TaskCategory::Research => "research",
            TaskCategory::Other => "other",
        }
    }

    /// Parse a category name. `line` is accepted for messaging.
    pub fn parse(name: &str) -> Option<TaskCategory> {
        let name = name.trim().to_lowercase();
        if name == "line" {
            return Some(TaskCategory::Messaging);
        }
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A revision of the wish. Kept for audit and undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub revision_text: String,
    pub previous_wish: String,
    pub merged_wish: String,
    pub revised_at: DateTime<Utc>,
}

/// Outcome of the task's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub result: ExecutionResult,
    pub fallback_suggestions: Option<String>,
}

/// A user's wish and everything the engine has done with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub owner: String,
    /// The wish as first submitted. Never overwritten.
    pub original_wish: String,
    /// The wish after revisions.
    pub current_wish: String,
    #[serde(default)]
    pub revisions: Vec<Revision>,
    pub classified_type: TaskCategory,
    pub search_category: SearchCategory,
    #[serde(default)]
    pub proposed_actions: Vec<String>,
    #[serde(default)]
    pub proposal_text: String,
    pub requires_confirmation: bool,
    pub status: TaskStatus,
    #[serde(default)]
    pub search_results: Vec<SearchResult>,
    pub selected_result: Option<SearchResult>,
    pub execution: Option<TaskExecution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task with a fresh id.
    pub fn new(owner: impl Into<String>, wish: impl Into<String>) -> Self {
        let wish = wish.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner: owner.into(),
            original_wish: wish.clone(),
            current_wish: wish,
            revisions: Vec::new(),
            classified_type: TaskCategory::Other,
            search_category: SearchCategory::General,
            proposed_actions: Vec::new(),
            proposal_text: String::new(),
            requires_confirmation: true,
            status: TaskStatus::Pending,
            search_results: Vec::new(),
            selected_result: None,
            execution: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a state change.
    pub fn transition(&mut self, event: TaskEvent) -> Result<TaskStatus, InvalidTransition> {
        let next = self.status.apply(event)?;
        tracing::debug!(task_id = %self.id, from = %self.status, to = %next, "task transition");
        self.status = next;
        self.touch();
        Ok(next)
    }

    /// Replace the current wish and record the revision.
    pub fn record_revision(&mut self, revision_text: &str, merged_wish: String) {
        self.revisions.push(Revision {
            revision_text: revision_text.to_string(),
            previous_wish: self.current_wish.clone(),
            merged_wish: merged_wish.clone(),
            revised_at: Utc::now(),
        });
        self.current_wish = merged_wish;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
