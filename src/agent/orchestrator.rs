//! Task orchestration: wish -> proposal -> confirmation -> execution.
//!
//! Capability failures (model, search) degrade to simpler behaviour and
//! never abort a task. Only configuration and storage problems cross this
//! boundary as errors.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::classify::{classify, search_category_for};
use super::fallback::FallbackAdvisor;
use super::task::{InvalidTransition, Task, TaskCategory, TaskEvent, TaskExecution, TaskStatus};
use crate::config::{get_system_prompt, proposal_request, revision_request};
use crate::executor::{
    infer_service, ExecutionPool, ExecutionResult, Executor, ExecutorRegistry, FailureKind,
    RegistryError, RunRequest,
};
use crate::ledger::{ExecutionState, LedgerError};
use crate::model::{ChatMessage, LanguageModel};
use crate::search::{format_price, SearchProvider, SearchResult};
use crate::store::{Collection, Store, StoreError};
use crate::vault::{Secrets, VaultError};

/// Candidates included in a proposal prompt.
pub const MAX_PROMPT_CANDIDATES: usize = 5;

/// Longest candidate line passed to the model.
const MAX_CANDIDATE_CHARS: usize = 240;

/// Service executed for payments that name no bank.
const DEFAULT_PAYMENT_SERVICE: &str = "bank_simulation";

static SECTION_MARKER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\[[A-Z_]+\]").ok());

/// Orchestrator errors.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("Candidate {index} does not exist ({available} available)")]
    InvalidCandidate { index: usize, available: usize },
    #[error("Task is waiting for {expected} credentials, not {given}")]
    ServiceMismatch { expected: String, given: String },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        OrchestratorError::Storage(e.to_string())
    }
}

impl From<LedgerError> for OrchestratorError {
    fn from(e: LedgerError) -> Self {
        OrchestratorError::Storage(e.to_string())
    }
}

impl From<VaultError> for OrchestratorError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::Storage(e) => OrchestratorError::Storage(e.to_string()),
            other => OrchestratorError::Configuration(other.to_string()),
        }
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(e: RegistryError) -> Self {
        OrchestratorError::Configuration(e.to_string())
    }
}

/// Drives tasks through their lifecycle.
pub struct TaskOrchestrator {
    model: Arc<dyn LanguageModel>,
    search: Arc<dyn SearchProvider>,
    registry: ExecutorRegistry,
    pool: Arc<ExecutionPool>,
    advisor: FallbackAdvisor,
    tasks: Collection<Task>,
}

impl TaskOrchestrator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        search: Arc<dyn SearchProvider>,
        pool: Arc<ExecutionPool>,
        store: &Store,
    ) -> Result<Self, OrchestratorError> {
        Ok(Self {
            advisor: FallbackAdvisor::new(model.clone()),
            model,
            search,
            registry: ExecutorRegistry::default(),
            pool,
            tasks: store.collection("tasks")?,
        })
    }

    pub fn with_registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    /// Create a task from a wish, classify it and propose an action.
    pub async fn submit_wish(&self, wish: &str, owner: &str) -> Result<Task, OrchestratorError> {
        let mut task = Task::new(owner, wish.trim());
        tracing::info!(task_id = %task.id, owner, "wish submitted");

        task.transition(TaskEvent::Analyze)?;
        self.save(&task).await?;

        self.analyze(&mut task).await;
        self.propose_task(&mut task).await?;
        Ok(task)
    }

    /// Search again and rebuild the proposal.
    pub async fn propose(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let mut task = self.load(task_id).await?;
        task.status.apply(TaskEvent::Propose)?;
        self.propose_task(&mut task).await?;
        Ok(task)
    }

    /// Choose which search result the executor acts on.
    pub async fn select_candidate(&self, task_id: &str, index: usize) -> Result<Task, OrchestratorError> {
        let mut task = self.load(task_id).await?;
        if task.status != TaskStatus::Proposed {
            return Err(InvalidTransition {
                from: task.status,
                event: TaskEvent::Propose,
            }
            .into());
        }
        let candidate = task
            .search_results
            .get(index)
            .cloned()
            .ok_or(OrchestratorError::InvalidCandidate {
                index,
                available: task.search_results.len(),
            })?;
        tracing::info!(task_id, index, title = %candidate.title, "candidate selected");
        task.selected_result = Some(candidate);
        task.touch();
        self.save(&task).await?;
        Ok(task)
    }

    /// Confirm the proposal and run it. Returns once the run has finished
    /// or suspended.
    pub async fn confirm(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let task = self.transition_stored(task_id, TaskEvent::Confirm).await?;
        tracing::info!(task_id, "task confirmed");

        let (target, service) = execution_target(&task);
        let executor = match self.registry.resolve(task.search_category, service.as_deref()) {
            Ok(executor) => executor,
            Err(e) => {
                tracing::error!(task_id, error = %e, "no executor for task");
                let result = ExecutionResult::failure(FailureKind::Configuration, e.to_string());
                self.settle(task_id, TaskEvent::Fail, result, None).await?;
                return Err(e.into());
            }
        };

        self.execute(task_id, executor, RunRequest::new(task_id, "", target))
            .await
    }

    /// Fold a revision into the wish and propose again.
    pub async fn revise(&self, task_id: &str, revision_text: &str) -> Result<Task, OrchestratorError> {
        let mut task = self.load(task_id).await?;
        task.transition(TaskEvent::Revise)?;

        let merged = self.merge_revision(&task.current_wish, revision_text).await;
        tracing::info!(task_id, merged = %merged, "wish revised");
        task.record_revision(revision_text, merged);
        task.execution = None;
        self.save(&task).await?;

        self.analyze(&mut task).await;
        self.propose_task(&mut task).await?;
        Ok(task)
    }

    /// Cancel a task. A registered run is asked to stop at its next
    /// checkpoint; the task becomes cancelled once it does.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let pool = &self.pool;
        let (task, stopping) = self
            .tasks
            .update(|tasks| -> Result<(Task, bool), OrchestratorError> {
                let task = tasks
                    .get_mut(task_id)
                    .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
                // A run registers its flag before its task becomes Executing
                let live = matches!(
                    task.status,
                    TaskStatus::Confirmed | TaskStatus::AwaitingCredentials | TaskStatus::Executing
                );
                if live && pool.cancel(task_id) {
                    return Ok((task.clone(), true));
                }
                task.transition(TaskEvent::Cancel)?;
                Ok((task.clone(), false))
            })
            .await?;

        if stopping {
            tracing::info!(task_id, "cancellation requested for running task");
        } else {
            tracing::info!(task_id, "task cancelled");
        }
        Ok(task)
    }

    /// Resume a run suspended for credentials. With `save`, the credentials
    /// are also stored in the vault.
    pub async fn provide_credentials(
        &self,
        task_id: &str,
        service: &str,
        secrets: Secrets,
        save: bool,
    ) -> Result<Task, OrchestratorError> {
        let task = self.load(task_id).await?;
        if task.status != TaskStatus::AwaitingCredentials {
            return Err(InvalidTransition {
                from: task.status,
                event: TaskEvent::StartExecution,
            }
            .into());
        }

        let (target, target_service) = execution_target(&task);
        let executor = self
            .registry
            .resolve(task.search_category, target_service.as_deref())?;
        if executor.service_name() != service {
            return Err(OrchestratorError::ServiceMismatch {
                expected: executor.service_name().to_string(),
                given: service.to_string(),
            });
        }

        if save {
            self.pool
                .context()
                .vault
                .save(&task.owner, service, &secrets)
                .await?;
        }

        let request = RunRequest::new(task_id, "", target).with_credentials(secrets);
        self.execute(task_id, executor, request).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, OrchestratorError> {
        Ok(self.tasks.get(task_id).await?)
    }

    /// Tasks, newest first, optionally for one owner.
    pub async fn list_tasks(&self, owner: Option<&str>, limit: usize) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .await
            .into_iter()
            .filter(|t| owner.map_or(true, |o| t.owner == o))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        tasks
    }

    pub async fn execution_status(&self, task_id: &str) -> Result<Option<ExecutionState>, OrchestratorError> {
        Ok(self.pool.context().ledger.status(task_id).await?)
    }

    async fn analyze(&self, task: &mut Task) {
        task.classified_type = classify(self.model.as_ref(), &task.current_wish).await;
        task.search_category = search_category_for(task.classified_type, &task.current_wish);
        tracing::info!(
            task_id = %task.id,
            category = %task.classified_type,
            search_category = %task.search_category,
            "wish classified"
        );
    }

    async fn propose_task(&self, task: &mut Task) -> Result<(), OrchestratorError> {
        task.search_results = match self
            .search
            .search(task.search_category, &task.current_wish)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "search failed, proposing without candidates");
                Vec::new()
            }
        };
        task.selected_result = task.search_results.first().cloned();

        let candidates = format_candidates(&task.search_results);
        let request = proposal_request(&task.current_wish, task.classified_type.as_str(), &candidates);
        match self
            .model
            .complete(&get_system_prompt(), &[ChatMessage::user(request)])
            .await
        {
            Ok(text) => {
                task.proposed_actions = extract_actions(&text);
                task.proposal_text = text;
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "proposal model failed, using generic proposal");
                let (text, actions) = generic_proposal(task);
                task.proposal_text = text;
                task.proposed_actions = actions;
            }
        }

        task.requires_confirmation = true;
        task.transition(TaskEvent::Propose)?;
        self.save(task).await?;
        tracing::info!(task_id = %task.id, actions = task.proposed_actions.len(), "proposal ready");
        Ok(())
    }

    async fn merge_revision(&self, wish: &str, revision: &str) -> String {
        let fallback = || format!("{} ({})", wish, revision);
        match self
            .model
            .complete(&get_system_prompt(), &[ChatMessage::user(revision_request(wish, revision))])
            .await
        {
            Ok(text) => {
                let merged = text.trim().trim_matches(|c: char| c == '"' || c == '「' || c == '」').trim();
                if merged.is_empty() {
                    fallback()
                } else {
                    merged.to_string()
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "revision merge failed, appending revision");
                fallback()
            }
        }
    }

    /// Dispatch a run and apply its outcome to the task.
    async fn execute(
        &self,
        task_id: &str,
        executor: Executor,
        request: RunRequest,
    ) -> Result<Task, OrchestratorError> {
        let cancel = self.pool.register(task_id);
        let outcome = self
            .execute_registered(task_id, executor, request.with_cancel(cancel))
            .await;
        self.pool.release(task_id);
        outcome
    }

    async fn execute_registered(
        &self,
        task_id: &str,
        executor: Executor,
        mut request: RunRequest,
    ) -> Result<Task, OrchestratorError> {
        let cancel = request.cancel.clone();
        let (task, start) = self
            .tasks
            .update(|tasks| -> Result<(Task, bool), OrchestratorError> {
                let task = tasks
                    .get_mut(task_id)
                    .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
                if cancel.is_raised() {
                    task.transition(TaskEvent::Cancel)?;
                    return Ok((task.clone(), false));
                }
                task.transition(TaskEvent::StartExecution)?;
                Ok((task.clone(), true))
            })
            .await?;
        if !start {
            tracing::info!(task_id, "task cancelled before execution started");
            return Ok(task);
        }

        request.owner = task.owner.clone();
        tracing::info!(task_id, service = executor.service_name(), "dispatching execution");
        let result = self.pool.dispatch(executor, request).await;
        self.apply_outcome(&task, result).await
    }

    async fn apply_outcome(&self, task: &Task, mut result: ExecutionResult) -> Result<Task, OrchestratorError> {
        let task_id = task.id.as_str();
        if result.success {
            tracing::info!(task_id, confirmation_id = ?result.confirmation_id, "task completed");
            return self.settle(task_id, TaskEvent::Complete, result, None).await;
        }
        if result.is_awaiting_credentials() {
            tracing::info!(task_id, service = ?result.awaiting_service, "task awaiting credentials");
            return self.settle(task_id, TaskEvent::AwaitCredentials, result, None).await;
        }
        if result.failure == Some(FailureKind::Cancelled) {
            tracing::info!(task_id, "task cancelled during execution");
            return self.settle(task_id, TaskEvent::Cancel, result, None).await;
        }
        if result.is_configuration_error() {
            tracing::error!(task_id, error = %result.message, "execution stopped on a configuration error");
            let message = result.message.clone();
            self.settle(task_id, TaskEvent::Fail, result, None).await?;
            return Err(OrchestratorError::Configuration(message));
        }

        let failed_action = task
            .proposed_actions
            .first()
            .cloned()
            .unwrap_or_else(|| task.current_wish.clone());
        let suggestions = self.advisor.suggest(task, &failed_action, &result.message).await;
        tracing::warn!(task_id, failure = ?result.failure, "task failed");
        result.message = format!("{}\n\nAlternatives:\n{}", result.message, suggestions);
        self.settle(task_id, TaskEvent::Fail, result, Some(suggestions)).await
    }

    /// Record a run's result on the stored task.
    async fn settle(
        &self,
        task_id: &str,
        event: TaskEvent,
        result: ExecutionResult,
        fallback_suggestions: Option<String>,
    ) -> Result<Task, OrchestratorError> {
        self.tasks
            .update(|tasks| -> Result<Task, OrchestratorError> {
                let task = tasks
                    .get_mut(task_id)
                    .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
                task.transition(event)?;
                task.execution = Some(TaskExecution {
                    result,
                    fallback_suggestions,
                });
                Ok(task.clone())
            })
            .await
    }

    /// Apply `event` to the stored record, not to a copy loaded earlier.
    async fn transition_stored(&self, task_id: &str, event: TaskEvent) -> Result<Task, OrchestratorError> {
        self.tasks
            .update(|tasks| -> Result<Task, OrchestratorError> {
                let task = tasks
                    .get_mut(task_id)
                    .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
                task.transition(event)?;
                Ok(task.clone())
            })
            .await
    }

    async fn load(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    async fn save(&self, task: &Task) -> Result<(), OrchestratorError> {
        self.tasks.put(task.id.clone(), task.clone()).await?;
        Ok(())
    }
}

/// What the executor acts on, and the service it belongs to.
fn execution_target(task: &Task) -> (SearchResult, Option<String>) {
    let target = task.selected_result.clone().unwrap_or_else(|| {
        SearchResult::new("wish", task.search_category, task.current_wish.clone())
    });
    let service = infer_service(&target).or_else(|| {
        (task.classified_type == TaskCategory::Payment).then(|| DEFAULT_PAYMENT_SERVICE.to_string())
    });
    (target, service)
}

/// Numbered candidate lines for the proposal prompt.
pub fn format_candidates(results: &[SearchResult]) -> String {
    results
        .iter()
        .take(MAX_PROMPT_CANDIDATES)
        .enumerate()
        .map(|(i, result)| {
            let mut line = format!("{}. {}", i + 1, result.title);
            if let Some(price) = result.price {
                line.push_str(&format!(" - {}", format_price(price)));
            }
            if let Some(url) = &result.url {
                line.push_str(&format!(" ({})", url));
            }
            truncate_chars(&line, MAX_CANDIDATE_CHARS)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

/// Action lines from a proposal: the bulleted lines of the `[ACTION]`
/// section, or of the whole text when there is no such section.
pub fn extract_actions(text: &str) -> Vec<String> {
    let section = action_section(text).unwrap_or(text);
    let bullets: Vec<String> = section
        .lines()
        .filter_map(bullet_text)
        .collect();
    if !bullets.is_empty() {
        return bullets;
    }

    let plain: Vec<String> = section
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if plain.is_empty() && !text.trim().is_empty() {
        vec![text.trim().to_string()]
    } else {
        plain
    }
}

/// Text between the first `[ACTION]` marker and the next section marker.
fn action_section(text: &str) -> Option<&str> {
    let start = text.find("[ACTION]")? + "[ACTION]".len();
    let rest = &text[start..];
    let end = SECTION_MARKER
        .as_ref()
        .and_then(|re| re.find(rest))
        .map(|m| m.start())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

fn bullet_text(line: &str) -> Option<String> {
    let line = line.trim();
    let stripped = if let Some(rest) = line
        .strip_prefix('-')
        .or_else(|| line.strip_prefix('*'))
        .or_else(|| line.strip_prefix('•'))
    {
        rest
    } else {
        let digits = line.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let rest = &line[digits..];
        rest.strip_prefix('.').or_else(|| rest.strip_prefix(')'))?
    };
    let stripped = stripped.trim();
    (!stripped.is_empty()).then(|| stripped.to_string())
}

/// Proposal used when the model is unavailable.
fn generic_proposal(task: &Task) -> (String, Vec<String>) {
    let action = match &task.selected_result {
        Some(top) => match top.price {
            Some(price) => format!("Proceed with \"{}\" for {}", top.title, format_price(price)),
            None => format!("Proceed with \"{}\"", top.title),
        },
        None => format!("Proceed with: {}", task.current_wish),
    };
    let text = format!(
        "[SUMMARY] {}\n[ACTION]\n- {}\n- Stop before the final confirmation so you can review it\n[NOTE] Generated from the top search result without the assistant.",
        task.current_wish, action
    );
    let actions = vec![
        action,
        "Stop before the final confirmation so you can review it".to_string(),
    ];
    (text, actions)
}
