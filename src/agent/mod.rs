//! Wish handling: classification, proposals, confirmation and recovery.

mod classify;
mod fallback;
mod orchestrator;
mod task;

pub use classify::{classify, classify_by_rules, parse_classification, search_category_for};
pub use fallback::{static_suggestions, FallbackAdvisor};
pub use orchestrator::{extract_actions, format_candidates, OrchestratorError, TaskOrchestrator, MAX_PROMPT_CANDIDATES};
pub use task::{InvalidTransition, Revision, Task, TaskCategory, TaskEvent, TaskExecution, TaskStatus};
