use std::sync::Arc;

use super::task::{Task, TaskCategory};
use crate::config::{fallback_alternatives, fallback_request, get_fallback_prompt};
use crate::model::{ChatMessage, LanguageModel};

/// Suggests alternatives after a failed execution.
pub struct FallbackAdvisor {
    model: Arc<dyn LanguageModel>,
}

impl FallbackAdvisor {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Ranked alternatives for a failed action. Never empty: the static
    /// per-category list is used when the model fails or says nothing.
    pub async fn suggest(&self, task: &Task, failed_action: &str, error_message: &str) -> String {
        let request = fallback_request(
            &task.current_wish,
            task.classified_type.as_str(),
            failed_action,
            error_message,
        );
        match self
            .model
            .complete(&get_fallback_prompt(), &[ChatMessage::user(request)])
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                tracing::warn!(task_id = %task.id, "empty fallback suggestion, using static list");
                static_suggestions(task.classified_type)
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "fallback model failed, using static list");
                static_suggestions(task.classified_type)
            }
        }
    }
}

/// Numbered static alternatives for a category.
pub fn static_suggestions(category: TaskCategory) -> String {
    fallback_alternatives(category.as_str())
        .iter()
        .enumerate()
        .map(|(i, option)| format!("{}. {}", i + 1, option))
        .collect::<Vec<_>>()
        .join("\n")
}
