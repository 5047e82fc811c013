//! Wish classification: keyword rules first, then the model.

use serde::Deserialize;

use super::task::TaskCategory;
use crate::config::{classification_request, get_system_prompt};
use crate::model::{ChatMessage, LanguageModel};
use crate::search::SearchCategory;

/// Keyword rules in precedence order. Transit is checked before messaging
/// so "LINE" in a route name never wins over a train booking, and payment
/// before purchase so "pay for the order" is a payment.
const RULES: &[(TaskCategory, &[&str])] = &[
    (
        TaskCategory::Travel,
        &[
            "新幹線", "電車", "特急", "高速バス", "夜行バス", "飛行機", "航空券", "乗車券", "切符",
            "shinkansen", "train", "bus", "flight", "airline",
        ],
    ),
    (
        TaskCategory::Payment,
        &["振込", "振り込", "支払", "請求書", "pay", "transfer", "invoice", "bill"],
    ),
    (
        TaskCategory::Purchase,
        &["購入", "買", "注文", "buy", "purchase", "order"],
    ),
    (TaskCategory::Email, &["メール", "email", "mail", "gmail"]),
    (
        TaskCategory::Messaging,
        &["ライン", "メッセージ", "line", "message", "chat"],
    ),
    (
        TaskCategory::Research,
        &["調べ", "検索", "research", "search", "lookup"],
    ),
];

/// Fallback scan of a free-text answer, in precedence order.
const ANSWER_NAMES: &[(TaskCategory, &str)] = &[
    (TaskCategory::Travel, "travel"),
    (TaskCategory::Payment, "payment"),
    (TaskCategory::Purchase, "purchase"),
    (TaskCategory::Email, "email"),
    (TaskCategory::Messaging, "messaging"),
    (TaskCategory::Messaging, "line"),
    (TaskCategory::Research, "research"),
];

#[derive(Debug, Deserialize)]
struct ClassificationAnswer {
    task_type: String,
}

/// Classify by keywords only.
pub fn classify_by_rules(wish: &str) -> Option<TaskCategory> {
    let lower = wish.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    RULES
        .iter()
        .find(|(_, keywords)| {
            keywords.iter().any(|keyword| {
                if keyword.is_ascii() {
                    words.contains(keyword)
                } else {
                    lower.contains(keyword)
                }
            })
        })
        .map(|(category, _)| *category)
}

/// Read the category from a model answer: JSON first, then a substring scan.
pub fn parse_classification(answer: &str) -> Option<TaskCategory> {
    if let (Some(start), Some(end)) = (answer.find('{'), answer.rfind('}')) {
        if start < end {
            if let Ok(parsed) = serde_json::from_str::<ClassificationAnswer>(&answer[start..=end]) {
                if let Some(category) = TaskCategory::parse(&parsed.task_type) {
                    return Some(category);
                }
            }
        }
    }

    let lower = answer.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .collect();
    ANSWER_NAMES
        .iter()
        .find(|(_, name)| words.contains(name))
        .map(|(category, _)| *category)
}

/// Classify a wish. Never fails: an unusable model answer yields `Other`.
pub async fn classify(model: &dyn LanguageModel, wish: &str) -> TaskCategory {
    if let Some(category) = classify_by_rules(wish) {
        tracing::debug!(%category, "classified by keyword rules");
        return category;
    }

    let messages = [ChatMessage::user(classification_request(wish))];
    match model.complete(&get_system_prompt(), &messages).await {
        Ok(answer) => parse_classification(&answer).unwrap_or_else(|| {
            tracing::warn!(answer = %answer, "unrecognised classification answer");
            TaskCategory::Other
        }),
        Err(e) => {
            tracing::warn!(error = %e, "classification failed, using other");
            TaskCategory::Other
        }
    }
}

/// Search category to use for a classified wish.
pub fn search_category_for(category: TaskCategory, wish: &str) -> SearchCategory {
    match category {
        TaskCategory::Purchase => SearchCategory::Product,
        TaskCategory::Travel => {
            let lower = wish.to_lowercase();
            let mentions = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));
            if mentions(&["バス", "bus"]) {
                SearchCategory::Bus
            } else if mentions(&["飛行機", "航空", "flight", "airline"]) {
                SearchCategory::Flight
            } else {
                SearchCategory::Train
            }
        }
        _ => SearchCategory::General,
    }
}
