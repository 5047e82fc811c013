//! Prompts for the secretary model.

use chrono::Local;

/// Prefix a prompt with today's date.
fn with_date(prompt: &str) -> String {
    let today = Local::now();
    format!("Today's date is: {}\n{}", today.format("%B %d, %Y (%A)"), prompt)
}

/// Get the secretary system prompt with the current date.
pub fn get_system_prompt() -> String {
    with_date(SECRETARY_PROMPT)
}

/// Get the fallback advisor system prompt with the current date.
pub fn get_fallback_prompt() -> String {
    with_date(FALLBACK_PROMPT)
}

/// Classification request for a wish.
pub fn classification_request(wish: &str) -> String {
    format!(
        r#"Analyze the following user request and determine the task type.

Request: {}

Task types:
- purchase: buying a product
- travel: train, bus or flight tickets and reservations
- payment: paying a bill or transferring money
- email: sending, searching or replying to email
- messaging: LINE or chat messages
- research: looking up information
- other: anything else

Respond in JSON format: {{"task_type": "type_name", "summary": "summary"}}"#,
        wish
    )
}

/// Proposal request for a wish with formatted search candidates.
pub fn proposal_request(wish: &str, category: &str, candidates: &str) -> String {
    let candidates = if candidates.is_empty() {
        "(no search results available)"
    } else {
        candidates
    };
    format!(
        r#"Propose a concrete action for the following request.

Request: {}
Task type: {}

Candidates:
{}

Reply with these sections:
[SUMMARY] one sentence restating the request
[ACTION] a bulleted list of the steps you will take, naming the chosen candidate and its price
[NOTE] anything the user should check before confirming"#,
        wish, category, candidates
    )
}

/// Revision request merging a wish with a follow-up instruction.
pub fn revision_request(wish: &str, revision: &str) -> String {
    format!(
        r#"The user made a request and then revised it.

Original request: {}
Revision: {}

Restate the combined request as a single sentence. Reply with the sentence only."#,
        wish, revision
    )
}

/// Fallback request describing a failed automation.
pub fn fallback_request(wish: &str, category: &str, failed_action: &str, error: &str) -> String {
    format!(
        r#"An automated action failed.

Request: {}
Task type: {}
Failed action: {}
Error: {}

Suggest 2-3 alternative courses of action, ranked from most to least likely to succeed.
Prefer options the user can complete today. Number each option on its own line."#,
        wish, category, failed_action, error
    )
}

pub static SECRETARY_PROMPT: &str = r#"You are a personal secretary who turns a user's wish into a concrete, safe plan of action.

Rules:
1. Never claim an action has been executed. You only propose; the user confirms.
2. Prefer the cheapest candidate that satisfies the request unless the user asked otherwise.
3. Always mention the price of the chosen candidate when one is known.
4. Keep proposals short: at most five action steps.
5. Purchases, reservations and transfers stop before the final irreversible submission."#;

pub static FALLBACK_PROMPT: &str = r#"You are a personal secretary. An automation you started on the user's behalf has failed.
Explain the alternatives plainly and rank them. Do not apologize at length and do not repeat the error verbatim."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_has_date() {
        let prompt = get_system_prompt();
        assert!(prompt.starts_with("Today's date is:"));
        assert!(prompt.contains("personal secretary"));
    }

    #[test]
    fn test_proposal_request_marks_empty_candidates() {
        let request = proposal_request("buy a kettle", "purchase", "");
        assert!(request.contains("(no search results available)"));
        assert!(request.contains("[ACTION]"));
    }
}
