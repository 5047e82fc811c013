//! Configuration module for the wish agent.

mod prompts;
mod services;

pub use prompts::{
    classification_request, fallback_request, get_fallback_prompt, get_system_prompt,
    proposal_request, revision_request, FALLBACK_PROMPT, SECRETARY_PROMPT,
};
pub use services::{
    fallback_alternatives, service_display_name, service_for_host, FALLBACK_ALTERNATIVES,
    OTP_SENDER_DOMAINS, OTP_SMS_KEYWORDS, SERVICE_DISPLAY_NAMES, SERVICE_SITE_DOMAINS,
};
