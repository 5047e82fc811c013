//! One-time passcode extraction and hand-off.

mod broker;
mod patterns;

pub use broker::{
    CodeSource, InboundMessage, OneTimeCode, OneTimeCodeBroker, OtpError, OtpSettings,
    DEFAULT_CODE_TTL, DEFAULT_INBOX_CAPACITY, DEFAULT_MAX_AGE, DEFAULT_POLL_INTERVAL,
    DEFAULT_WAIT_TIMEOUT,
};
pub use patterns::{extract_code, mask_code, sender_allowed, sms_allowed, sms_service, OTP_FIELD_SELECTORS};
