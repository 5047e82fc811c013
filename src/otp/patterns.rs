//! Code extraction patterns and sender filtering.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{OTP_SENDER_DOMAINS, OTP_SMS_KEYWORDS};

/// Ordered extraction patterns: labeled forms first, a bare six-digit run last.
/// Group 1 holds the code.
static CODE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(?:認証コード|確認コード|ワンタイムパスワード|OTP|verification code|passcode|セキュリティコード)[：:\s]*[「\[]?(\d{4,8})[」\]]?",
        r"(?i)(?:コード|code)[：:\s]*[「\[]?(\d{4,8})[」\]]?",
        r"(?i)(?:コードは|code is)[：:\s]*[「\[]?(\d{4,8})[」\]]?",
        r"(?:^|\D)(\d{6})(?:\D|$)",
    ]
    .iter()
    .filter_map(|pattern| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!(pattern, error = %e, "invalid code pattern");
            None
        }
    })
    .collect()
});

/// Selectors that usually identify a one-time-code input on a page.
pub const OTP_FIELD_SELECTORS: &[&str] = &[
    r#"input[name*="otp"]"#,
    r#"input[name*="code"]"#,
    r#"input[name*="verification"]"#,
    r#"input[autocomplete="one-time-code"]"#,
    r#"input[placeholder*="認証コード"]"#,
    r#"input[aria-label*="verification"]"#,
];

/// Extract a 4-8 digit code from `text` using the first matching pattern.
pub fn extract_code(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    CODE_PATTERNS.iter().find_map(|re| {
        re.captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .find(|code| (4..=8).contains(&code.len()) && code.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
    })
}

/// Whether an email `sender` is allowed to deliver codes for `service`.
///
/// No service, or a service without a known domain list, allows any sender.
pub fn sender_allowed(sender: &str, service: Option<&str>) -> bool {
    let Some(service) = service else {
        return true;
    };
    let Some(domains) = OTP_SENDER_DOMAINS.get(service.to_lowercase().as_str()) else {
        return true;
    };

    let Some(domain) = sender_domain(sender) else {
        return false;
    };
    domains
        .iter()
        .any(|allowed| domain == *allowed || domain.ends_with(&format!(".{}", allowed)))
}

/// Service an SMS belongs to, judged from its sender and text.
pub fn sms_service(sender: &str, text: &str) -> Option<&'static str> {
    let haystack = format!("{} {}", sender, text).to_lowercase();
    OTP_SMS_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| haystack.contains(&k.to_lowercase())))
        .map(|(service, _)| *service)
}

/// Whether an SMS attributed to `tagged` may deliver codes for `service`.
///
/// Services with SMS keywords only accept their own messages. Other
/// services accept messages no service claims.
pub fn sms_allowed(tagged: Option<&str>, service: Option<&str>) -> bool {
    let Some(service) = service else {
        return true;
    };
    match tagged {
        Some(tagged) => tagged.eq_ignore_ascii_case(service),
        None => !OTP_SMS_KEYWORDS
            .iter()
            .any(|(known, _)| known.eq_ignore_ascii_case(service)),
    }
}

/// Domain part of an address such as `"Amazon <no-reply@amazon.co.jp>"`.
fn sender_domain(sender: &str) -> Option<String> {
    let (_, domain) = sender.rsplit_once('@')?;
    let domain = domain
        .trim()
        .trim_end_matches('>')
        .trim()
        .to_lowercase();
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

/// Mask a code for logs, keeping the first two digits.
pub fn mask_code(code: &str) -> String {
    let visible: String = code.chars().take(2).collect();
    format!("{}****", visible)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labeled_patterns() {
        assert_eq!(extract_code("認証コード：123456").as_deref(), Some("123456"));
        assert_eq!(extract_code("Your verification code: 4821").as_deref(), Some("4821"));
        assert_eq!(extract_code("確認コード「98765432」を入力").as_deref(), Some("98765432"));
        assert_eq!(extract_code("Your code is 778899").as_deref(), Some("778899"));
    }

    #[test]
    fn test_labeled_pattern_wins_over_bare_digits() {
        let text = "Order 555555 shipped. OTP: 1234";
        assert_eq!(extract_code(text).as_deref(), Some("1234"));
    }

    #[test]
    fn test_bare_six_digit_run() {
        assert_eq!(extract_code("Use 246810 to sign in").as_deref(), Some("246810"));
        assert_eq!(extract_code("135790").as_deref(), Some("135790"));
        assert_eq!(extract_code("Tracking 12345678901"), None);
        assert_eq!(extract_code("no digits here"), None);
    }

    #[test]
    fn test_sender_allowlist() {
        assert!(sender_allowed("Amazon <account-update@amazon.co.jp>", Some("amazon")));
        assert!(sender_allowed("info@mail.rakuten.co.jp", Some("rakuten")));
        assert!(!sender_allowed("phish@amazon.co.jp.evil.com", Some("amazon")));
        assert!(!sender_allowed("no-reply@rakuten.co.jp", Some("amazon")));
        assert!(sender_allowed("anyone@example.com", None));
        assert!(sender_allowed("anyone@example.com", Some("unlisted_service")));
    }

    #[test]
    fn test_sms_service_from_sender_or_text() {
        assert_eq!(sms_service("+81312345678", "[Rakuten] 認証コード: 135791"), Some("rakuten"));
        assert_eq!(sms_service("Amazon", "Your code is 246810"), Some("amazon"));
        assert_eq!(sms_service("+81000", "スマートEXの認証コード 1234"), Some("ex_reservation"));
        assert_eq!(sms_service("+81000", "code 555555"), None);
    }

    #[test]
    fn test_sms_allowed_by_service() {
        assert!(sms_allowed(Some("rakuten"), Some("rakuten")));
        assert!(!sms_allowed(Some("rakuten"), Some("amazon")));
        assert!(!sms_allowed(None, Some("amazon")));
        assert!(sms_allowed(None, Some("unlisted_service")));
        assert!(!sms_allowed(Some("amazon"), Some("unlisted_service")));
        assert!(sms_allowed(Some("amazon"), None));
    }

    #[test]
    fn test_mask_code() {
        assert_eq!(mask_code("123456"), "12****");
    }
}
