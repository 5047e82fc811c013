//! Known external services: display names, site domains, one-time-code
//! sender domains and fallback alternatives.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Mapping from service keys to user-facing display names.
pub static SERVICE_DISPLAY_NAMES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();

    // Marketplaces
    m.insert("amazon", "Amazon");
    m.insert("rakuten", "楽天市場");

    // Transit
    m.insert("ex_reservation", "スマートEX");
    m.insert("willer", "WILLER EXPRESS");

    // Payments
    m.insert("bank_simulation", "Bank transfer (simulation)");

    m
});

/// Site domains used to infer the service from a search result URL.
pub static SERVICE_SITE_DOMAINS: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("amazon", vec!["amazon.co.jp", "amazon.com", "amazon.jp"]);
    m.insert("rakuten", vec!["rakuten.co.jp", "rakuten.jp"]);
    m.insert("ex_reservation", vec!["smart-ex.jp", "expy.jp", "jr-central.co.jp"]);
    m.insert("willer", vec!["willer.co.jp", "willerexpress.com"]);
    m
});

/// Allowed sender domains for one-time-code messages, per service.
pub static OTP_SENDER_DOMAINS: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("amazon", vec!["amazon.co.jp", "amazon.com", "amazon.jp"]);
    m.insert("ex_reservation", vec!["expy.jp", "jr-central.co.jp", "smartex.jp"]);
    m.insert("rakuten", vec!["rakuten.co.jp", "rakuten.jp"]);
    m.insert("willer", vec!["willer.co.jp", "willerexpress.com"]);
    m.insert("line", vec!["line.me", "line.biz"]);
    m.insert("google", vec!["google.com", "google.co.jp"]);
    m.insert("microsoft", vec!["microsoft.com", "live.com", "outlook.com"]);
    m.insert("yahoo", vec!["yahoo.co.jp", "yahoo.com"]);
    m.insert("apple", vec!["apple.com", "icloud.com"]);
    m
});

/// Keywords that tie an SMS to a service, matched case-insensitively
/// against the sender and body. Checked in order.
pub const OTP_SMS_KEYWORDS: &[(&str, &[&str])] = &[
    ("amazon", &["amazon", "アマゾン"]),
    ("rakuten", &["楽天", "rakuten"]),
    ("ex_reservation", &["ex予約", "smartex", "スマートex", "新幹線", "jr"]),
    ("willer", &["willer", "ウィラー"]),
    ("google", &["google", "グーグル"]),
    ("line", &["line", "ライン"]),
    ("yahoo", &["yahoo", "ヤフー"]),
];

/// Static alternatives offered when an automation fails and the model is
/// unavailable, keyed by task category name.
pub static FALLBACK_ALTERNATIVES: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "purchase",
        vec![
            "Try the same item on another marketplace (Rakuten, Yahoo! Shopping)",
            "Pick a similar item from the other search results",
            "Open the product page and finish the purchase manually",
        ],
    );
    m.insert(
        "travel",
        vec![
            "Book an alternative mode of transport (highway bus instead of train, or vice versa)",
            "Try a different departure time on the same route",
            "Reserve at the station counter or by phone",
        ],
    );
    m.insert(
        "payment",
        vec![
            "Pay through the bank's own app or website",
            "Pay at a convenience store before the due date",
            "Contact the payee to arrange a different payment method",
        ],
    );
    m.insert(
        "email",
        vec![
            "Send the message manually from your mail client",
            "Save the draft and retry later",
        ],
    );
    m.insert(
        "messaging",
        vec![
            "Send the message manually from the LINE app",
            "Reach the recipient by email instead",
        ],
    );
    m.insert(
        "research",
        vec![
            "Refine the wish with more specific keywords",
            "Check an official site or comparison site directly",
        ],
    );
    m.insert(
        "other",
        vec![
            "Rephrase the wish with more detail and try again",
            "Complete the task manually",
        ],
    );
    m
});

/// Get the display name for a service key, falling back to the key itself.
pub fn service_display_name(service: &str) -> &str {
    SERVICE_DISPLAY_NAMES.get(service).copied().unwrap_or(service)
}

/// Find the service whose site domains match `host`.
pub fn service_for_host(host: &str) -> Option<&'static str> {
    let host = host.to_lowercase();
    let mut services: Vec<_> = SERVICE_SITE_DOMAINS.iter().collect();
    services.sort_by_key(|(name, _)| **name);
    services
        .into_iter()
        .find(|(_, domains)| {
            domains
                .iter()
                .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
        })
        .map(|(name, _)| *name)
}

/// Get the fallback alternatives for a category name.
pub fn fallback_alternatives(category: &str) -> &'static [&'static str] {
    FALLBACK_ALTERNATIVES
        .get(category)
        .or_else(|| FALLBACK_ALTERNATIVES.get("other"))
        .map(|v| v.as_slice())
        .unwrap_or(&[])
}
