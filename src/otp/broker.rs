//! One-time code broker: ingests inbound messages, extracts codes and hands
//! each code out exactly once.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use super::patterns::{extract_code, mask_code, sender_allowed, sms_allowed, sms_service};
use crate::store::{Collection, Store, StoreError};

/// Default code lifetime.
pub const DEFAULT_CODE_TTL: Duration = Duration::from_secs(10 * 60);
/// Default maximum message age considered by extraction.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);
/// Default poll interval while waiting for a code.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default wait timeout.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default number of inbound messages kept per owner.
pub const DEFAULT_INBOX_CAPACITY: usize = 50;

/// OTP errors.
#[derive(Error, Debug)]
pub enum OtpError {
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeSource {
    Email,
    Sms,
}

impl std::fmt::Display for CodeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeSource::Email => write!(f, "email"),
            CodeSource::Sms => write!(f, "sms"),
        }
    }
}

/// A raw message delivered by the external inbound watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub owner: String,
    pub source: CodeSource,
    pub sender: String,
    pub subject: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Create a message received now.
    pub fn new(
        owner: impl Into<String>,
        source: CodeSource,
        sender: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner: owner.into(),
            source,
            sender: sender.into(),
            subject: None,
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    /// Set the upstream message id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Service an SMS names in its sender or text.
    fn sms_service(&self) -> Option<&'static str> {
        let text = match &self.subject {
            Some(subject) => format!("{} {}", subject, self.body),
            None => self.body.clone(),
        };
        sms_service(&self.sender, &text)
    }

    fn serves(&self, service: Option<&str>) -> bool {
        match self.source {
            CodeSource::Email => sender_allowed(&self.sender, service),
            CodeSource::Sms => sms_allowed(self.sms_service(), service),
        }
    }
}

/// An extracted code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneTimeCode {
    pub id: String,
    pub owner: String,
    pub service: Option<String>,
    pub source: CodeSource,
    pub message_id: String,
    pub sender: String,
    pub code: String,
    pub received_at: DateTime<Utc>,
    pub extracted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
}

impl OneTimeCode {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.used && self.expires_at > now
    }

    fn serves(&self, service: Option<&str>) -> bool {
        match self.source {
            CodeSource::Email => sender_allowed(&self.sender, service),
            CodeSource::Sms => sms_allowed(self.service.as_deref(), service),
        }
    }
}

/// Broker timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct OtpSettings {
    pub code_ttl: Duration,
    pub max_age: Duration,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
    pub inbox_capacity: usize,
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self {
            code_ttl: DEFAULT_CODE_TTL,
            max_age: DEFAULT_MAX_AGE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

/// Extracts one-time codes from inbound messages.
pub struct OneTimeCodeBroker {
    settings: OtpSettings,
    inbox: RwLock<HashMap<String, VecDeque<InboundMessage>>>,
    codes: Collection<OneTimeCode>,
}

impl OneTimeCodeBroker {
    /// Open the broker's code collection in `store`.
    pub fn new(store: &Store, settings: OtpSettings) -> Result<Self, OtpError> {
        Ok(Self {
            settings,
            inbox: RwLock::new(HashMap::new()),
            codes: store.collection("otp_codes")?,
        })
    }

    pub fn settings(&self) -> &OtpSettings {
        &self.settings
    }

    /// Store an inbound message. The oldest message is dropped once the
    /// owner's buffer is full.
    pub async fn ingest(&self, message: InboundMessage) {
        tracing::debug!(
            owner = %message.owner,
            source = %message.source,
            sender = %message.sender,
            "ingested inbound message"
        );
        let mut inbox = self.inbox.write().await;
        let buffer = inbox.entry(message.owner.clone()).or_default();
        buffer.push_back(message);
        while buffer.len() > self.settings.inbox_capacity.max(1) {
            buffer.pop_front();
        }
    }

    /// Scan recent messages for codes and return the newest unused,
    /// unexpired one.
    pub async fn extract_latest(
        &self,
        owner: &str,
        service: Option<&str>,
        source: CodeSource,
        max_age: Duration,
    ) -> Result<Option<OneTimeCode>, OtpError> {
        let now = Utc::now();
        let cutoff = now - to_chrono(max_age).min(self.retention());

        let mut candidates: Vec<InboundMessage> = self
            .inbox
            .read()
            .await
            .get(owner)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|m| m.source == source && m.received_at >= cutoff)
                    .filter(|m| m.serves(service))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        candidates.sort_by(|a, b| b.received_at.cmp(&a.received_at));

        let extracted: Vec<OneTimeCode> = candidates
            .iter()
            .filter_map(|message| {
                let code = message
                    .subject
                    .as_deref()
                    .and_then(extract_code)
                    .or_else(|| extract_code(&message.body))?;
                let service = match source {
                    CodeSource::Email => service,
                    CodeSource::Sms => message.sms_service(),
                };
                Some(OneTimeCode {
                    id: Uuid::new_v4().to_string(),
                    owner: owner.to_string(),
                    service: service.map(str::to_string),
                    source,
                    message_id: message.id.clone(),
                    sender: message.sender.clone(),
                    code,
                    received_at: message.received_at,
                    extracted_at: now,
                    expires_at: now + to_chrono(self.settings.code_ttl),
                    used: false,
                    used_at: None,
                })
            })
            .collect();

        let retention = self.retention();
        let existing = self.codes.values().await;
        let stale = existing
            .iter()
            .any(|c| !c.is_live(now) && c.received_at < now - retention);
        let fresh = extracted.iter().any(|code| {
            !existing
                .iter()
                .any(|c| c.owner == code.owner && c.message_id == code.message_id)
        });
        if stale || fresh {
            self.codes
                .update(|codes| {
                    let before = codes.len();
                    codes.retain(|_, c| c.is_live(now) || c.received_at >= now - retention);
                    if codes.len() < before {
                        tracing::debug!(pruned = before - codes.len(), "pruned stale one-time codes");
                    }
                    for code in extracted {
                        let duplicate = codes
                            .values()
                            .any(|c| c.owner == code.owner && c.message_id == code.message_id);
                        if !duplicate {
                            tracing::info!(
                                owner = %code.owner,
                                service = ?code.service,
                                code = %mask_code(&code.code),
                                "extracted one-time code"
                            );
                            codes.insert(code.id.clone(), code);
                        }
                    }
                    Ok::<_, StoreError>(())
                })
                .await?;
        }

        let latest = self
            .codes
            .values()
            .await
            .into_iter()
            .filter(|c| c.owner == owner && c.source == source && c.is_live(now))
            .filter(|c| c.received_at >= cutoff)
            .filter(|c| c.serves(service))
            .max_by_key(|c| c.received_at);
        Ok(latest)
    }

    /// Wait for a code and claim it.
    ///
    /// Returns `None` on timeout without marking anything used. A claimed
    /// code is never handed to a second waiter.
    pub async fn await_code(
        &self,
        owner: &str,
        service: &str,
        source: CodeSource,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<OneTimeCode>, OtpError> {
        tracing::info!(owner, service, %source, ?timeout, "waiting for one-time code");
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(candidate) = self
                .extract_latest(owner, Some(service), source, self.settings.max_age)
                .await?
            {
                if let Some(claimed) = self.claim(&candidate.id).await? {
                    tracing::info!(owner, service, code = %mask_code(&claimed.code), "one-time code claimed");
                    return Ok(Some(claimed));
                }
                // Another waiter won the race; look again straight away
                if Instant::now() < deadline {
                    continue;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(owner, service, "timed out waiting for one-time code");
                return Ok(None);
            }
            sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Mark a code used. Returns `true` only if this call flipped it.
    pub async fn mark_used(&self, code_id: &str) -> Result<bool, OtpError> {
        Ok(self.claim(code_id).await?.is_some())
    }

    /// Most recent codes for `owner`, newest first.
    pub async fn history(&self, owner: &str, limit: usize) -> Vec<OneTimeCode> {
        let mut codes: Vec<OneTimeCode> = self
            .codes
            .values()
            .await
            .into_iter()
            .filter(|c| c.owner == owner)
            .collect();
        codes.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        codes.truncate(limit);
        codes
    }

    /// How long a spent or expired code is kept. Messages older than this
    /// are not extracted, so the record still deduplicates its message.
    fn retention(&self) -> chrono::Duration {
        to_chrono(self.settings.max_age.max(self.settings.code_ttl))
    }

    /// Test-and-set under the collection's write lock.
    async fn claim(&self, code_id: &str) -> Result<Option<OneTimeCode>, OtpError> {
        let now = Utc::now();
        self.codes
            .update(|codes| {
                let claimed = match codes.get_mut(code_id) {
                    Some(code) if code.is_live(now) => {
                        code.used = true;
                        code.used_at = Some(now);
                        Some(code.clone())
                    }
                    _ => None,
                };
                Ok::<_, OtpError>(claimed)
            })
            .await
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn broker() -> OneTimeCodeBroker {
        OneTimeCodeBroker::new(&Store::in_memory(), OtpSettings::default()).unwrap()
    }

    fn amazon_mail(body: &str) -> InboundMessage {
        InboundMessage::new("alice", CodeSource::Email, "Amazon <account-update@amazon.co.jp>", body)
    }

    const FAST: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_extract_latest_prefers_newest_message() {
        let broker = broker();
        let older = amazon_mail("認証コード：111111")
            .with_received_at(Utc::now() - chrono::Duration::seconds(30));
        broker.ingest(older).await;
        broker.ingest(amazon_mail("認証コード：222222")).await;

        let code = broker
            .extract_latest("alice", Some("amazon"), CodeSource::Email, DEFAULT_MAX_AGE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code.code, "222222");
    }

    #[tokio::test]
    async fn test_extraction_is_deduplicated_by_message() {
        let broker = broker();
        broker.ingest(amazon_mail("OTP: 123456").with_id("msg-1")).await;

        for _ in 0..3 {
            broker
                .extract_latest("alice", Some("amazon"), CodeSource::Email, DEFAULT_MAX_AGE)
                .await
                .unwrap();
        }
        assert_eq!(broker.history("alice", 10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_sender_filter_and_max_age() {
        let broker = broker();
        broker
            .ingest(InboundMessage::new("alice", CodeSource::Email, "x@rakuten.co.jp", "code: 4444"))
            .await;
        broker
            .ingest(amazon_mail("code: 5555").with_received_at(Utc::now() - chrono::Duration::minutes(30)))
            .await;

        let found = broker
            .extract_latest("alice", Some("amazon"), CodeSource::Email, DEFAULT_MAX_AGE)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_await_code_claims_once() {
        let broker = broker();
        broker.ingest(amazon_mail("Your verification code: 987654")).await;

        let first = broker
            .await_code("alice", "amazon", CodeSource::Email, FAST, FAST)
            .await
            .unwrap();
        assert_eq!(first.as_ref().map(|c| c.code.as_str()), Some("987654"));
        assert!(first.unwrap().used);

        let second = broker
            .await_code("alice", "amazon", CodeSource::Email, FAST, FAST)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_waiters_never_share_a_code() {
        let broker = Arc::new(broker());
        broker.ingest(amazon_mail("OTP: 424242")).await;

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move {
                    broker
                        .await_code("alice", "amazon", CodeSource::Email, Duration::from_millis(50), FAST)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut received = 0;
        for waiter in waiters {
            if waiter.await.unwrap().is_some() {
                received += 1;
            }
        }
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn test_timeout_marks_nothing_used() {
        let broker = broker();
        let result = broker
            .await_code("alice", "amazon", CodeSource::Email, Duration::from_millis(30), FAST)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(broker.history("alice", 10).await.iter().all(|c| !c.used));
    }

    #[tokio::test]
    async fn test_inbox_is_bounded() {
        let settings = OtpSettings {
            inbox_capacity: 2,
            ..OtpSettings::default()
        };
        let broker = OneTimeCodeBroker::new(&Store::in_memory(), settings).unwrap();
        for code in ["111111", "222222", "333333"] {
            broker
                .ingest(InboundMessage::new("bob", CodeSource::Sms, "+81000", format!("code {}", code)))
                .await;
        }
        assert_eq!(broker.inbox.read().await.get("bob").map(|b| b.len()), Some(2));
    }

    #[tokio::test]
    async fn test_sms_code_goes_only_to_its_service() {
        let broker = broker();
        broker
            .ingest(InboundMessage::new("alice", CodeSource::Sms, "Rakuten", "[Rakuten] 認証コード: 135791"))
            .await;

        let amazon = broker
            .await_code("alice", "amazon", CodeSource::Sms, Duration::from_millis(30), FAST)
            .await
            .unwrap();
        assert!(amazon.is_none());

        let rakuten = broker
            .await_code("alice", "rakuten", CodeSource::Sms, FAST, FAST)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rakuten.code, "135791");
        assert_eq!(rakuten.service.as_deref(), Some("rakuten"));
    }

    #[tokio::test]
    async fn test_untagged_sms_skips_services_with_keywords() {
        let broker = broker();
        broker
            .ingest(InboundMessage::new("alice", CodeSource::Sms, "+815012345678", "code 864200"))
            .await;

        let found = broker
            .extract_latest("alice", Some("amazon"), CodeSource::Sms, DEFAULT_MAX_AGE)
            .await
            .unwrap();
        assert!(found.is_none());

        let found = broker
            .extract_latest("alice", None, CodeSource::Sms, DEFAULT_MAX_AGE)
            .await
            .unwrap();
        assert_eq!(found.map(|c| c.code).as_deref(), Some("864200"));
    }

    #[tokio::test]
    async fn test_spent_codes_are_pruned_and_not_reextracted() {
        let broker = broker();
        let long_ago = Utc::now() - chrono::Duration::minutes(30);
        let message = amazon_mail("OTP: 303030").with_id("msg-old").with_received_at(long_ago);
        broker.ingest(message).await;
        broker
            .codes
            .put(
                "spent",
                OneTimeCode {
                    id: "spent".to_string(),
                    owner: "alice".to_string(),
                    service: Some("amazon".to_string()),
                    source: CodeSource::Email,
                    message_id: "msg-old".to_string(),
                    sender: "account-update@amazon.co.jp".to_string(),
                    code: "303030".to_string(),
                    received_at: long_ago,
                    extracted_at: long_ago,
                    expires_at: long_ago + chrono::Duration::minutes(10),
                    used: true,
                    used_at: Some(long_ago),
                },
            )
            .await
            .unwrap();
        broker.ingest(amazon_mail("OTP: 404040")).await;

        let latest = broker
            .extract_latest("alice", Some("amazon"), CodeSource::Email, Duration::from_secs(3600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.code, "404040");

        let history = broker.history("alice", 10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].code, "404040");
    }

    #[tokio::test]
    async fn test_mark_used_is_test_and_set() {
        let broker = broker();
        broker.ingest(amazon_mail("OTP: 777777")).await;
        let code = broker
            .extract_latest("alice", Some("amazon"), CodeSource::Email, DEFAULT_MAX_AGE)
            .await
            .unwrap()
            .unwrap();

        assert!(broker.mark_used(&code.id).await.unwrap());
        assert!(!broker.mark_used(&code.id).await.unwrap());
        assert!(!broker.mark_used("missing").await.unwrap());
    }
}
