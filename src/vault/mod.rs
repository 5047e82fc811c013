//! Encrypted per-owner, per-service credential storage.

mod cipher;

pub use cipher::{EnvelopeCipher, DEFAULT_KDF_SALT, PBKDF2_ITERATIONS};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::config::service_display_name;
use crate::store::{Collection, Store, StoreError};

/// Default length of generated passwords.
pub const DEFAULT_PASSWORD_LENGTH: usize = 16;

const MIN_PASSWORD_LENGTH: usize = 8;

/// Vault errors.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Encryption key is not configured")]
    MissingKey,
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Credential payload is malformed: {0}")]
    Malformed(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Decrypted credential fields (e.g. `email`, `password`).
///
/// Values are zeroized on drop and never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets(BTreeMap<String, String>);

impl Secrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        if let Some(mut previous) = self.0.insert(field.into(), value.into()) {
            previous.zeroize();
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn to_json(&self) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        serde_json::to_vec(&self.0)
            .map(Zeroizing::new)
            .map_err(|e| VaultError::Malformed(e.to_string()))
    }

    fn from_json(bytes: &[u8]) -> Result<Self, VaultError> {
        serde_json::from_slice(bytes)
            .map(Self)
            .map_err(|e| VaultError::Malformed(e.to_string()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Secrets {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut secrets = Self::new();
        for (field, value) in iter {
            secrets.insert(field, value);
        }
        secrets
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

impl Drop for Secrets {
    fn drop(&mut self) {
        for value in self.0.values_mut() {
            value.zeroize();
        }
    }
}

/// A stored credential. The payload is always an encrypted envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub owner: String,
    pub service: String,
    pub encrypted_payload: String,
    pub updated_at: DateTime<Utc>,
}

/// A form field the user fills to log in or register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthField {
    pub name: String,
    pub label: String,
    pub field_type: String,
    pub required: bool,
    pub placeholder: String,
    #[serde(default, skip_serializing)]
    pub default_value: Option<String>,
}

impl AuthField {
    fn new(name: &str, label: &str, field_type: &str, placeholder: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            field_type: field_type.to_string(),
            required: true,
            placeholder: placeholder.to_string(),
            default_value: None,
        }
    }
}

/// What the user needs to provide when a run suspends for credentials.
///
/// The generated password is a suggestion for registration and is never
/// written to durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthOptions {
    pub service: String,
    pub display_name: String,
    pub login_fields: Vec<AuthField>,
    pub registration_fields: Vec<AuthField>,
    #[serde(default, skip_serializing)]
    pub generated_password: Option<String>,
}

impl AuthOptions {
    /// Build the login and registration forms for a service.
    pub fn for_service(service: &str) -> Self {
        let generated_password = generate_secure_password(DEFAULT_PASSWORD_LENGTH);

        let login_fields = vec![
            AuthField::new("email", "Email address", "email", "example@email.com"),
            AuthField::new("password", "Password", "password", "Enter your password"),
        ];

        let mut password = AuthField::new("password", "Password", "password", "Generated for you");
        password.default_value = Some(generated_password.clone());
        let mut registration_fields = vec![
            AuthField::new("email", "Email address", "email", "example@email.com"),
            password,
        ];

        // Highway bus bookings need a passenger name and phone number
        if service == "willer" {
            registration_fields.push(AuthField::new("name", "Full name", "text", "Taro Yamada"));
            registration_fields.push(AuthField::new("phone", "Phone number", "tel", "090-1234-5678"));
        }

        Self {
            service: service.to_string(),
            display_name: service_display_name(service).to_string(),
            login_fields,
            registration_fields,
            generated_password: Some(generated_password),
        }
    }
}

/// Generate a random password containing lowercase, uppercase and digits.
pub fn generate_secure_password(length: usize) -> String {
    const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const DIGITS: &[u8] = b"0123456789";

    let length = length.max(MIN_PASSWORD_LENGTH);
    let mut rng = OsRng;
    let all: Vec<u8> = [LOWER, UPPER, DIGITS].concat();

    let mut chars: Vec<u8> = [LOWER, UPPER, DIGITS]
        .iter()
        .filter_map(|set| set.choose(&mut rng).copied())
        .collect();
    while chars.len() < length {
        if let Some(c) = all.choose(&mut rng) {
            chars.push(*c);
        }
    }
    chars.shuffle(&mut rng);

    chars.into_iter().map(char::from).collect()
}

/// Encrypted credential vault backed by the durable store.
pub struct CredentialVault {
    cipher: EnvelopeCipher,
    records: Collection<StoredCredential>,
}

impl CredentialVault {
    /// Open the vault's collection in `store`.
    pub fn new(store: &Store, cipher: EnvelopeCipher) -> Result<Self, VaultError> {
        Ok(Self {
            cipher,
            records: store.collection("credentials")?,
        })
    }

    /// Encrypt and save secrets, replacing any previous value.
    pub async fn save(&self, owner: &str, service: &str, secrets: &Secrets) -> Result<(), VaultError> {
        let plaintext = secrets.to_json()?;
        let encrypted_payload = self.cipher.seal(&plaintext, &associated_data(owner, service))?;

        let record = StoredCredential {
            owner: owner.to_string(),
            service: service.to_string(),
            encrypted_payload,
            updated_at: Utc::now(),
        };
        self.records.put(record_key(owner, service), record).await?;

        tracing::info!(owner, service, "saved credentials");
        Ok(())
    }

    /// Decrypt secrets for `(owner, service)`. Absence is `Ok(None)`.
    pub async fn get(&self, owner: &str, service: &str) -> Result<Option<Secrets>, VaultError> {
        let Some(record) = self.records.get(&record_key(owner, service)).await? else {
            return Ok(None);
        };
        let plaintext = self
            .cipher
            .open(&record.encrypted_payload, &associated_data(owner, service))?;
        Secrets::from_json(&plaintext).map(Some)
    }

    /// Services with stored credentials for `owner`, sorted.
    pub async fn list(&self, owner: &str) -> Result<Vec<String>, VaultError> {
        let mut services: Vec<String> = self
            .records
            .values()
            .await
            .into_iter()
            .filter(|record| record.owner == owner)
            .map(|record| record.service)
            .collect();
        services.sort();
        Ok(services)
    }

    /// Delete credentials. Returns whether anything was removed.
    pub async fn delete(&self, owner: &str, service: &str) -> Result<bool, VaultError> {
        let removed = self.records.remove(&record_key(owner, service)).await?.is_some();
        if removed {
            tracing::info!(owner, service, "deleted credentials");
        }
        Ok(removed)
    }

    /// Whether credentials exist for `(owner, service)`.
    pub async fn has(&self, owner: &str, service: &str) -> Result<bool, VaultError> {
        Ok(self.records.get(&record_key(owner, service)).await?.is_some())
    }
}

fn record_key(owner: &str, service: &str) -> String {
    format!("{}::{}", owner, service)
}

fn associated_data(owner: &str, service: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(owner.len() + service.len() + 1);
    aad.extend_from_slice(owner.as_bytes());
    aad.push(0);
    aad.extend_from_slice(service.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault(store: &Store) -> CredentialVault {
        let cipher = EnvelopeCipher::from_key("test-passphrase", DEFAULT_KDF_SALT).unwrap();
        CredentialVault::new(store, cipher).unwrap()
    }

    fn login() -> Secrets {
        Secrets::new()
            .with("email", "alice@example.com")
            .with("password", "s3cret-Passw0rd")
    }

    #[tokio::test]
    async fn test_round_trip_and_delete() {
        let store = Store::in_memory();
        let vault = vault(&store);

        vault.save("alice", "amazon", &login()).await.unwrap();
        assert_eq!(vault.get("alice", "amazon").await.unwrap(), Some(login()));
        assert!(vault.has("alice", "amazon").await.unwrap());

        assert!(vault.delete("alice", "amazon").await.unwrap());
        assert!(vault.get("alice", "amazon").await.unwrap().is_none());
        assert!(!vault.delete("alice", "amazon").await.unwrap());
    }

    #[tokio::test]
    async fn test_absent_is_none() {
        let store = Store::in_memory();
        let vault = vault(&store);
        assert!(vault.get("nobody", "amazon").await.unwrap().is_none());
        assert!(!vault.has("nobody", "amazon").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_is_per_owner() {
        let store = Store::in_memory();
        let vault = vault(&store);
        vault.save("alice", "rakuten", &login()).await.unwrap();
        vault.save("alice", "amazon", &login()).await.unwrap();
        vault.save("bob", "willer", &login()).await.unwrap();

        assert_eq!(vault.list("alice").await.unwrap(), vec!["amazon", "rakuten"]);
        assert_eq!(vault.list("bob").await.unwrap(), vec!["willer"]);
    }

    #[tokio::test]
    async fn test_plaintext_never_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let vault = vault(&store);
        vault.save("alice", "amazon", &login()).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("credentials.json")).unwrap();
        assert!(raw.contains("enc:v1:"));
        assert!(!raw.contains("s3cret-Passw0rd"));
        assert!(!raw.contains("alice@example.com"));

        let reopened = self::vault(&Store::open(dir.path()).unwrap());
        assert_eq!(reopened.get("alice", "amazon").await.unwrap(), Some(login()));
    }

    #[test]
    fn test_debug_is_redacted() {
        let rendered = format!("{:?}", login());
        assert!(rendered.contains("password"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_generated_password_mixes_classes() {
        let password = generate_secure_password(16);
        assert_eq!(password.len(), 16);
        assert!(password.chars().any(|c| c.is_ascii_lowercase()));
        assert!(password.chars().any(|c| c.is_ascii_uppercase()));
        assert!(password.chars().any(|c| c.is_ascii_digit()));
        assert_eq!(generate_secure_password(2).len(), MIN_PASSWORD_LENGTH);
    }

    #[test]
    fn test_auth_options_for_willer_ask_for_phone() {
        let options = AuthOptions::for_service("willer");
        assert_eq!(options.display_name, "WILLER EXPRESS");
        assert_eq!(options.login_fields.len(), 2);
        assert!(options.registration_fields.iter().any(|f| f.name == "phone"));
        assert!(options.generated_password.is_some());
    }
}
