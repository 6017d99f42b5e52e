//! Credential store.
//!
//! Holds the single username/password pair every handshake is checked
//! against. The pair is resolved once at startup and never changes.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

/// Environment variable holding the proxy username.
pub const USERNAME_ENV: &str = "PROXY_USERNAME";
/// Environment variable holding the proxy password.
pub const PASSWORD_ENV: &str = "PROXY_PASSWORD";

/// Length of a generated username.
pub const GENERATED_USERNAME_LEN: usize = 8;
/// Length of a generated password.
pub const GENERATED_PASSWORD_LEN: usize = 12;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Where the active credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    /// Both values were supplied by configuration
    Environment,
    /// At least one value was generated at startup
    Generated,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Environment => f.write_str("environment"),
            CredentialSource::Generated => f.write_str("generated"),
        }
    }
}

/// The active username/password pair and its provenance.
#[derive(Clone, Serialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub issued_at: DateTime<Utc>,
    pub source: CredentialSource,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("source", &self.source)
            .finish()
    }
}

impl Credential {
    /// Resolve a credential from optional configured values.
    ///
    /// Missing or empty values are replaced with random lowercase
    /// alphanumeric strings.
    pub fn resolve(username: Option<String>, password: Option<String>) -> Self {
        let username = username.filter(|s| !s.is_empty());
        let password = password.filter(|s| !s.is_empty());

        let source = if username.is_some() && password.is_some() {
            CredentialSource::Environment
        } else {
            CredentialSource::Generated
        };

        Self {
            username: username.unwrap_or_else(|| random_string(GENERATED_USERNAME_LEN)),
            password: password.unwrap_or_else(|| random_string(GENERATED_PASSWORD_LEN)),
            issued_at: Utc::now(),
            source,
        }
    }

    /// Resolve a credential from `PROXY_USERNAME` / `PROXY_PASSWORD`.
    pub fn from_env() -> Self {
        Self::resolve(
            std::env::var(USERNAME_ENV).ok(),
            std::env::var(PASSWORD_ENV).ok(),
        )
    }

    /// Create a credential from fixed values.
    pub fn fixed(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            issued_at: Utc::now(),
            source: CredentialSource::Environment,
        }
    }
}

/// Generate a random lowercase alphanumeric string.
fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Read-only shared handle to the active credential.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    inner: Arc<Credential>,
}

impl CredentialStore {
    /// Wrap a resolved credential, logging it once.
    pub fn new(credential: Credential) -> Self {
        tracing::info!(
            username = %credential.username,
            password = %credential.password,
            source = %credential.source,
            issued_at = %credential.issued_at.to_rfc3339(),
            "proxy credentials resolved"
        );
        Self {
            inner: Arc::new(credential),
        }
    }

    /// Get the active credential.
    pub fn get(&self) -> &Credential {
        &self.inner
    }

    /// Check a client-supplied pair against the active credential.
    pub fn verify(&self, username: &[u8], password: &[u8]) -> bool {
        self.inner.username.as_bytes() == username && self.inner.password.as_bytes() == password
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_from_supplied_values() {
        let cred = Credential::resolve(Some("alice".into()), Some("s3cret".into()));
        assert_eq!(cred.username, "alice");
        assert_eq!(cred.password, "s3cret");
        assert_eq!(cred.source, CredentialSource::Environment);
    }

    #[test]
    fn test_resolve_generates_missing_values() {
        let cred = Credential::resolve(None, None);
        assert_eq!(cred.username.len(), GENERATED_USERNAME_LEN);
        assert_eq!(cred.password.len(), GENERATED_PASSWORD_LEN);
        assert_eq!(cred.source, CredentialSource::Generated);
        assert!(cred
            .username
            .bytes()
            .chain(cred.password.bytes())
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn test_resolve_treats_empty_as_missing() {
        let cred = Credential::resolve(Some("bob".into()), Some(String::new()));
        assert_eq!(cred.username, "bob");
        assert_eq!(cred.password.len(), GENERATED_PASSWORD_LEN);
        assert_eq!(cred.source, CredentialSource::Generated);
    }

    #[test]
    fn test_verify() {
        let store = CredentialStore::new(Credential::fixed("user", "pass"));
        assert!(store.verify(b"user", b"pass"));
        assert!(!store.verify(b"user", b"wrong"));
        assert!(!store.verify(b"User", b"pass"));
        assert!(!store.verify(b"", b""));
    }

    #[test]
    fn test_debug_redacts_password() {
        let cred = Credential::fixed("user", "topsecret");
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("topsecret"));
    }
}
