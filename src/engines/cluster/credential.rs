//! Proxy credentials presented to cluster schedulers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ClusterError;

#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredential {
    pub subject: String,
    token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for ProxyCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCredential")
            .field("subject", &self.subject)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl ProxyCredential {
    pub fn new(subject: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    /// Credential for submitting to the cluster at `location`
    async fn credential(&self, location: &str) -> Result<ProxyCredential, ClusterError>;
}

/// Hands out one fixed credential
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    credential: ProxyCredential,
}

impl StaticCredentialProvider {
    pub fn new(credential: ProxyCredential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credential(&self, location: &str) -> Result<ProxyCredential, ClusterError> {
        if self.credential.is_expired(Utc::now()) {
            return Err(ClusterError::credential(format!(
                "credential for {} expired; ask an administrator to renew it for {location}",
                self.credential.subject
            )));
        }
        Ok(self.credential.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_token() {
        let credential = ProxyCredential::new("CN=pipeline", "s3cret");
        let printed = format!("{credential:?}");
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("CN=pipeline"));
    }

    #[tokio::test]
    async fn test_expired_credential_is_refused() {
        let expired = ProxyCredential::new("CN=pipeline", "t")
            .expiring_at(Utc::now() - chrono::Duration::minutes(1));
        let provider = StaticCredentialProvider::new(expired);
        assert!(matches!(
            provider.credential("location1").await,
            Err(ClusterError::Credential { .. })
        ));
    }
}
