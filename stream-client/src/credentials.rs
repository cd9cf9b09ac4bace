use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::{Error, Result};

/// A short-lived token presented when opening a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: OffsetDateTime) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Whether the token expires before `margin` from now has elapsed.
    pub fn expires_within(&self, margin: Duration) -> bool {
        OffsetDateTime::now_utc() + margin >= self.expires_at
    }
}

/// Source of access tokens. The authentication protocol itself lives behind this trait.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self) -> Result<AccessToken>;

    /// Release whatever the provider holds. Later `get_token` calls fail.
    async fn close(&self) -> Result<()>;
}

/// Hands out the same secret with a fresh expiry each time, like a shared access key.
pub struct StaticCredential {
    secret: String,
    lifetime: Duration,
    closed: AtomicBool,
}

impl StaticCredential {
    pub fn new(secret: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            secret: secret.into(),
            lifetime,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn get_token(&self) -> Result<AccessToken> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Credential("credential has been closed".to_owned()));
        }
        Ok(AccessToken::new(
            self.secret.clone(),
            OffsetDateTime::now_utc() + self.lifetime,
        ))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_credential_refreshes_expiry() {
        let credential = StaticCredential::new("secret", Duration::from_secs(300));
        let token = credential.get_token().await.unwrap();

        assert_eq!(token.token, "secret");
        assert!(!token.expires_within(Duration::from_secs(60)));
        assert!(token.expires_within(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn closed_credential_refuses_tokens() {
        let credential = StaticCredential::new("secret", Duration::from_secs(300));
        credential.close().await.unwrap();

        assert!(matches!(
            credential.get_token().await,
            Err(Error::Credential(_))
        ));
    }
}
