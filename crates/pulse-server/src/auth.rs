//! Authentication collaborator boundary.
//!
//! The gateway never validates tokens itself. A [`TokenVerifier`] is handed
//! the `token` query parameter at handshake and returns the identity to
//! record on the connection; the platform's auth service implements this
//! trait, and [`AllowAll`] is the default for local development and tests.

use async_trait::async_trait;

/// Identity resolved by the authentication collaborator.
#[derive(Clone, Debug, Default)]
pub struct Identity {
    /// Resolved user, when one could be established.
    pub user_id: Option<String>,
    /// Permission set recorded on the connection.
    pub permissions: Vec<String>,
}

/// External authentication collaborator.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve an identity from the handshake's `token` and claimed
    /// `user_id` query parameters.
    async fn verify(&self, token: Option<&str>, claimed_user: Option<&str>) -> Identity;
}

/// Verifier that trusts the claimed `user_id` without checking the token.
pub struct AllowAll;

#[async_trait]
impl TokenVerifier for AllowAll {
    async fn verify(&self, _token: Option<&str>, claimed_user: Option<&str>) -> Identity {
        Identity {
            user_id: claimed_user.map(ToOwned::to_owned),
            permissions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_records_claimed_user() {
        let identity = AllowAll.verify(Some("tok_abc"), Some("user_7")).await;
        assert_eq!(identity.user_id.as_deref(), Some("user_7"));
        assert!(identity.permissions.is_empty());
    }

    #[tokio::test]
    async fn allow_all_without_user_is_anonymous() {
        let identity = AllowAll.verify(None, None).await;
        assert!(identity.user_id.is_none());
    }
}
