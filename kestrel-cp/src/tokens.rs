//! Node registration tokens.

use chrono::{Duration, Utc};
use rand::RngCore;
use tracing::info;
use uuid::Uuid;

use kestrel_store::{Repository, TokenRepo};
use kestrel_types::{RegistrationToken, Result};

use crate::SharedRepository;

pub struct TokenService {
    repo: SharedRepository,
}

impl TokenService {
    pub fn new(repo: SharedRepository) -> Self {
        Self { repo }
    }

    /// Mints a token: 32 random bytes, base32-encoded. `max_uses` 0 means
    /// unlimited.
    pub async fn create(
        &self,
        valid_for: Option<Duration>,
        max_uses: u32,
    ) -> Result<RegistrationToken> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let encoded = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &raw);

        let token = RegistrationToken {
            id: Uuid::new_v4().to_string(),
            token: encoded,
            expires_at: valid_for.map(|d| Utc::now() + d),
            max_uses,
            use_count: 0,
            used_by_nodes: Vec::new(),
            revoked: false,
            created_at: Utc::now(),
        };
        self.repo.tokens().create(&token).await?;
        info!(token_id = %token.id, max_uses = max_uses, "registration token created");
        Ok(token)
    }

    /// Validates a presented token and burns one use for `node_id`.
    pub async fn validate_and_use(&self, presented: &str, node_id: &str) -> Result<()> {
        let mut token = self.repo.tokens().get_by_token(presented).await?;
        token.check_usable(Utc::now())?;

        token.use_count += 1;
        if !token.used_by_nodes.iter().any(|n| n == node_id) {
            token.used_by_nodes.push(node_id.to_string());
        }
        self.repo.tokens().update(&token).await
    }

    pub async fn revoke(&self, token_id: &str) -> Result<()> {
        let mut token = self.repo.tokens().get(token_id).await?;
        token.revoked = true;
        self.repo.tokens().update(&token).await
    }

    pub async fn list(&self) -> Result<Vec<RegistrationToken>> {
        self.repo.tokens().list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_store::{Repository, SqliteRepository};
    use kestrel_types::Error;
    use std::sync::Arc;

    async fn make_service() -> TokenService {
        let repo = Arc::new(SqliteRepository::open_in_memory().await.unwrap());
        TokenService::new(repo as Arc<dyn Repository>)
    }

    #[tokio::test]
    async fn test_token_is_base32_of_32_bytes() {
        let service = make_service().await;
        let token = service.create(None, 0).await.unwrap();
        // 32 bytes -> ceil(256 / 5) = 52 base32 characters without padding.
        assert_eq!(token.token.len(), 52);
        assert!(base32::decode(
            base32::Alphabet::Rfc4648 { padding: false },
            &token.token
        )
        .is_some());
    }

    #[tokio::test]
    async fn test_validate_and_use_counts() {
        let service = make_service().await;
        let token = service.create(None, 2).await.unwrap();

        service.validate_and_use(&token.token, "node-1").await.unwrap();
        service.validate_and_use(&token.token, "node-2").await.unwrap();

        // Third use exceeds max_uses.
        let err = service
            .validate_and_use(&token.token, "node-3")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn test_revoked_token_rejected() {
        let service = make_service().await;
        let token = service.create(None, 0).await.unwrap();
        service.revoke(&token.id).await.unwrap();

        let err = service
            .validate_and_use(&token.token, "node-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn test_unknown_token_not_found() {
        let service = make_service().await;
        let err = service
            .validate_and_use("NOSUCHTOKEN", "node-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
