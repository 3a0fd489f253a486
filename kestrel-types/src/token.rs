//! Node registration tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A one-time-or-counted credential nodes present when joining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub id: String,
    /// 32 random bytes, base32-encoded.
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// 0 means unlimited.
    pub max_uses: u32,
    pub use_count: u32,
    #[serde(default)]
    pub used_by_nodes: Vec<String>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl RegistrationToken {
    /// Validates the token for a new use at `now`.
    pub fn check_usable(&self, now: DateTime<Utc>) -> Result<()> {
        if self.revoked {
            return Err(Error::FailedPrecondition("token revoked".to_string()));
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return Err(Error::FailedPrecondition("token expired".to_string()));
            }
        }
        if self.max_uses > 0 && self.use_count >= self.max_uses {
            return Err(Error::FailedPrecondition("token use limit reached".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_token() -> RegistrationToken {
        RegistrationToken {
            id: "tok-1".to_string(),
            token: "MFRGG===".to_string(),
            expires_at: None,
            max_uses: 0,
            use_count: 0,
            used_by_nodes: Vec::new(),
            revoked: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_unlimited_token_usable() {
        let mut token = make_token();
        token.use_count = 1000;
        assert!(token.check_usable(Utc::now()).is_ok());
    }

    #[test]
    fn test_revoked_token_rejected() {
        let mut token = make_token();
        token.revoked = true;
        assert!(matches!(
            token.check_usable(Utc::now()),
            Err(Error::FailedPrecondition(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut token = make_token();
        token.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(token.check_usable(Utc::now()).is_err());
    }

    #[test]
    fn test_use_limit_enforced() {
        let mut token = make_token();
        token.max_uses = 2;
        token.use_count = 1;
        assert!(token.check_usable(Utc::now()).is_ok());
        token.use_count = 2;
        assert!(token.check_usable(Utc::now()).is_err());
    }
}
