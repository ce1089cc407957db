// Token Authority port
// The engine never inspects token contents; it only stores and forwards the handles

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::session::types::RequestContext;

/// Opaque token handle issued by the Token Authority
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSet {
    /// Identifier of this issuance (changes on every refresh)
    pub id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

/// Claims requested for a new token set
#[derive(Debug, Clone, Serialize)]
pub struct TokenPayload {
    pub user_id: String,
    pub session_id: String,
    pub session_type: Option<String>,
    /// Caller-supplied user data merged with the session claims
    pub claims: serde_json::Value,
}

/// Result of a successful issuance or refresh
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token_set: TokenSet,
    /// Ids of the token sets this one replaced, oldest first
    pub refresh_chain: Vec<String>,
}

/// Why an access token was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenInvalidReason {
    Expired,
    Revoked,
    Malformed,
    Unknown,
}

impl TokenInvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenInvalidReason::Expired => "expired",
            TokenInvalidReason::Revoked => "revoked",
            TokenInvalidReason::Malformed => "malformed",
            TokenInvalidReason::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenValidation {
    pub valid: bool,
    pub reason: Option<TokenInvalidReason>,
    pub should_refresh: bool,
}

impl TokenValidation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
            should_refresh: false,
        }
    }

    pub fn invalid(reason: TokenInvalidReason) -> Self {
        Self {
            should_refresh: reason == TokenInvalidReason::Expired,
            valid: false,
            reason: Some(reason),
        }
    }

    pub fn is_expired(&self) -> bool {
        !self.valid && self.reason == Some(TokenInvalidReason::Expired)
    }
}

/// Options forwarded with validation and refresh requests
#[derive(Debug, Clone, Default)]
pub struct TokenRequestOptions {
    pub session_id: String,
    /// Set when the refresh was triggered ahead of expiry
    pub predictive: bool,
}

/// Errors raised by a Token Authority
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenAuthorityError {
    /// The authority refused the request (unknown or revoked refresh token, policy)
    #[error("Token request rejected: {0}")]
    Rejected(String),
    /// The authority could not be reached
    #[error("Token authority unavailable: {0}")]
    Unavailable(String),
}

/// External issuer of access/refresh tokens
#[async_trait]
pub trait TokenAuthority: Send + Sync {
    /// Issue a new token set for a session
    async fn create_token_set(
        &self,
        payload: TokenPayload,
        context: &RequestContext,
    ) -> Result<TokenGrant, TokenAuthorityError>;

    /// Check an access token
    async fn validate_access_token(
        &self,
        access_token: &str,
        options: &TokenRequestOptions,
    ) -> Result<TokenValidation, TokenAuthorityError>;

    /// Exchange a refresh token for a new token set
    async fn refresh_token_set(
        &self,
        refresh_token: &str,
        options: &TokenRequestOptions,
    ) -> Result<TokenGrant, TokenAuthorityError>;

    /// Revoke a token set, tagged with a machine-readable reason
    async fn revoke_token(
        &self,
        token: &str,
        reason: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), TokenAuthorityError>;
}

#[derive(Debug, Clone)]
struct IssuedTokens {
    token_set: TokenSet,
    user_id: String,
    chain: Vec<String>,
    revoked: bool,
}

/// In-process Token Authority used by the demo binary and tests
pub struct MemoryTokenAuthority {
    access_ttl: Duration,
    refresh_ttl: Duration,
    /// Keyed by access token
    issued: RwLock<HashMap<String, IssuedTokens>>,
    /// Refresh token -> access token
    refresh_index: RwLock<HashMap<String, String>>,
    revocations: RwLock<Vec<(String, String)>>,
    fail_issuance: AtomicBool,
    fail_refresh: AtomicBool,
}

impl MemoryTokenAuthority {
    pub fn new(access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            access_ttl,
            refresh_ttl,
            issued: RwLock::new(HashMap::new()),
            refresh_index: RwLock::new(HashMap::new()),
            revocations: RwLock::new(Vec::new()),
            fail_issuance: AtomicBool::new(false),
            fail_refresh: AtomicBool::new(false),
        }
    }

    /// Make subsequent issuance requests fail
    pub fn set_fail_issuance(&self, fail: bool) {
        self.fail_issuance.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent refresh requests fail
    pub fn set_fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    /// Force an access token into the expired state
    pub async fn expire_access_token(&self, access_token: &str) -> bool {
        let mut issued = self.issued.write().await;
        match issued.get_mut(access_token) {
            Some(entry) => {
                entry.token_set.access_expires_at = Utc::now() - Duration::seconds(1);
                true
            }
            None => false,
        }
    }

    /// Revocations recorded so far as (access token, reason)
    pub async fn revocations(&self) -> Vec<(String, String)> {
        self.revocations.read().await.clone()
    }

    fn mint(&self) -> TokenSet {
        let now = Utc::now();
        TokenSet {
            id: uuid::Uuid::new_v4().to_string(),
            access_token: random_token(),
            refresh_token: random_token(),
            token_type: "Bearer".to_string(),
            access_expires_at: now + self.access_ttl,
            refresh_expires_at: Some(now + self.refresh_ttl),
        }
    }

    async fn store(&self, entry: IssuedTokens) {
        let access = entry.token_set.access_token.clone();
        self.refresh_index
            .write()
            .await
            .insert(entry.token_set.refresh_token.clone(), access.clone());
        self.issued.write().await.insert(access, entry);
    }
}

impl Default for MemoryTokenAuthority {
    fn default() -> Self {
        Self::new(Duration::minutes(15), Duration::days(7))
    }
}

#[async_trait]
impl TokenAuthority for MemoryTokenAuthority {
    async fn create_token_set(
        &self,
        payload: TokenPayload,
        _context: &RequestContext,
    ) -> Result<TokenGrant, TokenAuthorityError> {
        if self.fail_issuance.load(Ordering::SeqCst) {
            return Err(TokenAuthorityError::Unavailable(
                "issuance disabled".to_string(),
            ));
        }

        let token_set = self.mint();
        debug!(
            "Issued token set {} for user {} (session {})",
            token_set.id, payload.user_id, payload.session_id
        );

        self.store(IssuedTokens {
            token_set: token_set.clone(),
            user_id: payload.user_id,
            chain: Vec::new(),
            revoked: false,
        })
        .await;

        Ok(TokenGrant {
            token_set,
            refresh_chain: Vec::new(),
        })
    }

    async fn validate_access_token(
        &self,
        access_token: &str,
        _options: &TokenRequestOptions,
    ) -> Result<TokenValidation, TokenAuthorityError> {
        let issued = self.issued.read().await;
        let validation = match issued.get(access_token) {
            None => TokenValidation::invalid(TokenInvalidReason::Unknown),
            Some(entry) if entry.revoked => TokenValidation::invalid(TokenInvalidReason::Revoked),
            Some(entry) if Utc::now() > entry.token_set.access_expires_at => {
                TokenValidation::invalid(TokenInvalidReason::Expired)
            }
            Some(_) => TokenValidation::valid(),
        };
        Ok(validation)
    }

    async fn refresh_token_set(
        &self,
        refresh_token: &str,
        options: &TokenRequestOptions,
    ) -> Result<TokenGrant, TokenAuthorityError> {
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(TokenAuthorityError::Rejected("refresh disabled".to_string()));
        }

        let access = self
            .refresh_index
            .write()
            .await
            .remove(refresh_token)
            .ok_or_else(|| TokenAuthorityError::Rejected("unknown refresh token".to_string()))?;

        let previous = {
            let mut issued = self.issued.write().await;
            issued
                .remove(&access)
                .ok_or_else(|| TokenAuthorityError::Rejected("token set not found".to_string()))?
        };

        if previous.revoked {
            return Err(TokenAuthorityError::Rejected(
                "refresh token revoked".to_string(),
            ));
        }

        let mut chain = previous.chain.clone();
        chain.push(previous.token_set.id.clone());

        let token_set = self.mint();
        debug!(
            "Refreshed token set {} -> {} (session {}, predictive: {})",
            previous.token_set.id, token_set.id, options.session_id, options.predictive
        );

        self.store(IssuedTokens {
            token_set: token_set.clone(),
            user_id: previous.user_id,
            chain: chain.clone(),
            revoked: false,
        })
        .await;

        Ok(TokenGrant {
            token_set,
            refresh_chain: chain,
        })
    }

    async fn revoke_token(
        &self,
        token: &str,
        reason: &str,
        _metadata: &HashMap<String, String>,
    ) -> Result<(), TokenAuthorityError> {
        if let Some(entry) = self.issued.write().await.get_mut(token) {
            entry.revoked = true;
        }
        self.revocations
            .write()
            .await
            .push((token.to_string(), reason.to_string()));
        debug!("Revoked token with reason {}", reason);
        Ok(())
    }
}

/// 256-bit random token, URL-safe base64
pub(crate) fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
