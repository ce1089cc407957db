// Session recovery tokens
// Single-use credentials that revive a session without full re-authentication

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::locks::KeyedLocks;
use super::storage::{DurableStore, SessionRepository, StoreOptions};
use super::types::Session;
use crate::config::SessionPolicyConfig;
use crate::error::SessionError;
use crate::token::random_token;

/// Lifecycle of a recovery token
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecoveryTokenState {
    Active,
    /// Redeemed; kept until `purge_after` so duplicate in-flight
    /// redemptions get RECOVERY_TOKEN_USED rather than an unknown-token error
    Used {
        used_at: DateTime<Utc>,
        purge_after: DateTime<Utc>,
    },
}

/// Stored binding of a recovery token (the token itself is only kept hashed)
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryToken {
    pub recovery_id: String,
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: RecoveryTokenState,
}

impl RecoveryToken {
    pub fn used(&self) -> bool {
        matches!(self.state, RecoveryTokenState::Used { .. })
    }

    pub fn used_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            RecoveryTokenState::Used { used_at, .. } => Some(used_at),
            RecoveryTokenState::Active => None,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            RecoveryTokenState::Active => now > self.expires_at,
            RecoveryTokenState::Used { purge_after, .. } => now > purge_after,
        }
    }
}

/// Plain-text token returned once, at issuance
#[derive(Debug, Clone, Serialize)]
pub struct IssuedRecoveryToken {
    pub token: String,
    pub recovery_id: String,
    pub session_id: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    /// Issuances left in the current cooldown window
    pub remaining_attempts: u32,
}

/// Per-user issuance counter, persisted with a TTL equal to the cooldown window
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttemptCounter {
    count: u32,
    window_started_at: DateTime<Utc>,
}

fn attempts_key(user_id: &str) -> String {
    format!("recovery_attempts_{}", user_id)
}

fn digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Issues and redeems recovery tokens with per-user rate limiting
pub struct RecoveryTokenManager {
    enabled: bool,
    token_ttl: Duration,
    max_attempts: u32,
    cooldown: Duration,
    purge_grace: Duration,
    /// Keyed by SHA-256 digest of the token
    tokens: RwLock<HashMap<String, RecoveryToken>>,
    /// Serializes the attempt counter read-check-write per user
    user_locks: KeyedLocks,
    sessions: Arc<SessionRepository>,
    durable: Arc<dyn DurableStore>,
}

impl RecoveryTokenManager {
    pub fn new(
        config: &SessionPolicyConfig,
        sessions: Arc<SessionRepository>,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            enabled: config.allow_session_recovery,
            token_ttl: config.recovery_token_ttl(),
            max_attempts: config.max_recovery_attempts,
            cooldown: config.recovery_cooldown(),
            purge_grace: config.recovery_purge_grace(),
            tokens: RwLock::new(HashMap::new()),
            user_locks: KeyedLocks::new(),
            sessions,
            durable,
        }
    }

    /// Issue a recovery token for an existing session
    pub async fn create_recovery_token(
        &self,
        session_id: &str,
    ) -> Result<IssuedRecoveryToken, SessionError> {
        if !self.enabled {
            return Err(SessionError::RecoveryDisabled);
        }

        let session = self
            .sessions
            .get(session_id)
            .await
            .map_err(|e| SessionError::Dependency(e.to_string()))?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        self.purge_stale().await;

        self.user_locks
            .run(&session.user_id, self.issue_locked(&session))
            .await
    }

    async fn issue_locked(&self, session: &Session) -> Result<IssuedRecoveryToken, SessionError> {
        let now = Utc::now();
        let counter = self.load_attempts(&session.user_id).await?;
        let counter = match counter {
            Some(c) if now <= c.window_started_at + self.cooldown => c,
            _ => AttemptCounter {
                count: 0,
                window_started_at: now,
            },
        };

        if counter.count >= self.max_attempts {
            let cooldown_until = counter.window_started_at + self.cooldown;
            warn!(
                "Recovery rate limit reached for user {} ({} attempts), cooldown until {}",
                session.user_id, counter.count, cooldown_until
            );
            return Err(SessionError::RateLimited { cooldown_until });
        }

        let token = random_token();
        let record = RecoveryToken {
            recovery_id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            created_at: now,
            expires_at: now + self.token_ttl,
            state: RecoveryTokenState::Active,
        };

        let counter = AttemptCounter {
            count: counter.count + 1,
            window_started_at: counter.window_started_at,
        };
        self.store_attempts(&session.user_id, &counter).await?;

        self.tokens.write().await.insert(digest(&token), record.clone());

        info!(
            "Issued recovery token {} for session {} (attempt {}/{})",
            record.recovery_id, session.id, counter.count, self.max_attempts
        );

        Ok(IssuedRecoveryToken {
            token,
            recovery_id: record.recovery_id,
            session_id: record.session_id,
            user_id: record.user_id,
            expires_at: record.expires_at,
            remaining_attempts: self.max_attempts.saturating_sub(counter.count),
        })
    }

    /// Claim a token. Succeeds at most once per token.
    pub async fn redeem(
        &self,
        token: &str,
        expected_user: Option<&str>,
    ) -> Result<RecoveryToken, SessionError> {
        self.purge_stale().await;

        let key = digest(token);
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;

        let record = tokens
            .get_mut(&key)
            .ok_or(SessionError::InvalidRecoveryToken)?;

        if record.used() {
            debug!("Recovery token {} already used", record.recovery_id);
            return Err(SessionError::RecoveryTokenUsed);
        }

        if now > record.expires_at {
            let recovery_id = record.recovery_id.clone();
            tokens.remove(&key);
            debug!("Recovery token {} expired", recovery_id);
            return Err(SessionError::RecoveryTokenExpired);
        }

        if let Some(expected) = expected_user
            && expected != record.user_id
        {
            warn!(
                "Recovery token {} presented for user {} but bound to {}",
                record.recovery_id, expected, record.user_id
            );
            return Err(SessionError::RecoveryUserMismatch(expected.to_string()));
        }

        record.state = RecoveryTokenState::Used {
            used_at: now,
            purge_after: now + self.purge_grace,
        };

        info!(
            "Recovery token {} redeemed for session {}",
            record.recovery_id, record.session_id
        );
        Ok(record.clone())
    }

    /// Clear a user's attempt counter
    pub async fn reset_attempts(&self, user_id: &str) -> Result<(), SessionError> {
        self.user_locks
            .run(user_id, self.durable.delete(&attempts_key(user_id)))
            .await
            .map_err(|e| SessionError::Dependency(e.to_string()))
    }

    /// Issuances recorded in the user's current cooldown window
    pub async fn attempts(&self, user_id: &str) -> Result<u32, SessionError> {
        Ok(self
            .load_attempts(user_id)
            .await?
            .filter(|c| Utc::now() <= c.window_started_at + self.cooldown)
            .map_or(0, |c| c.count))
    }

    /// Drop every token bound to a session
    pub async fn revoke_for_session(&self, session_id: &str) -> usize {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.session_id != session_id);
        let removed = before - tokens.len();
        if removed > 0 {
            debug!(
                "Revoked {} recovery token(s) for session {}",
                removed, session_id
            );
        }
        removed
    }

    /// Remove expired tokens and used tokens past their grace period
    pub async fn purge_stale(&self) -> usize {
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| !t.is_stale(now));
        before - tokens.len()
    }

    pub async fn token_count(&self) -> usize {
        self.tokens.read().await.len()
    }

    async fn load_attempts(&self, user_id: &str) -> Result<Option<AttemptCounter>, SessionError> {
        let value = self
            .durable
            .get(&attempts_key(user_id))
            .await
            .map_err(|e| SessionError::Dependency(e.to_string()))?;

        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| SessionError::Dependency(format!("Corrupt attempt counter: {}", e)))
    }

    async fn store_attempts(
        &self,
        user_id: &str,
        counter: &AttemptCounter,
    ) -> Result<(), SessionError> {
        let value = serde_json::to_value(counter)
            .map_err(|e| SessionError::Dependency(e.to_string()))?;
        let remaining = counter.window_started_at + self.cooldown - Utc::now();
        let ttl = remaining.max(Duration::milliseconds(1));

        self.durable
            .set(&attempts_key(user_id), value, StoreOptions::with_ttl(ttl))
            .await
            .map_err(|e| SessionError::Dependency(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::storage::MemoryDurableStore;
    use crate::session::types::{RequestContext, Session};
    use crate::token::TokenSet;

    /// Suspends before every call so concurrent tasks interleave
    struct YieldingStore(MemoryDurableStore);

    #[async_trait::async_trait]
    impl DurableStore for YieldingStore {
        async fn set(
            &self,
            key: &str,
            value: serde_json::Value,
            options: StoreOptions,
        ) -> Result<(), crate::session::storage::StorageError> {
            tokio::task::yield_now().await;
            self.0.set(key, value, options).await
        }

        async fn get(
            &self,
            key: &str,
        ) -> Result<Option<serde_json::Value>, crate::session::storage::StorageError> {
            tokio::task::yield_now().await;
            self.0.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<(), crate::session::storage::StorageError> {
            tokio::task::yield_now().await;
            self.0.delete(key).await
        }
    }

    async fn setup(config: SessionPolicyConfig) -> (RecoveryTokenManager, Session) {
        setup_with(config, Arc::new(MemoryDurableStore::new())).await
    }

    async fn setup_with(
        config: SessionPolicyConfig,
        durable: Arc<dyn DurableStore>,
    ) -> (RecoveryTokenManager, Session) {
        let sessions = Arc::new(SessionRepository::new(durable.clone()));
        let token_set = TokenSet {
            id: "ts".to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            token_type: "Bearer".to_string(),
            access_expires_at: Utc::now() + Duration::minutes(15),
            refresh_expires_at: None,
        };
        let session = Session::new(
            "user-123".to_string(),
            token_set,
            Duration::hours(1),
            &RequestContext::default(),
            None,
        );
        sessions.save(&session).await.unwrap();

        (
            RecoveryTokenManager::new(&config, sessions, durable),
            session,
        )
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let (manager, session) = setup(SessionPolicyConfig::default()).await;
        let issued = manager.create_recovery_token(&session.id).await.unwrap();

        let redeemed = manager.redeem(&issued.token, None).await.unwrap();
        assert_eq!(redeemed.session_id, session.id);
        assert!(redeemed.used());
        assert!(redeemed.used_at().is_some());

        let second = manager.redeem(&issued.token, None).await;
        assert_eq!(second.unwrap_err().code(), "RECOVERY_TOKEN_USED");
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let (manager, _) = setup(SessionPolicyConfig::default()).await;
        let result = manager.redeem("not-a-token", None).await;
        assert_eq!(result.unwrap_err().code(), "INVALID_RECOVERY_TOKEN");
    }

    #[tokio::test]
    async fn test_rate_limit_after_max_attempts() {
        let (manager, session) = setup(SessionPolicyConfig {
            max_recovery_attempts: 2,
            ..Default::default()
        })
        .await;

        let first = manager.create_recovery_token(&session.id).await.unwrap();
        assert_eq!(first.remaining_attempts, 1);
        manager.create_recovery_token(&session.id).await.unwrap();

        let err = manager.create_recovery_token(&session.id).await.unwrap_err();
        assert_eq!(err.code(), "RECOVERY_RATE_LIMITED");
        assert!(err.cooldown_until().unwrap() > Utc::now());

        manager.reset_attempts("user-123").await.unwrap();
        assert_eq!(manager.attempts("user-123").await.unwrap(), 0);
        assert!(manager.create_recovery_token(&session.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let (manager, session) = setup(SessionPolicyConfig {
            recovery_token_ttl_ms: 20,
            ..Default::default()
        })
        .await;

        let issued = manager.create_recovery_token(&session.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        // Lazily purged before lookup, so it is no longer known
        let err = manager.redeem(&issued.token, None).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::RecoveryTokenExpired | SessionError::InvalidRecoveryToken
        ));
    }

    #[tokio::test]
    async fn test_user_mismatch_does_not_consume() {
        let (manager, session) = setup(SessionPolicyConfig::default()).await;
        let issued = manager.create_recovery_token(&session.id).await.unwrap();

        let err = manager
            .redeem(&issued.token, Some("someone-else"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RECOVERY_USER_MISMATCH");

        assert!(manager.redeem(&issued.token, Some("user-123")).await.is_ok());
    }

    #[tokio::test]
    async fn test_used_token_purged_after_grace() {
        let (manager, session) = setup(SessionPolicyConfig {
            recovery_purge_grace_ms: 20,
            ..Default::default()
        })
        .await;

        let issued = manager.create_recovery_token(&session.id).await.unwrap();
        manager.redeem(&issued.token, None).await.unwrap();
        assert_eq!(manager.token_count().await, 1);

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        assert_eq!(manager.purge_stale().await, 1);
        assert_eq!(manager.token_count().await, 0);
    }

    #[tokio::test]
    async fn test_disabled_and_missing_session() {
        let (manager, _) = setup(SessionPolicyConfig {
            allow_session_recovery: false,
            ..Default::default()
        })
        .await;
        let err = manager.create_recovery_token("anything").await.unwrap_err();
        assert_eq!(err.code(), "RECOVERY_DISABLED");

        let (manager, _) = setup(SessionPolicyConfig::default()).await;
        let err = manager.create_recovery_token("missing").await.unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_revoke_for_session() {
        let (manager, session) = setup(SessionPolicyConfig::default()).await;
        let issued = manager.create_recovery_token(&session.id).await.unwrap();

        assert_eq!(manager.revoke_for_session(&session.id).await, 1);
        let err = manager.redeem(&issued.token, None).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_RECOVERY_TOKEN");
    }

    #[tokio::test]
    async fn test_concurrent_issuance_respects_limit() {
        let (manager, session) = setup_with(
            SessionPolicyConfig {
                max_recovery_attempts: 3,
                ..Default::default()
            },
            Arc::new(YieldingStore(MemoryDurableStore::new())),
        )
        .await;
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let manager = manager.clone();
            let session_id = session.id.clone();
            handles.push(tokio::spawn(async move {
                manager.create_recovery_token(&session_id).await
            }));
        }

        let mut issued = 0;
        let mut limited = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => issued += 1,
                Err(SessionError::RateLimited { .. }) => limited += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(issued, 3);
        assert_eq!(limited, 3);
        assert_eq!(manager.attempts("user-123").await.unwrap(), 3);
    }
}
