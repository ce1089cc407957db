// Session lifecycle manager
// Orchestrates create/validate/renew/destroy on top of the store, policy engine and timers

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use super::events::{EventSink, SessionEvent};
use super::locks::KeyedLocks;
use super::monitor::{
    ActivityMonitor, ActivitySnapshot, ActivityVerdict, MonitorTarget,
    PredictiveRenewalScheduler,
};
use super::recovery::{IssuedRecoveryToken, RecoveryTokenManager};
use super::security::{SecurityFinding, SecurityPolicyEngine};
use super::storage::{DurableStore, SessionIndex, SessionRepository};
use super::types::{
    DestroyReason, MetadataUpdate, RenewalTrigger, RequestContext, Session, SessionInfo,
    TokenProjection,
};
use crate::config::SessionPolicyConfig;
use crate::error::SessionError;
use crate::token::{TokenAuthority, TokenPayload, TokenRequestOptions};

/// Options for `validate_session`
#[derive(Debug, Clone)]
pub struct ValidateOptions {
    pub context: RequestContext,
    /// Count this validation as user activity
    pub update_activity: bool,
}

impl ValidateOptions {
    pub fn new(context: RequestContext) -> Self {
        Self {
            context,
            update_activity: true,
        }
    }

    /// Check the session without recording activity
    pub fn read_only(context: RequestContext) -> Self {
        Self {
            context,
            update_activity: false,
        }
    }
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self::new(RequestContext::default())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenewOptions {
    pub trigger: RenewalTrigger,
}

impl RenewOptions {
    pub fn triggered_by(trigger: RenewalTrigger) -> Self {
        Self { trigger }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedSession {
    pub session: Session,
    pub tokens: TokenProjection,
    pub session_info: SessionInfo,
    /// Sessions evicted to respect the per-user limit
    pub evicted: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub session: SessionInfo,
    pub tokens: TokenProjection,
    pub warnings: Vec<SecurityFinding>,
    /// Valid, but the caller must step up authentication
    pub requires_reauthentication: bool,
    pub reauthentication_reason: Option<String>,
    /// The access token expired and was renewed during validation
    pub renewed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenewedSession {
    pub session: SessionInfo,
    pub tokens: TokenProjection,
    pub trigger: RenewalTrigger,
    pub old_expires_at: DateTime<Utc>,
    pub new_expires_at: DateTime<Utc>,
    pub refresh_chain: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestroyedSession {
    pub session_id: String,
    pub user_id: String,
    pub reason: DestroyReason,
    pub session_lifetime_ms: i64,
    /// False when the Token Authority could not revoke the tokens
    pub token_revoked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestroyFailure {
    pub session_id: String,
    pub code: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestroyAllOutcome {
    pub user_id: String,
    pub total: usize,
    pub destroyed: usize,
    /// Indexed ids whose session had already disappeared from the store
    pub already_gone: usize,
    pub failed: usize,
    pub failures: Vec<DestroyFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredSession {
    pub recovery_id: String,
    pub renewal: RenewedSession,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub indexed_sessions: usize,
    pub users: usize,
    pub cached_sessions: usize,
    pub monitored_sessions: usize,
    pub scheduled_renewals: usize,
    pub recovery_tokens: usize,
}

/// Session lifecycle manager.
///
/// Operations on the same session id are serialized, and so are session
/// creations for the same user. Operations are
/// best-effort, not transactional: side effects committed before a later
/// step fails (a revoked token, a cancelled timer) are not rolled back.
pub struct SessionLifecycleManager {
    config: SessionPolicyConfig,
    tokens: Arc<dyn TokenAuthority>,
    sessions: Arc<SessionRepository>,
    index: SessionIndex,
    security: SecurityPolicyEngine,
    recovery: RecoveryTokenManager,
    monitor: Arc<ActivityMonitor>,
    scheduler: PredictiveRenewalScheduler,
    events: Arc<dyn EventSink>,
    session_locks: KeyedLocks,
    user_locks: KeyedLocks,
    self_ref: Weak<SessionLifecycleManager>,
}

/// Builder that validates every dependency up front
#[derive(Default)]
pub struct SessionLifecycleManagerBuilder {
    config: Option<SessionPolicyConfig>,
    token_authority: Option<Arc<dyn TokenAuthority>>,
    durable_store: Option<Arc<dyn DurableStore>>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl SessionLifecycleManagerBuilder {
    pub fn config(mut self, config: SessionPolicyConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn token_authority(mut self, authority: Arc<dyn TokenAuthority>) -> Self {
        self.token_authority = Some(authority);
        self
    }

    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable_store = Some(store);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Arc<SessionLifecycleManager>, SessionError> {
        let config = self.config.unwrap_or_default();
        config.validate().map_err(SessionError::Validation)?;

        let tokens = self
            .token_authority
            .ok_or_else(|| SessionError::Validation("a token authority is required".to_string()))?;
        let durable = self
            .durable_store
            .ok_or_else(|| SessionError::Validation("a durable store is required".to_string()))?;
        let events = self
            .event_sink
            .ok_or_else(|| SessionError::Validation("an event sink is required".to_string()))?;

        let sessions = Arc::new(SessionRepository::new(durable.clone()));
        let recovery = RecoveryTokenManager::new(&config, sessions.clone(), durable);

        info!(
            "Session lifecycle manager ready (ttl={}ms, idle={}ms, sliding={}, max_sessions={})",
            config.default_ttl_ms,
            config.idle_timeout_ms,
            config.sliding_expiration,
            config.max_sessions_per_user
        );

        Ok(Arc::new_cyclic(|self_ref| SessionLifecycleManager {
            index: SessionIndex::new(config.max_sessions_per_user),
            security: SecurityPolicyEngine::new(&config),
            monitor: Arc::new(ActivityMonitor::new(&config)),
            scheduler: PredictiveRenewalScheduler::new(&config),
            tokens,
            sessions,
            recovery,
            events,
            session_locks: KeyedLocks::new(),
            user_locks: KeyedLocks::new(),
            self_ref: self_ref.clone(),
            config,
        }))
    }
}

impl SessionLifecycleManager {
    pub fn builder() -> SessionLifecycleManagerBuilder {
        SessionLifecycleManagerBuilder::default()
    }

    pub fn config(&self) -> &SessionPolicyConfig {
        &self.config
    }

    /// Create a session for an already authenticated principal
    pub async fn create_session(
        &self,
        user_id: &str,
        user_data: Value,
        context: RequestContext,
    ) -> Result<CreatedSession, SessionError> {
        if user_id.trim().is_empty() {
            return Err(SessionError::Validation("user_id is required".to_string()));
        }

        let (session, evicted) = self
            .user_locks
            .run(user_id, self.create_locked(user_id, user_data, context))
            .await?;

        for evicted_id in &evicted {
            let mut metadata = HashMap::new();
            metadata.insert("evicted_by".to_string(), session.id.clone());

            if let Err(e) = self
                .destroy_session(evicted_id, DestroyReason::MaxSessionsExceeded, metadata)
                .await
            {
                warn!("Failed to destroy evicted session {}: {}", evicted_id, e);
            }

            self.events.emit(SessionEvent::AutoEvicted {
                session_id: evicted_id.clone(),
                user_id: user_id.to_string(),
                max_sessions: self.config.max_sessions_per_user,
            });
        }

        Ok(CreatedSession {
            tokens: session.to_token_projection(),
            session_info: session.to_info(),
            session,
            evicted,
        })
    }

    /// Concurrent-login check through index insert, under the user's lock
    async fn create_locked(
        &self,
        user_id: &str,
        user_data: Value,
        context: RequestContext,
    ) -> Result<(Session, Vec<String>), SessionError> {
        if !self.config.allow_concurrent_logins && self.index.count(user_id).await > 0 {
            info!(
                "User {} already has sessions and concurrent logins are disabled, terminating them",
                user_id
            );
            let outcome = self
                .destroy_all_user_sessions(user_id, DestroyReason::ConcurrentLogin, HashMap::new())
                .await;
            if outcome.failed > 0 {
                warn!(
                    "Could not terminate {} existing session(s) for user {}",
                    outcome.failed, user_id
                );
                return Err(SessionError::ConcurrentLoginNotAllowed);
            }
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let ttl = self.config.ttl_for(context.session_type.as_deref());

        let payload = TokenPayload {
            user_id: user_id.to_string(),
            session_id: session_id.clone(),
            session_type: context.session_type.clone(),
            claims: issuance_claims(user_id, &session_id, context.session_type.as_deref(), user_data),
        };

        let grant = self
            .tokens
            .create_token_set(payload, &context)
            .await
            .map_err(|e| {
                error!("Token issuance failed for user {}: {}", user_id, e);
                SessionError::CreationFailed(e.to_string())
            })?;

        let fingerprint = if self.config.device_fingerprinting {
            context.device_fingerprint()
        } else {
            None
        };

        let session = Session::with_id(
            session_id,
            user_id.to_string(),
            grant.token_set,
            ttl,
            &context,
            fingerprint,
        );

        // Issued tokens are left to expire on their own if this fails
        self.sessions.save(&session).await.map_err(|e| {
            error!("Failed to persist session {}: {}", session.id, e);
            SessionError::CreationFailed(e.to_string())
        })?;

        let evicted = self.index.insert(user_id, &session.id).await;
        self.start_timers(&session);

        info!(
            "Created session {} for user {} (expires {})",
            session.id, user_id, session.expires_at
        );
        self.events.emit(SessionEvent::Created {
            session_id: session.id.clone(),
            user_id: user_id.to_string(),
            expires_at: session.expires_at,
            session_type: session.session_type.clone(),
        });

        Ok((session, evicted))
    }

    /// Validate a session against expiry, idle, token and security policies
    pub async fn validate_session(
        &self,
        session_id: &str,
        options: ValidateOptions,
    ) -> Result<ValidationOutcome, SessionError> {
        let result = self
            .serialized(session_id, self.validate_locked(session_id, &options))
            .await;

        match &result {
            Ok(outcome) => self.events.emit(SessionEvent::Validated {
                session_id: session_id.to_string(),
                user_id: outcome.session.user_id.clone(),
                warnings: outcome.warnings.clone(),
            }),
            Err(e) => {
                debug!("Validation of session {} failed: {}", session_id, e);
                self.events.emit(SessionEvent::ValidationFailed {
                    session_id: session_id.to_string(),
                    code: e.code(),
                    reason: e.reason(),
                });
            }
        }

        result
    }

    async fn validate_locked(
        &self,
        session_id: &str,
        options: &ValidateOptions,
    ) -> Result<ValidationOutcome, SessionError> {
        let mut session = self.load(session_id).await?;

        if !session.is_active() {
            return Err(SessionError::Inactive {
                status: session.status.as_str().to_string(),
            });
        }

        if session.flags.force_logout {
            self.destroy_quietly(session_id, DestroyReason::ForcedLogout).await;
            return Err(SessionError::ForcedLogout);
        }

        let now = Utc::now();
        if session.is_expired_at(now) {
            self.destroy_quietly(session_id, DestroyReason::Expired).await;
            return Err(SessionError::Expired);
        }

        if let Some(idle_timeout) = self.config.idle_timeout()
            && session.idle_for(now) > idle_timeout
        {
            self.destroy_quietly(session_id, DestroyReason::IdleTimeout).await;
            return Err(SessionError::IdleTimeout);
        }

        let token_options = TokenRequestOptions {
            session_id: session_id.to_string(),
            predictive: false,
        };
        let validation = self
            .tokens
            .validate_access_token(&session.token_set.access_token, &token_options)
            .await
            .map_err(|e| SessionError::Dependency(e.to_string()))?;

        let mut renewed = false;
        if !validation.valid {
            let within_window = session.idle_for(now) <= self.config.sliding_window();
            if validation.is_expired() && self.config.sliding_expiration && within_window {
                debug!("Access token for session {} expired, renewing", session_id);
                match self
                    .renew_locked(session_id, RenewOptions::triggered_by(RenewalTrigger::Sliding))
                    .await
                {
                    Ok(_) => {
                        session = self.load(session_id).await?;
                        renewed = true;
                    }
                    Err(e) => {
                        self.destroy_quietly(session_id, DestroyReason::TokenExpiredNoRenewal)
                            .await;
                        return Err(SessionError::TokenExpiredNoRenewal(e.to_string()));
                    }
                }
            } else {
                let reason = validation
                    .reason
                    .as_ref()
                    .map_or("unknown", |r| r.as_str())
                    .to_string();
                self.destroy_quietly(session_id, DestroyReason::InvalidToken).await;
                return Err(SessionError::InvalidToken(reason));
            }
        }

        let evaluation = self.security.evaluate(&session, &options.context);
        if !evaluation.valid {
            self.destroy_quietly(session_id, DestroyReason::SecurityViolation).await;
            return Err(SessionError::SecurityViolation(evaluation.violation_messages()));
        }

        let mut dirty = false;
        if options.update_activity {
            session.touch(Utc::now(), self.config.sliding_expiration);
            dirty = true;
        }
        if !evaluation.warnings.is_empty() && !session.flags.suspicious_activity {
            session.flags.suspicious_activity = true;
            dirty = true;
        }
        if dirty {
            self.sessions
                .save(&session)
                .await
                .map_err(|e| SessionError::Dependency(e.to_string()))?;
        }

        Ok(ValidationOutcome {
            valid: true,
            tokens: session.to_token_projection(),
            warnings: evaluation.warnings,
            requires_reauthentication: session.flags.requires_reauthentication,
            reauthentication_reason: session.flags.requires_reauthentication_reason.clone(),
            renewed,
            session: session.to_info(),
        })
    }

    /// Refresh the session's tokens and extend it
    pub async fn renew_session(
        &self,
        session_id: &str,
        options: RenewOptions,
    ) -> Result<RenewedSession, SessionError> {
        self.serialized(session_id, self.renew_locked(session_id, options))
            .await
    }

    async fn renew_locked(
        &self,
        session_id: &str,
        options: RenewOptions,
    ) -> Result<RenewedSession, SessionError> {
        let mut session = match self.sessions.get(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                return Err(SessionError::RenewalFailed(format!(
                    "Session not found: {}",
                    session_id
                )));
            }
            Err(e) => return Err(SessionError::RenewalFailed(e.to_string())),
        };

        if !session.is_active() {
            return Err(SessionError::RenewalFailed(format!(
                "Session is {}",
                session.status.as_str()
            )));
        }

        if session.is_expired_at(Utc::now()) {
            return Err(SessionError::RenewalFailed("Session expired".to_string()));
        }

        let token_options = TokenRequestOptions {
            session_id: session_id.to_string(),
            predictive: options.trigger == RenewalTrigger::Predictive,
        };
        let grant = self
            .tokens
            .refresh_token_set(&session.token_set.refresh_token, &token_options)
            .await
            .map_err(|e| {
                warn!("Token refresh failed for session {}: {}", session_id, e);
                SessionError::RenewalFailed(e.to_string())
            })?;

        let old_expires_at = session.expires_at;
        session.token_set = grant.token_set;
        session.touch(Utc::now(), self.config.sliding_expiration);
        session.renewal_count += 1;

        self.sessions
            .save(&session)
            .await
            .map_err(|e| SessionError::RenewalFailed(e.to_string()))?;

        self.start_timers(&session);

        info!(
            "Renewed session {} ({:?}), expiry {} -> {}",
            session_id, options.trigger, old_expires_at, session.expires_at
        );
        self.events.emit(SessionEvent::Renewed {
            session_id: session_id.to_string(),
            user_id: session.user_id.clone(),
            trigger: options.trigger,
            old_expires_at,
            new_expires_at: session.expires_at,
        });

        Ok(RenewedSession {
            session: session.to_info(),
            tokens: session.to_token_projection(),
            trigger: options.trigger,
            old_expires_at,
            new_expires_at: session.expires_at,
            refresh_chain: grant.refresh_chain,
        })
    }

    /// Destroy one session: revoke tokens, cancel timers, drop recovery tokens, unlink
    pub async fn destroy_session(
        &self,
        session_id: &str,
        reason: DestroyReason,
        metadata: HashMap<String, String>,
    ) -> Result<DestroyedSession, SessionError> {
        self.serialized(session_id, self.destroy_locked(session_id, reason, metadata))
            .await
    }

    async fn destroy_locked(
        &self,
        session_id: &str,
        reason: DestroyReason,
        metadata: HashMap<String, String>,
    ) -> Result<DestroyedSession, SessionError> {
        let session = match self.sessions.get(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                // Nothing stored, but never leave timers or recovery tokens behind
                self.release_resources(session_id).await;
                return Err(SessionError::NotFound(session_id.to_string()));
            }
            Err(e) => return Err(SessionError::Dependency(e.to_string())),
        };

        let token_revoked = match self
            .tokens
            .revoke_token(
                &session.token_set.access_token,
                &reason.revocation_tag(),
                &metadata,
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to revoke tokens of session {}: {}", session_id, e);
                false
            }
        };

        self.release_resources(session_id).await;
        self.index.remove(&session.user_id, session_id).await;

        self.sessions.remove(session_id).await.map_err(|e| {
            error!("Failed to remove session {} from store: {}", session_id, e);
            SessionError::Dependency(e.to_string())
        })?;

        let session_lifetime_ms = (Utc::now() - session.created_at).num_milliseconds();
        info!(
            "Destroyed session {} for user {} ({}), lifetime {}ms, status {}",
            session_id,
            session.user_id,
            reason,
            session_lifetime_ms,
            reason.terminal_status().as_str()
        );

        self.events.emit(SessionEvent::Destroyed {
            session_id: session_id.to_string(),
            user_id: session.user_id.clone(),
            reason: reason.clone(),
            session_lifetime_ms,
            metadata,
        });

        Ok(DestroyedSession {
            session_id: session_id.to_string(),
            user_id: session.user_id,
            reason,
            session_lifetime_ms,
            token_revoked,
        })
    }

    /// Destroy every session of a user; individual failures do not stop the rest
    pub async fn destroy_all_user_sessions(
        &self,
        user_id: &str,
        reason: DestroyReason,
        metadata: HashMap<String, String>,
    ) -> DestroyAllOutcome {
        let snapshot = self.index.snapshot(user_id).await;
        let mut outcome = DestroyAllOutcome {
            user_id: user_id.to_string(),
            total: snapshot.len(),
            destroyed: 0,
            already_gone: 0,
            failed: 0,
            failures: Vec::new(),
        };

        for session_id in &snapshot {
            match self
                .destroy_session(session_id, reason.clone(), metadata.clone())
                .await
            {
                Ok(_) => outcome.destroyed += 1,
                Err(SessionError::NotFound(_)) => {
                    // Stale index entry, e.g. the store already expired the session
                    self.index.remove(user_id, session_id).await;
                    outcome.already_gone += 1;
                }
                Err(e) => {
                    outcome.failed += 1;
                    outcome.failures.push(DestroyFailure {
                        session_id: session_id.clone(),
                        code: e.code(),
                        reason: e.reason(),
                    });
                }
            }
        }

        info!(
            "Destroyed {}/{} sessions for user {} ({} already gone, {} failed)",
            outcome.destroyed, outcome.total, user_id, outcome.already_gone, outcome.failed
        );
        outcome
    }

    /// Sanitized view of a session
    pub async fn get_session(&self, session_id: &str) -> Result<SessionInfo, SessionError> {
        Ok(self.load(session_id).await?.to_info())
    }

    /// Sanitized views of a user's sessions in login order
    pub async fn get_user_sessions(&self, user_id: &str) -> Result<Vec<SessionInfo>, SessionError> {
        let mut infos = Vec::new();
        for session_id in self.index.snapshot(user_id).await {
            match self.sessions.get(&session_id).await {
                Ok(Some(session)) => infos.push(session.to_info()),
                Ok(None) => debug!("Indexed session {} no longer stored", session_id),
                Err(e) => return Err(SessionError::Dependency(e.to_string())),
            }
        }
        Ok(infos)
    }

    /// Require step-up authentication on the next validation
    pub async fn mark_for_reauthentication(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<SessionInfo, SessionError> {
        let info = self
            .serialized(session_id, async {
                let mut session = self.load(session_id).await?;
                session.flags.requires_reauthentication = true;
                session.flags.requires_reauthentication_reason = Some(reason.to_string());
                self.persist(&session).await?;
                Ok::<_, SessionError>(session.to_info())
            })
            .await?;

        info!("Session {} requires reauthentication: {}", session_id, reason);
        self.events.emit(SessionEvent::ReauthenticationRequired {
            session_id: session_id.to_string(),
            user_id: info.user_id.clone(),
            reason: reason.to_string(),
        });
        Ok(info)
    }

    /// Clear the step-up requirement once the user re-authenticated
    pub async fn clear_reauthentication(&self, session_id: &str) -> Result<SessionInfo, SessionError> {
        self.serialized(session_id, async {
            let mut session = self.load(session_id).await?;
            session.flags.requires_reauthentication = false;
            session.flags.requires_reauthentication_reason = None;
            self.persist(&session).await?;
            Ok::<_, SessionError>(session.to_info())
        })
        .await
    }

    /// Merge new client metadata into the session
    pub async fn update_metadata(
        &self,
        session_id: &str,
        update: MetadataUpdate,
    ) -> Result<SessionInfo, SessionError> {
        let info = self
            .serialized(session_id, async {
                let mut session = self.load(session_id).await?;
                session.metadata.apply(update);
                self.persist(&session).await?;
                Ok::<_, SessionError>(session.to_info())
            })
            .await?;

        self.events.emit(SessionEvent::MetadataUpdated {
            session_id: session_id.to_string(),
            user_id: info.user_id.clone(),
        });
        Ok(info)
    }

    /// Flag the session so its next validation logs it out
    pub async fn request_force_logout(&self, session_id: &str) -> Result<(), SessionError> {
        self.serialized(session_id, async {
            let mut session = self.load(session_id).await?;
            session.flags.force_logout = true;
            self.persist(&session).await?;
            Ok::<_, SessionError>(())
        })
        .await?;

        warn!("Force logout requested for session {}", session_id);
        Ok(())
    }

    /// Issue a single-use recovery token for a session
    pub async fn create_recovery_token(
        &self,
        session_id: &str,
    ) -> Result<IssuedRecoveryToken, SessionError> {
        let issued = self.recovery.create_recovery_token(session_id).await?;

        self.events.emit(SessionEvent::RecoveryTokenCreated {
            session_id: issued.session_id.clone(),
            user_id: issued.user_id.clone(),
            recovery_id: issued.recovery_id.clone(),
            expires_at: issued.expires_at,
        });
        Ok(issued)
    }

    /// Redeem a recovery token and renew the session it is bound to
    pub async fn recover_session(
        &self,
        token: &str,
        context: RequestContext,
    ) -> Result<RecoveredSession, SessionError> {
        let record = self.recovery.redeem(token, context.user_id.as_deref()).await?;

        let renewal = self
            .renew_session(
                &record.session_id,
                RenewOptions::triggered_by(RenewalTrigger::Recovery),
            )
            .await?;

        if let Err(e) = self.recovery.reset_attempts(&record.user_id).await {
            warn!(
                "Failed to reset recovery attempts for user {}: {}",
                record.user_id, e
            );
        }

        info!(
            "Session {} recovered with token {}",
            record.session_id, record.recovery_id
        );
        self.events.emit(SessionEvent::Recovered {
            session_id: record.session_id.clone(),
            user_id: record.user_id.clone(),
            recovery_id: record.recovery_id.clone(),
        });

        Ok(RecoveredSession {
            recovery_id: record.recovery_id,
            renewal,
        })
    }

    pub async fn session_stats(&self) -> SessionStats {
        SessionStats {
            indexed_sessions: self.index.total_sessions().await,
            users: self.index.user_count().await,
            cached_sessions: self.sessions.cached_len().await,
            monitored_sessions: self.monitor.active_count(),
            scheduled_renewals: self.scheduler.scheduled_count(),
            recovery_tokens: self.recovery.token_count().await,
        }
    }

    pub fn is_monitored(&self, session_id: &str) -> bool {
        self.monitor.is_monitoring(session_id)
    }

    pub fn has_scheduled_renewal(&self, session_id: &str) -> bool {
        self.scheduler.is_scheduled(session_id)
    }

    /// Session ids indexed for a user, oldest login first
    pub async fn indexed_sessions(&self, user_id: &str) -> Vec<String> {
        self.index.snapshot(user_id).await
    }

    /// Cancel every background timer
    pub fn shutdown(&self) {
        let monitors = self.monitor.stop_all();
        let renewals = self.scheduler.cancel_all();
        info!(
            "Session manager shut down ({} monitors, {} renewal timers cancelled)",
            monitors, renewals
        );
    }

    async fn load(&self, session_id: &str) -> Result<Session, SessionError> {
        self.sessions
            .get(session_id)
            .await
            .map_err(|e| SessionError::Dependency(e.to_string()))?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn persist(&self, session: &Session) -> Result<(), SessionError> {
        self.sessions
            .save(session)
            .await
            .map_err(|e| SessionError::Dependency(e.to_string()))
    }

    /// Self-triggered destroy; failures are logged, the caller reports its own error
    async fn destroy_quietly(&self, session_id: &str, reason: DestroyReason) {
        let mut metadata = HashMap::new();
        metadata.insert("trigger".to_string(), "validation".to_string());
        if let Err(e) = self.destroy_locked(session_id, reason, metadata).await {
            warn!("Failed to destroy session {}: {}", session_id, e);
        }
    }

    async fn release_resources(&self, session_id: &str) {
        self.monitor.stop(session_id);
        self.scheduler.cancel(session_id);
        self.recovery.revoke_for_session(session_id).await;
    }

    fn start_timers(&self, session: &Session) {
        let target: Weak<dyn MonitorTarget> = self.self_ref.clone();
        self.monitor.start(&session.id, target.clone());
        self.scheduler
            .schedule(&session.id, session.expires_at, session.ttl(), target);
    }

    /// Run `operation` while holding the session's lock
    async fn serialized<T>(&self, session_id: &str, operation: impl Future<Output = T>) -> T {
        self.session_locks.run(session_id, operation).await
    }

    /// Re-check inactivity under the session lock before destroying
    async fn expire_if_inactive(&self, session_id: &str) {
        let outcome = self
            .serialized(session_id, async {
                let session = match self.sessions.get(session_id).await {
                    Ok(Some(session)) => session,
                    _ => return None,
                };

                let snapshot = ActivitySnapshot {
                    last_activity: session.last_activity,
                    expires_at: session.expires_at,
                };
                let reason = match self.monitor.assess(&snapshot, Utc::now()) {
                    ActivityVerdict::IdleTimeout => DestroyReason::IdleTimeout,
                    ActivityVerdict::Expired => DestroyReason::Expired,
                    _ => {
                        // Activity arrived in the meantime, keep watching
                        self.start_timers(&session);
                        return None;
                    }
                };

                let mut metadata = HashMap::new();
                metadata.insert("trigger".to_string(), "activity_monitor".to_string());
                Some(self.destroy_locked(session_id, reason, metadata).await)
            })
            .await;

        if let Some(Err(e)) = outcome {
            warn!("Monitor could not destroy session {}: {}", session_id, e);
        }
    }
}

#[async_trait]
impl MonitorTarget for SessionLifecycleManager {
    async fn activity_snapshot(&self, session_id: &str) -> Option<ActivitySnapshot> {
        match self.sessions.get(session_id).await {
            Ok(Some(session)) if session.is_active() => Some(ActivitySnapshot {
                last_activity: session.last_activity,
                expires_at: session.expires_at,
            }),
            Ok(_) => None,
            Err(e) => {
                // Keep monitoring through transient store errors
                warn!("Monitor could not load session {}: {}", session_id, e);
                Some(ActivitySnapshot {
                    last_activity: Utc::now(),
                    expires_at: Utc::now() + Duration::days(1),
                })
            }
        }
    }

    async fn on_idle_warning(&self, session_id: &str, idle: Duration, timeout: Duration) {
        let Ok(Some(session)) = self.sessions.get(session_id).await else {
            return;
        };

        debug!(
            "Session {} idle for {}ms of {}ms",
            session_id,
            idle.num_milliseconds(),
            timeout.num_milliseconds()
        );
        self.events.emit(SessionEvent::IdleWarning {
            session_id: session_id.to_string(),
            user_id: session.user_id,
            idle_ms: idle.num_milliseconds(),
            idle_timeout_ms: timeout.num_milliseconds(),
        });
    }

    async fn on_idle_timeout(&self, session_id: &str) {
        self.expire_if_inactive(session_id).await;
    }

    async fn on_expired(&self, session_id: &str) {
        self.expire_if_inactive(session_id).await;
    }

    async fn on_renewal_due(&self, session_id: &str) {
        if let Err(e) = self
            .renew_session(
                session_id,
                RenewOptions::triggered_by(RenewalTrigger::Predictive),
            )
            .await
        {
            warn!("Predictive renewal of session {} failed: {}", session_id, e);
        }
    }
}

/// Token claims: caller data plus the session binding
fn issuance_claims(
    user_id: &str,
    session_id: &str,
    session_type: Option<&str>,
    user_data: Value,
) -> Value {
    let mut claims = match user_data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("user_data".to_string(), other);
            map
        }
    };

    claims.insert("sub".to_string(), Value::String(user_id.to_string()));
    claims.insert("sid".to_string(), Value::String(session_id.to_string()));
    if let Some(session_type) = session_type {
        claims.insert(
            "session_type".to_string(),
            Value::String(session_type.to_string()),
        );
    }
    Value::Object(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::events::BroadcastEventSink;
    use crate::session::storage::MemoryDurableStore;
    use crate::session::types::DeviceSignals;
    use crate::token::MemoryTokenAuthority;
    use tokio::sync::broadcast::Receiver;

    struct Harness {
        manager: Arc<SessionLifecycleManager>,
        authority: Arc<MemoryTokenAuthority>,
        store: Arc<MemoryDurableStore>,
        events: Receiver<SessionEvent>,
    }

    fn harness(config: SessionPolicyConfig) -> Harness {
        let authority = Arc::new(MemoryTokenAuthority::default());
        let sink = Arc::new(BroadcastEventSink::new(1024));
        let events = sink.subscribe();
        let store = Arc::new(MemoryDurableStore::new());

        let manager = SessionLifecycleManager::builder()
            .config(config)
            .token_authority(authority.clone())
            .durable_store(store.clone())
            .event_sink(sink)
            .build()
            .unwrap();

        Harness {
            manager,
            authority,
            store,
            events,
        }
    }

    fn drain(events: &mut Receiver<SessionEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        names
    }

    fn browser() -> RequestContext {
        RequestContext {
            ip: Some("192.168.1.1".to_string()),
            user_agent: Some("Mozilla/5.0 Firefox/120.0".to_string()),
            device: DeviceSignals {
                screen_resolution: Some("2560x1440".to_string()),
                timezone: Some("Europe/Berlin".to_string()),
                language: Some("de-DE".to_string()),
                platform: Some("Linux x86_64".to_string()),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_builder_requires_dependencies() {
        let err = SessionLifecycleManager::builder()
            .durable_store(Arc::new(MemoryDurableStore::new()))
            .event_sink(Arc::new(BroadcastEventSink::default()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("token authority"));

        let err = SessionLifecycleManager::builder()
            .config(SessionPolicyConfig {
                default_ttl_ms: 0,
                ..Default::default()
            })
            .token_authority(Arc::new(MemoryTokenAuthority::default()))
            .durable_store(Arc::new(MemoryDurableStore::new()))
            .event_sink(Arc::new(BroadcastEventSink::default()))
            .build()
            .err()
            .unwrap();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_issuance_claims_merge() {
        let claims = issuance_claims(
            "user-123",
            "s1",
            Some("remember_me"),
            serde_json::json!({"email": "user@example.com", "sub": "spoofed"}),
        );
        assert_eq!(claims["sub"], "user-123");
        assert_eq!(claims["sid"], "s1");
        assert_eq!(claims["email"], "user@example.com");
        assert_eq!(claims["session_type"], "remember_me");

        let claims = issuance_claims("user-123", "s1", None, serde_json::json!("plain"));
        assert_eq!(claims["user_data"], "plain");
    }

    #[tokio::test]
    async fn test_create_starts_timers_and_emits() {
        let mut h = harness(SessionPolicyConfig::default());
        let created = h
            .manager
            .create_session("user-123", serde_json::json!({}), browser())
            .await
            .unwrap();

        assert!(h.manager.is_monitored(&created.session.id));
        assert!(h.manager.has_scheduled_renewal(&created.session.id));
        assert!(created.session_info.has_device_fingerprint);
        assert_eq!(drain(&mut h.events), vec!["session:created"]);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_user() {
        let h = harness(SessionPolicyConfig::default());
        let err = h
            .manager
            .create_session("  ", Value::Null, RequestContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_create_fails_when_issuance_fails() {
        let h = harness(SessionPolicyConfig::default());
        h.authority.set_fail_issuance(true);

        let err = h
            .manager
            .create_session("user-123", Value::Null, RequestContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_CREATION_FAILED");
        assert!(h.manager.indexed_sessions("user-123").await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_login_disabled_replaces_session() {
        let h = harness(SessionPolicyConfig {
            allow_concurrent_logins: false,
            ..Default::default()
        });

        let first = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();
        let second = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();

        assert_eq!(
            h.manager.indexed_sessions("user-123").await,
            vec![second.session.id.clone()]
        );
        assert!(h.manager.get_session(&first.session.id).await.is_err());

        let revocations = h.authority.revocations().await;
        assert_eq!(revocations[0].1, "session_concurrent_login");
    }

    #[tokio::test]
    async fn test_validate_renews_expired_access_token_in_window() {
        let mut h = harness(SessionPolicyConfig::default());
        let created = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();
        h.authority
            .expire_access_token(&created.session.token_set.access_token)
            .await;

        let outcome = h
            .manager
            .validate_session(&created.session.id, ValidateOptions::new(browser()))
            .await
            .unwrap();

        assert!(outcome.valid);
        assert!(outcome.renewed);
        assert_ne!(
            outcome.tokens.access_token,
            created.session.token_set.access_token
        );
        let names = drain(&mut h.events);
        assert!(names.contains(&"session:renewed"));
        assert!(names.contains(&"session:validated"));
    }

    #[tokio::test]
    async fn test_validate_destroys_when_renewal_fails() {
        let h = harness(SessionPolicyConfig::default());
        let created = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();
        h.authority
            .expire_access_token(&created.session.token_set.access_token)
            .await;
        h.authority.set_fail_refresh(true);

        let err = h
            .manager
            .validate_session(&created.session.id, ValidateOptions::new(browser()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TOKEN_EXPIRED_NO_RENEWAL");
        assert!(h.manager.get_session(&created.session.id).await.is_err());
        assert!(!h.manager.is_monitored(&created.session.id));
    }

    #[tokio::test]
    async fn test_validate_rejects_revoked_token() {
        let h = harness(SessionPolicyConfig::default());
        let created = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();
        h.authority
            .revoke_token(
                &created.session.token_set.access_token,
                "external",
                &HashMap::new(),
            )
            .await
            .unwrap();

        let err = h
            .manager
            .validate_session(&created.session.id, ValidateOptions::new(browser()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TOKEN");
        assert!(h.manager.get_session(&created.session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_warnings_mark_session_suspicious() {
        let h = harness(SessionPolicyConfig::default());
        let created = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();

        let mut moved = browser();
        moved.ip = Some("203.0.113.7".to_string());
        let outcome = h
            .manager
            .validate_session(&created.session.id, ValidateOptions::new(moved))
            .await
            .unwrap();

        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.session.flags.suspicious_activity);
    }

    #[tokio::test]
    async fn test_reauthentication_flow() {
        let mut h = harness(SessionPolicyConfig::default());
        let created = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();

        h.manager
            .mark_for_reauthentication(&created.session.id, "password_changed")
            .await
            .unwrap();

        let outcome = h
            .manager
            .validate_session(&created.session.id, ValidateOptions::new(browser()))
            .await
            .unwrap();
        assert!(outcome.valid);
        assert!(outcome.requires_reauthentication);
        assert_eq!(
            outcome.reauthentication_reason.as_deref(),
            Some("password_changed")
        );
        assert!(drain(&mut h.events).contains(&"session:reauthentication_required"));

        let info = h
            .manager
            .clear_reauthentication(&created.session.id)
            .await
            .unwrap();
        assert!(!info.flags.requires_reauthentication);
    }

    #[tokio::test]
    async fn test_force_logout_destroys_on_next_validation() {
        let h = harness(SessionPolicyConfig::default());
        let created = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();

        h.manager
            .request_force_logout(&created.session.id)
            .await
            .unwrap();
        let err = h
            .manager
            .validate_session(&created.session.id, ValidateOptions::new(browser()))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "SESSION_FORCE_LOGOUT");
        assert!(h.manager.get_session(&created.session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_update_metadata() {
        let mut h = harness(SessionPolicyConfig::default());
        let created = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();

        let info = h
            .manager
            .update_metadata(
                &created.session.id,
                MetadataUpdate {
                    location: Some("Berlin, DE".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(info.metadata.location.as_deref(), Some("Berlin, DE"));
        assert_eq!(info.metadata.ip.as_deref(), Some("192.168.1.1"));
        assert!(drain(&mut h.events).contains(&"session:metadata_updated"));
    }

    #[tokio::test]
    async fn test_destroy_releases_everything() {
        let h = harness(SessionPolicyConfig::default());
        let created = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();
        h.manager
            .create_recovery_token(&created.session.id)
            .await
            .unwrap();

        let destroyed = h
            .manager
            .destroy_session(&created.session.id, DestroyReason::Logout, HashMap::new())
            .await
            .unwrap();
        assert!(destroyed.token_revoked);

        let stats = h.manager.session_stats().await;
        assert_eq!(stats.indexed_sessions, 0);
        assert_eq!(stats.monitored_sessions, 0);
        assert_eq!(stats.scheduled_renewals, 0);
        assert_eq!(stats.recovery_tokens, 0);
        assert_eq!(stats.cached_sessions, 0);
    }

    #[tokio::test]
    async fn test_predictive_renewal_fires() {
        let mut h = harness(SessionPolicyConfig {
            default_ttl_ms: 400,
            renewal_threshold: 0.5,
            idle_timeout_ms: 0,
            ..Default::default()
        });
        let created = h
            .manager
            .create_session("user-123", Value::Null, RequestContext::default())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let info = h.manager.get_session(&created.session.id).await.unwrap();
        assert!(info.renewal_count >= 1);
        assert!(info.expires_at > created.session.expires_at);
        assert!(drain(&mut h.events).contains(&"session:renewed"));
        h.manager.shutdown();
    }

    #[tokio::test]
    async fn test_monitor_destroys_idle_session() {
        let mut h = harness(SessionPolicyConfig {
            idle_timeout_ms: 100,
            cleanup_interval_ms: 20,
            predictive_renewal: false,
            ..Default::default()
        });
        let created = h
            .manager
            .create_session("user-123", Value::Null, RequestContext::default())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        assert!(h.manager.get_session(&created.session.id).await.is_err());
        assert!(h.manager.indexed_sessions("user-123").await.is_empty());
        let names = drain(&mut h.events);
        assert!(names.contains(&"session:idle_warning"));
        assert!(names.contains(&"session:destroyed"));
    }

    #[tokio::test]
    async fn test_concurrent_login_aborts_when_termination_fails() {
        let h = harness(SessionPolicyConfig {
            allow_concurrent_logins: false,
            ..Default::default()
        });
        h.manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();

        h.store.set_fail_delete(true);
        let err = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "CONCURRENT_LOGIN_NOT_ALLOWED");
        assert_eq!(h.manager.session_stats().await.indexed_sessions, 0);
    }

    #[tokio::test]
    async fn test_destroy_all_aggregates_failures() {
        let h = harness(SessionPolicyConfig::default());
        for _ in 0..3 {
            h.manager
                .create_session("user-123", Value::Null, browser())
                .await
                .unwrap();
        }

        h.store.set_fail_delete(true);
        let outcome = h
            .manager
            .destroy_all_user_sessions("user-123", DestroyReason::Logout, HashMap::new())
            .await;

        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.destroyed, 0);
        assert_eq!(outcome.failed, 3);
        assert_eq!(outcome.failures.len(), 3);
        assert!(
            outcome
                .failures
                .iter()
                .all(|f| f.code == "DEPENDENCY_FAILURE")
        );
    }

    #[tokio::test]
    async fn test_destroy_all_mixes_outcomes() {
        let h = harness(SessionPolicyConfig::default());
        let first = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();
        h.manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();

        // Drop the first session from cache and store behind the manager's back
        h.manager.sessions.remove(&first.session.id).await.unwrap();

        let outcome = h
            .manager
            .destroy_all_user_sessions("user-123", DestroyReason::Logout, HashMap::new())
            .await;

        assert_eq!(outcome.total, 2);
        assert_eq!(outcome.already_gone, 1);
        assert_eq!(outcome.destroyed, 1);
        assert_eq!(outcome.failed, 0);
        assert!(h.manager.indexed_sessions("user-123").await.is_empty());
    }

    #[tokio::test]
    async fn test_store_read_failure_surfaces_as_dependency() {
        let h = harness(SessionPolicyConfig::default());
        let created = h
            .manager
            .create_session("user-123", Value::Null, browser())
            .await
            .unwrap();

        // A second manager over the same store starts with a cold cache
        let cold = SessionLifecycleManager::builder()
            .token_authority(h.authority.clone())
            .durable_store(h.store.clone())
            .event_sink(Arc::new(BroadcastEventSink::default()))
            .build()
            .unwrap();
        h.store.set_fail_get(true);

        let err = cold
            .validate_session(&created.session.id, ValidateOptions::new(browser()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DEPENDENCY_FAILURE");
    }

    #[tokio::test]
    async fn test_expired_session_reaped_without_validation() {
        let mut h = harness(SessionPolicyConfig {
            default_ttl_ms: 200,
            idle_timeout_ms: 0,
            cleanup_interval_ms: 20,
            predictive_renewal: false,
            ..Default::default()
        });
        let created = h
            .manager
            .create_session("user-123", Value::Null, RequestContext::default())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        let stats = h.manager.session_stats().await;
        assert_eq!(stats.cached_sessions, 0);
        assert_eq!(stats.indexed_sessions, 0);
        assert!(!h.manager.is_monitored(&created.session.id));
        assert!(drain(&mut h.events).contains(&"session:destroyed"));
    }

    #[test]
    fn test_builder_rejects_oversized_ttl() {
        let err = SessionLifecycleManager::builder()
            .config(SessionPolicyConfig {
                default_ttl_ms: u64::MAX,
                ..Default::default()
            })
            .token_authority(Arc::new(MemoryTokenAuthority::default()))
            .durable_store(Arc::new(MemoryDurableStore::new()))
            .event_sink(Arc::new(BroadcastEventSink::default()))
            .build()
            .err()
            .unwrap();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
