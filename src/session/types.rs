// Session types and data structures

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::token::TokenSet;

/// Session status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is active
    Active,
    /// Session exceeded the idle timeout
    IdleTimeout,
    /// Session passed its expiry
    Expired,
    /// Session was destroyed (terminal)
    Destroyed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::IdleTimeout => "idle_timeout",
            SessionStatus::Expired => "expired",
            SessionStatus::Destroyed => "destroyed",
        }
    }
}

/// Network and client details captured for a session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_id: Option<String>,
    pub location: Option<String>,
    pub login_method: Option<String>,
}

/// Partial metadata update; only `Some` fields are applied
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataUpdate {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_id: Option<String>,
    pub location: Option<String>,
    pub login_method: Option<String>,
}

impl SessionMetadata {
    pub fn apply(&mut self, update: MetadataUpdate) {
        if let Some(ip) = update.ip {
            self.ip = Some(ip);
        }
        if let Some(user_agent) = update.user_agent {
            self.user_agent = Some(user_agent);
        }
        if let Some(device_id) = update.device_id {
            self.device_id = Some(device_id);
        }
        if let Some(location) = update.location {
            self.location = Some(location);
        }
        if let Some(login_method) = update.login_method {
            self.login_method = Some(login_method);
        }
    }
}

/// Security flags attached to a session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionFlags {
    pub requires_reauthentication: bool,
    pub requires_reauthentication_reason: Option<String>,
    pub suspicious_activity: bool,
    pub force_logout: bool,
}

/// Client-reported device signals used for fingerprinting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSignals {
    pub screen_resolution: Option<String>,
    pub timezone: Option<String>,
    pub language: Option<String>,
    pub platform: Option<String>,
}

/// Network/device context of the request driving an operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_id: Option<String>,
    pub location: Option<String>,
    pub login_method: Option<String>,
    /// Selects a TTL override at creation
    pub session_type: Option<String>,
    /// Expected owner, cross-checked during recovery
    pub user_id: Option<String>,
    #[serde(default)]
    pub device: DeviceSignals,
}

impl RequestContext {
    /// Fingerprint over (user agent, screen resolution, timezone, language, platform).
    /// Used for anomaly detection only. Returns None when no signal is present.
    pub fn device_fingerprint(&self) -> Option<String> {
        let signals = [
            self.user_agent.as_deref(),
            self.device.screen_resolution.as_deref(),
            self.device.timezone.as_deref(),
            self.device.language.as_deref(),
            self.device.platform.as_deref(),
        ];

        if signals.iter().all(|s| s.is_none()) {
            return None;
        }

        let mut hasher = Sha256::new();
        for signal in signals {
            hasher.update(signal.unwrap_or("").as_bytes());
            hasher.update(b"|");
        }
        Some(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }

    fn to_metadata(&self) -> SessionMetadata {
        SessionMetadata {
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            device_id: self.device_id.clone(),
            location: self.location.clone(),
            login_method: self.login_method.clone(),
        }
    }
}

/// Authenticated user session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// Opaque token handle from the Token Authority
    pub token_set: TokenSet,
    pub status: SessionStatus,
    pub session_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_ms: i64,
    pub device_fingerprint: Option<String>,
    pub metadata: SessionMetadata,
    pub flags: SessionFlags,
    pub renewal_count: u32,
}

impl Session {
    /// Create a new active session expiring `ttl` from now
    pub fn new(
        user_id: String,
        token_set: TokenSet,
        ttl: Duration,
        context: &RequestContext,
        device_fingerprint: Option<String>,
    ) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            user_id,
            token_set,
            ttl,
            context,
            device_fingerprint,
        )
    }

    pub fn with_id(
        id: String,
        user_id: String,
        token_set: TokenSet,
        ttl: Duration,
        context: &RequestContext,
        device_fingerprint: Option<String>,
    ) -> Self {
        let now = Utc::now();

        Self {
            id,
            user_id,
            token_set,
            status: SessionStatus::Active,
            session_type: context.session_type.clone(),
            created_at: now,
            last_activity: now,
            expires_at: now + ttl,
            ttl_ms: ttl.num_milliseconds(),
            device_fingerprint,
            metadata: context.to_metadata(),
            flags: SessionFlags::default(),
            renewal_count: 0,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::milliseconds(self.ttl_ms)
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Record activity; with sliding expiration the expiry follows it
    pub fn touch(&mut self, now: DateTime<Utc>, sliding: bool) {
        self.last_activity = now;
        if sliding {
            self.expires_at = now + self.ttl();
        }
    }

    /// Sanitized projection without tokens
    pub fn to_info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            user_id: self.user_id.clone(),
            status: self.status,
            session_type: self.session_type.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            expires_at: self.expires_at,
            ttl_ms: self.ttl_ms,
            metadata: self.metadata.clone(),
            flags: self.flags.clone(),
            has_device_fingerprint: self.device_fingerprint.is_some(),
            renewal_count: self.renewal_count,
        }
    }

    pub fn to_token_projection(&self) -> TokenProjection {
        TokenProjection::from(&self.token_set)
    }
}

/// Session information for display (without tokens)
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub session_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_ms: i64,
    pub metadata: SessionMetadata,
    pub flags: SessionFlags,
    pub has_device_fingerprint: bool,
    pub renewal_count: u32,
}

/// Tokens handed back to the client
#[derive(Debug, Clone, Serialize)]
pub struct TokenProjection {
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

impl From<&TokenSet> for TokenProjection {
    fn from(token_set: &TokenSet) -> Self {
        Self {
            token_type: token_set.token_type.clone(),
            access_token: token_set.access_token.clone(),
            refresh_token: token_set.refresh_token.clone(),
            access_expires_at: token_set.access_expires_at,
            refresh_expires_at: token_set.refresh_expires_at,
        }
    }
}

/// Why a session was destroyed; also the token revocation tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyReason {
    Logout,
    Expired,
    IdleTimeout,
    TokenExpiredNoRenewal,
    InvalidToken,
    SecurityViolation,
    MaxSessionsExceeded,
    ConcurrentLogin,
    ForcedLogout,
    Other(String),
}

impl DestroyReason {
    pub fn as_str(&self) -> &str {
        match self {
            DestroyReason::Logout => "logout",
            DestroyReason::Expired => "expired",
            DestroyReason::IdleTimeout => "idle_timeout",
            DestroyReason::TokenExpiredNoRenewal => "token_expired_no_renewal",
            DestroyReason::InvalidToken => "invalid_token",
            DestroyReason::SecurityViolation => "security_violation",
            DestroyReason::MaxSessionsExceeded => "max_sessions_exceeded",
            DestroyReason::ConcurrentLogin => "concurrent_login",
            DestroyReason::ForcedLogout => "forced_logout",
            DestroyReason::Other(reason) => reason,
        }
    }

    /// Tag passed to the Token Authority on revocation
    pub fn revocation_tag(&self) -> String {
        format!("session_{}", self.as_str())
    }

    /// Status recorded on the session as it is torn down
    pub fn terminal_status(&self) -> SessionStatus {
        match self {
            DestroyReason::Expired => SessionStatus::Expired,
            DestroyReason::IdleTimeout => SessionStatus::IdleTimeout,
            _ => SessionStatus::Destroyed,
        }
    }
}

impl std::fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenewalTrigger {
    #[default]
    Manual,
    /// Access token expired during validation inside the sliding window
    Sliding,
    /// Fired by the predictive renewal scheduler
    Predictive,
    /// Redemption of a recovery token
    Recovery,
}
