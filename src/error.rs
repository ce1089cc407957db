// Session engine error taxonomy
// Every public operation returns these; callers map them to structured failures

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Broad error categories used for auditing and client mapping
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    Expired,
    IdleTimeout,
    InvalidToken,
    SecurityViolation,
    RateLimited,
    ValidationError,
    DependencyFailure,
}

/// Errors returned by the session lifecycle engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Session exists but its persisted status is no longer active
    #[error("Session is {status}")]
    Inactive { status: String },

    #[error("Session expired")]
    Expired,

    #[error("Session idle timeout exceeded")]
    IdleTimeout,

    #[error("Session was force logged out")]
    ForcedLogout,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Access token expired and could not be renewed: {0}")]
    TokenExpiredNoRenewal(String),

    #[error("Security violation: {}", .0.join("; "))]
    SecurityViolation(Vec<String>),

    #[error("Concurrent login not allowed")]
    ConcurrentLoginNotAllowed,

    #[error("Session creation failed: {0}")]
    CreationFailed(String),

    #[error("Session renewal failed: {0}")]
    RenewalFailed(String),

    #[error("Session recovery is disabled")]
    RecoveryDisabled,

    #[error("Too many recovery attempts, retry after {cooldown_until}")]
    RateLimited { cooldown_until: DateTime<Utc> },

    #[error("Invalid recovery token")]
    InvalidRecoveryToken,

    #[error("Recovery token already used")]
    RecoveryTokenUsed,

    #[error("Recovery token expired")]
    RecoveryTokenExpired,

    #[error("Recovery token does not belong to user {0}")]
    RecoveryUserMismatch(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency failure: {0}")]
    Dependency(String),
}

impl SessionError {
    /// Machine-readable error code
    pub fn code(&self) -> String {
        match self {
            SessionError::NotFound(_) => "SESSION_NOT_FOUND".to_string(),
            SessionError::Inactive { status } => format!("SESSION_{}", status.to_uppercase()),
            SessionError::Expired => "SESSION_EXPIRED".to_string(),
            SessionError::IdleTimeout => "SESSION_IDLE_TIMEOUT".to_string(),
            SessionError::ForcedLogout => "SESSION_FORCE_LOGOUT".to_string(),
            SessionError::InvalidToken(_) => "INVALID_TOKEN".to_string(),
            SessionError::TokenExpiredNoRenewal(_) => "TOKEN_EXPIRED_NO_RENEWAL".to_string(),
            SessionError::SecurityViolation(_) => "SECURITY_VIOLATION".to_string(),
            SessionError::ConcurrentLoginNotAllowed => "CONCURRENT_LOGIN_NOT_ALLOWED".to_string(),
            SessionError::CreationFailed(_) => "SESSION_CREATION_FAILED".to_string(),
            SessionError::RenewalFailed(_) => "SESSION_RENEWAL_FAILED".to_string(),
            SessionError::RecoveryDisabled => "RECOVERY_DISABLED".to_string(),
            SessionError::RateLimited { .. } => "RECOVERY_RATE_LIMITED".to_string(),
            SessionError::InvalidRecoveryToken => "INVALID_RECOVERY_TOKEN".to_string(),
            SessionError::RecoveryTokenUsed => "RECOVERY_TOKEN_USED".to_string(),
            SessionError::RecoveryTokenExpired => "RECOVERY_TOKEN_EXPIRED".to_string(),
            SessionError::RecoveryUserMismatch(_) => "RECOVERY_USER_MISMATCH".to_string(),
            SessionError::Validation(_) => "VALIDATION_ERROR".to_string(),
            SessionError::Dependency(_) => "DEPENDENCY_FAILURE".to_string(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::NotFound(_) | SessionError::Inactive { .. } => ErrorCategory::NotFound,
            SessionError::Expired | SessionError::RecoveryTokenExpired => ErrorCategory::Expired,
            SessionError::IdleTimeout => ErrorCategory::IdleTimeout,
            SessionError::InvalidToken(_)
            | SessionError::TokenExpiredNoRenewal(_)
            | SessionError::InvalidRecoveryToken
            | SessionError::RecoveryTokenUsed => ErrorCategory::InvalidToken,
            SessionError::SecurityViolation(_)
            | SessionError::ForcedLogout
            | SessionError::RecoveryUserMismatch(_) => ErrorCategory::SecurityViolation,
            SessionError::RateLimited { .. } => ErrorCategory::RateLimited,
            SessionError::Validation(_)
            | SessionError::ConcurrentLoginNotAllowed
            | SessionError::RecoveryDisabled => ErrorCategory::ValidationError,
            SessionError::CreationFailed(_)
            | SessionError::RenewalFailed(_)
            | SessionError::Dependency(_) => ErrorCategory::DependencyFailure,
        }
    }

    /// Cooldown deadline carried by rate-limit errors
    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        match self {
            SessionError::RateLimited { cooldown_until } => Some(*cooldown_until),
            _ => None,
        }
    }

    /// Human-readable reason
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// Structured `{success: false, reason, code}` projection
    pub fn to_failure(&self) -> OperationFailure {
        OperationFailure {
            success: false,
            reason: self.reason(),
            code: self.code(),
            category: self.category(),
            cooldown_until: self.cooldown_until(),
        }
    }
}

/// Serializable failure result handed to callers outside the engine
#[derive(Debug, Clone, Serialize)]
pub struct OperationFailure {
    pub success: bool,
    pub reason: String,
    pub code: String,
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_status_code() {
        let err = SessionError::Inactive {
            status: "idle_timeout".to_string(),
        };
        assert_eq!(err.code(), "SESSION_IDLE_TIMEOUT");
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn test_concurrent_login_reason() {
        let failure = SessionError::ConcurrentLoginNotAllowed.to_failure();
        assert!(!failure.success);
        assert_eq!(failure.reason, "Concurrent login not allowed");
        assert_eq!(failure.code, "CONCURRENT_LOGIN_NOT_ALLOWED");
    }

    #[test]
    fn test_rate_limited_failure_carries_cooldown() {
        let until = Utc::now();
        let failure = SessionError::RateLimited {
            cooldown_until: until,
        }
        .to_failure();

        assert_eq!(failure.code, "RECOVERY_RATE_LIMITED");
        assert_eq!(failure.cooldown_until, Some(until));

        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["category"], "rate_limited");
    }
}
