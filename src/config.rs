// Session policy configuration
// Loaded once at startup and treated as immutable by the lifecycle manager

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// How strictly the client IP is bound to the session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BindingMode {
    /// Mismatches are reported as warnings
    #[default]
    Advisory,
    /// Mismatches invalidate the session
    Strict,
}

/// Upper bound for every configured duration (100 years)
pub const MAX_DURATION_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

fn check_duration(name: &str, ms: u64) -> Result<(), String> {
    if ms > MAX_DURATION_MS {
        return Err(format!(
            "{} must not exceed {}ms, got {}ms",
            name, MAX_DURATION_MS, ms
        ));
    }
    Ok(())
}

/// Session lifecycle and trust-policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPolicyConfig {
    /// Default session lifetime
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Lifetime overrides keyed by session type (e.g. "remember_me")
    #[serde(default)]
    pub session_type_ttls_ms: HashMap<String, u64>,
    /// Maximum gap since last activity (0 disables idle timeout)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Push expiry forward on every activity
    #[serde(default = "default_true")]
    pub sliding_expiration: bool,
    /// Max idle gap for which an expired access token is still renewed
    #[serde(default = "default_sliding_window_ms")]
    pub sliding_window_ms: u64,
    /// Maximum sessions per user (0 = unlimited)
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: usize,
    /// Whether a user may hold more than one session at a time
    #[serde(default = "default_true")]
    pub allow_concurrent_logins: bool,
    /// Interval of the per-session activity check, which also reaps expired sessions
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Fraction of idle timeout after which a warning is emitted
    #[serde(default = "default_idle_warning_ratio")]
    pub idle_warning_ratio: f64,
    /// Renew sessions proactively before they expire
    #[serde(default = "default_true")]
    pub predictive_renewal: bool,
    /// Fraction of the TTL before expiry at which predictive renewal fires
    #[serde(default = "default_renewal_threshold")]
    pub renewal_threshold: f64,
    #[serde(default)]
    pub ip_binding: BindingMode,
    /// Warn when the user agent changes mid-session
    #[serde(default = "default_true")]
    pub user_agent_binding: bool,
    /// Capture a device fingerprint at creation
    #[serde(default = "default_true")]
    pub device_fingerprinting: bool,
    /// Session age after which regeneration is recommended
    #[serde(default = "default_session_regeneration_interval_ms")]
    pub session_regeneration_interval_ms: u64,
    #[serde(default = "default_true")]
    pub allow_session_recovery: bool,
    #[serde(default = "default_recovery_token_ttl_ms")]
    pub recovery_token_ttl_ms: u64,
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    #[serde(default = "default_recovery_cooldown_ms")]
    pub recovery_cooldown_ms: u64,
    /// How long a used recovery token is kept before being purged
    #[serde(default = "default_recovery_purge_grace_ms")]
    pub recovery_purge_grace_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000 // 24 hours
}

fn default_idle_timeout_ms() -> u64 {
    30 * 60 * 1000 // 30 minutes
}

fn default_sliding_window_ms() -> u64 {
    15 * 60 * 1000
}

fn default_max_sessions_per_user() -> usize {
    5
}

fn default_cleanup_interval_ms() -> u64 {
    60 * 1000
}

fn default_idle_warning_ratio() -> f64 {
    0.8
}

fn default_renewal_threshold() -> f64 {
    0.2
}

fn default_session_regeneration_interval_ms() -> u64 {
    60 * 60 * 1000
}

fn default_recovery_token_ttl_ms() -> u64 {
    15 * 60 * 1000
}

fn default_max_recovery_attempts() -> u32 {
    3
}

fn default_recovery_cooldown_ms() -> u64 {
    60 * 60 * 1000
}

fn default_recovery_purge_grace_ms() -> u64 {
    30 * 1000
}

impl Default for SessionPolicyConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl_ms(),
            session_type_ttls_ms: HashMap::new(),
            idle_timeout_ms: default_idle_timeout_ms(),
            sliding_expiration: true,
            sliding_window_ms: default_sliding_window_ms(),
            max_sessions_per_user: default_max_sessions_per_user(),
            allow_concurrent_logins: true,
            cleanup_interval_ms: default_cleanup_interval_ms(),
            idle_warning_ratio: default_idle_warning_ratio(),
            predictive_renewal: true,
            renewal_threshold: default_renewal_threshold(),
            ip_binding: BindingMode::Advisory,
            user_agent_binding: true,
            device_fingerprinting: true,
            session_regeneration_interval_ms: default_session_regeneration_interval_ms(),
            allow_session_recovery: true,
            recovery_token_ttl_ms: default_recovery_token_ttl_ms(),
            max_recovery_attempts: default_max_recovery_attempts(),
            recovery_cooldown_ms: default_recovery_cooldown_ms(),
            recovery_purge_grace_ms: default_recovery_purge_grace_ms(),
        }
    }
}

impl SessionPolicyConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl_ms == 0 {
            return Err("default_ttl_ms must be greater than zero".to_string());
        }

        if let Some((session_type, _)) = self.session_type_ttls_ms.iter().find(|(_, ttl)| **ttl == 0)
        {
            return Err(format!(
                "TTL for session type '{}' must be greater than zero",
                session_type
            ));
        }

        if self.cleanup_interval_ms == 0 {
            return Err("cleanup_interval_ms must be greater than zero".to_string());
        }

        check_duration("default_ttl_ms", self.default_ttl_ms)?;
        for (session_type, ttl) in &self.session_type_ttls_ms {
            check_duration(&format!("TTL for session type '{}'", session_type), *ttl)?;
        }
        check_duration("idle_timeout_ms", self.idle_timeout_ms)?;
        check_duration("sliding_window_ms", self.sliding_window_ms)?;
        check_duration("cleanup_interval_ms", self.cleanup_interval_ms)?;
        check_duration(
            "session_regeneration_interval_ms",
            self.session_regeneration_interval_ms,
        )?;
        check_duration("recovery_token_ttl_ms", self.recovery_token_ttl_ms)?;
        check_duration("recovery_cooldown_ms", self.recovery_cooldown_ms)?;
        check_duration("recovery_purge_grace_ms", self.recovery_purge_grace_ms)?;

        if !(self.idle_warning_ratio > 0.0 && self.idle_warning_ratio < 1.0) {
            return Err("idle_warning_ratio must be between 0 and 1".to_string());
        }

        if self.predictive_renewal && !(self.renewal_threshold > 0.0 && self.renewal_threshold < 1.0)
        {
            return Err("renewal_threshold must be between 0 and 1".to_string());
        }

        if self.allow_session_recovery {
            if self.recovery_token_ttl_ms == 0 {
                return Err("recovery_token_ttl_ms must be greater than zero".to_string());
            }
            if self.max_recovery_attempts == 0 {
                return Err("max_recovery_attempts must be at least 1".to_string());
            }
            if self.recovery_cooldown_ms == 0 {
                return Err("recovery_cooldown_ms must be greater than zero".to_string());
            }
        }

        Ok(())
    }

    /// Lifetime for a session of the given type
    pub fn ttl_for(&self, session_type: Option<&str>) -> Duration {
        let ms = session_type
            .and_then(|t| self.session_type_ttls_ms.get(t))
            .copied()
            .unwrap_or(self.default_ttl_ms);
        millis(ms)
    }

    /// Idle timeout, if enabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| millis(self.idle_timeout_ms))
    }

    pub fn sliding_window(&self) -> Duration {
        millis(self.sliding_window_ms)
    }

    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn session_regeneration_interval(&self) -> Duration {
        millis(self.session_regeneration_interval_ms)
    }

    pub fn recovery_token_ttl(&self) -> Duration {
        millis(self.recovery_token_ttl_ms)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        millis(self.recovery_cooldown_ms)
    }

    pub fn recovery_purge_grace(&self) -> Duration {
        millis(self.recovery_purge_grace_ms)
    }
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SessionPolicyConfig, String> {
    let path = path.as_ref();
    info!("Loading session policy from: {}", path.display());

    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

    let config: SessionPolicyConfig = serde_yaml::from_str(&contents)
        .map_err(|e| format!("Failed to parse YAML config: {}", e))?;

    config.validate()?;

    info!(
        "Session policy loaded: ttl={}ms idle={}ms sliding={} max_sessions={}",
        config.default_ttl_ms,
        config.idle_timeout_ms,
        config.sliding_expiration,
        config.max_sessions_per_user
    );

    Ok(config)
}

/// Load configuration from SESSION_CONFIG_PATH or a well-known file, else defaults
pub fn load_config_with_fallback() -> Result<SessionPolicyConfig, String> {
    if let Ok(config_path) = std::env::var("SESSION_CONFIG_PATH") {
        match load_config(&config_path) {
            Ok(config) => return Ok(config),
            Err(e) => warn!(
                "Failed to load config from SESSION_CONFIG_PATH ({}): {}",
                config_path, e
            ),
        }
    }

    for path in ["session.yaml", "session.yml"] {
        if Path::new(path).exists() {
            match load_config(path) {
                Ok(config) => return Ok(config),
                Err(e) => warn!("Failed to load config from '{}': {}", path, e),
            }
        }
    }

    warn!("No session policy file found, using defaults");
    let config = SessionPolicyConfig::default();
    config.validate()?;
    Ok(config)
}
