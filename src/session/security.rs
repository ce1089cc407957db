// Security policy evaluation
// Stateless binding checks of a session against the current request context

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::types::{RequestContext, Session};
use crate::config::{BindingMode, SessionPolicyConfig};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityCheck {
    IpBinding,
    UserAgentBinding,
    DeviceFingerprint,
    SessionAge,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Advisory,
    Critical,
}

/// A single failed or noteworthy check
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SecurityFinding {
    pub check: SecurityCheck,
    pub severity: Severity,
    pub message: String,
}

impl SecurityFinding {
    fn advisory(check: SecurityCheck, message: impl Into<String>) -> Self {
        Self {
            check,
            severity: Severity::Advisory,
            message: message.into(),
        }
    }

    fn critical(check: SecurityCheck, message: impl Into<String>) -> Self {
        Self {
            check,
            severity: Severity::Critical,
            message: message.into(),
        }
    }
}

/// Result of evaluating all checks
#[derive(Debug, Clone, Default, Serialize)]
pub struct SecurityEvaluation {
    /// False when any critical violation was found
    pub valid: bool,
    pub warnings: Vec<SecurityFinding>,
    pub violations: Vec<SecurityFinding>,
}

impl SecurityEvaluation {
    fn record(&mut self, finding: SecurityFinding) {
        match finding.severity {
            Severity::Advisory => self.warnings.push(finding),
            Severity::Critical => self.violations.push(finding),
        }
    }

    pub fn violation_messages(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.message.clone()).collect()
    }
}

/// Evaluates IP, user agent, device fingerprint and session age policies
#[derive(Debug, Clone)]
pub struct SecurityPolicyEngine {
    ip_binding: BindingMode,
    user_agent_binding: bool,
    regeneration_interval: chrono::Duration,
}

impl SecurityPolicyEngine {
    pub fn new(config: &SessionPolicyConfig) -> Self {
        Self {
            ip_binding: config.ip_binding,
            user_agent_binding: config.user_agent_binding,
            regeneration_interval: config.session_regeneration_interval(),
        }
    }

    pub fn evaluate(&self, session: &Session, context: &RequestContext) -> SecurityEvaluation {
        self.evaluate_at(session, context, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        session: &Session,
        context: &RequestContext,
        now: DateTime<Utc>,
    ) -> SecurityEvaluation {
        let mut evaluation = SecurityEvaluation::default();

        // IP mismatch is always recorded; only strict mode makes it fatal
        if let (Some(bound), Some(current)) = (&session.metadata.ip, &context.ip)
            && bound != current
        {
            let message = format!("IP address changed from {} to {}", bound, current);
            evaluation.record(match self.ip_binding {
                BindingMode::Strict => SecurityFinding::critical(SecurityCheck::IpBinding, message),
                BindingMode::Advisory => {
                    SecurityFinding::advisory(SecurityCheck::IpBinding, message)
                }
            });
        }

        // User agents drift with browser updates, never fatal
        if self.user_agent_binding
            && let (Some(bound), Some(current)) = (&session.metadata.user_agent, &context.user_agent)
            && bound != current
        {
            evaluation.record(SecurityFinding::advisory(
                SecurityCheck::UserAgentBinding,
                "User agent changed",
            ));
        }

        // A captured fingerprint must match, whatever the other settings say
        if let Some(bound) = &session.device_fingerprint
            && context.device_fingerprint().as_deref() != Some(bound.as_str())
        {
            evaluation.record(SecurityFinding::critical(
                SecurityCheck::DeviceFingerprint,
                "Device fingerprint mismatch",
            ));
        }

        let age = session.age(now);
        if age > self.regeneration_interval {
            evaluation.record(SecurityFinding::advisory(
                SecurityCheck::SessionAge,
                format!(
                    "Session is {}s old, regeneration recommended",
                    age.num_seconds()
                ),
            ));
        }

        evaluation.valid = evaluation.violations.is_empty();

        if !evaluation.valid {
            warn!(
                "Session {} failed security checks: {:?}",
                session.id,
                evaluation.violation_messages()
            );
        } else if !evaluation.warnings.is_empty() {
            debug!(
                "Session {} passed security checks with {} warning(s)",
                session.id,
                evaluation.warnings.len()
            );
        }

        evaluation
    }
}
