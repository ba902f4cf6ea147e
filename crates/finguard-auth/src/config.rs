//! Security core configuration.
//!
//! All sections deserialize with `#[serde(default)]` and accept humantime
//! durations, so a deployment only has to override what differs.
//!
//! # Example (TOML)
//!
//! ```toml
//! [security.token]
//! secret = "change-me-to-at-least-32-bytes-of-entropy"
//! expiration = "1h"
//! rotation_threshold = "30m"
//!
//! [security.attempts.policies.login]
//! max_attempts = 5
//! window = "15m"
//! lockout_duration = "15m"
//!
//! [security.session]
//! max_concurrent_sessions = 5
//! ```

use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::attempts::ActionType;
use crate::token::SigningAlgorithm;

/// Minimum accepted length of the HMAC signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Root configuration for the security core.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Prefix prepended to every store key (empty = no prefix).
    pub namespace: String,

    /// Bearer token settings.
    pub token: TokenConfig,

    /// Brute-force protection settings.
    pub attempts: AttemptConfig,

    /// Server-side session settings.
    pub session: SessionConfig,

    /// Number of security events retained in memory.
    pub event_log_capacity: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            token: TokenConfig::default(),
            attempts: AttemptConfig::default(),
            session: SessionConfig::default(),
            event_log_capacity: 1000,
        }
    }
}

/// What a component does when the backing store cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Permit: treat the check as passed.
    FailOpen,
    /// Deny: treat the check as failed.
    FailClosed,
}

/// Bearer token configuration.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC signing secret. Required; at least [`MIN_SECRET_LEN`] bytes.
    pub secret: String,

    /// HMAC algorithm.
    pub algorithm: SigningAlgorithm,

    /// Token `iss` claim.
    pub issuer: String,

    /// Token `aud` claim.
    pub audience: String,

    /// Absolute token lifetime.
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,

    /// Token age after which validation recommends rotation.
    #[serde(with = "humantime_serde")]
    pub rotation_threshold: Duration,

    /// Reject tokens presented from a different IP than at issuance.
    pub bind_ip: bool,

    /// Reject tokens presented with a different user agent than at issuance.
    pub bind_user_agent: bool,

    /// Maintain a per-token usage counter in the store.
    pub track_usage: bool,

    /// Behaviour when the blacklist cannot be read during validation.
    pub revocation_check_failure: StoreFailurePolicy,

    /// Capacity of the in-process revoked-id cache.
    pub blacklist_cache_capacity: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            algorithm: SigningAlgorithm::HS256,
            issuer: "finguard".to_string(),
            audience: "finguard-api".to_string(),
            expiration: Duration::from_secs(3600),         // 1 hour
            rotation_threshold: Duration::from_secs(1800), // 30 minutes
            bind_ip: true,
            bind_user_agent: true,
            track_usage: false,
            revocation_check_failure: StoreFailurePolicy::FailClosed,
            blacklist_cache_capacity: 10_000,
        }
    }
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("expiration", &self.expiration)
            .field("rotation_threshold", &self.rotation_threshold)
            .field("bind_ip", &self.bind_ip)
            .field("bind_user_agent", &self.bind_user_agent)
            .field("track_usage", &self.track_usage)
            .field("revocation_check_failure", &self.revocation_check_failure)
            .field("blacklist_cache_capacity", &self.blacklist_cache_capacity)
            .finish()
    }
}

/// Limits for one protected action.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ActionPolicy {
    /// Failed attempts within `window` that trigger a lockout.
    pub max_attempts: u32,

    /// Attempt-counting window, started by the first failure.
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Base lockout duration.
    #[serde(with = "humantime_serde")]
    pub lockout_duration: Duration,

    /// Behaviour when the store cannot be read or written.
    pub store_failure: StoreFailurePolicy,
}

impl ActionPolicy {
    /// Creates a fail-open policy.
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration, lockout_duration: Duration) -> Self {
        Self {
            max_attempts,
            window,
            lockout_duration,
            store_failure: StoreFailurePolicy::FailOpen,
        }
    }
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(900), Duration::from_secs(900))
    }
}

/// Per-action policy table. One field per [`ActionType`] variant.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ActionPolicies {
    /// Password login.
    pub login: ActionPolicy,
    /// Assessment submission.
    pub assessment_submission: ActionPolicy,
    /// Password reset.
    pub password_reset: ActionPolicy,
    /// Registration.
    pub registration: ActionPolicy,
    /// Generic API requests.
    pub api_request: ActionPolicy,
}

impl ActionPolicies {
    /// Returns the policy for `action`.
    #[must_use]
    pub fn get(&self, action: ActionType) -> &ActionPolicy {
        match action {
            ActionType::Login => &self.login,
            ActionType::AssessmentSubmission => &self.assessment_submission,
            ActionType::PasswordReset => &self.password_reset,
            ActionType::Registration => &self.registration,
            ActionType::ApiRequest => &self.api_request,
        }
    }

    /// Returns a mutable reference to the policy for `action`.
    pub fn get_mut(&mut self, action: ActionType) -> &mut ActionPolicy {
        match action {
            ActionType::Login => &mut self.login,
            ActionType::AssessmentSubmission => &mut self.assessment_submission,
            ActionType::PasswordReset => &mut self.password_reset,
            ActionType::Registration => &mut self.registration,
            ActionType::ApiRequest => &mut self.api_request,
        }
    }
}

impl Default for ActionPolicies {
    fn default() -> Self {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 3600;
        Self {
            login: ActionPolicy::new(
                5,
                Duration::from_secs(15 * MINUTE),
                Duration::from_secs(15 * MINUTE),
            ),
            assessment_submission: ActionPolicy::new(
                3,
                Duration::from_secs(HOUR),
                Duration::from_secs(HOUR),
            ),
            password_reset: ActionPolicy::new(
                3,
                Duration::from_secs(HOUR),
                Duration::from_secs(30 * MINUTE),
            ),
            registration: ActionPolicy::new(
                3,
                Duration::from_secs(HOUR),
                Duration::from_secs(HOUR),
            ),
            api_request: ActionPolicy::new(
                100,
                Duration::from_secs(MINUTE),
                Duration::from_secs(5 * MINUTE),
            ),
        }
    }
}

/// Brute-force protection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AttemptConfig {
    /// Per-action limits.
    pub policies: ActionPolicies,

    /// Grow lockout durations geometrically with repeated failures.
    pub progressive_lockout: bool,

    /// Growth factor applied per failure beyond `max_attempts`.
    pub progressive_multiplier: f64,

    /// Ceiling for any lockout duration.
    #[serde(with = "humantime_serde")]
    pub max_lockout_duration: Duration,

    /// Attempt count at which a CAPTCHA is required.
    pub require_captcha_after: u32,

    /// Attempt count at which email verification is required.
    pub require_email_verification_after: u32,

    /// Attempt count reported by the suspicious-activity scan.
    pub suspicious_activity_threshold: u32,

    /// Client networks that are never counted or locked.
    pub whitelisted_ips: Vec<IpNetwork>,

    /// Identifiers that are never counted or locked.
    pub whitelisted_identifiers: Vec<String>,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            policies: ActionPolicies::default(),
            progressive_lockout: true,
            progressive_multiplier: 2.0,
            max_lockout_duration: Duration::from_secs(24 * 3600),
            require_captcha_after: 3,
            require_email_verification_after: 5,
            suspicious_activity_threshold: 10,
            whitelisted_ips: Vec::new(),
            whitelisted_identifiers: Vec::new(),
        }
    }
}

/// Server-side session configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a regular session, and the sliding extension step.
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Lifetime of a "remember me" session.
    #[serde(with = "humantime_serde")]
    pub remember_me_duration: Duration,

    /// Activity this close to expiry slides `expires_at` forward.
    #[serde(with = "humantime_serde")]
    pub refresh_threshold: Duration,

    /// Active sessions allowed per principal; the oldest is evicted beyond it.
    pub max_concurrent_sessions: usize,

    /// Revoke sessions presented from a different IP.
    pub bind_ip: bool,

    /// Revoke sessions presented with a different user agent.
    pub bind_user_agent: bool,

    /// Lifetime of the per-principal creation lock.
    #[serde(with = "humantime_serde")]
    pub creation_lock_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3600),
            remember_me_duration: Duration::from_secs(30 * 24 * 3600),
            refresh_threshold: Duration::from_secs(900),
            max_concurrent_sessions: 5,
            bind_ip: true,
            bind_user_agent: true,
            creation_lock_ttl: Duration::from_secs(5),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl SecurityConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if the signing secret is unset and
    /// `ConfigError::InvalidValue` for out-of-range or inconsistent values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.token.validate()?;
        self.attempts.validate()?;
        self.session.validate()?;

        if self.event_log_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "event_log_capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl TokenConfig {
    /// Validates token settings.
    ///
    /// # Errors
    ///
    /// See [`SecurityConfig::validate`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::Missing("token.secret".to_string()));
        }
        if self.secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::InvalidValue(format!(
                "token.secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.issuer.is_empty() {
            return Err(ConfigError::InvalidValue(
                "token.issuer cannot be empty".to_string(),
            ));
        }
        if self.audience.is_empty() {
            return Err(ConfigError::InvalidValue(
                "token.audience cannot be empty".to_string(),
            ));
        }
        if self.expiration.is_zero() {
            return Err(ConfigError::InvalidValue(
                "token.expiration must be > 0".to_string(),
            ));
        }
        if self.rotation_threshold >= self.expiration {
            return Err(ConfigError::InvalidValue(
                "token.rotation_threshold must be shorter than token.expiration".to_string(),
            ));
        }
        if self.blacklist_cache_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "token.blacklist_cache_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl AttemptConfig {
    /// Validates brute-force protection settings.
    ///
    /// # Errors
    ///
    /// See [`SecurityConfig::validate`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        for action in ActionType::ALL {
            let policy = self.policies.get(action);
            if policy.max_attempts == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "attempts.policies.{action}.max_attempts must be > 0"
                )));
            }
            if policy.window.is_zero() || policy.lockout_duration.is_zero() {
                return Err(ConfigError::InvalidValue(format!(
                    "attempts.policies.{action} window and lockout_duration must be > 0"
                )));
            }
        }

        if self.max_lockout_duration.is_zero() {
            return Err(ConfigError::InvalidValue(
                "attempts.max_lockout_duration must be > 0".to_string(),
            ));
        }

        if !self.progressive_multiplier.is_finite() || self.progressive_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "attempts.progressive_multiplier must be a finite value >= 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

impl SessionConfig {
    /// Validates session settings.
    ///
    /// # Errors
    ///
    /// See [`SecurityConfig::validate`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout.is_zero() || self.remember_me_duration.is_zero() {
            return Err(ConfigError::InvalidValue(
                "session.session_timeout and session.remember_me_duration must be > 0"
                    .to_string(),
            ));
        }
        if self.refresh_threshold >= self.session_timeout {
            return Err(ConfigError::InvalidValue(
                "session.refresh_threshold must be shorter than session.session_timeout"
                    .to_string(),
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::InvalidValue(
                "session.max_concurrent_sessions must be > 0".to_string(),
            ));
        }
        if self.creation_lock_ttl.is_zero() {
            return Err(ConfigError::InvalidValue(
                "session.creation_lock_ttl must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
