//! Attempt tracking results.

use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;

use super::ActionType;

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttemptResult {
    /// The pair is locked out after this attempt.
    pub locked: bool,

    /// Failed attempts counted in the current window.
    pub attempts: u32,

    /// The identifier is whitelisted; nothing was counted.
    pub whitelisted: bool,

    /// Attempts left before lockout (unlocked results only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_attempts: Option<u32>,

    /// Lockout length (locked results only).
    #[serde(
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub lockout_duration: Option<Duration>,

    /// Client should present a CAPTCHA on the next attempt.
    pub require_captcha: bool,

    /// Client should complete email verification.
    pub require_email_verification: bool,

    /// The store failed and the outcome came from the failure policy.
    pub degraded: bool,
}

impl AttemptResult {
    /// Result for a whitelisted identifier.
    #[must_use]
    pub fn whitelisted() -> Self {
        Self {
            whitelisted: true,
            ..Self::default()
        }
    }
}

/// Lockout state for one `(identifier, action)` pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LockoutInfo {
    /// A lockout is active.
    pub locked: bool,

    /// Time until the lockout lifts.
    #[serde(
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub remaining: Option<Duration>,

    /// Failed attempts counted in the current window.
    pub attempts: u32,

    /// Time until the attempt counter resets.
    #[serde(
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub attempts_reset_in: Option<Duration>,
}

/// Whether an action may proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionCheck {
    /// The action may proceed.
    pub allowed: bool,

    /// When a denied action may be retried.
    #[serde(
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_after: Option<Duration>,

    /// Short reason for a denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// The store failed and the outcome came from the failure policy.
    pub degraded: bool,
}

impl ActionCheck {
    /// The action may proceed.
    #[must_use]
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: None,
            reason: None,
            degraded: false,
        }
    }

    /// The action is denied.
    #[must_use]
    pub fn denied(reason: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            retry_after,
            reason: Some(reason.into()),
            degraded: false,
        }
    }

    /// Marks the outcome as decided by the store failure policy.
    #[must_use]
    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }
}

/// An identifier with an unusually high failure count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspiciousActivity {
    /// Protected action.
    pub action: ActionType,

    /// Identifier being attacked.
    pub identifier: String,

    /// Failed attempts in the current window.
    pub attempts: u32,

    /// When the current counting window started.
    #[serde(with = "time::serde::rfc3339")]
    pub window_started_at: OffsetDateTime,

    /// The pair is currently locked out.
    pub locked: bool,
}
