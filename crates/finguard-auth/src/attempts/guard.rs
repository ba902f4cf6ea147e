//! Brute-force protection with progressive lockout.

use std::net::IpAddr;
use std::time::Duration;

use super::types::{ActionCheck, AttemptResult, LockoutInfo, SuspiciousActivity};
use super::ActionType;
use crate::audit::{SecurityEventKind, Severity};
use crate::config::{ActionPolicy, AttemptConfig, StoreFailurePolicy};
use crate::context::CoreContext;
use crate::error::AuthError;
use crate::store::StoreError;
use crate::AuthResult;

/// Counts failed attempts per `(identifier, action)` and locks out pairs
/// that cross their action's threshold.
///
/// Counters and lockouts live in the store with TTLs, so the guard holds no
/// per-identifier state and any number of instances can share it. The
/// counter increment is a single atomic store operation.
///
/// When a lockout is triggered the attempt counter is kept alive for the
/// lockout plus one window, so a failure right after the lockout lifts
/// continues the count and earns a longer lockout.
#[derive(Debug)]
pub struct AttemptGuard {
    config: AttemptConfig,
    ctx: CoreContext,
}

impl AttemptGuard {
    /// Creates an attempt guard.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if the configuration is invalid.
    pub fn new(config: AttemptConfig, ctx: CoreContext) -> AuthResult<Self> {
        config
            .validate()
            .map_err(|e| AuthError::configuration(e.to_string()))?;
        Ok(Self { config, ctx })
    }

    /// Returns the guard configuration.
    #[must_use]
    pub fn config(&self) -> &AttemptConfig {
        &self.config
    }

    /// Returns `true` if the identifier or client IP is whitelisted.
    #[must_use]
    pub fn is_whitelisted(&self, identifier: &str, ip: Option<IpAddr>) -> bool {
        self.config
            .whitelisted_identifiers
            .iter()
            .any(|w| w == identifier)
            || ip.is_some_and(|ip| self.config.whitelisted_ips.iter().any(|n| n.contains(ip)))
    }

    /// Returns `true` if a lockout is active for the pair.
    ///
    /// On store failure the action's failure policy decides.
    pub async fn is_locked_out(&self, identifier: &str, action: ActionType) -> bool {
        let key = self.ctx.keys.lockout(action.as_str(), identifier);
        match self.ctx.store.exists(&key).await {
            Ok(locked) => locked,
            Err(e) => self.fails_closed(identifier, action, None, &e),
        }
    }

    /// Returns the lockout and counter state for the pair.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the store cannot be read.
    pub async fn lockout_info(
        &self,
        identifier: &str,
        action: ActionType,
    ) -> AuthResult<LockoutInfo> {
        let store = &self.ctx.store;
        let lockout_key = self.ctx.keys.lockout(action.as_str(), identifier);
        let attempts_key = self.ctx.keys.attempts(action.as_str(), identifier);

        let remaining = store.ttl(&lockout_key).await?;
        let attempts = parse_count(store.get(&attempts_key).await?);
        let attempts_reset_in = if attempts > 0 {
            store.ttl(&attempts_key).await?
        } else {
            None
        };

        Ok(LockoutInfo {
            locked: remaining.is_some(),
            remaining,
            attempts,
            attempts_reset_in,
        })
    }

    /// Counts a failed attempt and locks the pair once it reaches the
    /// action's `max_attempts`.
    pub async fn record_failed_attempt(
        &self,
        identifier: &str,
        action: ActionType,
        ip: Option<IpAddr>,
    ) -> AttemptResult {
        if self.is_whitelisted(identifier, ip) {
            self.ctx.events.record(
                self.ctx
                    .events
                    .event(SecurityEventKind::WhitelistBypass, identifier, Severity::Low)
                    .with_ip(ip)
                    .with_action(action),
            );
            return AttemptResult::whitelisted();
        }

        let policy = self.config.policies.get(action);
        let attempts_key = self.ctx.keys.attempts(action.as_str(), identifier);

        let attempts = match self
            .ctx
            .store
            .incr_with_ttl(&attempts_key, policy.window)
            .await
        {
            Ok(count) => u32::try_from(count.max(0)).unwrap_or(u32::MAX),
            Err(e) => {
                let locked = self.fails_closed(identifier, action, ip, &e);
                return AttemptResult {
                    locked,
                    degraded: true,
                    ..AttemptResult::default()
                };
            }
        };

        let require_captcha = attempts >= self.config.require_captcha_after;
        let require_email_verification =
            attempts >= self.config.require_email_verification_after;

        if attempts >= policy.max_attempts {
            let duration = self.lockout_duration(policy, attempts);
            self.lock(identifier, action, &attempts_key, policy, duration, ip)
                .await;

            return AttemptResult {
                locked: true,
                attempts,
                lockout_duration: Some(duration),
                require_captcha,
                require_email_verification,
                ..AttemptResult::default()
            };
        }

        let severity = if require_captcha {
            Severity::Medium
        } else {
            Severity::Low
        };
        self.ctx.events.record(
            self.ctx
                .events
                .event(SecurityEventKind::FailedAttempt, identifier, severity)
                .with_ip(ip)
                .with_action(action)
                .with_details(format!("attempt {attempts}/{}", policy.max_attempts)),
        );

        AttemptResult {
            locked: false,
            attempts,
            remaining_attempts: Some(policy.max_attempts - attempts),
            require_captcha,
            require_email_verification,
            ..AttemptResult::default()
        }
    }

    /// Clears the counter and any lockout for the pair.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the store cannot be written.
    pub async fn record_successful_attempt(
        &self,
        identifier: &str,
        action: ActionType,
        ip: Option<IpAddr>,
    ) -> AuthResult<()> {
        self.reset(identifier, action).await?;
        self.ctx.events.record(
            self.ctx
                .events
                .event(SecurityEventKind::SuccessfulAttempt, identifier, Severity::Low)
                .with_ip(ip)
                .with_action(action),
        );
        Ok(())
    }

    /// Lifts a lockout manually and resets the counter.
    ///
    /// Returns `true` if a lockout was active.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the store cannot be written.
    pub async fn clear_lockout(&self, identifier: &str, action: ActionType) -> AuthResult<bool> {
        let was_locked = self.reset(identifier, action).await?;
        self.ctx.events.record(
            self.ctx
                .events
                .event(SecurityEventKind::LockoutCleared, identifier, Severity::Medium)
                .with_action(action),
        );
        Ok(was_locked)
    }

    /// Reports whether `action` may proceed for `identifier`.
    pub async fn check_action_allowed(&self, identifier: &str, action: ActionType) -> ActionCheck {
        let key = self.ctx.keys.lockout(action.as_str(), identifier);
        match self.ctx.store.ttl(&key).await {
            Ok(Some(remaining)) => ActionCheck::denied("locked out", Some(remaining)),
            Ok(None) => ActionCheck::allowed(),
            Err(e) => {
                let check = if self.fails_closed(identifier, action, None, &e) {
                    ActionCheck::denied("protection unavailable", None)
                } else {
                    ActionCheck::allowed()
                };
                check.degraded()
            }
        }
    }

    /// Checks whether `principal_id` may submit `resource_id` again.
    ///
    /// Failed submissions must be recorded under
    /// [`assessment_identifier`] with [`ActionType::AssessmentSubmission`].
    pub async fn check_assessment_submission_protection(
        &self,
        principal_id: &str,
        resource_id: &str,
    ) -> ActionCheck {
        let identifier = assessment_identifier(principal_id, resource_id);
        let check = self
            .check_action_allowed(&identifier, ActionType::AssessmentSubmission)
            .await;
        if check.allowed {
            check
        } else {
            ActionCheck {
                reason: Some("too many submission attempts".to_string()),
                ..check
            }
        }
    }

    /// Lists identifiers whose counter exceeds the suspicious-activity
    /// threshold in a window that started within `within`.
    ///
    /// Enumerates the store, so it is meant for dashboards. Sorted by
    /// attempts, highest first.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the store cannot be scanned.
    pub async fn suspicious_activity(
        &self,
        within: Duration,
    ) -> AuthResult<Vec<SuspiciousActivity>> {
        let store = &self.ctx.store;
        let prefix = self.ctx.keys.attempts_prefix();
        let now = self.ctx.clock.now();
        let cutoff = now - within;

        let mut found = Vec::new();
        for key in store.scan_prefix(&prefix).await? {
            let Some((action, identifier)) = self
                .ctx
                .keys
                .strip(&prefix, &key)
                .and_then(|rest| rest.split_once(':'))
            else {
                continue;
            };
            let Ok(action) = action.parse::<ActionType>() else {
                tracing::debug!(key = %key, "Skipping attempt key with unknown action");
                continue;
            };

            let attempts = parse_count(store.get(&key).await?);
            if attempts <= self.config.suspicious_activity_threshold {
                continue;
            }

            let window = self.config.policies.get(action).window;
            let elapsed = store
                .ttl(&key)
                .await?
                .map_or(Duration::ZERO, |ttl| window.saturating_sub(ttl));
            let window_started_at = now - elapsed;
            if window_started_at < cutoff {
                continue;
            }

            let locked = store
                .exists(&self.ctx.keys.lockout(action.as_str(), identifier))
                .await?;
            found.push(SuspiciousActivity {
                action,
                identifier: identifier.to_string(),
                attempts,
                window_started_at,
                locked,
            });
        }

        found.sort_by(|a, b| b.attempts.cmp(&a.attempts));
        Ok(found)
    }

    /// Computes the lockout length for the `attempts`-th failure.
    #[must_use]
    pub fn lockout_duration(&self, policy: &ActionPolicy, attempts: u32) -> Duration {
        let base = policy.lockout_duration;
        let max = self.config.max_lockout_duration;
        if !self.config.progressive_lockout {
            return base.min(max);
        }

        let excess = i32::try_from(attempts.saturating_sub(policy.max_attempts)).unwrap_or(i32::MAX);
        let secs = base.as_secs_f64() * self.config.progressive_multiplier.powi(excess);
        Duration::try_from_secs_f64(secs.min(max.as_secs_f64())).unwrap_or(max)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn lock(
        &self,
        identifier: &str,
        action: ActionType,
        attempts_key: &str,
        policy: &ActionPolicy,
        duration: Duration,
        ip: Option<IpAddr>,
    ) {
        let store = &self.ctx.store;
        let locked_until = self.ctx.clock.now() + duration;
        let lockout_key = self.ctx.keys.lockout(action.as_str(), identifier);

        if let Err(e) = store
            .set(
                &lockout_key,
                &locked_until.unix_timestamp().to_string(),
                Some(duration),
            )
            .await
        {
            tracing::error!(
                error = %e,
                identifier = %identifier,
                action = %action,
                "Failed to persist lockout"
            );
        }
        if let Err(e) = store.expire(attempts_key, duration + policy.window).await {
            tracing::warn!(error = %e, "Failed to extend attempt window past lockout");
        }

        self.ctx.events.record(
            self.ctx
                .events
                .event(SecurityEventKind::LockoutTriggered, identifier, Severity::High)
                .with_ip(ip)
                .with_action(action)
                .with_details(format!("locked for {}s", duration.as_secs())),
        );
    }

    async fn reset(&self, identifier: &str, action: ActionType) -> AuthResult<bool> {
        let store = &self.ctx.store;
        store
            .delete(&self.ctx.keys.attempts(action.as_str(), identifier))
            .await?;
        let was_locked = store
            .delete(&self.ctx.keys.lockout(action.as_str(), identifier))
            .await?;
        Ok(was_locked)
    }

    /// Applies the action's store failure policy; `true` means deny.
    fn fails_closed(
        &self,
        identifier: &str,
        action: ActionType,
        ip: Option<IpAddr>,
        error: &StoreError,
    ) -> bool {
        let policy = self.config.policies.get(action).store_failure;
        tracing::warn!(
            error = %error,
            action = %action,
            policy = ?policy,
            "Attempt store unavailable"
        );
        self.ctx.events.record(
            self.ctx
                .events
                .event(SecurityEventKind::StoreFailure, identifier, Severity::Medium)
                .with_ip(ip)
                .with_action(action)
                .with_details(error.to_string()),
        );
        policy == StoreFailurePolicy::FailClosed
    }
}

/// Identifier under which assessment submissions are counted.
#[must_use]
pub fn assessment_identifier(principal_id: &str, resource_id: &str) -> String {
    format!("{principal_id}:{resource_id}")
}

fn parse_count(value: Option<String>) -> u32 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}
