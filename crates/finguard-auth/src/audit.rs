//! Security event audit logging.
//!
//! Every security-relevant transition (failed attempt, lockout, revocation,
//! session eviction, hijack containment) is recorded as a [`SecurityEvent`].
//! Events are emitted through `tracing` under the `finguard::security`
//! target and retained in a bounded in-process ring buffer for dashboards.
//!
//! The ring buffer is per process and best-effort. Deployments that need a
//! durable audit trail should ship the tracing output.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

use crate::attempts::ActionType;
use crate::clock::SharedClock;

/// Tracing target used for security events.
pub const SECURITY_TARGET: &str = "finguard::security";

/// Default number of events retained in memory.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine.
    Low,
    /// Worth watching.
    Medium,
    /// Likely attack or hijack indicator.
    High,
    /// Requires immediate attention.
    Critical,
}

impl Severity {
    /// Returns the severity as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    /// A failed attempt was counted.
    FailedAttempt,
    /// A failure crossed the threshold and locked the pair.
    LockoutTriggered,
    /// A successful attempt reset counters.
    SuccessfulAttempt,
    /// A whitelisted identifier bypassed counting.
    WhitelistBypass,
    /// An administrator cleared a lockout.
    LockoutCleared,
    /// A token was revoked.
    TokenRevoked,
    /// Every token of a subject was revoked.
    SubjectTokensRevoked,
    /// A token was presented from a different client.
    TokenFingerprintMismatch,
    /// A session was created.
    SessionCreated,
    /// The oldest session was evicted by the concurrency cap.
    SessionEvicted,
    /// A session was revoked.
    SessionRevoked,
    /// A session was presented from a different client and destroyed.
    SessionHijackSuspected,
    /// The backing store failed during a security check.
    StoreFailure,
}

impl SecurityEventKind {
    /// Returns the kind as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailedAttempt => "failed_attempt",
            Self::LockoutTriggered => "lockout_triggered",
            Self::SuccessfulAttempt => "successful_attempt",
            Self::WhitelistBypass => "whitelist_bypass",
            Self::LockoutCleared => "lockout_cleared",
            Self::TokenRevoked => "token_revoked",
            Self::SubjectTokensRevoked => "subject_tokens_revoked",
            Self::TokenFingerprintMismatch => "token_fingerprint_mismatch",
            Self::SessionCreated => "session_created",
            Self::SessionEvicted => "session_evicted",
            Self::SessionRevoked => "session_revoked",
            Self::SessionHijackSuspected => "session_hijack_suspected",
            Self::StoreFailure => "store_failure",
        }
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded security event.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    /// When the event happened.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,

    /// What happened.
    pub kind: SecurityEventKind,

    /// Identifier, principal, or subject involved.
    pub identifier: String,

    /// Client IP, if known.
    pub ip: Option<IpAddr>,

    /// Protected action, for attempt events.
    pub action: Option<ActionType>,

    /// Severity.
    pub severity: Severity,

    /// Free-form details (never returned to clients).
    pub details: String,
}

impl SecurityEvent {
    /// Creates an event without ip, action, or details.
    #[must_use]
    pub fn new(
        timestamp: OffsetDateTime,
        kind: SecurityEventKind,
        identifier: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            timestamp,
            kind,
            identifier: identifier.into(),
            ip: None,
            action: None,
            severity,
            details: String::new(),
        }
    }

    /// Sets the client IP.
    #[must_use]
    pub fn with_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.ip = ip;
        self
    }

    /// Sets the protected action.
    #[must_use]
    pub fn with_action(mut self, action: ActionType) -> Self {
        self.action = Some(action);
        self
    }

    /// Sets the details string.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Bounded security event log shared by all components.
pub struct SecurityEventLog {
    events: Mutex<VecDeque<SecurityEvent>>,
    capacity: usize,
    clock: SharedClock,
}

impl SecurityEventLog {
    /// Creates a log retaining at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize, clock: SharedClock) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity,
            clock,
        }
    }

    /// Returns the current time from the log's clock.
    #[must_use]
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Starts an event stamped with the current time.
    #[must_use]
    pub fn event(
        &self,
        kind: SecurityEventKind,
        identifier: impl Into<String>,
        severity: Severity,
    ) -> SecurityEvent {
        SecurityEvent::new(self.now(), kind, identifier, severity)
    }

    /// Emits and retains an event.
    pub fn record(&self, event: SecurityEvent) {
        emit(&event);

        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Returns up to `limit` events, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        self.events.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl fmt::Debug for SecurityEventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityEventLog")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

fn emit(event: &SecurityEvent) {
    let kind = event.kind.as_str();
    let identifier = event.identifier.as_str();
    let ip = event.ip.map(|ip| ip.to_string()).unwrap_or_default();
    let action = event.action.map(|a| a.as_str()).unwrap_or_default();
    let details = event.details.as_str();

    match event.severity {
        Severity::Low => tracing::info!(
            target: SECURITY_TARGET,
            kind, identifier, ip = ip.as_str(), action, severity = "low", details,
            "Security event"
        ),
        Severity::Medium => tracing::warn!(
            target: SECURITY_TARGET,
            kind, identifier, ip = ip.as_str(), action, severity = "medium", details,
            "Security event"
        ),
        Severity::High | Severity::Critical => tracing::error!(
            target: SECURITY_TARGET,
            kind, identifier, ip = ip.as_str(), action, severity = event.severity.as_str(), details,
            "Security event"
        ),
    }
}
