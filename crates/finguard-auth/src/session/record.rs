//! Session record and validation outcomes.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Server-side session bound to a client fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque random id.
    pub session_id: String,

    /// Owning principal.
    pub principal_id: String,

    /// Creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// Last successful validation.
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,

    /// Expiry; slides forward on activity near the end.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,

    /// Client IP at creation.
    pub client_ip: Option<IpAddr>,

    /// SHA-256 of the user agent at creation.
    pub user_agent_hash: String,

    /// `false` once deactivated.
    pub is_active: bool,

    /// Created with the long "remember me" lifetime.
    pub remember_me: bool,

    /// Id of the bearer token issued alongside this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_token_id: Option<String>,

    /// Opaque caller metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SessionRecord {
    /// Returns `true` if the session is active and not past `expires_at`.
    #[must_use]
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        self.is_active && now <= self.expires_at
    }
}

/// Options for a new session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    /// Use the long "remember me" lifetime.
    pub remember_me: bool,

    /// Bearer token id to link.
    pub bound_token_id: Option<String>,

    /// Opaque caller metadata.
    pub metadata: Map<String, Value>,
}

/// Why a session was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRejection {
    /// No record for the id.
    NotFound,
    /// The record is deactivated.
    Inactive,
    /// The record is past `expires_at`.
    Expired,
    /// Presented from a different IP than at creation.
    IpMismatch,
    /// Presented with a different user agent than at creation.
    UserAgentMismatch,
    /// The store could not be read.
    Unavailable,
}

impl SessionRejection {
    /// Returns the reason string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "session not found",
            Self::Inactive => "session inactive",
            Self::Expired => "session expired",
            Self::IpMismatch => "ip address mismatch",
            Self::UserAgentMismatch => "user agent mismatch",
            Self::Unavailable => "validation unavailable",
        }
    }

    /// Returns `true` for client fingerprint mismatches.
    #[must_use]
    pub fn is_fingerprint_mismatch(&self) -> bool {
        matches!(self, Self::IpMismatch | Self::UserAgentMismatch)
    }
}

impl fmt::Display for SessionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of validating a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionValidation {
    /// The session is accepted; the record reflects the recorded activity.
    Valid(SessionRecord),
    /// The session is rejected.
    Invalid(SessionRejection),
}

impl SessionValidation {
    /// Returns `true` if the session was accepted.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Returns the accepted record.
    #[must_use]
    pub fn record(&self) -> Option<&SessionRecord> {
        match self {
            Self::Valid(record) => Some(record),
            Self::Invalid(_) => None,
        }
    }

    /// Returns the rejection reason, if any.
    #[must_use]
    pub fn rejection(&self) -> Option<SessionRejection> {
        match self {
            Self::Valid(_) => None,
            Self::Invalid(reason) => Some(*reason),
        }
    }
}
