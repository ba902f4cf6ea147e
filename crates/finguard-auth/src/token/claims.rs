//! Token claim set and validation outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Claim names owned by the token format; extra claims may not override them.
pub const RESERVED_CLAIMS: [&str; 10] = [
    "sub",
    "iat",
    "exp",
    "iss",
    "aud",
    "jti",
    "ip",
    "user_agent_hash",
    "created_at",
    "refreshed_from",
];

/// Claims carried by every bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenClaims {
    /// Subject (principal identifier).
    pub sub: String,

    /// Issued at (Unix timestamp, seconds).
    pub iat: i64,

    /// Expiration time (Unix timestamp, seconds).
    pub exp: i64,

    /// Issuer.
    pub iss: String,

    /// Audience.
    pub aud: String,

    /// Unique token id, used for revocation and usage tracking.
    pub jti: String,

    /// Client IP at issuance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// SHA-256 of the client user agent at issuance.
    pub user_agent_hash: String,

    /// Issuance instant in Unix milliseconds, compared with per-subject
    /// revocation epochs.
    pub created_at: i64,

    /// Id of the token this one replaced through rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_from: Option<String>,

    /// Caller supplied claims.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenClaims {
    /// Returns the expiry as a timestamp.
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.exp).ok()
    }
}

/// A freshly minted token.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    /// Encoded token, handed to the client.
    pub token: String,

    /// The token's `jti`.
    pub token_id: String,

    /// Absolute expiry.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,

    /// Lifetime in seconds from issuance.
    pub expires_in: u64,
}

/// Why a token was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenRejection {
    /// The token id, or every token of its subject, has been revoked.
    Revoked,
    /// Signature, structure, or required claims are bad.
    Invalid,
    /// `exp` has passed.
    Expired,
    /// `iss` differs from the configured issuer.
    InvalidIssuer,
    /// `aud` differs from the configured audience.
    InvalidAudience,
    /// Presented from a different IP than at issuance.
    IpMismatch,
    /// Presented with a different user agent than at issuance.
    UserAgentMismatch,
    /// Revocation state could not be read.
    Unavailable,
}

impl TokenRejection {
    /// Returns the reason string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Revoked => "token revoked",
            Self::Invalid => "invalid token",
            Self::Expired => "token expired",
            Self::InvalidIssuer => "invalid issuer",
            Self::InvalidAudience => "invalid audience",
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

impl fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of validating a token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValidation {
    /// The token is accepted.
    Valid {
        /// Decoded claims.
        claims: TokenClaims,
        /// The token is older than the rotation threshold.
        rotation_needed: bool,
    },
    /// The token is rejected.
    Invalid(TokenRejection),
}

impl TokenValidation {
    /// Returns `true` if the token was accepted.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    /// Returns the claims of an accepted token.
    #[must_use]
    pub fn claims(&self) -> Option<&TokenClaims> {
        match self {
            Self::Valid { claims, .. } => Some(claims),
            Self::Invalid(_) => None,
        }
    }

    /// Returns the rejection reason, if any.
    #[must_use]
    pub fn rejection(&self) -> Option<TokenRejection> {
        match self {
            Self::Valid { .. } => None,
            Self::Invalid(reason) => Some(*reason),
        }
    }
}
