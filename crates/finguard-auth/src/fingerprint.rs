//! Client fingerprint shared by tokens and sessions.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The (IP address, hashed user-agent) pair a credential is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientFingerprint {
    /// Client IP address, if known.
    pub ip: Option<IpAddr>,

    /// Hex-encoded SHA-256 of the raw `User-Agent` value.
    pub user_agent_hash: String,
}

impl ClientFingerprint {
    /// Builds a fingerprint from the raw request values.
    ///
    /// A missing user agent hashes the empty string, so two clients that both
    /// omit the header share a hash.
    #[must_use]
    pub fn new(ip: Option<IpAddr>, user_agent: Option<&str>) -> Self {
        Self {
            ip,
            user_agent_hash: hash_user_agent(user_agent.unwrap_or_default()),
        }
    }

    /// Returns the IP address rendered for storage and claims.
    #[must_use]
    pub fn ip_string(&self) -> Option<String> {
        self.ip.map(|ip| ip.to_string())
    }
}

impl fmt::Display for ClientFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            Some(ip) => write!(f, "{ip}/{}", short_hash(&self.user_agent_hash)),
            None => write!(f, "-/{}", short_hash(&self.user_agent_hash)),
        }
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// One-way hash of a user-agent string (SHA-256, hex).
#[must_use]
pub fn hash_user_agent(user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic_and_hex() {
        let a = hash_user_agent("Mozilla/5.0");
        assert_eq!(a, hash_user_agent("Mozilla/5.0"));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, hash_user_agent("curl/8.0"));
    }

    #[test]
    fn test_missing_user_agent_hashes_empty_string() {
        let fp = ClientFingerprint::new(None, None);
        assert_eq!(fp.user_agent_hash, hash_user_agent(""));
    }

    #[test]
    fn test_display_truncates_hash() {
        let fp = ClientFingerprint::new("1.2.3.4".parse().ok(), Some("agent"));
        let rendered = fp.to_string();
        assert!(rendered.starts_with("1.2.3.4/"));
        assert_eq!(rendered.len(), "1.2.3.4/".len() + 12);
    }
}
