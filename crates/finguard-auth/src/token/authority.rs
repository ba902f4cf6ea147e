//! Bearer token lifecycle: issue, validate, rotate, revoke.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::claims::{IssuedToken, RESERVED_CLAIMS, TokenClaims, TokenRejection, TokenValidation};
use super::jwt::JwtCodec;
use crate::audit::{SecurityEventKind, Severity};
use crate::config::{StoreFailurePolicy, TokenConfig};
use crate::context::CoreContext;
use crate::error::AuthError;
use crate::fingerprint::ClientFingerprint;
use crate::store::StoreResult;
use crate::AuthResult;

/// Issues and validates bearer tokens bound to a client fingerprint.
///
/// Tokens are self-contained; the store holds only the revocation
/// blacklist, per-subject revocation epochs, and optional usage counters.
///
/// # Validation order
///
/// 1. signature, structure, required claims (`"invalid token"`)
/// 2. blacklist and subject epoch (`"token revoked"`)
/// 3. expiry (`"token expired"`)
/// 4. issuer, audience
/// 5. ip and user-agent binding
/// 6. rotation hint
///
/// The signature is verified before the blacklist lookup because an
/// unverified `jti` cannot be trusted.
pub struct TokenAuthority {
    config: TokenConfig,
    codec: JwtCodec,
    ctx: CoreContext,
    revoked: Mutex<RevokedCache>,
}

impl TokenAuthority {
    /// Creates a token authority.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if the token configuration is
    /// invalid (missing or short secret, inconsistent durations).
    pub fn new(config: TokenConfig, ctx: CoreContext) -> AuthResult<Self> {
        config
            .validate()
            .map_err(|e| AuthError::configuration(e.to_string()))?;
        let codec = JwtCodec::from_secret(config.secret.as_bytes(), config.algorithm)
            .map_err(|e| AuthError::configuration(e.to_string()))?;
        let revoked = Mutex::new(RevokedCache::new(config.blacklist_cache_capacity));

        Ok(Self {
            config,
            codec,
            ctx,
            revoked,
        })
    }

    /// Returns the token configuration.
    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Mints a token for `subject` bound to `client`.
    ///
    /// Extra claims that collide with a reserved claim name are dropped.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Signing` if encoding fails.
    pub async fn issue(
        &self,
        subject: &str,
        extra_claims: Map<String, Value>,
        client: &ClientFingerprint,
    ) -> AuthResult<IssuedToken> {
        self.mint(subject, extra_claims, client, None).await
    }

    /// Validates a token presented by `client`.
    ///
    /// Never fails: every problem is reported as a [`TokenRejection`].
    pub async fn validate(&self, token: &str, client: &ClientFingerprint) -> TokenValidation {
        let claims = match self.codec.decode::<TokenClaims>(token) {
            Ok(data) => data.claims,
            Err(e) => {
                tracing::debug!(error = %e, "Token decode failed");
                return TokenValidation::Invalid(TokenRejection::Invalid);
            }
        };

        match self.is_revoked(&claims).await {
            Ok(true) => return TokenValidation::Invalid(TokenRejection::Revoked),
            Ok(false) => {}
            Err(e) => match self.config.revocation_check_failure {
                StoreFailurePolicy::FailClosed => {
                    self.record_store_failure(&claims.sub, client, &e.to_string());
                    return TokenValidation::Invalid(TokenRejection::Unavailable);
                }
                StoreFailurePolicy::FailOpen => {
                    tracing::warn!(
                        error = %e,
                        jti = %claims.jti,
                        "Revocation check unavailable, accepting token"
                    );
                }
            },
        }

        let now = self.ctx.clock.now().unix_timestamp();
        if now >= claims.exp {
            return TokenValidation::Invalid(TokenRejection::Expired);
        }
        if claims.iss != self.config.issuer {
            return TokenValidation::Invalid(TokenRejection::InvalidIssuer);
        }
        if claims.aud != self.config.audience {
            return TokenValidation::Invalid(TokenRejection::InvalidAudience);
        }

        if self.config.bind_ip && claims.ip != client.ip_string() {
            self.record_mismatch(&claims, client, TokenRejection::IpMismatch);
            return TokenValidation::Invalid(TokenRejection::IpMismatch);
        }
        if self.config.bind_user_agent && claims.user_agent_hash != client.user_agent_hash {
            self.record_mismatch(&claims, client, TokenRejection::UserAgentMismatch);
            return TokenValidation::Invalid(TokenRejection::UserAgentMismatch);
        }

        let age = now - claims.iat;
        let rotation_needed = age > duration_secs(self.config.rotation_threshold);

        if self.config.track_usage {
            self.bump_usage(&claims.jti).await;
        }

        TokenValidation::Valid {
            claims,
            rotation_needed,
        }
    }

    /// Replaces a valid token with a fresh one and revokes the old one.
    ///
    /// Returns `Ok(None)` if `old_token` does not validate for `client`.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails or the old token cannot be
    /// blacklisted; in the latter case no new token is handed out.
    pub async fn rotate(
        &self,
        old_token: &str,
        client: &ClientFingerprint,
    ) -> AuthResult<Option<IssuedToken>> {
        let claims = match self.validate(old_token, client).await {
            TokenValidation::Valid { claims, .. } => claims,
            TokenValidation::Invalid(reason) => {
                tracing::debug!(reason = %reason, "Rotation refused");
                return Ok(None);
            }
        };

        let issued = self
            .mint(
                &claims.sub,
                claims.extra.clone(),
                client,
                Some(claims.jti.clone()),
            )
            .await?;
        self.blacklist(&claims.jti, &claims.sub).await?;

        tracing::debug!(
            subject = %claims.sub,
            old_jti = %claims.jti,
            new_jti = %issued.token_id,
            "Token rotated"
        );
        Ok(Some(issued))
    }

    /// Permanently revokes a token. Idempotent.
    ///
    /// The signature must verify but expiry is ignored. Returns `Ok(false)`
    /// for input that is not a token signed by this authority.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the blacklist cannot be written. The
    /// id is still recorded in the in-process cache.
    pub async fn revoke(&self, token: &str) -> AuthResult<bool> {
        let claims = match self.codec.decode::<TokenClaims>(token) {
            Ok(data) => data.claims,
            Err(e) => {
                tracing::debug!(error = %e, "Refusing to revoke undecodable token");
                return Ok(false);
            }
        };

        self.blacklist(&claims.jti, &claims.sub).await?;
        Ok(true)
    }

    /// Revokes every token issued to `subject` up to now.
    ///
    /// Writes a per-subject epoch; tokens created at or before it are
    /// rejected as revoked. Tokens issued afterwards are stamped past the
    /// epoch even within the same millisecond. The epoch expires with the token lifetime, after
    /// which every affected token has expired anyway.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the epoch cannot be written.
    pub async fn revoke_all_for_subject(&self, subject: &str) -> AuthResult<()> {
        let epoch = unix_millis(self.ctx.clock.now());
        self.ctx
            .store
            .set(
                &self.ctx.keys.token_revoked_before(subject),
                &epoch.to_string(),
                Some(self.config.expiration),
            )
            .await?;

        self.ctx.events.record(
            self.ctx
                .events
                .event(SecurityEventKind::SubjectTokensRevoked, subject, Severity::Medium)
                .with_details(format!("revoked_before={epoch}")),
        );
        Ok(())
    }

    /// Returns how many times a token has been issued or validated.
    ///
    /// Always `0` unless usage tracking is enabled.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the counter cannot be read.
    pub async fn usage_count(&self, token_id: &str) -> AuthResult<u64> {
        let value = self
            .ctx
            .store
            .get(&self.ctx.keys.token_usage(token_id))
            .await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn mint(
        &self,
        subject: &str,
        mut extra: Map<String, Value>,
        client: &ClientFingerprint,
        refreshed_from: Option<String>,
    ) -> AuthResult<IssuedToken> {
        if subject.is_empty() {
            return Err(AuthError::internal("token subject cannot be empty"));
        }

        let before = extra.len();
        extra.retain(|name, _| !RESERVED_CLAIMS.contains(&name.as_str()));
        if extra.len() != before {
            tracing::debug!(
                dropped = before - extra.len(),
                "Dropped extra claims that shadow reserved names"
            );
        }

        let now = self.ctx.clock.now();
        let expires_at = now + self.config.expiration;
        let claims = TokenClaims {
            sub: subject.to_string(),
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            jti: uuid::Uuid::new_v4().to_string(),
            ip: client.ip_string(),
            user_agent_hash: client.user_agent_hash.clone(),
            created_at: self.creation_stamp(subject, now).await,
            refreshed_from,
            extra,
        };

        let token = self
            .codec
            .encode(&claims)
            .map_err(|e| AuthError::signing(e.to_string()))?;

        if self.config.track_usage {
            self.bump_usage(&claims.jti).await;
        }

        Ok(IssuedToken {
            token,
            token_id: claims.jti,
            expires_at,
            expires_in: self.config.expiration.as_secs(),
        })
    }

    /// Millisecond creation time, kept strictly after any revocation epoch
    /// already written for `subject` so a token minted in the same
    /// millisecond as a revoke-all survives it.
    async fn creation_stamp(&self, subject: &str, now: OffsetDateTime) -> i64 {
        let created_at = unix_millis(now);
        match self
            .ctx
            .store
            .get(&self.ctx.keys.token_revoked_before(subject))
            .await
        {
            Ok(epoch) => epoch
                .and_then(|v| v.parse::<i64>().ok())
                .map_or(created_at, |epoch| created_at.max(epoch.saturating_add(1))),
            Err(e) => {
                tracing::debug!(error = %e, "Revocation epoch unreadable at issue");
                created_at
            }
        }
    }

    async fn is_revoked(&self, claims: &TokenClaims) -> StoreResult<bool> {
        if self.revoked.lock().contains(&claims.jti) {
            return Ok(true);
        }

        let store = &self.ctx.store;
        if store
            .exists(&self.ctx.keys.token_blacklist(&claims.jti))
            .await?
        {
            self.revoked.lock().insert(claims.jti.clone());
            return Ok(true);
        }

        let epoch = store
            .get(&self.ctx.keys.token_revoked_before(&claims.sub))
            .await?
            .and_then(|v| v.parse::<i64>().ok());
        Ok(epoch.is_some_and(|epoch| claims.created_at <= epoch))
    }

    async fn blacklist(&self, token_id: &str, subject: &str) -> AuthResult<()> {
        self.revoked.lock().insert(token_id.to_string());

        let revoked_at = self.ctx.clock.now().unix_timestamp();
        self.ctx
            .store
            .set(
                &self.ctx.keys.token_blacklist(token_id),
                &revoked_at.to_string(),
                None,
            )
            .await?;

        self.ctx.events.record(
            self.ctx
                .events
                .event(SecurityEventKind::TokenRevoked, subject, Severity::Low)
                .with_details(format!("jti={token_id}")),
        );
        Ok(())
    }

    async fn bump_usage(&self, token_id: &str) {
        let key = self.ctx.keys.token_usage(token_id);
        if let Err(e) = self
            .ctx
            .store
            .incr_with_ttl(&key, self.config.expiration)
            .await
        {
            tracing::warn!(error = %e, jti = %token_id, "Failed to update token usage");
        }
    }

    fn record_mismatch(
        &self,
        claims: &TokenClaims,
        client: &ClientFingerprint,
        reason: TokenRejection,
    ) {
        self.ctx.events.record(
            self.ctx
                .events
                .event(
                    SecurityEventKind::TokenFingerprintMismatch,
                    claims.sub.as_str(),
                    Severity::High,
                )
                .with_ip(client.ip)
                .with_details(format!("{reason}; jti={}", claims.jti)),
        );
    }

    fn record_store_failure(&self, subject: &str, client: &ClientFingerprint, error: &str) {
        self.ctx.events.record(
            self.ctx
                .events
                .event(SecurityEventKind::StoreFailure, subject, Severity::High)
                .with_ip(client.ip)
                .with_details(format!("revocation check: {error}")),
        );
    }
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("issuer", &self.config.issuer)
            .field("audience", &self.config.audience)
            .field("algorithm", &self.codec.algorithm())
            .finish_non_exhaustive()
    }
}

/// Bounded set of revoked ids, evicted in insertion order.
///
/// Best-effort only; the store is authoritative across instances.
struct RevokedCache {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RevokedCache {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if self.ids.contains(&id) {
            return;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        self.ids.insert(id.clone());
        self.order.push_back(id);
    }
}

fn unix_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn duration_secs(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
