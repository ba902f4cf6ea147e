//! Composition of token, attempt, and session checks for request handlers.
//!
//! The facade is the only place the three components meet. It translates
//! their internal reasons into a small external vocabulary
//! ([`AuthFailure`]) and logs the detail instead of returning it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::attempts::{ActionCheck, ActionType, AttemptGuard};
use crate::config::SecurityConfig;
use crate::context::CoreContext;
use crate::fingerprint::ClientFingerprint;
use crate::session::{NewSession, SessionRecord, SessionRegistry, SessionValidation};
use crate::token::{IssuedToken, TokenAuthority, TokenClaims, TokenValidation};
use crate::AuthResult;

/// Credentials extracted from one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Bearer token, without the `Bearer ` prefix.
    pub bearer_token: Option<String>,
    /// Session id.
    pub session_id: Option<String>,
    /// Client fingerprint.
    pub fingerprint: ClientFingerprint,
}

impl RequestContext {
    /// Creates a context with no credentials.
    #[must_use]
    pub fn anonymous(fingerprint: ClientFingerprint) -> Self {
        Self {
            bearer_token: None,
            session_id: None,
            fingerprint,
        }
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Sets the session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// How a request was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Bearer token.
    Token,
    /// Server-side session.
    Session,
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthenticatedPrincipal {
    /// Principal id (token subject or session owner).
    pub principal_id: String,
    /// Credential that succeeded.
    pub method: AuthMethod,
    /// The bearer token should be rotated.
    pub rotation_needed: bool,
    /// Token claims, for token authentication.
    pub claims: Option<TokenClaims>,
    /// Session record, for session authentication.
    pub session: Option<SessionRecord>,
}

/// Client-facing authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No valid credential.
    Unauthenticated,
    /// A credential was presented from the wrong client.
    Forbidden,
    /// The identifier is locked out.
    LockedOut {
        /// When to retry.
        retry_after: Option<Duration>,
    },
    /// Security state could not be read.
    TemporarilyUnavailable,
}

impl AuthFailure {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::LockedOut { .. } => "locked_out",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of the caller's credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialCheck {
    /// Credentials matched this principal.
    Valid {
        /// Id to use as token subject and session owner.
        principal_id: String,
    },
    /// Credentials did not match.
    Invalid,
}

/// Login options.
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    /// Create a long-lived session.
    pub remember_me: bool,
    /// Extra token claims.
    pub extra_claims: Map<String, Value>,
    /// Session metadata.
    pub session_metadata: Map<String, Value>,
}

/// Successful login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginSuccess {
    /// Authenticated principal.
    pub principal_id: String,
    /// Bearer token.
    pub token: IssuedToken,
    /// Session id.
    pub session_id: String,
    /// Token lifetime in seconds.
    pub expires_in: u64,
    /// Token age after which clients should rotate.
    #[serde(with = "humantime_serde")]
    pub rotation_after: Duration,
}

/// Failed login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginFailure {
    /// Too many failures.
    LockedOut {
        /// When to retry.
        retry_after: Option<Duration>,
        /// Failures counted so far.
        attempts: u32,
    },
    /// Wrong credentials.
    InvalidCredentials {
        /// Attempts left before lockout.
        remaining_attempts: Option<u32>,
        /// Client should present a CAPTCHA.
        require_captcha: bool,
    },
    /// Security state could not be read or written.
    Unavailable,
}

impl LoginFailure {
    /// Maps to the client-facing vocabulary.
    #[must_use]
    pub fn as_auth_failure(&self) -> AuthFailure {
        match self {
            Self::LockedOut { retry_after, .. } => AuthFailure::LockedOut {
                retry_after: *retry_after,
            },
            Self::InvalidCredentials { .. } => AuthFailure::Unauthenticated,
            Self::Unavailable => AuthFailure::TemporarilyUnavailable,
        }
    }
}

/// What logout revoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogoutOutcome {
    /// The bearer token was blacklisted.
    pub token_revoked: bool,
    /// The session was deleted.
    pub session_revoked: bool,
}

/// Sequences attempt checks, token minting, and session creation.
#[derive(Debug, Clone)]
pub struct AuthenticationFacade {
    tokens: Arc<TokenAuthority>,
    attempts: Arc<AttemptGuard>,
    sessions: Arc<SessionRegistry>,
}

impl AuthenticationFacade {
    /// Composes existing components.
    #[must_use]
    pub fn new(
        tokens: Arc<TokenAuthority>,
        attempts: Arc<AttemptGuard>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            tokens,
            attempts,
            sessions,
        }
    }

    /// Builds all three components from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if any section is invalid.
    pub fn from_config(config: &SecurityConfig, ctx: CoreContext) -> AuthResult<Self> {
        config
            .validate()
            .map_err(|e| crate::AuthError::configuration(e.to_string()))?;
        Ok(Self::new(
            Arc::new(TokenAuthority::new(config.token.clone(), ctx.clone())?),
            Arc::new(AttemptGuard::new(config.attempts.clone(), ctx.clone())?),
            Arc::new(SessionRegistry::new(config.session.clone(), ctx)?),
        ))
    }

    /// Token authority.
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenAuthority> {
        &self.tokens
    }

    /// Attempt guard.
    #[must_use]
    pub fn attempts(&self) -> &Arc<AttemptGuard> {
        &self.attempts
    }

    /// Session registry.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Authenticates a request: bearer token first, then session.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if any presented credential failed a fingerprint
    /// check, `TemporarilyUnavailable` if validity could not be confirmed,
    /// and `Unauthenticated` otherwise.
    pub async fn authenticate(
        &self,
        ctx: &RequestContext,
    ) -> Result<AuthenticatedPrincipal, AuthFailure> {
        let mut failure = None;

        if let Some(token) = ctx.bearer_token.as_deref() {
            match self.tokens.validate(token, &ctx.fingerprint).await {
                TokenValidation::Valid {
                    claims,
                    rotation_needed,
                } => {
                    return Ok(AuthenticatedPrincipal {
                        principal_id: claims.sub.clone(),
                        method: AuthMethod::Token,
                        rotation_needed,
                        claims: Some(claims),
                        session: None,
                    });
                }
                TokenValidation::Invalid(reason) => {
                    tracing::info!(
                        reason = %reason,
                        client = %ctx.fingerprint,
                        "Bearer token rejected"
                    );
                    failure = Some(if reason.is_fingerprint_mismatch() {
                        AuthFailure::Forbidden
                    } else if reason == crate::token::TokenRejection::Unavailable {
                        AuthFailure::TemporarilyUnavailable
                    } else {
                        AuthFailure::Unauthenticated
                    });
                }
            }
        }

        if let Some(session_id) = ctx.session_id.as_deref() {
            match self.sessions.validate(session_id, &ctx.fingerprint).await {
                SessionValidation::Valid(record) => {
                    return Ok(AuthenticatedPrincipal {
                        principal_id: record.principal_id.clone(),
                        method: AuthMethod::Session,
                        rotation_needed: false,
                        claims: None,
                        session: Some(record),
                    });
                }
                SessionValidation::Invalid(reason) => {
                    tracing::info!(
                        reason = %reason,
                        client = %ctx.fingerprint,
                        "Session rejected"
                    );
                    let session_failure = if reason.is_fingerprint_mismatch() {
                        AuthFailure::Forbidden
                    } else if reason == crate::session::SessionRejection::Unavailable {
                        AuthFailure::TemporarilyUnavailable
                    } else {
                        AuthFailure::Unauthenticated
                    };
                    failure = Some(worst(failure, session_failure));
                }
            }
        }

        Err(failure.unwrap_or(AuthFailure::Unauthenticated))
    }

    /// Runs a login: lockout check, attempt accounting, token, session.
    ///
    /// # Errors
    ///
    /// Returns a [`LoginFailure`] when locked out, when the credentials are
    /// invalid, or when security state cannot be written.
    pub async fn login(
        &self,
        identifier: &str,
        credentials: CredentialCheck,
        ctx: &RequestContext,
        options: LoginOptions,
    ) -> Result<LoginSuccess, LoginFailure> {
        let ip = ctx.fingerprint.ip;

        let check = self
            .attempts
            .check_action_allowed(identifier, ActionType::Login)
            .await;
        if !check.allowed {
            return Err(self.denied(identifier, &check).await);
        }

        let principal_id = match credentials {
            CredentialCheck::Valid { principal_id } => principal_id,
            CredentialCheck::Invalid => {
                let result = self
                    .attempts
                    .record_failed_attempt(identifier, ActionType::Login, ip)
                    .await;
                return Err(if result.locked && result.degraded {
                    LoginFailure::Unavailable
                } else if result.locked {
                    LoginFailure::LockedOut {
                        retry_after: result.lockout_duration,
                        attempts: result.attempts,
                    }
                } else {
                    LoginFailure::InvalidCredentials {
                        remaining_attempts: result.remaining_attempts,
                        require_captcha: result.require_captcha,
                    }
                });
            }
        };

        if let Err(e) = self
            .attempts
            .record_successful_attempt(identifier, ActionType::Login, ip)
            .await
        {
            tracing::warn!(error = %e, "Failed to reset login attempts");
        }

        let token = self
            .tokens
            .issue(&principal_id, options.extra_claims, &ctx.fingerprint)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, category = %e.category(), "Token issuance failed");
                LoginFailure::Unavailable
            })?;

        let session = self
            .sessions
            .create(
                &principal_id,
                &ctx.fingerprint,
                NewSession {
                    remember_me: options.remember_me,
                    bound_token_id: Some(token.token_id.clone()),
                    metadata: options.session_metadata,
                },
            )
            .await;
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "Session creation failed");
                if let Err(e) = self.tokens.revoke(&token.token).await {
                    tracing::warn!(error = %e, "Failed to revoke token after session failure");
                }
                return Err(LoginFailure::Unavailable);
            }
        };

        tracing::info!(principal_id = %principal_id, client = %ctx.fingerprint, "Login succeeded");
        Ok(LoginSuccess {
            principal_id,
            expires_in: token.expires_in,
            session_id: session.session_id,
            rotation_after: self.tokens.config().rotation_threshold,
            token,
        })
    }

    /// Revokes the bearer token and the session carried by the request.
    ///
    /// Store failures are logged; the outcome reports what was revoked.
    pub async fn logout(&self, ctx: &RequestContext) -> LogoutOutcome {
        let mut outcome = LogoutOutcome::default();

        if let Some(token) = ctx.bearer_token.as_deref() {
            match self.tokens.revoke(token).await {
                Ok(revoked) => outcome.token_revoked = revoked,
                Err(e) => tracing::warn!(error = %e, "Failed to revoke token on logout"),
            }
        }

        if let Some(session_id) = ctx.session_id.as_deref() {
            match self.sessions.revoke(session_id, None).await {
                Ok(revoked) => outcome.session_revoked = revoked,
                Err(e) => tracing::warn!(error = %e, "Failed to revoke session on logout"),
            }
        }

        outcome
    }

    /// Brute-force check for a non-login action.
    pub async fn check_action_allowed(&self, identifier: &str, action: ActionType) -> ActionCheck {
        self.attempts.check_action_allowed(identifier, action).await
    }

    async fn denied(&self, identifier: &str, check: &ActionCheck) -> LoginFailure {
        if check.degraded {
            return LoginFailure::Unavailable;
        }
        let attempts = match self.attempts.lockout_info(identifier, ActionType::Login).await {
            Ok(info) => info.attempts,
            Err(_) => 0,
        };
        LoginFailure::LockedOut {
            retry_after: check.retry_after,
            attempts,
        }
    }
}

/// Picks the failure that tells the client the most without leaking detail.
fn worst(current: Option<AuthFailure>, next: AuthFailure) -> AuthFailure {
    fn rank(failure: AuthFailure) -> u8 {
        match failure {
            AuthFailure::Unauthenticated => 0,
            AuthFailure::TemporarilyUnavailable => 1,
            AuthFailure::LockedOut { .. } => 2,
            AuthFailure::Forbidden => 3,
        }
    }
    match current {
        Some(current) if rank(current) >= rank(next) => current,
        _ => next,
    }
}
