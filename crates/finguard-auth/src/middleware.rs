//! Axum integration: request credential extraction and the require-auth gate.
//!
//! # Example
//!
//! ```ignore
//! use axum::{Extension, Router, middleware, routing::get};
//! use finguard_auth::middleware::require_auth;
//! use finguard_auth::AuthenticatedPrincipal;
//!
//! async fn me(Extension(principal): Extension<AuthenticatedPrincipal>) -> String {
//!     principal.principal_id
//! }
//!
//! let app = Router::new()
//!     .route("/me", get(me))
//!     .layer(middleware::from_fn_with_state(facade.clone(), require_auth));
//! ```

use std::net::{IpAddr, SocketAddr};

use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::facade::{AuthFailure, AuthenticationFacade, RequestContext};
use crate::fingerprint::ClientFingerprint;

/// Header carrying a session id.
pub const SESSION_HEADER: &str = "x-session-id";

/// Cookie carrying a session id.
pub const SESSION_COOKIE: &str = "session_id";

/// Response header set when the bearer token should be rotated.
pub const TOKEN_ROTATION_HEADER: HeaderName = HeaderName::from_static("x-token-rotation");

/// Generic client-facing message; the specific reason is only logged.
const FAILURE_MESSAGE: &str = "authentication failed";

impl RequestContext {
    /// Extracts credentials and the client fingerprint from request headers.
    ///
    /// The client IP is the first `X-Forwarded-For` entry, else `X-Real-IP`,
    /// else `peer`.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, peer: Option<IpAddr>) -> Self {
        let bearer_token = header_str(headers, header::AUTHORIZATION.as_str())
            .and_then(bearer_credentials)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string);

        let session_id = header_str(headers, SESSION_HEADER)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .or_else(|| session_from_cookie(headers));

        let ip = client_ip(headers).or(peer);
        let user_agent = header_str(headers, header::USER_AGENT.as_str());

        Self {
            bearer_token,
            session_id,
            fingerprint: ClientFingerprint::new(ip, user_agent),
        }
    }
}

/// Middleware that rejects unauthenticated requests.
///
/// On success the [`AuthenticatedPrincipal`](crate::AuthenticatedPrincipal)
/// is inserted into request extensions and, when the token is due for
/// rotation, the response carries `X-Token-Rotation: recommended`.
pub async fn require_auth(
    State(facade): State<AuthenticationFacade>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let ctx = RequestContext::from_headers(request.headers(), peer);

    let principal = match facade.authenticate(&ctx).await {
        Ok(principal) => principal,
        Err(failure) => return failure.into_response(),
    };

    let rotation_needed = principal.rotation_needed;
    tracing::debug!(
        principal_id = %principal.principal_id,
        method = ?principal.method,
        "Request authenticated"
    );
    request.extensions_mut().insert(principal);

    let mut response = next.run(request).await;
    if rotation_needed {
        response.headers_mut().insert(
            TOKEN_ROTATION_HEADER,
            HeaderValue::from_static("recommended"),
        );
    }
    response
}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        let body = json!({
            "error": self.code(),
            "message": FAILURE_MESSAGE,
        });

        let mut headers = HeaderMap::new();
        if status == StatusCode::UNAUTHORIZED {
            headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        if let AuthFailure::LockedOut {
            retry_after: Some(retry_after),
        } = self
        {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                headers.insert(header::RETRY_AFTER, value);
            }
        }

        (status, headers, Json(body)).into_response()
    }
}

/// Maps a failure to its HTTP status.
#[must_use]
pub fn status_code(failure: &AuthFailure) -> StatusCode {
    match failure {
        AuthFailure::Unauthenticated => StatusCode::UNAUTHORIZED,
        AuthFailure::Forbidden => StatusCode::FORBIDDEN,
        AuthFailure::LockedOut { .. } => StatusCode::TOO_MANY_REQUESTS,
        AuthFailure::TemporarilyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| header_str(headers, "x-real-ip").and_then(|v| v.trim().parse().ok()))
}

/// Credentials of an `Authorization: Bearer <token>` header. The scheme
/// name is matched case-insensitively.
fn bearer_credentials(value: &str) -> Option<&str> {
    let (scheme, credentials) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then_some(credentials)
}

fn session_from_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::hash_user_agent;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_extracts_bearer_and_user_agent() {
        let ctx = RequestContext::from_headers(
            &headers(&[
                ("authorization", "Bearer abc.def.ghi"),
                ("user-agent", "Mozilla/5.0"),
            ]),
            "10.0.0.1".parse().ok(),
        );
        assert_eq!(ctx.bearer_token.as_deref(), Some("abc.def.ghi"));
        assert!(ctx.session_id.is_none());
        assert_eq!(ctx.fingerprint.ip, "10.0.0.1".parse().ok());
        assert_eq!(ctx.fingerprint.user_agent_hash, hash_user_agent("Mozilla/5.0"));
    }

    #[test]
    fn test_forwarded_for_wins_over_peer() {
        let ctx = RequestContext::from_headers(
            &headers(&[
                ("x-forwarded-for", "1.2.3.4, 10.0.0.2"),
                ("x-real-ip", "5.6.7.8"),
            ]),
            "10.0.0.1".parse().ok(),
        );
        assert_eq!(ctx.fingerprint.ip, "1.2.3.4".parse().ok());

        let ctx = RequestContext::from_headers(&headers(&[("x-real-ip", "5.6.7.8")]), None);
        assert_eq!(ctx.fingerprint.ip, "5.6.7.8".parse().ok());
    }

    #[test]
    fn test_session_from_header_or_cookie() {
        let ctx = RequestContext::from_headers(&headers(&[("x-session-id", "s-header")]), None);
        assert_eq!(ctx.session_id.as_deref(), Some("s-header"));

        let ctx = RequestContext::from_headers(
            &headers(&[("cookie", "theme=dark; session_id=s-cookie")]),
            None,
        );
        assert_eq!(ctx.session_id.as_deref(), Some("s-cookie"));
    }

    #[test]
    fn test_bearer_scheme_is_case_insensitive() {
        for value in ["bearer abc", "BEARER abc", "BeArEr   abc"] {
            let ctx = RequestContext::from_headers(&headers(&[("authorization", value)]), None);
            assert_eq!(ctx.bearer_token.as_deref(), Some("abc"), "{value}");
        }
        let ctx = RequestContext::from_headers(&headers(&[("authorization", "Bearerabc")]), None);
        assert!(ctx.bearer_token.is_none());
    }

    #[test]
    fn test_non_bearer_authorization_is_ignored() {
        let ctx =
            RequestContext::from_headers(&headers(&[("authorization", "Basic dXNlcjpwYXNz")]), None);
        assert!(ctx.bearer_token.is_none());
    }

    #[test]
    fn test_failure_statuses() {
        assert_eq!(
            status_code(&AuthFailure::Unauthenticated),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_code(&AuthFailure::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(
            status_code(&AuthFailure::LockedOut { retry_after: None }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_code(&AuthFailure::TemporarilyUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_locked_out_response_sets_retry_after() {
        let response = AuthFailure::LockedOut {
            retry_after: Some(std::time::Duration::from_secs(90)),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "90");
    }
}
