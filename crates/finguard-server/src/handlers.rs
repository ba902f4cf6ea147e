use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use finguard_auth::{AuthenticatedPrincipal, AuthenticationFacade, KeyValueStore, RequestContext};
use serde_json::json;

#[derive(Clone)]
pub struct AppState {
    pub facade: AuthenticationFacade,
    pub store: Arc<dyn KeyValueStore>,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok", "store": "ok"}))),
        Err(e) => {
            tracing::warn!(error = %e, "Health check: store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "store": "unavailable"})),
            )
        }
    }
}

/// Who the gate authenticated.
pub async fn me(Extension(principal): Extension<AuthenticatedPrincipal>) -> impl IntoResponse {
    let expires_at = principal
        .claims
        .as_ref()
        .map(|c| c.exp)
        .or_else(|| principal.session.as_ref().map(|s| s.expires_at.unix_timestamp()));

    Json(json!({
        "principal_id": principal.principal_id,
        "method": principal.method,
        "rotation_needed": principal.rotation_needed,
        "expires_at": expires_at,
    }))
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let ctx = RequestContext::from_headers(&headers, None);
    let outcome = state.facade.logout(&ctx).await;
    Json(outcome)
}
