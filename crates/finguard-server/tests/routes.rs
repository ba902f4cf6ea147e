//! Router tests against the in-memory store.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use finguard_auth::{
    AuthenticationFacade, ClientFingerprint, CoreContext, KeyValueStore, MemoryStore,
    SecurityConfig, system_clock,
};
use finguard_server::{AppState, build_app};
use tower::ServiceExt;

const UA: &str = "finguard-web/1.0";
const IP: &str = "203.0.113.7";

fn setup() -> (Router, AuthenticationFacade, Arc<MemoryStore>) {
    let mut config = SecurityConfig::default();
    config.token.secret = "router-test-secret-with-at-least-32-bytes".to_string();

    let clock = system_clock();
    let memory = Arc::new(MemoryStore::with_clock(clock.clone()));
    let store: Arc<dyn KeyValueStore> = memory.clone();
    let ctx = CoreContext::from_config(store.clone(), clock, &config);
    let facade = AuthenticationFacade::from_config(&config, ctx).unwrap();

    let app = build_app(AppState {
        facade: facade.clone(),
        store,
    });
    (app, facade, memory)
}

async fn token_for(facade: &AuthenticationFacade, subject: &str) -> String {
    let client = ClientFingerprint::new(IP.parse().ok(), Some(UA));
    facade
        .tokens()
        .issue(subject, serde_json::Map::new(), &client)
        .await
        .unwrap()
        .token
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(uri)
        .header(header::USER_AGENT, UA)
        .header("x-real-ip", IP);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_reports_store_state() {
    let (app, _, memory) = setup();

    let response = app.clone().oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    memory.set_unavailable(true);
    let response = app.oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_me_requires_authentication() {
    let (app, facade, _) = setup();

    let response = app.clone().oneshot(get("/me", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = token_for(&facade, "u1").await;
    let response = app.oneshot(get("/me", Some(&token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_logout_revokes_the_token() {
    let (app, facade, _) = setup();
    let token = token_for(&facade, "u1").await;

    let logout = Request::builder()
        .method("POST")
        .uri("/logout")
        .header(header::USER_AGENT, UA)
        .header("x-real-ip", IP)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(logout).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/me", Some(&token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
