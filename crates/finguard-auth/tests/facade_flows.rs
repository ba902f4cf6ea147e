//! End-to-end flows through the authentication facade.
//!
//! Every test runs against the in-memory store and a manual clock, so
//! expiry and lockout windows are driven without sleeping.

use std::sync::Arc;
use std::time::Duration;

use finguard_auth::prelude::*;
use finguard_auth::{
    ActionPolicy, AuthMethod, LoginFailure, ManualClock, SecurityEventKind, TokenRejection,
};
use time::macros::datetime;

const SECRET: &str = "integration-secret-with-at-least-32-bytes!";

struct Harness {
    facade: AuthenticationFacade,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    ctx: CoreContext,
}

fn harness_with(configure: impl FnOnce(&mut SecurityConfig)) -> Harness {
    let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 09:00 UTC)));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));

    let mut config = SecurityConfig::default();
    config.token.secret = SECRET.to_string();
    configure(&mut config);

    let ctx = CoreContext::from_config(store.clone(), clock.clone(), &config);
    let facade = AuthenticationFacade::from_config(&config, ctx.clone()).expect("valid config");
    Harness {
        facade,
        store,
        clock,
        ctx,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn laptop() -> ClientFingerprint {
    ClientFingerprint::new("1.2.3.4".parse().ok(), Some("Mozilla/5.0 (X11; Linux x86_64)"))
}

fn valid(principal_id: &str) -> CredentialCheck {
    CredentialCheck::Valid {
        principal_id: principal_id.to_string(),
    }
}

async fn login(h: &Harness, client: &ClientFingerprint) -> finguard_auth::LoginSuccess {
    h.facade
        .login(
            "a@b.com",
            valid("u1"),
            &RequestContext::anonymous(client.clone()),
            LoginOptions::default(),
        )
        .await
        .expect("login succeeds")
}

// =============================================================================
// Login and authenticate
// =============================================================================

#[tokio::test]
async fn test_login_then_authenticate_with_token_and_session() {
    let h = harness();
    let client = laptop();
    let success = login(&h, &client).await;

    assert_eq!(success.principal_id, "u1");
    assert_eq!(success.expires_in, 3600);
    assert_eq!(success.rotation_after, Duration::from_secs(1800));

    let by_token = h
        .facade
        .authenticate(&RequestContext::anonymous(client.clone()).with_bearer(&success.token.token))
        .await
        .expect("token authenticates");
    assert_eq!(by_token.principal_id, "u1");
    assert_eq!(by_token.method, AuthMethod::Token);
    assert!(!by_token.rotation_needed);

    let by_session = h
        .facade
        .authenticate(&RequestContext::anonymous(client).with_session(&success.session_id))
        .await
        .expect("session authenticates");
    assert_eq!(by_session.method, AuthMethod::Session);
    let record = by_session.session.expect("session record");
    assert_eq!(record.bound_token_id.as_deref(), Some(success.token.token_id.as_str()));
}

#[tokio::test]
async fn test_anonymous_request_is_unauthenticated() {
    let h = harness();
    let result = h
        .facade
        .authenticate(&RequestContext::anonymous(laptop()))
        .await;
    assert_eq!(result.unwrap_err(), AuthFailure::Unauthenticated);
}

#[tokio::test]
async fn test_bad_token_falls_back_to_session() {
    let h = harness();
    let client = laptop();
    let success = login(&h, &client).await;

    let principal = h
        .facade
        .authenticate(
            &RequestContext::anonymous(client)
                .with_bearer("not-a-jwt")
                .with_session(&success.session_id),
        )
        .await
        .expect("session still valid");
    assert_eq!(principal.method, AuthMethod::Session);
}

#[tokio::test]
async fn test_token_from_other_ip_is_forbidden() {
    let h = harness();
    let success = login(&h, &laptop()).await;

    let elsewhere = ClientFingerprint::new(
        "9.9.9.9".parse().ok(),
        Some("Mozilla/5.0 (X11; Linux x86_64)"),
    );
    let result = h
        .facade
        .authenticate(&RequestContext::anonymous(elsewhere.clone()).with_bearer(&success.token.token))
        .await;
    assert_eq!(result.unwrap_err(), AuthFailure::Forbidden);

    assert_eq!(
        h.facade
            .tokens()
            .validate(&success.token.token, &elsewhere)
            .await
            .rejection(),
        Some(TokenRejection::IpMismatch)
    );
}

#[tokio::test]
async fn test_ip_binding_disabled_accepts_roaming_client() {
    let h = harness_with(|c| c.token.bind_ip = false);
    let success = login(&h, &laptop()).await;

    let roaming = ClientFingerprint::new(
        "9.9.9.9".parse().ok(),
        Some("Mozilla/5.0 (X11; Linux x86_64)"),
    );
    assert!(
        h.facade
            .tokens()
            .validate(&success.token.token, &roaming)
            .await
            .is_valid()
    );
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let h = harness();
    let client = laptop();
    let success = login(&h, &client).await;

    h.clock.advance(Duration::from_secs(3601));
    assert_eq!(
        h.facade
            .tokens()
            .validate(&success.token.token, &client)
            .await
            .rejection(),
        Some(TokenRejection::Expired)
    );
}

#[tokio::test]
async fn test_aged_token_recommends_rotation() {
    let h = harness();
    let client = laptop();
    let success = login(&h, &client).await;

    h.clock.advance(Duration::from_secs(31 * 60));
    let principal = h
        .facade
        .authenticate(&RequestContext::anonymous(client.clone()).with_bearer(&success.token.token))
        .await
        .unwrap();
    assert!(principal.rotation_needed);

    let rotated = h
        .facade
        .tokens()
        .rotate(&success.token.token, &client)
        .await
        .unwrap()
        .expect("valid token rotates");
    assert_ne!(rotated.token_id, success.token.token_id);

    let old = h
        .facade
        .tokens()
        .validate(&success.token.token, &client)
        .await;
    assert_eq!(old.rejection(), Some(TokenRejection::Revoked));

    let new = h.facade.tokens().validate(&rotated.token, &client).await;
    let claims = new.claims().expect("rotated token valid");
    assert_eq!(
        claims.refreshed_from.as_deref(),
        Some(success.token.token_id.as_str())
    );
}

// =============================================================================
// Logout and revocation
// =============================================================================

#[tokio::test]
async fn test_logout_revokes_token_and_session() {
    let h = harness();
    let client = laptop();
    let success = login(&h, &client).await;
    let request = RequestContext::anonymous(client.clone())
        .with_bearer(&success.token.token)
        .with_session(&success.session_id);

    let outcome = h.facade.logout(&request).await;
    assert!(outcome.token_revoked);
    assert!(outcome.session_revoked);

    for _ in 0..3 {
        assert_eq!(
            h.facade.authenticate(&request).await.unwrap_err(),
            AuthFailure::Unauthenticated
        );
    }

    // Still revoked right up to natural expiry.
    h.clock.advance(Duration::from_secs(3599));
    assert_eq!(
        h.facade
            .tokens()
            .validate(&success.token.token, &client)
            .await
            .rejection(),
        Some(TokenRejection::Revoked)
    );
}

#[tokio::test]
async fn test_revoke_all_for_subject_invalidates_earlier_tokens() {
    let h = harness();
    let client = laptop();
    let first = login(&h, &client).await;
    h.clock.advance(Duration::from_secs(5));
    let second = login(&h, &client).await;

    h.clock.advance(Duration::from_secs(5));
    h.facade.tokens().revoke_all_for_subject("u1").await.unwrap();

    for token in [&first.token.token, &second.token.token] {
        assert_eq!(
            h.facade.tokens().validate(token, &client).await.rejection(),
            Some(TokenRejection::Revoked)
        );
    }

    h.clock.advance(Duration::from_secs(1));
    let fresh = login(&h, &client).await;
    assert!(
        h.facade
            .tokens()
            .validate(&fresh.token.token, &client)
            .await
            .is_valid()
    );
}

// =============================================================================
// Brute-force protection
// =============================================================================

#[tokio::test]
async fn test_three_failures_lock_the_login() {
    let h = harness_with(|c| {
        c.attempts.policies.login = ActionPolicy::new(3, Duration::from_secs(900), Duration::from_secs(60));
    });
    let request = RequestContext::anonymous(laptop());

    for expected_remaining in [2, 1] {
        let failure = h
            .facade
            .login("a@b.com", CredentialCheck::Invalid, &request, LoginOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            failure,
            LoginFailure::InvalidCredentials {
                remaining_attempts: Some(expected_remaining),
                require_captcha: false,
            }
        );
    }

    let third = h
        .facade
        .login("a@b.com", CredentialCheck::Invalid, &request, LoginOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        third,
        LoginFailure::LockedOut {
            retry_after: Some(Duration::from_secs(60)),
            attempts: 3,
        }
    );
    assert!(
        h.facade
            .attempts()
            .is_locked_out("a@b.com", ActionType::Login)
            .await
    );

    // Correct credentials are refused while locked.
    let blocked = h
        .facade
        .login("a@b.com", valid("u1"), &request, LoginOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(blocked, LoginFailure::LockedOut { attempts: 3, .. }));
    assert!(matches!(
        blocked.as_auth_failure(),
        AuthFailure::LockedOut { retry_after: Some(_) }
    ));

    h.clock.advance(Duration::from_secs(61));
    assert!(
        h.facade
            .login("a@b.com", valid("u1"), &request, LoginOptions::default())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_successful_login_resets_the_counter() {
    let h = harness();
    let request = RequestContext::anonymous(laptop());

    for _ in 0..3 {
        let _ = h
            .facade
            .login("a@b.com", CredentialCheck::Invalid, &request, LoginOptions::default())
            .await;
    }
    h.facade
        .login("a@b.com", valid("u1"), &request, LoginOptions::default())
        .await
        .unwrap();

    let result = h
        .facade
        .attempts()
        .record_failed_attempt("a@b.com", ActionType::Login, None)
        .await;
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn test_whitelisted_identifier_is_never_locked() {
    let h = harness_with(|c| c.attempts.whitelisted_identifiers = vec!["ops@b.com".to_string()]);
    let request = RequestContext::anonymous(laptop());

    for _ in 0..20 {
        let failure = h
            .facade
            .login("ops@b.com", CredentialCheck::Invalid, &request, LoginOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(failure, LoginFailure::InvalidCredentials { .. }));
    }
    assert!(
        !h.facade
            .attempts()
            .is_locked_out("ops@b.com", ActionType::Login)
            .await
    );
}

#[tokio::test]
async fn test_assessment_submission_protection_is_independent_of_login() {
    let h = harness();
    let guard = h.facade.attempts();
    let identifier = finguard_auth::attempts::assessment_identifier("u1", "risk-profile");

    for _ in 0..3 {
        guard
            .record_failed_attempt(&identifier, ActionType::AssessmentSubmission, None)
            .await;
    }

    let check = guard
        .check_assessment_submission_protection("u1", "risk-profile")
        .await;
    assert!(!check.allowed);
    assert_eq!(check.reason.as_deref(), Some("too many submission attempts"));

    assert!(
        h.facade
            .check_action_allowed("u1", ActionType::Login)
            .await
            .allowed
    );
    assert!(
        guard
            .check_assessment_submission_protection("u1", "other-profile")
            .await
            .allowed
    );
}

// =============================================================================
// Sessions
// =============================================================================

#[tokio::test]
async fn test_session_hijack_destroys_the_session() {
    let h = harness();
    let client = laptop();
    let success = login(&h, &client).await;

    let hijacker = ClientFingerprint::new("1.2.3.4".parse().ok(), Some("curl/8.0"));
    let result = h
        .facade
        .authenticate(&RequestContext::anonymous(hijacker).with_session(&success.session_id))
        .await;
    assert_eq!(result.unwrap_err(), AuthFailure::Forbidden);

    let result = h
        .facade
        .authenticate(&RequestContext::anonymous(client).with_session(&success.session_id))
        .await;
    assert_eq!(result.unwrap_err(), AuthFailure::Unauthenticated);

    let events = h.ctx.events.recent(10);
    assert!(
        events
            .iter()
            .any(|e| e.kind == SecurityEventKind::SessionHijackSuspected)
    );
}

#[tokio::test]
async fn test_concurrent_session_cap_evicts_oldest() {
    let h = harness_with(|c| c.session.max_concurrent_sessions = 2);
    let client = laptop();

    let first = login(&h, &client).await;
    h.clock.advance(Duration::from_secs(1));
    let second = login(&h, &client).await;
    h.clock.advance(Duration::from_secs(1));
    let third = login(&h, &client).await;

    let live: Vec<_> = h
        .facade
        .sessions()
        .list_sessions("u1")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    assert_eq!(live, vec![second.session_id, third.session_id]);
    assert!(!live.contains(&first.session_id));
}

#[tokio::test]
async fn test_remember_me_outlives_regular_session() {
    let h = harness();
    let client = laptop();
    let remembered = h
        .facade
        .login(
            "a@b.com",
            valid("u1"),
            &RequestContext::anonymous(client.clone()),
            LoginOptions {
                remember_me: true,
                ..LoginOptions::default()
            },
        )
        .await
        .unwrap();
    let regular = login(&h, &client).await;

    h.clock.advance(Duration::from_secs(2 * 3600));
    let sessions = h.facade.sessions();
    assert!(sessions.validate(&remembered.session_id, &client).await.is_valid());
    assert!(!sessions.validate(&regular.session_id, &client).await.is_valid());
}

// =============================================================================
// Store outages
// =============================================================================

#[tokio::test]
async fn test_store_outage_fails_token_validation_closed() {
    let h = harness();
    let client = laptop();
    let success = login(&h, &client).await;

    h.store.set_unavailable(true);
    let result = h
        .facade
        .authenticate(&RequestContext::anonymous(client.clone()).with_bearer(&success.token.token))
        .await;
    assert_eq!(result.unwrap_err(), AuthFailure::TemporarilyUnavailable);

    h.store.set_unavailable(false);
    assert!(
        h.facade
            .authenticate(&RequestContext::anonymous(client).with_bearer(&success.token.token))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_store_outage_fails_login_protection_open() {
    let h = harness();
    h.store.set_unavailable(true);

    let check = h.facade.check_action_allowed("a@b.com", ActionType::Login).await;
    assert!(check.allowed);
    assert!(check.degraded);

    let failure = h
        .facade
        .login(
            "a@b.com",
            CredentialCheck::Invalid,
            &RequestContext::anonymous(laptop()),
            LoginOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(failure, LoginFailure::InvalidCredentials { .. }));
}

#[tokio::test]
async fn test_fail_closed_login_policy_reports_unavailable() {
    let h = harness_with(|c| {
        c.attempts.policies.login.store_failure = finguard_auth::StoreFailurePolicy::FailClosed;
    });
    h.store.set_unavailable(true);

    let failure = h
        .facade
        .login(
            "a@b.com",
            valid("u1"),
            &RequestContext::anonymous(laptop()),
            LoginOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(failure, LoginFailure::Unavailable);
    assert_eq!(
        failure.as_auth_failure(),
        AuthFailure::TemporarilyUnavailable
    );
}
