//! # finguard-auth
//!
//! Security core for the Finguard personal-finance backend.
//!
//! This crate provides:
//! - Signed bearer tokens with revocation, rotation, and client binding
//! - Brute-force protection with progressive lockouts
//! - Server-side sessions bound to a client fingerprint
//! - A facade that composes the three for request handlers
//!
//! All shared state lives behind [`KeyValueStore`], so any number of
//! service replicas see the same revocations, counters, and sessions.
//!
//! ## Modules
//!
//! - [`token`] - Token issue, validation, rotation, and revocation
//! - [`attempts`] - Attempt counting and lockouts per action
//! - [`session`] - Session registry
//! - [`facade`] - Composition for request handlers
//! - [`middleware`] - Axum gate built on the facade
//! - [`store`] - Key/value store abstraction and in-memory implementation
//! - [`audit`] - Security event log
//! - [`config`] - Configuration and validation
//! - [`clock`] - Time source
//! - [`cleanup`] - Background session sweeping

pub mod attempts;
pub mod audit;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod fingerprint;
pub mod middleware;
pub mod session;
pub mod store;
pub mod token;

pub use attempts::{
    ActionCheck, ActionType, AttemptGuard, AttemptResult, LockoutInfo, SuspiciousActivity,
};
pub use audit::{SecurityEvent, SecurityEventKind, SecurityEventLog, Severity};
pub use cleanup::spawn_cleanup_task;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use config::{
    ActionPolicies, ActionPolicy, AttemptConfig, ConfigError, SecurityConfig, SessionConfig,
    StoreFailurePolicy, TokenConfig,
};
pub use context::CoreContext;
pub use error::{AuthError, ErrorCategory};
pub use facade::{
    AuthFailure, AuthMethod, AuthenticatedPrincipal, AuthenticationFacade, CredentialCheck,
    LoginFailure, LoginOptions, LoginSuccess, LogoutOutcome, RequestContext,
};
pub use fingerprint::ClientFingerprint;
pub use middleware::require_auth;
pub use session::{NewSession, SessionRecord, SessionRegistry, SessionValidation};
pub use store::{KeyValueStore, Keyspace, MemoryStore, StoreError, StoreResult};
pub use token::{IssuedToken, TokenAuthority, TokenClaims, TokenRejection, TokenValidation};

/// Type alias for security core results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use finguard_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::attempts::{ActionCheck, ActionType, AttemptGuard, AttemptResult};
    pub use crate::config::{ConfigError, SecurityConfig};
    pub use crate::context::CoreContext;
    pub use crate::error::{AuthError, ErrorCategory};
    pub use crate::facade::{
        AuthFailure, AuthenticatedPrincipal, AuthenticationFacade, CredentialCheck, LoginOptions,
        RequestContext,
    };
    pub use crate::fingerprint::ClientFingerprint;
    pub use crate::middleware::require_auth;
    pub use crate::session::{SessionRecord, SessionRegistry};
    pub use crate::store::{KeyValueStore, MemoryStore};
    pub use crate::token::{TokenAuthority, TokenValidation};
}
