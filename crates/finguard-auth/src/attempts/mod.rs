//! Brute-force attempt tracking.
//!
//! The same primitive protects login, assessment submission, password reset,
//! registration, and API throttling, parameterized by [`ActionType`].

mod action;
mod guard;
mod types;

pub use action::{ActionType, UnknownActionType};
pub use guard::{AttemptGuard, assessment_identifier};
pub use types::{ActionCheck, AttemptResult, LockoutInfo, SuspiciousActivity};
