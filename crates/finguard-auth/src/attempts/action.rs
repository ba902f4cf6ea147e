//! Protected action types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An action whose failures are counted and locked out independently.
///
/// Each variant has its own entry in
/// [`ActionPolicies`](crate::config::ActionPolicies); there is no fallback
/// policy, so an unknown action name fails to parse instead of silently
/// sharing another action's limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Password login.
    Login,
    /// Assessment submission (per principal and resource).
    AssessmentSubmission,
    /// Password reset request.
    PasswordReset,
    /// Account registration.
    Registration,
    /// Generic API request throttling.
    ApiRequest,
}

impl ActionType {
    /// Every action type, in declaration order.
    pub const ALL: [ActionType; 5] = [
        Self::Login,
        Self::AssessmentSubmission,
        Self::PasswordReset,
        Self::Registration,
        Self::ApiRequest,
    ];

    /// Returns the key segment used in store keys.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::AssessmentSubmission => "assessment",
            Self::PasswordReset => "password_reset",
            Self::Registration => "registration",
            Self::ApiRequest => "api_request",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown action name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown action type: {0}")]
pub struct UnknownActionType(pub String);

impl FromStr for ActionType {
    type Err = UnknownActionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| UnknownActionType(s.to_string()))
    }
}
