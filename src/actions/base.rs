use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an action was deliberately not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    ActionAlreadyExecuted,
    ElementClosedByUser,
    ElementWaitInProgress,
    ElementNotFound,
    ElementTimeout,
    SamePageRedirect,
    RapidRedirect,
    InvalidUrl,
    Cancelled,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::ActionAlreadyExecuted => "action_already_executed",
            Rejection::ElementClosedByUser => "element_closed_by_user",
            Rejection::ElementWaitInProgress => "element_wait_in_progress",
            Rejection::ElementNotFound => "element_not_found",
            Rejection::ElementTimeout => "element_timeout",
            Rejection::SamePageRedirect => "same_page_redirect",
            Rejection::RapidRedirect => "rapid_redirect",
            Rejection::InvalidUrl => "invalid_url",
            Rejection::Cancelled => "cancelled",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Rejection::ActionAlreadyExecuted => "Action already executed",
            Rejection::ElementClosedByUser => "Element was closed by the user",
            Rejection::ElementWaitInProgress => "Already waiting for this element",
            Rejection::ElementNotFound => "No elements found",
            Rejection::ElementTimeout => "Element did not appear within timeout",
            Rejection::SamePageRedirect => "Same page redirect prevented",
            Rejection::RapidRedirect => "Rapid repeat redirect prevented",
            Rejection::InvalidUrl => "Invalid redirect URL",
            Rejection::Cancelled => "Engine shut down",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an action execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub action_id: String,
    pub action_type: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Rejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The mutation was deferred and will be applied later.
    #[serde(default)]
    pub scheduled: bool,
    #[serde(default)]
    pub elements_affected: usize,
    pub execution_time_ms: u64,
}

impl ActionOutcome {
    pub fn success(action_id: &str, action_type: &str, elements_affected: usize) -> Self {
        Self {
            action_id: action_id.to_string(),
            action_type: action_type.to_string(),
            success: true,
            reason: None,
            error: None,
            scheduled: false,
            elements_affected,
            execution_time_ms: 0,
        }
    }

    pub fn scheduled(action_id: &str, action_type: &str) -> Self {
        Self {
            scheduled: true,
            ..Self::success(action_id, action_type, 0)
        }
    }

    pub fn rejected(action_id: &str, action_type: &str, reason: Rejection) -> Self {
        Self {
            action_id: action_id.to_string(),
            action_type: action_type.to_string(),
            success: false,
            reason: Some(reason),
            error: Some(reason.message().to_string()),
            scheduled: false,
            elements_affected: 0,
            execution_time_ms: 0,
        }
    }

    pub fn with_execution_time(mut self, time_ms: u64) -> Self {
        self.execution_time_ms = time_ms;
        self
    }

    pub fn timed_out(&self) -> bool {
        self.reason == Some(Rejection::ElementTimeout)
    }
}
