//! Register calls and responses for correlation-based callbacks

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persistence::StoreError;
use crate::serde_millis::option_duration_millis;

/// How many of a register call's correlation ids must be answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Resume once every correlation id has a response
    All,

    /// Resume on the first response for any correlation id
    First,
}

impl WaitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::First => "first",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(Self::All),
            "first" => Some(Self::First),
            _ => None,
        }
    }
}

/// A workflow instance waiting for one or more correlated responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterCall {
    /// Instance that is suspended
    pub instance_id: Uuid,

    /// Wait for all or for the first response
    pub wait_mode: WaitMode,

    /// Absolute deadline, `None` waits forever (also for unrepresentable timeouts)
    pub deadline: Option<DateTime<Utc>>,

    /// Correlation ids in registration order, never empty, no duplicates
    pub correlation_ids: Vec<String>,
}

impl RegisterCall {
    /// Create a register call
    ///
    /// Duplicate correlation ids are collapsed, keeping the first occurrence.
    /// Fails if no correlation id is given.
    pub fn new(
        instance_id: Uuid,
        wait_mode: WaitMode,
        timeout: Option<Duration>,
        correlation_ids: Vec<String>,
    ) -> Result<Self, StoreError> {
        let mut ids: Vec<String> = Vec::with_capacity(correlation_ids.len());
        for id in correlation_ids {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            return Err(StoreError::InvalidArgument(
                "register call needs at least one correlation id".into(),
            ));
        }

        let deadline = timeout.and_then(|t| {
            chrono::Duration::from_std(t)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
        });

        Ok(Self {
            instance_id,
            wait_mode,
            deadline,
            correlation_ids: ids,
        })
    }

    /// Whether the deadline has passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// A response to a correlation id
///
/// # Example
///
/// ```
/// use durable_dispatch::workflow::Response;
///
/// let ok = Response::success("payment-42", serde_json::json!({"status": "settled"}));
/// let failed = Response::failure("payment-43", "card declined");
///
/// assert!(!ok.is_failure());
/// assert!(failed.is_failure());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id this response answers
    pub correlation_id: String,

    /// Payload, or the failure reported by the responder
    pub outcome: Result<serde_json::Value, String>,

    /// When the response was created
    pub timestamp: DateTime<Utc>,

    /// How long an unmatched response is kept (storage default when `None`)
    #[serde(default, with = "option_duration_millis")]
    pub removal_timeout: Option<Duration>,
}

impl Response {
    /// A successful response
    pub fn success(correlation_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            outcome: Ok(payload),
            timestamp: Utc::now(),
            removal_timeout: None,
        }
    }

    /// A failed response
    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            outcome: Err(error.into()),
            timestamp: Utc::now(),
            removal_timeout: None,
        }
    }

    /// Keep this response for `timeout` if nobody waits for it
    pub fn with_removal_timeout(mut self, timeout: Duration) -> Self {
        self.removal_timeout = Some(timeout);
        self
    }

    pub fn is_failure(&self) -> bool {
        self.outcome.is_err()
    }

    /// When an unmatched copy of this response may be reaped
    pub fn expires_at(&self, default_timeout: Duration) -> DateTime<Utc> {
        let timeout = self.removal_timeout.unwrap_or(default_timeout);
        chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| self.timestamp.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_call_requires_correlation_id() {
        let result = RegisterCall::new(Uuid::now_v7(), WaitMode::All, None, vec![]);
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_register_call_deduplicates_in_order() {
        let call = RegisterCall::new(
            Uuid::now_v7(),
            WaitMode::All,
            None,
            vec!["b".into(), "a".into(), "b".into()],
        )
        .unwrap();

        assert_eq!(call.correlation_ids, vec!["b", "a"]);
        assert!(call.deadline.is_none());
        assert!(!call.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_register_call_deadline() {
        let call = RegisterCall::new(
            Uuid::now_v7(),
            WaitMode::First,
            Some(Duration::from_secs(60)),
            vec!["c1".into()],
        )
        .unwrap();

        assert!(!call.is_expired_at(Utc::now()));
        assert!(call.is_expired_at(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_response_expiry_uses_default() {
        let response = Response::success("c1", serde_json::json!(null));
        let expires = response.expires_at(Duration::from_secs(3600));
        assert_eq!(expires - response.timestamp, chrono::Duration::seconds(3600));

        let response = response.with_removal_timeout(Duration::from_secs(10));
        let expires = response.expires_at(Duration::from_secs(3600));
        assert_eq!(expires - response.timestamp, chrono::Duration::seconds(10));
    }

    #[test]
    fn test_wait_mode_names() {
        assert_eq!(WaitMode::parse(WaitMode::All.as_str()), Some(WaitMode::All));
        assert_eq!(WaitMode::parse(WaitMode::First.as_str()), Some(WaitMode::First));
        assert_eq!(WaitMode::parse("any"), None);
    }
}
