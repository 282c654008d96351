//! The `Succeeded` condition carried by every run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tri-state value of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// Outcome not yet known.
    #[default]
    Unknown,
    /// The run succeeded.
    True,
    /// The run failed.
    False,
}

impl ConditionStatus {
    /// Check if the status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::True | Self::False)
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
        }
    }
}

/// Machine-readable reason attached to the condition.
///
/// Each reconciler transition emits exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    /// The pod exists and not all steps have finished.
    Running,
    /// All steps completed.
    Succeeded,
    /// The pod failed.
    Failed,
    /// The task template, a resource or an image entrypoint could not be resolved.
    FailedResolution,
    /// The run's bindings do not satisfy the template (e.g. a missing parameter).
    #[serde(rename = "TaskRunValidationFailed")]
    FailedValidation,
    /// Pod creation was refused by a quota; retried with backoff.
    ExceededResourceQuota,
    /// Pod creation failed for a non-transient reason.
    CouldntGetTask,
    /// The run exceeded its timeout.
    #[serde(rename = "TaskRunTimeout")]
    Timeout,
    /// The run was cancelled by its owner.
    #[serde(rename = "TaskRunCancelled")]
    Cancelled,
}

impl Reason {
    /// The wire representation of the reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::FailedResolution => "FailedResolution",
            Self::FailedValidation => "TaskRunValidationFailed",
            Self::ExceededResourceQuota => "ExceededResourceQuota",
            Self::CouldntGetTask => "CouldntGetTask",
            Self::Timeout => "TaskRunTimeout",
            Self::Cancelled => "TaskRunCancelled",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The run's `Succeeded` condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Tri-state outcome.
    pub status: ConditionStatus,
    /// Machine-readable reason.
    pub reason: Reason,
    /// Human-readable detail.
    #[serde(default)]
    pub message: String,
    /// When `status` last changed.
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a condition stamped with the current time.
    pub fn new(status: ConditionStatus, reason: Reason, message: impl Into<String>) -> Self {
        Self {
            status,
            reason,
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Check if the condition is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_wire_names() {
        assert_eq!(Reason::Timeout.as_str(), "TaskRunTimeout");
        assert_eq!(Reason::FailedValidation.to_string(), "TaskRunValidationFailed");
        let json = serde_json::to_string(&Reason::Cancelled).ok();
        assert_eq!(json.as_deref(), Some("\"TaskRunCancelled\""));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ConditionStatus::Unknown.is_terminal());
        assert!(ConditionStatus::True.is_terminal());
        assert!(ConditionStatus::False.is_terminal());
    }
}
