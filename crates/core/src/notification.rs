//! Per-target notification delivery bookkeeping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Delivery state of one notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Not yet delivered; will be retried.
    #[default]
    Unknown,
    /// Delivered. Never reverts.
    Sent,
    /// Attempt budget spent without a successful delivery.
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Sent => write!(f, "Sent"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Delivery record for one notification target of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDeliveryRecord {
    /// Address the event is sent to.
    pub target: String,
    /// Output resource this record belongs to.
    #[serde(default)]
    pub resource: String,
    /// Last error message; empty after a successful delivery.
    #[serde(default)]
    pub message: String,
    /// Number of attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    /// Current delivery state.
    #[serde(default)]
    pub status: DeliveryStatus,
}

impl NotificationDeliveryRecord {
    /// A fresh record: no attempts, status Unknown.
    pub fn new(target: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            resource: resource.into(),
            message: String::new(),
            attempts: 0,
            status: DeliveryStatus::Unknown,
        }
    }

    /// Check whether another attempt may be made within `max_attempts`.
    #[must_use]
    pub fn is_pending(&self, max_attempts: u32) -> bool {
        self.status == DeliveryStatus::Unknown && self.attempts < max_attempts
    }

    /// Record a successful attempt.
    pub fn record_sent(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.message.clear();
        self.status = DeliveryStatus::Sent;
    }

    /// Record a failed attempt; the record becomes Failed once the budget is spent.
    pub fn record_failure(&mut self, message: impl Into<String>, max_attempts: u32) {
        self.attempts = self.attempts.saturating_add(1);
        self.message = message.into();
        self.status = if self.attempts >= max_attempts {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Unknown
        };
    }
}
