//! Notification delivery for finished runs.
//!
//! Every cloud-event output of a run gets one delivery record. Once the run
//! is terminal each pending record is sent one attempt per dispatch, all
//! records concurrently, until it is Sent or its attempt budget is spent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use stepwise_core::{ConditionStatus, DeliveryStatus, Run, RunKey};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Event type for runs that succeeded.
pub const EVENT_TYPE_SUCCESSFUL: &str = "dev.tekton.event.task.successful.v1";
/// Event type for runs that failed.
pub const EVENT_TYPE_FAILED: &str = "dev.tekton.event.task.failed.v1";
/// Event type for runs whose outcome is unknown.
pub const EVENT_TYPE_UNKNOWN: &str = "dev.tekton.event.task.unknown.v1";

const SPEC_VERSION: &str = "1.0";

/// A CloudEvents-style notification about a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloudEvent {
    /// Unique event id.
    pub id: String,
    /// Path of the run that produced the event.
    pub source: String,
    /// One of the `EVENT_TYPE_*` constants.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Output resource the event is delivered for.
    pub subject: String,
    /// CloudEvents spec version.
    #[serde(rename = "specversion")]
    pub spec_version: String,
    /// Snapshot of the run.
    pub data: serde_json::Value,
}

impl CloudEvent {
    /// Build the event for `run`, delivered on behalf of output `resource`.
    #[must_use]
    pub fn for_run(run: &Run, resource: &str) -> Self {
        let event_type = match run.status.condition_status() {
            ConditionStatus::True => EVENT_TYPE_SUCCESSFUL,
            ConditionStatus::False => EVENT_TYPE_FAILED,
            ConditionStatus::Unknown => EVENT_TYPE_UNKNOWN,
        };
        let data = serde_json::to_value(run)
            .map(|run| serde_json::json!({ "taskRun": run }))
            .unwrap_or(serde_json::Value::Null);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: format!(
                "/apis/tekton.dev/v1alpha1/namespaces/{}/taskruns/{}",
                run.metadata.namespace, run.metadata.name
            ),
            event_type: event_type.to_string(),
            subject: resource.to_string(),
            spec_version: SPEC_VERSION.to_string(),
            data,
        }
    }
}

/// Failure to deliver one event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The request could not be sent or timed out.
    #[error("request failed: {reason}")]
    Request { reason: String },

    /// The receiver answered with a non-success status.
    #[error("receiver answered with status {status}")]
    Status { status: u16 },
}

impl SinkError {
    /// Create a request error.
    pub fn request(reason: impl Into<String>) -> Self {
        Self::Request {
            reason: reason.into(),
        }
    }
}

/// Transport for notification events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver `event` to `target`.
    async fn send(&self, target: &str, event: &CloudEvent) -> Result<(), SinkError>;
}

/// Delivers events as binary-mode CloudEvents over HTTP.
pub struct HttpEventSink {
    client: reqwest::Client,
}

impl HttpEventSink {
    /// Create a sink whose requests time out after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Request`] if the HTTP client cannot be built.
    pub fn new(request_timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SinkError::request(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn send(&self, target: &str, event: &CloudEvent) -> Result<(), SinkError> {
        let response = self
            .client
            .post(target)
            .header("ce-id", &event.id)
            .header("ce-source", &event.source)
            .header("ce-type", &event.event_type)
            .header("ce-subject", &event.subject)
            .header("ce-specversion", &event.spec_version)
            .json(&event.data)
            .send()
            .await
            .map_err(|e| SinkError::request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Status {
                status: status.as_u16(),
            })
        }
    }
}

/// Dispatch was requested for a run that has not finished.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Events are only sent for terminal runs.
    #[error("run '{key}' is not finished")]
    NotTerminal { key: RunKey },
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Records attempted in this dispatch.
    pub attempted: usize,
    /// Records delivered in this dispatch.
    pub sent: usize,
    /// Records that failed in this dispatch (retryable or not).
    pub failed: usize,
    /// Records still eligible for another attempt.
    pub pending: usize,
}

impl DispatchReport {
    /// Check whether any record changed.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.attempted > 0
    }
}

/// Sends run-completion events and keeps the delivery records up to date.
pub struct NotificationDispatcher {
    sink: Arc<dyn EventSink>,
    max_attempts: u32,
}

impl NotificationDispatcher {
    /// Create a dispatcher allowing `max_attempts` attempts per record.
    pub fn new(sink: Arc<dyn EventSink>, max_attempts: u32) -> Self {
        Self { sink, max_attempts }
    }

    /// Attempt budget per record.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Check whether any record of `run` would be attempted by [`dispatch`](Self::dispatch).
    #[must_use]
    pub fn has_pending(&self, run: &Run) -> bool {
        run.status
            .cloud_events
            .iter()
            .any(|r| r.is_pending(self.max_attempts))
    }

    /// Make one delivery attempt for every pending record of a terminal run.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotTerminal`] if the run has not finished.
    /// Delivery failures are recorded on the records, never returned.
    pub async fn dispatch(&self, run: &mut Run) -> Result<DispatchReport, DispatchError> {
        if !run.status.is_done() {
            return Err(DispatchError::NotTerminal { key: run.key() });
        }

        let snapshot = &*run;
        let attempts = snapshot
            .status
            .cloud_events
            .iter()
            .enumerate()
            .filter(|(_, record)| record.is_pending(self.max_attempts))
            .map(|(index, record)| {
                let event = CloudEvent::for_run(snapshot, &record.resource);
                let target = record.target.clone();
                async move {
                    let result = self.sink.send(&target, &event).await;
                    (index, result)
                }
            })
            .collect::<Vec<_>>();

        let outcomes = join_all(attempts).await;

        let mut report = DispatchReport {
            attempted: outcomes.len(),
            ..DispatchReport::default()
        };
        let key = run.key();
        for (index, outcome) in outcomes {
            let Some(record) = run.status.cloud_events.get_mut(index) else {
                continue;
            };
            match outcome {
                Ok(()) => {
                    record.record_sent();
                    report.sent = report.sent.saturating_add(1);
                    info!(key = %key, target = %record.target, "notification sent");
                }
                Err(e) => {
                    record.record_failure(e.to_string(), self.max_attempts);
                    report.failed = report.failed.saturating_add(1);
                    warn!(
                        key = %key,
                        target = %record.target,
                        attempts = record.attempts,
                        exhausted = record.status == DeliveryStatus::Failed,
                        error = %e,
                        "notification delivery failed"
                    );
                }
            }
        }

        report.pending = run
            .status
            .cloud_events
            .iter()
            .filter(|r| r.is_pending(self.max_attempts))
            .count();
        debug!(key = %key, ?report, "dispatch finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEventSink;
    use stepwise_core::{NotificationDeliveryRecord, Reason};

    fn finished_run(targets: &[&str]) -> Run {
        let mut run = Run::new("foo", "test-taskrun");
        run.status.mark_succeeded("All Steps have completed executing");
        run.status.cloud_events = targets
            .iter()
            .enumerate()
            .map(|(i, t)| NotificationDeliveryRecord::new(*t, format!("ce-{i}")))
            .collect();
        run
    }

    /// Given a run that is still running
    /// When dispatch is called
    /// Then nothing is sent
    #[tokio::test]
    async fn running_run_is_not_dispatched() {
        let sink = Arc::new(InMemoryEventSink::new());
        let dispatcher = NotificationDispatcher::new(sink.clone(), 3);
        let mut run = Run::new("foo", "bar");
        run.status.mark_unknown(Reason::Running, "running");
        run.status.cloud_events = vec![NotificationDeliveryRecord::new("http://a", "ce")];

        let result = dispatcher.dispatch(&mut run).await;

        assert!(matches!(result, Err(DispatchError::NotTerminal { .. })));
        assert_eq!(sink.sent_count(), 0);
    }

    /// Given two notification targets and a finished run
    /// When dispatch is called twice
    /// Then each target receives one event and the second call sends nothing
    #[tokio::test]
    async fn sent_records_are_not_resent() {
        let sink = Arc::new(InMemoryEventSink::new());
        let dispatcher = NotificationDispatcher::new(sink.clone(), 3);
        let mut run = finished_run(&["http://a", "http://b"]);

        let first = dispatcher.dispatch(&mut run).await.ok();
        let second = dispatcher.dispatch(&mut run).await.ok();

        assert_eq!(first.map(|r| r.sent), Some(2));
        assert_eq!(second.map(|r| r.attempted), Some(0));
        assert_eq!(sink.sent_count(), 2);
        assert!(run
            .status
            .cloud_events
            .iter()
            .all(|r| r.status == DeliveryStatus::Sent && r.attempts == 1));
    }

    /// Given one failing and one healthy target
    /// When dispatch is called
    /// Then the healthy target is delivered and the failing one stays Unknown
    #[tokio::test]
    async fn failing_target_does_not_block_others() {
        let sink = Arc::new(InMemoryEventSink::new());
        sink.fail_target("http://down");
        let dispatcher = NotificationDispatcher::new(sink.clone(), 2);
        let mut run = finished_run(&["http://down", "http://up"]);

        let report = dispatcher.dispatch(&mut run).await.ok();

        assert_eq!(report.map(|r| (r.sent, r.failed, r.pending)), Some((1, 1, 1)));
        let down = run.status.cloud_events.first();
        assert_eq!(down.map(|r| r.status), Some(DeliveryStatus::Unknown));
        assert!(down.is_some_and(|r| !r.message.is_empty()));

        let _ = dispatcher.dispatch(&mut run).await;
        let down = run.status.cloud_events.first();
        assert_eq!(down.map(|r| (r.status, r.attempts)), Some((DeliveryStatus::Failed, 2)));
        assert_eq!(sink.sent_count(), 1);
    }

    #[test]
    fn event_type_follows_condition() {
        let mut run = Run::new("foo", "bar");
        run.status.mark_failed(Reason::Failed, "boom");
        let event = CloudEvent::for_run(&run, "ce");
        assert_eq!(event.event_type, EVENT_TYPE_FAILED);
        assert_eq!(event.subject, "ce");
        assert!(event.source.ends_with("/namespaces/foo/taskruns/bar"));
        assert!(event.data.get("taskRun").is_some());
    }
}
