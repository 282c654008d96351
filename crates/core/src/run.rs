//! Runs: one execution of a task template, plus its observed status.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionStatus, Reason};
use crate::error::Error;
use crate::notification::NotificationDeliveryRecord;
use crate::resource::ResourceSpec;
use crate::task::{ParamValue, TaskRef, TaskSpec};

/// `namespace/name` identifier of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    /// Namespace of the run.
    pub namespace: String,
    /// Name of the run.
    pub name: String,
}

impl RunKey {
    /// Create a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRunKey`] unless the input has exactly two
    /// non-empty segments.
    pub fn parse(input: &str) -> crate::Result<Self> {
        match input.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::invalid_run_key(input)),
        }
    }
}

impl FromStr for RunKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Bound value.
    pub value: ParamValue,
}

/// A resource bound to one of the template's declared slots.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBinding {
    /// Declaration slot name.
    pub name: String,
    /// Name of a stored resource.
    #[serde(default)]
    pub resource_ref: Option<String>,
    /// Inline resource definition.
    #[serde(default)]
    pub resource_spec: Option<ResourceSpec>,
}

impl ResourceBinding {
    /// Bind slot `name` to the stored resource `resource`.
    pub fn by_ref(name: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_ref: Some(resource.into()),
            ..Self::default()
        }
    }

    /// Bind slot `name` to an inline resource.
    pub fn inline(name: impl Into<String>, spec: ResourceSpec) -> Self {
        Self {
            name: name.into(),
            resource_spec: Some(spec),
            ..Self::default()
        }
    }
}

/// Object metadata of a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunMeta {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Unique id, used for owner references.
    #[serde(default)]
    pub uid: String,
    /// When the run object was created.
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Labels, propagated to the pod.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations, propagated to the pod.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Desired state of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    /// Reference to a stored template.
    #[serde(default)]
    pub task_ref: Option<TaskRef>,
    /// Embedded template; used when no reference is given.
    #[serde(default)]
    pub task_spec: Option<TaskSpec>,
    /// Parameter bindings.
    #[serde(default)]
    pub params: Vec<Param>,
    /// Input resource bindings.
    #[serde(default)]
    pub inputs: Vec<ResourceBinding>,
    /// Output resource bindings.
    #[serde(default)]
    pub outputs: Vec<ResourceBinding>,
    /// Service account the pod runs as.
    #[serde(default)]
    pub service_account: Option<String>,
    /// Timeout; the process default applies when absent, zero disables it.
    #[serde(default, with = "crate::duration::go_duration_opt")]
    pub timeout: Option<Duration>,
    /// Set by the owner to stop the run.
    #[serde(default)]
    pub cancelled: bool,
}

/// State of one step container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepPhase {
    /// Not started yet.
    Waiting {
        /// Platform reason (e.g. `ImagePullBackOff`).
        reason: Option<String>,
    },
    /// Executing.
    Running,
    /// Finished.
    Terminated {
        /// Exit code of the container.
        exit_code: i32,
        /// Platform reason (e.g. `Completed`, `Error`).
        reason: Option<String>,
    },
}

/// Observed state of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    /// Step name without the `step-` prefix.
    pub name: String,
    /// Container name.
    pub container_name: String,
    /// Current phase.
    pub phase: StepPhase,
}

/// A structured output record written by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResult {
    /// Resource name.
    pub name: String,
    /// Content digest, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Free-form value, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Observed state of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    /// The `Succeeded` condition.
    #[serde(default)]
    pub condition: Option<Condition>,
    /// When the pod was first created or discovered.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// When the condition became terminal.
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    /// Name of the pod bound to this run.
    #[serde(default)]
    pub pod_name: Option<String>,
    /// Per-step states, in execution order.
    #[serde(default)]
    pub steps: Vec<StepState>,
    /// Structured step outputs.
    #[serde(default)]
    pub results: Vec<ResourceResult>,
    /// Notification delivery records.
    #[serde(default)]
    pub cloud_events: Vec<NotificationDeliveryRecord>,
}

impl RunStatus {
    /// Check if the run reached a terminal condition.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.condition.as_ref().is_some_and(Condition::is_terminal)
    }

    /// Status value of the condition (Unknown when unset).
    #[must_use]
    pub fn condition_status(&self) -> ConditionStatus {
        self.condition
            .as_ref()
            .map_or(ConditionStatus::Unknown, |c| c.status)
    }

    /// Reason of the condition, if set.
    #[must_use]
    pub fn reason(&self) -> Option<Reason> {
        self.condition.as_ref().map(|c| c.reason)
    }

    /// Set the condition. Returns whether anything changed.
    ///
    /// A terminal condition is never modified. The transition time only
    /// moves when the status value changes.
    pub fn mark(&mut self, status: ConditionStatus, reason: Reason, message: impl Into<String>) -> bool {
        let message = message.into();
        if let Some(current) = self.condition.as_mut() {
            if current.is_terminal() {
                return false;
            }
            if current.status == status {
                if current.reason == reason && current.message == message {
                    return false;
                }
                current.reason = reason;
                current.message = message;
                return true;
            }
        }
        self.condition = Some(Condition::new(status, reason, message));
        true
    }

    /// Mark the run as in progress.
    pub fn mark_unknown(&mut self, reason: Reason, message: impl Into<String>) -> bool {
        self.mark(ConditionStatus::Unknown, reason, message)
    }

    /// Mark the run as succeeded.
    pub fn mark_succeeded(&mut self, message: impl Into<String>) -> bool {
        self.mark(ConditionStatus::True, Reason::Succeeded, message)
    }

    /// Mark the run as failed.
    pub fn mark_failed(&mut self, reason: Reason, message: impl Into<String>) -> bool {
        self.mark(ConditionStatus::False, reason, message)
    }

    /// Set the start time unless it is already set. Returns whether it was set.
    pub fn init_start_time(&mut self, now: DateTime<Utc>) -> bool {
        if self.start_time.is_some() {
            return false;
        }
        self.start_time = Some(now);
        true
    }
}

/// One execution of a task template.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Run {
    /// Object metadata.
    pub metadata: RunMeta,
    /// Desired state.
    pub spec: RunSpec,
    /// Observed state.
    #[serde(default)]
    pub status: RunStatus,
}

impl Run {
    /// Create a run with empty spec and status.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: RunMeta {
                namespace: namespace.into(),
                name: name.into(),
                ..RunMeta::default()
            },
            ..Self::default()
        }
    }

    /// Key of this run.
    #[must_use]
    pub fn key(&self) -> RunKey {
        RunKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Reference a stored template.
    #[must_use]
    pub fn with_task_ref(mut self, task_ref: TaskRef) -> Self {
        self.spec.task_ref = Some(task_ref);
        self
    }

    /// Embed a template.
    #[must_use]
    pub fn with_task_spec(mut self, spec: TaskSpec) -> Self {
        self.spec.task_spec = Some(spec);
        self
    }

    /// Bind a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.spec.params.push(Param {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Bind an input resource.
    #[must_use]
    pub fn with_input(mut self, binding: ResourceBinding) -> Self {
        self.spec.inputs.push(binding);
        self
    }

    /// Bind an output resource.
    #[must_use]
    pub fn with_output(mut self, binding: ResourceBinding) -> Self {
        self.spec.outputs.push(binding);
        self
    }

    /// Set the service account.
    #[must_use]
    pub fn with_service_account(mut self, service_account: impl Into<String>) -> Self {
        self.spec.service_account = Some(service_account.into());
        self
    }

    /// Set an explicit timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = Some(timeout);
        self
    }

    /// Set the creation time.
    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.metadata.creation_timestamp = Some(at);
        self
    }

    /// Set the uid.
    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.metadata.uid = uid.into();
        self
    }

    /// Timeout that applies to this run: the explicit value, else `default`.
    #[must_use]
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.spec.timeout.unwrap_or(default)
    }

    /// Instant past which the run times out. `None` when not started or
    /// when the timeout is zero.
    #[must_use]
    pub fn deadline(&self, default: Duration) -> Option<DateTime<Utc>> {
        let timeout = self.effective_timeout(default);
        if timeout.is_zero() {
            return None;
        }
        let start = self.status.start_time?;
        let delta = TimeDelta::from_std(timeout).ok()?;
        start.checked_add_signed(delta)
    }

    /// Latest instant by which the run must finish, measured from its start
    /// or, before it has started, from its creation.
    #[must_use]
    pub fn latest_finish(&self, default: Duration) -> Option<DateTime<Utc>> {
        let timeout = self.effective_timeout(default);
        if timeout.is_zero() {
            return None;
        }
        let origin = self.status.start_time.or(self.metadata.creation_timestamp)?;
        origin.checked_add_signed(TimeDelta::from_std(timeout).ok()?)
    }

    /// Check whether the run has been running longer than its timeout.
    #[must_use]
    pub fn has_timed_out(&self, default: Duration, now: DateTime<Utc>) -> bool {
        self.deadline(default).is_some_and(|deadline| now > deadline)
    }

    /// Time left before the deadline, if there is one.
    #[must_use]
    pub fn remaining(&self, default: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let deadline = self.deadline(default)?;
        Some(
            deadline
                .signed_duration_since(now)
                .to_std()
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Service account the pod runs as, falling back to `default`.
    #[must_use]
    pub fn service_account_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.spec
            .service_account
            .as_deref()
            .filter(|sa| !sa.is_empty())
            .unwrap_or(default)
    }
}
