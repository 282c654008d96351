//! Collaborator interfaces for the cluster API.
//!
//! The reconciler only ever talks to the cluster through these traits;
//! [`crate::memory`] provides in-memory implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use stepwise_core::{ResourceSpec, Run, RunKey, TaskKind, TaskRef, TaskSpec};
use thiserror::Error;

/// Classified failure of a store call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// The request was refused (admission, quota).
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// Any other failure.
    #[error("{reason}")]
    Other { reason: String },
}

impl StoreError {
    /// Create a not found error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a forbidden error.
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    /// Create an unclassified error.
    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other {
            reason: reason.into(),
        }
    }

    /// Check if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a forbidden error.
    #[must_use]
    pub const fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }
}

/// Failure to resolve a task template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// No template with that name exists.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: TaskKind, name: String },

    /// A template exists under the other kind.
    #[error("'{name}' is a {found}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: TaskKind,
        found: TaskKind,
    },

    /// The run neither references nor embeds a template.
    #[error("run references no task and embeds no task spec")]
    Missing,

    /// A bound resource could not be resolved.
    #[error("resource '{binding}' could not be resolved: {reason}")]
    Resource { binding: String, reason: String },

    /// Lookup failed for another reason.
    #[error("{reason}")]
    Other { reason: String },
}

impl TemplateError {
    /// Create a not found error.
    pub fn not_found(kind: TaskKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a resource resolution error.
    pub fn resource(binding: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resource {
            binding: binding.into(),
            reason: reason.into(),
        }
    }
}

/// Storage of run objects.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Fetch a run; `Ok(None)` when it no longer exists.
    async fn get(&self, key: &RunKey) -> Result<Option<Run>, StoreError>;

    /// Persist the status of a run.
    async fn update_status(&self, run: &Run) -> Result<(), StoreError>;
}

/// Lookup of task templates.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Resolve a template by reference.
    async fn resolve(&self, namespace: &str, task_ref: &TaskRef) -> Result<TaskSpec, TemplateError>;
}

/// Lookup of stored resources.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    /// Fetch a resource by name.
    async fn get(&self, namespace: &str, name: &str) -> Result<ResourceSpec, StoreError>;
}

/// Storage of pods.
#[async_trait]
pub trait PodStore: Send + Sync {
    /// Create a pod, returning the stored object.
    async fn create(&self, pod: &Pod) -> Result<Pod, StoreError>;

    /// Fetch a pod by name.
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, StoreError>;

    /// List pods whose labels contain every pair in `selector`.
    async fn list(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, StoreError>;

    /// Delete a pod.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// Registry pull credentials for one (namespace, service account).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    /// Identity the credentials belong to, used for cache keys.
    pub identity: String,
    /// Registry host → auth token.
    pub auths: BTreeMap<String, String>,
}

impl Credentials {
    /// Anonymous credentials for `identity`.
    pub fn anonymous(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            auths: BTreeMap::new(),
        }
    }
}

/// Source of registry pull credentials.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Credentials used when pulling as `service_account` in `namespace`.
    async fn resolve(&self, namespace: &str, service_account: &str)
        -> Result<Credentials, StoreError>;
}
