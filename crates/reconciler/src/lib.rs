//! Task-run reconciliation for Kubernetes.
//!
//! This crate drives runs of task templates to completion, one pass at a
//! time, in the style of a Kubernetes controller:
//!
//! - **Reconciler**: reads a run, resolves its template, creates or finds its
//!   pod, interprets the pod and records the outcome on the run's condition
//! - **Pod synthesis**: each step becomes a container wrapped by an
//!   entrypoint binary, so steps run strictly in order inside one pod
//! - **Timers**: every active run has a timeout countdown; quota-refused pod
//!   creations are retried with backoff
//! - **Notifications**: finished runs deliver cloud events to their targets
//!
//! # Key Concepts
//!
//! ## Passes
//!
//! A pass never blocks on the pod. It observes, moves the run at most one
//! step and returns a [`ReconcileOutcome`] telling the caller when to look
//! again. The [`ReconciliationLoop`] serializes passes per run.
//!
//! ## Collaborators
//!
//! Storage, template lookup, registries and event delivery are traits in
//! [`store`], [`entrypoint`] and [`notify`]. The [`memory`] module has
//! in-memory implementations of all of them.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use stepwise_core::{ControllerConfig, Run, TaskRef};
//! use stepwise_reconciler::memory::{
//!     InMemoryCredentialResolver, InMemoryImageRegistry, InMemoryPodStore, InMemoryRunStore,
//!     InMemoryTaskSource,
//! };
//! use stepwise_reconciler::{EntrypointCache, LoopConfig, Reconciler, ReconciliationLoop};
//!
//! #[tokio::main]
//! async fn main() -> stepwise_reconciler::Result<()> {
//!     let config = ControllerConfig::from_env();
//!     let runs = Arc::new(InMemoryRunStore::new());
//!     let cache = EntrypointCache::new(
//!         Arc::new(InMemoryCredentialResolver::new()),
//!         Arc::new(InMemoryImageRegistry::new()),
//!     );
//!
//!     let reconciler = Reconciler::builder()
//!         .with_run_store(runs.clone())
//!         .with_task_source(Arc::new(InMemoryTaskSource::new()))
//!         .with_pod_store(Arc::new(InMemoryPodStore::new()))
//!         .with_entrypoint_resolver(Arc::new(cache))
//!         .with_config(config.clone())
//!         .build()?;
//!
//!     let mut loop_runner = ReconciliationLoop::new(Arc::new(reconciler), LoopConfig::from(&config));
//!     let run = Run::new("default", "build-1").with_task_ref(TaskRef::task("build"));
//!     runs.insert(run.clone());
//!     loop_runner.enqueue(run.key());
//!
//!     // Run until stopped
//!     // loop_runner.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod entrypoint;
pub mod error;
pub mod image;
pub mod r#loop;
pub mod memory;
pub mod notify;
pub mod pod;
pub mod reconciler;
pub mod results;
pub mod store;
pub mod timeout;

// Re-export main types
pub use entrypoint::{
    resolve_entrypoints, EntrypointCache, EntrypointError, EntrypointResolver, ImageConfig,
    ImageRegistry, RegistryError, ResolvedImage,
};
pub use error::{Error, Result};
pub use image::{ImageDigest, ImageReference, InvalidReference};
pub use notify::{
    CloudEvent, DispatchError, DispatchReport, EventSink, HttpEventSink, NotificationDispatcher,
    SinkError,
};
pub use pod::{BuildError, PodBuilder, PodOutcome, ResolvedTask};
pub use r#loop::{LoopConfig, LoopHandle, LoopStopper, ReconciliationLoop, WorkQueue};
pub use reconciler::{PassReport, ReconcileOutcome, Reconciler, ReconcilerBuilder};
pub use results::{extract, ExtractError};
pub use store::{
    CredentialResolver, Credentials, PodStore, ResourceSource, RunStore, StoreError, TaskSource,
    TemplateError,
};
pub use timeout::{Backoff, TimeoutCallback, TimeoutHandler};
