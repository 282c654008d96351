//! Reconciler implementation.
//!
//! One call to [`Reconciler::reconcile`] is one pass over one run: it reads
//! the run, moves it at most one step through its lifecycle, persists the
//! status when it changed and says when the run wants to be looked at again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use stepwise_core::{
    format_duration, ControllerConfig, NamedResource, NotificationDeliveryRecord, Reason,
    ResourceBinding, ResourceDeclaration, ResourceType, Run, RunKey, RunStatus, TaskKind,
};
use tracing::{debug, info, warn};

use crate::entrypoint::EntrypointResolver;
use crate::error::{Error, Result};
use crate::memory::InMemoryResourceSource;
use crate::notify::{DispatchReport, EventSink, HttpEventSink, NotificationDispatcher};
use crate::pod::{
    interpret, step_states, termination_message, PodBuilder, PodOutcome, ResolvedTask,
    DIGEST_EXPORTER_PREFIX, RUN_LABEL, SUCCEEDED_MESSAGE, TASK_LABEL,
};
use crate::results::{extract, ExtractError};
use crate::store::{PodStore, ResourceSource, RunStore, StoreError, TaskSource, TemplateError};
use crate::timeout::TimeoutHandler;

/// API group/version of run objects, used in owner references.
pub const RUN_API_VERSION: &str = "tekton.dev/v1alpha1";
/// Kind of run objects, used in owner references.
pub const RUN_KIND: &str = "TaskRun";

/// Target parameter of a cloud-event resource.
const TARGET_URI_PARAM: &str = "targetURI";

/// What the caller should do with a key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do until the run changes.
    Done,
    /// The run is active; pod changes or the timeout will bring it back.
    Waiting,
    /// Look at the run again after the given delay.
    RetryAfter(Duration),
}

/// Details of one pass, beyond its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// What the caller should do next.
    pub outcome: ReconcileOutcome,
    /// Whether the stored status was written.
    pub persisted: bool,
    /// Results could not be extracted from a succeeded pod.
    pub extraction_error: Option<ExtractError>,
    /// Notifications sent during this pass.
    pub dispatch: Option<DispatchReport>,
}

impl PassReport {
    fn new() -> Self {
        Self {
            outcome: ReconcileOutcome::Waiting,
            persisted: false,
            extraction_error: None,
            dispatch: None,
        }
    }
}

/// Drives runs through their lifecycle.
pub struct Reconciler {
    runs: Arc<dyn RunStore>,
    tasks: Arc<dyn TaskSource>,
    resources: Arc<dyn ResourceSource>,
    pods: Arc<dyn PodStore>,
    builder: PodBuilder,
    dispatcher: NotificationDispatcher,
    timeouts: Arc<TimeoutHandler>,
    config: ControllerConfig,
}

impl Reconciler {
    /// Start building a reconciler.
    #[must_use]
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Timer owner shared with the loop.
    #[must_use]
    pub fn timeouts(&self) -> Arc<TimeoutHandler> {
        Arc::clone(&self.timeouts)
    }

    /// Run one pass for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the run or its pod cannot be read, or
    /// the status cannot be written. Every other failure is recorded on the
    /// run's condition instead.
    pub async fn reconcile(&self, key: &RunKey) -> Result<ReconcileOutcome> {
        self.reconcile_with_report(key).await.map(|r| r.outcome)
    }

    /// Run one pass for `key` and report what happened.
    ///
    /// # Errors
    ///
    /// See [`reconcile`](Self::reconcile).
    pub async fn reconcile_with_report(&self, key: &RunKey) -> Result<PassReport> {
        let Some(mut run) = self.runs.get(key).await? else {
            debug!(key = %key, "run no longer exists");
            self.timeouts.cancel(key);
            let mut report = PassReport::new();
            report.outcome = ReconcileOutcome::Done;
            return Ok(report);
        };
        let original = run.status.clone();
        let mut report = PassReport::new();

        if run.status.is_done() {
            debug!(key = %key, "run already finished");
            self.timeouts.cancel(key);
            return self.finish(run, &original, report).await;
        }

        if run.spec.cancelled {
            self.delete_pod(&run).await;
            let message = format!("TaskRun \"{}\" was cancelled", run.metadata.name);
            run.status.mark_failed(Reason::Cancelled, message);
            return self.finish(run, &original, report).await;
        }

        let now = Utc::now();
        if run.has_timed_out(self.config.default_timeout, now) {
            self.delete_pod(&run).await;
            let timeout = run.effective_timeout(self.config.default_timeout);
            let message = format!(
                "TaskRun \"{}\" failed to finish within \"{}\"",
                run.metadata.name,
                format_duration(timeout)
            );
            run.status.mark_failed(Reason::Timeout, message);
            return self.finish(run, &original, report).await;
        }

        let task = match self.resolve(&run).await {
            Ok(task) => task,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to resolve task");
                run.status.mark_failed(Reason::FailedResolution, err.to_string());
                return self.finish(run, &original, report).await;
            }
        };
        init_notifications(&mut run.status, &task.outputs);

        let pod = match self.locate_pod(&mut run).await? {
            Some(pod) => pod,
            None => match self.create_pod(&mut run, &task).await {
                Ok(pod) => pod,
                Err(outcome) => {
                    report.outcome = outcome;
                    return self.finish(run, &original, report).await;
                }
            },
        };

        run.status.steps = step_states(&pod);
        match interpret(&pod) {
            PodOutcome::Running { message } => {
                run.status.mark_unknown(Reason::Running, message);
                self.ensure_timeout(&run);
            }
            PodOutcome::Succeeded => {
                if let Some(raw) = termination_message(&pod, DIGEST_EXPORTER_PREFIX) {
                    match extract(raw.as_bytes()) {
                        Ok(results) => run.status.results = results,
                        Err(err) => {
                            warn!(key = %key, error = %err, "failed to extract results");
                            report.extraction_error = Some(err);
                        }
                    }
                }
                run.status.mark_succeeded(SUCCEEDED_MESSAGE);
            }
            PodOutcome::Failed { message } => {
                run.status.mark_failed(Reason::Failed, message);
            }
        }

        self.finish(run, &original, report).await
    }

    async fn resolve(&self, run: &Run) -> std::result::Result<ResolvedTask, TemplateError> {
        let namespace = run.metadata.namespace.as_str();
        let (name, kind, spec) = match (&run.spec.task_ref, &run.spec.task_spec) {
            (Some(task_ref), _) => {
                let spec = self.tasks.resolve(namespace, task_ref).await?;
                (Some(task_ref.name.clone()), task_ref.kind, spec)
            }
            (None, Some(spec)) => (None, TaskKind::Task, spec.clone()),
            (None, None) => return Err(TemplateError::Missing),
        };

        let inputs = self
            .bind_resources(namespace, &spec.inputs, &run.spec.inputs)
            .await?;
        let outputs = self
            .bind_resources(namespace, &spec.outputs, &run.spec.outputs)
            .await?;

        Ok(ResolvedTask {
            name,
            kind,
            spec,
            inputs,
            outputs,
        })
    }

    async fn bind_resources(
        &self,
        namespace: &str,
        declarations: &[ResourceDeclaration],
        bindings: &[ResourceBinding],
    ) -> std::result::Result<Vec<NamedResource>, TemplateError> {
        let mut bound = Vec::with_capacity(declarations.len());
        for declaration in declarations {
            let binding = bindings
                .iter()
                .find(|b| b.name == declaration.name)
                .ok_or_else(|| TemplateError::resource(&declaration.name, "no binding provided"))?;

            let (name, spec) = match (&binding.resource_spec, &binding.resource_ref) {
                (Some(spec), _) => (binding.name.clone(), spec.clone()),
                (None, Some(resource)) => {
                    let spec = self
                        .resources
                        .get(namespace, resource)
                        .await
                        .map_err(|e| TemplateError::resource(&declaration.name, e.to_string()))?;
                    (resource.clone(), spec)
                }
                (None, None) => {
                    return Err(TemplateError::resource(
                        &declaration.name,
                        "binding names no resource and embeds no spec",
                    ));
                }
            };

            if spec.resource_type != declaration.resource_type {
                return Err(TemplateError::resource(
                    &declaration.name,
                    format!(
                        "expected a {} resource, got {}",
                        declaration.resource_type.as_str(),
                        spec.resource_type.as_str()
                    ),
                ));
            }

            bound.push(NamedResource {
                declaration: declaration.name.clone(),
                name,
                spec,
                target_path: declaration.target_path.clone(),
            });
        }
        Ok(bound)
    }

    /// Find the run's pod, binding it when it was found by label.
    async fn locate_pod(&self, run: &mut Run) -> Result<Option<Pod>> {
        let namespace = run.metadata.namespace.clone();

        if let Some(name) = run.status.pod_name.clone() {
            return match self.pods.get(&namespace, &name).await {
                Ok(pod) => Ok(Some(pod)),
                Err(err) if err.is_not_found() => {
                    warn!(key = %run.key(), pod = %name, "bound pod is gone, recreating");
                    Ok(None)
                }
                Err(err) => Err(err.into()),
            };
        }

        let selector = BTreeMap::from([(RUN_LABEL.to_string(), run.metadata.name.clone())]);
        let pod = self.pods.list(&namespace, &selector).await?.into_iter().next();
        if let Some(pod) = &pod {
            let name = pod.metadata.name.clone().unwrap_or_default();
            debug!(key = %run.key(), pod = %name, "adopted existing pod");
            run.status.pod_name = Some(name);
            run.status.init_start_time(Utc::now());
        }
        Ok(pod)
    }

    /// Build and create the run's pod. On failure the condition is already
    /// set and the outcome for the caller is returned.
    async fn create_pod(
        &self,
        run: &mut Run,
        task: &ResolvedTask,
    ) -> std::result::Result<Pod, ReconcileOutcome> {
        let key = run.key();
        let mut pod = match self.builder.build(run, task).await {
            Ok(pod) => pod,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to build pod");
                run.status.mark_failed(err.reason(), err.to_string());
                return Err(ReconcileOutcome::Done);
            }
        };
        decorate(&mut pod, run, task);
        let pod_name = pod.metadata.name.clone().unwrap_or_default();

        match self.pods.create(&pod).await {
            Ok(created) => {
                info!(key = %key, pod = %pod_name, "created pod");
                run.status.pod_name = Some(pod_name);
                run.status.init_start_time(Utc::now());
                self.ensure_timeout(run);
                Ok(created)
            }
            Err(err) if err.is_forbidden() => Err(self.defer_creation(run, &pod_name, &err)),
            Err(err) => {
                warn!(key = %key, error = %err, "failed to create pod");
                let task_name = task.name.as_deref().unwrap_or_default();
                let message = format!(
                    "failed to create task run pod \"{}\": {err}. Maybe missing or invalid Task {}/{task_name}",
                    run.metadata.name, run.metadata.namespace
                );
                run.status.mark_failed(Reason::CouldntGetTask, message);
                Err(ReconcileOutcome::Done)
            }
        }
    }

    /// Pod creation was refused by a quota: mark the run and schedule a retry.
    fn defer_creation(&self, run: &mut Run, pod_name: &str, err: &StoreError) -> ReconcileOutcome {
        let key = run.key();
        let now = Utc::now();
        let backoff = self
            .timeouts
            .backoff(&key, run.latest_finish(self.config.default_timeout));
        let after = backoff
            .next_attempt
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.timeouts.set_backoff_timer(&key, after);

        info!(key = %key, attempts = backoff.attempts, after = ?after, "pod creation exceeded quota");
        let message = format!(
            "TaskRun pod \"{pod_name}\" exceeded available resources: {err}; retrying in {}",
            format_duration(after)
        );
        run.status.mark_unknown(Reason::ExceededResourceQuota, message);
        ReconcileOutcome::RetryAfter(after)
    }

    /// Arm the run's timeout if it has a deadline and no timer.
    fn ensure_timeout(&self, run: &Run) {
        let key = run.key();
        if self.timeouts.is_armed(&key) {
            return;
        }
        if let Some(remaining) = run.remaining(self.config.default_timeout, Utc::now()) {
            self.timeouts.set_timeout(&key, remaining);
        }
    }

    async fn delete_pod(&self, run: &Run) {
        let Some(name) = run.status.pod_name.as_deref() else {
            return;
        };
        if let Err(err) = self.pods.delete(&run.metadata.namespace, name).await {
            if !err.is_not_found() {
                warn!(key = %run.key(), pod = %name, error = %err, "failed to delete pod");
            }
        }
    }

    /// Persist, stop timers of finished runs and deliver their notifications.
    async fn finish(
        &self,
        mut run: Run,
        original: &RunStatus,
        mut report: PassReport,
    ) -> Result<PassReport> {
        let key = run.key();
        let done = run.status.is_done();
        if done {
            if run.status.completion_time.is_none() {
                run.status.completion_time = Some(Utc::now());
            }
            self.timeouts.cancel(&key);
        }

        if original.condition != run.status.condition {
            if let Some(condition) = &run.status.condition {
                info!(
                    key = %key,
                    status = %condition.status,
                    reason = %condition.reason,
                    message = %condition.message,
                    "run condition changed"
                );
            }
        }

        if run.status != *original {
            self.runs.update_status(&run).await?;
            report.persisted = true;
        }

        if !done {
            return Ok(report);
        }

        if self.dispatcher.has_pending(&run) {
            match self.dispatcher.dispatch(&mut run).await {
                Ok(dispatch) => {
                    if dispatch.changed() {
                        self.runs.update_status(&run).await?;
                        report.persisted = true;
                    }
                    report.dispatch = Some(dispatch);
                }
                Err(err) => warn!(key = %key, error = %err, "failed to dispatch notifications"),
            }
        }

        report.outcome = if self.dispatcher.has_pending(&run) {
            ReconcileOutcome::RetryAfter(self.config.notification.retry_interval)
        } else {
            ReconcileOutcome::Done
        };
        Ok(report)
    }
}

/// Create a delivery record for every cloud-event output, once.
fn init_notifications(status: &mut RunStatus, outputs: &[NamedResource]) {
    if !status.cloud_events.is_empty() {
        return;
    }
    status.cloud_events = outputs
        .iter()
        .filter(|r| r.spec.resource_type == ResourceType::CloudEvent)
        .map(|r| {
            let target = r.spec.param(TARGET_URI_PARAM).unwrap_or_default();
            NotificationDeliveryRecord::new(target, &r.name)
        })
        .collect();
}

/// Add the run's labels, annotations and owner reference to its pod.
fn decorate(pod: &mut Pod, run: &Run, task: &ResolvedTask) {
    let labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.extend(run.metadata.labels.clone());
    labels.insert(RUN_LABEL.to_string(), run.metadata.name.clone());
    if let Some(name) = &task.name {
        labels.insert(TASK_LABEL.to_string(), name.clone());
    }

    let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
    for (k, v) in &run.metadata.annotations {
        annotations.entry(k.clone()).or_insert_with(|| v.clone());
    }

    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: RUN_API_VERSION.to_string(),
        kind: RUN_KIND.to_string(),
        name: run.metadata.name.clone(),
        uid: run.metadata.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
}

/// Builder for [`Reconciler`].
#[derive(Default)]
pub struct ReconcilerBuilder {
    runs: Option<Arc<dyn RunStore>>,
    tasks: Option<Arc<dyn TaskSource>>,
    resources: Option<Arc<dyn ResourceSource>>,
    pods: Option<Arc<dyn PodStore>>,
    resolver: Option<Arc<dyn EntrypointResolver>>,
    sink: Option<Arc<dyn EventSink>>,
    timeouts: Option<Arc<TimeoutHandler>>,
    config: ControllerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run store.
    #[must_use]
    pub fn with_run_store(mut self, runs: Arc<dyn RunStore>) -> Self {
        self.runs = Some(runs);
        self
    }

    /// Set the template source.
    #[must_use]
    pub fn with_task_source(mut self, tasks: Arc<dyn TaskSource>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Set the resource source. Defaults to an empty one.
    #[must_use]
    pub fn with_resource_source(mut self, resources: Arc<dyn ResourceSource>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Set the pod store.
    #[must_use]
    pub fn with_pod_store(mut self, pods: Arc<dyn PodStore>) -> Self {
        self.pods = Some(pods);
        self
    }

    /// Set the entrypoint resolver, usually an [`EntrypointCache`](crate::EntrypointCache).
    #[must_use]
    pub fn with_entrypoint_resolver(mut self, resolver: Arc<dyn EntrypointResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the notification sink. Defaults to HTTP delivery.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Share a timeout handler. Defaults to a fresh one.
    #[must_use]
    pub fn with_timeout_handler(mut self, timeouts: Arc<TimeoutHandler>) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when a required collaborator is
    /// missing, the notification budget is zero, or the default HTTP sink
    /// cannot be created.
    pub fn build(self) -> Result<Reconciler> {
        let runs = self
            .runs
            .ok_or_else(|| Error::invalid_config("run store is required"))?;
        let tasks = self
            .tasks
            .ok_or_else(|| Error::invalid_config("task source is required"))?;
        let pods = self
            .pods
            .ok_or_else(|| Error::invalid_config("pod store is required"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| Error::invalid_config("entrypoint resolver is required"))?;
        if self.config.notification.max_attempts == 0 {
            return Err(Error::invalid_config(
                "notification max attempts must be at least 1",
            ));
        }

        let sink: Arc<dyn EventSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(
                HttpEventSink::new(self.config.notification.request_timeout)
                    .map_err(|e| Error::invalid_config(e.to_string()))?,
            ),
        };
        let resources = self
            .resources
            .unwrap_or_else(|| Arc::new(InMemoryResourceSource::new()));
        let timeouts = self
            .timeouts
            .unwrap_or_else(|| Arc::new(TimeoutHandler::new()));

        let builder = PodBuilder::new(
            self.config.images.clone(),
            resolver,
            self.config.entrypoint,
            self.config.default_service_account.clone(),
        );
        let dispatcher = NotificationDispatcher::new(sink, self.config.notification.max_attempts);

        Ok(Reconciler {
            runs,
            tasks,
            resources,
            pods,
            builder,
            dispatcher,
            timeouts,
            config: self.config,
        })
    }
}
