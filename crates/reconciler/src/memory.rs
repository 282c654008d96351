//! In-memory collaborators.
//!
//! Every trait the reconciler depends on has an implementation here that
//! keeps its state in a map, counts calls and can be told to fail. They back
//! the crate's tests and are usable for embedding without a cluster.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use stepwise_core::{ResourceSpec, Run, RunKey, TaskKind, TaskRef, TaskSpec};

use crate::entrypoint::{ImageConfig, ImageRegistry, RegistryError};
use crate::image::{ImageDigest, ImageReference};
use crate::notify::{CloudEvent, EventSink, SinkError};
use crate::store::{
    CredentialResolver, Credentials, PodStore, ResourceSource, RunStore, StoreError, TaskSource,
    TemplateError,
};

fn poisoned(err: impl std::fmt::Display) -> StoreError {
    StoreError::other(format!("mutex poisoned: {err}"))
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Run store backed by a map.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<RunKey, Run>>,
    updates: AtomicUsize,
    update_error: Mutex<Option<StoreError>>,
}

impl InMemoryRunStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a run.
    pub fn insert(&self, run: Run) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.insert(run.key(), run);
        }
    }

    /// Remove a run.
    pub fn remove(&self, key: &RunKey) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(key);
        }
    }

    /// Current stored copy of a run.
    pub fn run(&self, key: &RunKey) -> Option<Run> {
        self.runs.lock().ok().and_then(|runs| runs.get(key).cloned())
    }

    /// Modify a stored run in place (e.g. to cancel it).
    pub fn modify<F>(&self, key: &RunKey, f: F)
    where
        F: FnOnce(&mut Run),
    {
        if let Ok(mut runs) = self.runs.lock() {
            if let Some(run) = runs.get_mut(key) {
                f(run);
            }
        }
    }

    /// Number of successful status updates.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Make every subsequent status update fail with `error` (`None` to heal).
    pub fn fail_updates(&self, error: Option<StoreError>) {
        if let Ok(mut slot) = self.update_error.lock() {
            *slot = error;
        }
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn get(&self, key: &RunKey) -> Result<Option<Run>, StoreError> {
        let runs = self.runs.lock().map_err(poisoned)?;
        Ok(runs.get(key).cloned())
    }

    async fn update_status(&self, run: &Run) -> Result<(), StoreError> {
        if let Some(err) = self.update_error.lock().map_err(poisoned)?.clone() {
            return Err(err);
        }
        let mut runs = self.runs.lock().map_err(poisoned)?;
        let stored = runs
            .get_mut(&run.key())
            .ok_or_else(|| StoreError::not_found("taskrun", run.key().to_string()))?;
        stored.status = run.status.clone();
        bump(&self.updates);
        Ok(())
    }
}

/// Task and cluster-task templates backed by maps.
#[derive(Default)]
pub struct InMemoryTaskSource {
    tasks: Mutex<HashMap<(String, String), TaskSpec>>,
    cluster_tasks: Mutex<HashMap<String, TaskSpec>>,
    lookups: AtomicUsize,
}

impl InMemoryTaskSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a namespaced task.
    pub fn add_task(&self, namespace: impl Into<String>, name: impl Into<String>, spec: TaskSpec) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert((namespace.into(), name.into()), spec);
        }
    }

    /// Add a cluster-scoped task.
    pub fn add_cluster_task(&self, name: impl Into<String>, spec: TaskSpec) {
        if let Ok(mut tasks) = self.cluster_tasks.lock() {
            tasks.insert(name.into(), spec);
        }
    }

    /// Number of `resolve` calls.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn find(&self, namespace: &str, name: &str, kind: TaskKind) -> Option<TaskSpec> {
        match kind {
            TaskKind::Task => self
                .tasks
                .lock()
                .ok()
                .and_then(|t| t.get(&(namespace.to_string(), name.to_string())).cloned()),
            TaskKind::ClusterTask => self
                .cluster_tasks
                .lock()
                .ok()
                .and_then(|t| t.get(name).cloned()),
        }
    }
}

#[async_trait]
impl TaskSource for InMemoryTaskSource {
    async fn resolve(&self, namespace: &str, task_ref: &TaskRef) -> Result<TaskSpec, TemplateError> {
        bump(&self.lookups);
        if let Some(spec) = self.find(namespace, &task_ref.name, task_ref.kind) {
            return Ok(spec);
        }
        let other = match task_ref.kind {
            TaskKind::Task => TaskKind::ClusterTask,
            TaskKind::ClusterTask => TaskKind::Task,
        };
        if self.find(namespace, &task_ref.name, other).is_some() {
            return Err(TemplateError::KindMismatch {
                name: task_ref.name.clone(),
                expected: task_ref.kind,
                found: other,
            });
        }
        Err(TemplateError::not_found(task_ref.kind, &task_ref.name))
    }
}

/// Stored resources backed by a map.
#[derive(Default)]
pub struct InMemoryResourceSource {
    resources: Mutex<HashMap<(String, String), ResourceSpec>>,
}

impl InMemoryResourceSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource.
    pub fn add(&self, namespace: impl Into<String>, name: impl Into<String>, spec: ResourceSpec) {
        if let Ok(mut resources) = self.resources.lock() {
            resources.insert((namespace.into(), name.into()), spec);
        }
    }
}

#[async_trait]
impl ResourceSource for InMemoryResourceSource {
    async fn get(&self, namespace: &str, name: &str) -> Result<ResourceSpec, StoreError> {
        let resources = self.resources.lock().map_err(poisoned)?;
        resources
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found("pipelineresource", name))
    }
}

/// Pod store backed by a map, with per-operation error injection.
#[derive(Default)]
pub struct InMemoryPodStore {
    pods: Mutex<BTreeMap<(String, String), Pod>>,
    create_error: Mutex<Option<StoreError>>,
    get_error: Mutex<Option<StoreError>>,
    creates: AtomicUsize,
    gets: AtomicUsize,
    lists: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryPodStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent create fail with `error` (`None` to heal).
    pub fn fail_creates(&self, error: Option<StoreError>) {
        if let Ok(mut slot) = self.create_error.lock() {
            *slot = error;
        }
    }

    /// Make every subsequent get fail with `error` (`None` to heal).
    pub fn fail_gets(&self, error: Option<StoreError>) {
        if let Ok(mut slot) = self.get_error.lock() {
            *slot = error;
        }
    }

    /// Insert a pod directly, bypassing `create`.
    pub fn insert(&self, pod: Pod) {
        let key = pod_key(&pod);
        if let Ok(mut pods) = self.pods.lock() {
            pods.insert(key, pod);
        }
    }

    /// Modify a stored pod in place (e.g. to advance its phase).
    pub fn modify<F>(&self, namespace: &str, name: &str, f: F)
    where
        F: FnOnce(&mut Pod),
    {
        if let Ok(mut pods) = self.pods.lock() {
            if let Some(pod) = pods.get_mut(&(namespace.to_string(), name.to_string())) {
                f(pod);
            }
        }
    }

    /// All stored pods.
    pub fn pods(&self) -> Vec<Pod> {
        self.pods
            .lock()
            .map(|pods| pods.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of `create` calls.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Total number of calls of any kind.
    pub fn call_count(&self) -> usize {
        [&self.creates, &self.gets, &self.lists, &self.deletes]
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .fold(0, usize::saturating_add)
    }
}

fn pod_key(pod: &Pod) -> (String, String) {
    (
        pod.metadata.namespace.clone().unwrap_or_default(),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl PodStore for InMemoryPodStore {
    async fn create(&self, pod: &Pod) -> Result<Pod, StoreError> {
        bump(&self.creates);
        if let Some(err) = self.create_error.lock().map_err(poisoned)?.clone() {
            return Err(err);
        }
        let key = pod_key(pod);
        let mut pods = self.pods.lock().map_err(poisoned)?;
        if pods.contains_key(&key) {
            return Err(StoreError::other(format!("pod '{}' already exists", key.1)));
        }
        pods.insert(key, pod.clone());
        Ok(pod.clone())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, StoreError> {
        bump(&self.gets);
        if let Some(err) = self.get_error.lock().map_err(poisoned)?.clone() {
            return Err(err);
        }
        let pods = self.pods.lock().map_err(poisoned)?;
        pods.get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found("pod", name))
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, StoreError> {
        bump(&self.lists);
        let pods = self.pods.lock().map_err(poisoned)?;
        Ok(pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, pod)| {
                let labels = pod.metadata.labels.as_ref();
                selector
                    .iter()
                    .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        bump(&self.deletes);
        let mut pods = self.pods.lock().map_err(poisoned)?;
        pods.remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("pod", name))
    }
}

/// Credential resolver returning anonymous credentials.
#[derive(Default)]
pub struct InMemoryCredentialResolver {
    missing: Mutex<HashSet<String>>,
}

impl InMemoryCredentialResolver {
    /// Create a resolver that knows every service account.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make lookups for `service_account` fail.
    pub fn remove_service_account(&self, service_account: impl Into<String>) {
        if let Ok(mut missing) = self.missing.lock() {
            missing.insert(service_account.into());
        }
    }
}

#[async_trait]
impl CredentialResolver for InMemoryCredentialResolver {
    async fn resolve(
        &self,
        namespace: &str,
        service_account: &str,
    ) -> Result<Credentials, StoreError> {
        let missing = self.missing.lock().map_err(poisoned)?;
        if missing.contains(service_account) {
            return Err(StoreError::not_found("serviceaccount", service_account));
        }
        Ok(Credentials::anonymous(format!("{namespace}/{service_account}")))
    }
}

/// Image registry backed by a map from `registry/repository` to config.
#[derive(Default)]
pub struct InMemoryImageRegistry {
    images: Mutex<HashMap<String, ImageConfig>>,
    unreachable: Mutex<bool>,
    fetches: AtomicUsize,
}

impl InMemoryImageRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image by canonical name (`index.docker.io/library/busybox`).
    ///
    /// Entries whose digest is malformed are ignored.
    pub fn add_image(&self, name: impl Into<String>, entrypoint: Vec<String>, digest: &str) {
        let Ok(digest) = ImageDigest::parse(digest) else {
            return;
        };
        if let Ok(mut images) = self.images.lock() {
            images.insert(
                name.into(),
                ImageConfig {
                    entrypoint,
                    cmd: Vec::new(),
                    digest,
                },
            );
        }
    }

    /// Make every fetch fail as if the registry were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut slot) = self.unreachable.lock() {
            *slot = unreachable;
        }
    }

    /// Number of `fetch_config` calls.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageRegistry for InMemoryImageRegistry {
    async fn fetch_config(
        &self,
        reference: &ImageReference,
        _credentials: &Credentials,
    ) -> Result<ImageConfig, RegistryError> {
        bump(&self.fetches);
        if self.unreachable.lock().map(|u| *u).unwrap_or(true) {
            return Err(RegistryError::Unreachable {
                reason: "connection refused".to_string(),
            });
        }
        self.images
            .lock()
            .ok()
            .and_then(|images| images.get(&reference.name()).cloned())
            .ok_or_else(|| RegistryError::NotFound {
                reference: reference.to_string(),
            })
    }
}

/// Event sink that records deliveries.
#[derive(Default)]
pub struct InMemoryEventSink {
    sent: Mutex<Vec<(String, CloudEvent)>>,
    failing: Mutex<HashSet<String>>,
}

impl InMemoryEventSink {
    /// Create a sink that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deliveries to `target` fail.
    pub fn fail_target(&self, target: impl Into<String>) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(target.into());
        }
    }

    /// Make deliveries to `target` succeed again.
    pub fn heal_target(&self, target: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(target);
        }
    }

    /// Delivered `(target, event)` pairs.
    pub fn sent(&self) -> Vec<(String, CloudEvent)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of delivered events.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn send(&self, target: &str, event: &CloudEvent) -> Result<(), SinkError> {
        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(target))
            .unwrap_or(false);
        if failing {
            return Err(SinkError::request(format!("connection refused: {target}")));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((target.to_string(), event.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str, run: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("foo".to_string()),
                labels: Some(BTreeMap::from([(
                    "tekton.dev/taskRun".to_string(),
                    run.to_string(),
                )])),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    #[tokio::test]
    async fn test_pod_list_filters_by_label() {
        let store = InMemoryPodStore::new();
        store.insert(pod("a-pod-12345", "a"));
        store.insert(pod("b-pod-12345", "b"));

        let selector = BTreeMap::from([("tekton.dev/taskRun".to_string(), "a".to_string())]);
        let found = store.list("foo", &selector).await.ok().unwrap_or_default();

        assert_eq!(found.len(), 1);
        assert_eq!(
            found.first().and_then(|p| p.metadata.name.as_deref()),
            Some("a-pod-12345")
        );
    }

    #[tokio::test]
    async fn test_pod_create_error_injection() {
        let store = InMemoryPodStore::new();
        store.fail_creates(Some(StoreError::forbidden("exceeded quota")));

        let result = store.create(&pod("a-pod-12345", "a")).await;

        assert!(result.is_err_and(|e| e.is_forbidden()));
        assert_eq!(store.create_count(), 1);
        assert!(store.pods().is_empty());
    }

    #[tokio::test]
    async fn test_task_source_reports_kind_mismatch() {
        let source = InMemoryTaskSource::new();
        source.add_cluster_task("build", TaskSpec::new());

        let result = source.resolve("foo", &TaskRef::task("build")).await;

        assert!(matches!(result, Err(TemplateError::KindMismatch { .. })));
        assert_eq!(source.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_run_store_update_requires_existing_run() {
        let store = InMemoryRunStore::new();
        let result = store.update_status(&Run::new("foo", "ghost")).await;
        assert!(result.is_err_and(|e| e.is_not_found()));
        assert_eq!(store.update_count(), 0);
    }
}
