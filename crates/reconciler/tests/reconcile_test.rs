//! Behavior tests for the reconciler against in-memory collaborators.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::{Arc, Once};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodStatus,
};
use stepwise_core::{
    ConditionStatus, ControllerConfig, DeliveryStatus, ParamSpec, Reason, ResourceBinding,
    ResourceDeclaration, ResourceSpec, ResourceType, Run, RunKey, Step, TaskRef, TaskSpec,
};
use stepwise_reconciler::memory::{
    InMemoryCredentialResolver, InMemoryEventSink, InMemoryImageRegistry, InMemoryPodStore,
    InMemoryResourceSource, InMemoryRunStore, InMemoryTaskSource,
};
use stepwise_reconciler::pod::{post_file, DIGEST_EXPORTER_PREFIX, READY_FILE, STEP_PREFIX};
use stepwise_reconciler::{
    EntrypointCache, ExtractError, ReconcileOutcome, Reconciler, StoreError, TimeoutHandler,
};

const BUSYBOX_DIGEST: &str =
    "sha256:7a3b2a4f6d9c1e0b8f5a2d3c4e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b1c2d3e4f";

static TRACING: Once = Once::new();

fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct Harness {
    runs: Arc<InMemoryRunStore>,
    tasks: Arc<InMemoryTaskSource>,
    resources: Arc<InMemoryResourceSource>,
    pods: Arc<InMemoryPodStore>,
    registry: Arc<InMemoryImageRegistry>,
    sink: Arc<InMemoryEventSink>,
    timeouts: Arc<TimeoutHandler>,
    reconciler: Reconciler,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    fn with_config(config: ControllerConfig) -> Self {
        init_test_tracing();
        let runs = Arc::new(InMemoryRunStore::new());
        let tasks = Arc::new(InMemoryTaskSource::new());
        let resources = Arc::new(InMemoryResourceSource::new());
        let pods = Arc::new(InMemoryPodStore::new());
        let registry = Arc::new(InMemoryImageRegistry::new());
        let sink = Arc::new(InMemoryEventSink::new());
        let timeouts = Arc::new(TimeoutHandler::new());
        let cache = EntrypointCache::new(
            Arc::new(InMemoryCredentialResolver::new()),
            registry.clone(),
        );
        let reconciler = Reconciler::builder()
            .with_run_store(runs.clone())
            .with_task_source(tasks.clone())
            .with_resource_source(resources.clone())
            .with_pod_store(pods.clone())
            .with_entrypoint_resolver(Arc::new(cache))
            .with_event_sink(sink.clone())
            .with_timeout_handler(timeouts.clone())
            .with_config(config)
            .build()
            .expect("reconciler builds from a complete harness");
        Self {
            runs,
            tasks,
            resources,
            pods,
            registry,
            sink,
            timeouts,
            reconciler,
        }
    }

    fn stored(&self, key: &RunKey) -> Run {
        self.runs
            .run(key)
            .unwrap_or_else(|| Run::new(&key.namespace, &key.name))
    }

    fn only_pod(&self) -> Pod {
        self.pods.pods().into_iter().next().unwrap_or_default()
    }

    /// Finish every container of the run's pod with exit code 0.
    fn complete_pod(&self, run: &Run, exporter_message: Option<&str>) {
        self.finish_pod(run, "Succeeded", |name| {
            let message = name
                .starts_with(DIGEST_EXPORTER_PREFIX)
                .then(|| exporter_message.map(str::to_string))
                .flatten();
            (0, message)
        });
    }

    fn finish_pod<F>(&self, run: &Run, phase: &str, outcome: F)
    where
        F: Fn(&str) -> (i32, Option<String>),
    {
        let Some(name) = self.stored(&run.key()).status.pod_name else {
            return;
        };
        self.pods.modify(&run.metadata.namespace, &name, |pod| {
            let statuses = pod
                .spec
                .as_ref()
                .map(|spec| {
                    spec.containers
                        .iter()
                        .map(|c| {
                            let (exit_code, message) = outcome(&c.name);
                            ContainerStatus {
                                name: c.name.clone(),
                                image: c.image.clone().unwrap_or_default(),
                                state: Some(ContainerState {
                                    terminated: Some(ContainerStateTerminated {
                                        exit_code,
                                        message,
                                        ..ContainerStateTerminated::default()
                                    }),
                                    ..ContainerState::default()
                                }),
                                ..ContainerStatus::default()
                            }
                        })
                        .collect()
                })
                .unwrap_or_default();
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(statuses),
                ..PodStatus::default()
            });
        });
    }
}

fn echo_task() -> TaskSpec {
    TaskSpec::new().with_step(
        Step::new("simple-step", "foo")
            .with_command(["/mycmd"])
            .with_args(["arg1"]),
    )
}

fn container_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

/// The value following `flag` in a container's arguments.
fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i.saturating_add(1)))
        .cloned()
}

// ===== Behavior-Driven Tests =====

/// Given runs with and without an explicit timeout
/// When the effective timeout is computed
/// Then the default applies only when none is set
#[test]
fn effective_timeout_uses_default_only_when_unset() {
    let config = ControllerConfig::default();
    let plain = Run::new("foo", "plain");
    let explicit = Run::new("foo", "explicit").with_timeout(Duration::from_secs(10));
    let disabled = Run::new("foo", "disabled").with_timeout(Duration::ZERO);

    assert_eq!(plain.effective_timeout(config.default_timeout), Duration::from_secs(3600));
    assert_eq!(explicit.effective_timeout(config.default_timeout), Duration::from_secs(10));
    assert_eq!(disabled.effective_timeout(config.default_timeout), Duration::ZERO);
}

/// Given a new run referencing an existing task
/// When it is reconciled twice
/// Then one pod is created and the start time never moves
#[tokio::test]
async fn start_time_is_stable_across_passes() {
    let h = Harness::new();
    h.tasks.add_task("foo", "test-task", echo_task());
    let run = Run::new("foo", "test-taskrun").with_task_ref(TaskRef::task("test-task"));
    h.runs.insert(run.clone());

    let first = h.reconciler.reconcile(&run.key()).await.ok();
    assert_eq!(first, Some(ReconcileOutcome::Waiting));
    let started = h.stored(&run.key()).status.start_time;
    assert!(started.is_some());

    let second = h.reconciler.reconcile(&run.key()).await.ok();
    assert_eq!(second, Some(ReconcileOutcome::Waiting));
    assert_eq!(h.stored(&run.key()).status.start_time, started);
    assert_eq!(h.pods.create_count(), 1);

    let status = h.stored(&run.key()).status;
    assert_eq!(status.condition_status(), ConditionStatus::Unknown);
    assert_eq!(status.reason(), Some(Reason::Running));
    assert!(h.timeouts.is_armed(&run.key()));
}

/// Given a task with a git input, an image output and a cloud-event output
/// When its pod is built
/// Then containers run as resources before steps before the exporter,
/// and post files count up from zero
#[tokio::test]
async fn containers_are_chained_through_post_files() {
    let h = Harness::new();
    let spec = echo_task()
        .with_input(ResourceDeclaration::new("workspace", ResourceType::Git))
        .with_output(ResourceDeclaration::new("myimage", ResourceType::Image))
        .with_output(ResourceDeclaration::new("myevent", ResourceType::CloudEvent));
    h.tasks.add_task("foo", "test-with-resources", spec);
    h.resources.add(
        "foo",
        "git-resource",
        ResourceSpec::git("https://foo.git").with_param("revision", "main"),
    );
    h.resources.add("foo", "image-resource", ResourceSpec::image("gcr.io/kristoff/sven"));
    h.resources.add(
        "foo",
        "cloud-event-resource",
        ResourceSpec::cloud_event("http://sink:8080"),
    );
    let run = Run::new("foo", "test-taskrun-resources")
        .with_task_ref(TaskRef::task("test-with-resources"))
        .with_input(ResourceBinding::by_ref("workspace", "git-resource"))
        .with_output(ResourceBinding::by_ref("myimage", "image-resource"))
        .with_output(ResourceBinding::by_ref("myevent", "cloud-event-resource"));
    h.runs.insert(run.clone());

    let _ = h.reconciler.reconcile(&run.key()).await;

    let pod = h.only_pod();
    let names = container_names(&pod);
    let prefixes = [
        "step-create-dir-myimage-",
        "step-git-source-git-resource-",
        "step-simple-step",
        DIGEST_EXPORTER_PREFIX,
    ];
    assert_eq!(names.len(), prefixes.len(), "containers: {names:?}");
    for (name, prefix) in names.iter().zip(prefixes) {
        assert!(name.starts_with(prefix), "{name} should start with {prefix}");
    }
    assert!(names.iter().all(|n| n.starts_with(STEP_PREFIX)));

    let containers = pod.spec.map(|s| s.containers).unwrap_or_default();
    for (i, container) in containers.iter().enumerate() {
        let args = container.args.clone().unwrap_or_default();
        assert_eq!(flag_value(&args, "-post_file"), Some(post_file(i)));
        let waits_on = flag_value(&args, "-wait_file");
        if i == 0 {
            assert_eq!(waits_on.as_deref(), Some(READY_FILE));
        } else {
            assert_eq!(waits_on, Some(post_file(i.saturating_sub(1))));
        }
    }

    let records = h.stored(&run.key()).status.cloud_events;
    assert_eq!(records.len(), 1);
    assert_eq!(records.first().map(|r| r.target.as_str()), Some("http://sink:8080"));
    assert_eq!(records.first().map(|r| r.status), Some(DeliveryStatus::Unknown));
}

/// Given a git resource whose url parameter is declared as "URL"
/// When a step references the url in lowercase
/// Then the clone and the step both see the same value
#[tokio::test]
async fn resource_params_substitute_case_insensitively() {
    let h = Harness::new();
    let spec = TaskSpec::new()
        .with_input(ResourceDeclaration::new("src", ResourceType::Git))
        .with_step(
            Step::new("fetch", "foo")
                .with_command(["/mycmd"])
                .with_args(["$(inputs.resources.src.url)"]),
        );
    h.tasks.add_task("foo", "fetch-task", spec);
    h.resources.add(
        "foo",
        "repo",
        ResourceSpec::new(ResourceType::Git).with_param("URL", "https://g/r"),
    );
    let run = Run::new("foo", "fetch-run")
        .with_task_ref(TaskRef::task("fetch-task"))
        .with_input(ResourceBinding::by_ref("src", "repo"));
    h.runs.insert(run.clone());

    let _ = h.reconciler.reconcile(&run.key()).await;

    let pod = h.only_pod();
    let containers = pod.spec.map(|s| s.containers).unwrap_or_default();
    let args_of = |prefix: &str| {
        containers
            .iter()
            .find(|c| c.name.starts_with(prefix))
            .and_then(|c| c.args.clone())
            .unwrap_or_default()
    };
    let git = args_of("step-git-source-repo-");
    assert_eq!(flag_value(&git, "-url").as_deref(), Some("https://g/r"));
    let step = args_of("step-fetch");
    assert!(step.iter().any(|a| a == "https://g/r"), "step args: {step:?}");
    assert!(!step.iter().any(|a| a.contains("$(inputs.resources")));
}

/// Given a run referencing a task that does not exist
/// When it is reconciled
/// Then it fails resolution after one lookup and no pod calls
#[tokio::test]
async fn missing_task_fails_resolution_without_pod_calls() {
    let h = Harness::new();
    let run = Run::new("foo", "notaskrun").with_task_ref(TaskRef::task("notask"));
    h.runs.insert(run.clone());

    let outcome = h.reconciler.reconcile(&run.key()).await.ok();

    assert_eq!(outcome, Some(ReconcileOutcome::Done));
    let status = h.stored(&run.key()).status;
    assert_eq!(status.condition_status(), ConditionStatus::False);
    assert_eq!(status.reason(), Some(Reason::FailedResolution));
    assert_eq!(h.tasks.lookup_count(), 1);
    assert_eq!(h.pods.call_count(), 0);
}

/// Given a run referencing a cluster task by the wrong kind
/// When it is reconciled
/// Then it fails resolution
#[tokio::test]
async fn cluster_task_referenced_as_task_fails_resolution() {
    let h = Harness::new();
    h.tasks.add_cluster_task("test-cluster-task", echo_task());
    let wrong = Run::new("foo", "wrong-kind").with_task_ref(TaskRef::task("test-cluster-task"));
    let right = Run::new("foo", "right-kind")
        .with_task_ref(TaskRef::cluster_task("test-cluster-task"));
    h.runs.insert(wrong.clone());
    h.runs.insert(right.clone());

    let _ = h.reconciler.reconcile(&wrong.key()).await;
    let _ = h.reconciler.reconcile(&right.key()).await;

    assert_eq!(h.stored(&wrong.key()).status.reason(), Some(Reason::FailedResolution));
    assert_eq!(h.stored(&right.key()).status.reason(), Some(Reason::Running));
}

/// Given a task declaring a parameter with no default
/// When a run omits it
/// Then validation fails before any pod is created
#[tokio::test]
async fn missing_parameter_fails_validation() {
    let h = Harness::new();
    let spec = echo_task().with_param(ParamSpec::string("myarg"));
    let run = Run::new("foo", "noparam").with_task_spec(spec);
    h.runs.insert(run.clone());

    let _ = h.reconciler.reconcile(&run.key()).await;

    let status = h.stored(&run.key()).status;
    assert_eq!(status.reason(), Some(Reason::FailedValidation));
    assert!(status.condition.map(|c| c.message).unwrap_or_default().contains("myarg"));
    assert_eq!(h.pods.create_count(), 0);
}

/// Given pod creation refused by a quota
/// When the run is reconciled
/// Then it stays Unknown with ExceededResourceQuota and asks to be retried
#[tokio::test]
async fn quota_refusal_is_retried() {
    let h = Harness::new();
    h.tasks.add_task("foo", "test-task", echo_task());
    h.pods.fail_creates(Some(StoreError::forbidden("exceeded quota")));
    let run = Run::new("foo", "test-taskrun-quota").with_task_ref(TaskRef::task("test-task"));
    h.runs.insert(run.clone());

    let outcome = h.reconciler.reconcile(&run.key()).await.ok();

    assert!(matches!(outcome, Some(ReconcileOutcome::RetryAfter(d)) if d <= Duration::from_secs(3)));
    let status = h.stored(&run.key()).status;
    assert_eq!(status.condition_status(), ConditionStatus::Unknown);
    assert_eq!(status.reason(), Some(Reason::ExceededResourceQuota));
    assert!(status.start_time.is_none());

    h.pods.fail_creates(None);
    let _ = h.reconciler.reconcile(&run.key()).await;
    assert_eq!(h.stored(&run.key()).status.reason(), Some(Reason::Running));
}

/// Given pod creation failing for any other reason
/// When the run is reconciled
/// Then it fails with CouldntGetTask
#[tokio::test]
async fn other_create_errors_are_terminal() {
    let h = Harness::new();
    h.tasks.add_task("foo", "test-task", echo_task());
    h.pods.fail_creates(Some(StoreError::other("admission webhook denied")));
    let run = Run::new("foo", "test-taskrun-broken").with_task_ref(TaskRef::task("test-task"));
    h.runs.insert(run.clone());

    let outcome = h.reconciler.reconcile(&run.key()).await.ok();

    assert_eq!(outcome, Some(ReconcileOutcome::Done));
    let status = h.stored(&run.key()).status;
    assert_eq!(status.condition_status(), ConditionStatus::False);
    assert_eq!(status.reason(), Some(Reason::CouldntGetTask));
    assert!(status.completion_time.is_some());
}

/// Given a run started 15 seconds ago with a 10 second timeout
/// When it is reconciled
/// Then it fails with a timeout naming the run and the limit
#[tokio::test]
async fn overdue_run_times_out() {
    let h = Harness::new();
    h.tasks.add_task("foo", "test-task", echo_task());
    let mut run = Run::new("foo", "test-taskrun-timeout")
        .with_task_ref(TaskRef::task("test-task"))
        .with_timeout(Duration::from_secs(10));
    run.status.start_time = Utc::now().checked_sub_signed(TimeDelta::seconds(15));
    run.status.pod_name = Some("test-taskrun-timeout-pod-abcde".to_string());
    h.runs.insert(run.clone());

    let outcome = h.reconciler.reconcile(&run.key()).await.ok();

    assert_eq!(outcome, Some(ReconcileOutcome::Done));
    let status = h.stored(&run.key()).status;
    assert_eq!(status.condition_status(), ConditionStatus::False);
    assert_eq!(status.reason(), Some(Reason::Timeout));
    assert_eq!(
        status.condition.map(|c| c.message),
        Some("TaskRun \"test-taskrun-timeout\" failed to finish within \"10s\"".to_string())
    );
    assert_eq!(h.pods.delete_count(), 1);
    assert_eq!(h.tasks.lookup_count(), 0);
    assert!(!h.timeouts.is_armed(&run.key()));
}

/// Given a running run
/// When its owner cancels it
/// Then the pod is deleted and the run fails as cancelled
#[tokio::test]
async fn cancelled_run_deletes_its_pod() {
    let h = Harness::new();
    h.tasks.add_task("foo", "test-task", echo_task());
    let run = Run::new("foo", "test-taskrun-cancel").with_task_ref(TaskRef::task("test-task"));
    h.runs.insert(run.clone());
    let _ = h.reconciler.reconcile(&run.key()).await;
    assert_eq!(h.pods.pods().len(), 1);

    h.runs.modify(&run.key(), |r| r.spec.cancelled = true);
    let outcome = h.reconciler.reconcile(&run.key()).await.ok();

    assert_eq!(outcome, Some(ReconcileOutcome::Done));
    let status = h.stored(&run.key()).status;
    assert_eq!(status.condition_status(), ConditionStatus::False);
    assert_eq!(status.reason(), Some(Reason::Cancelled));
    assert!(h.pods.pods().is_empty());
    assert!(!h.timeouts.is_armed(&run.key()));
}

/// Given a pod whose second step exited non-zero
/// When the run is reconciled
/// Then it fails naming the step, exit code and image
#[tokio::test]
async fn failed_pod_names_failing_step() {
    let h = Harness::new();
    let spec = TaskSpec::new()
        .with_step(Step::new("a", "busybox").with_command(["true"]))
        .with_step(Step::new("b", "busybox").with_command(["false"]));
    let run = Run::new("foo", "test-taskrun-fail").with_task_spec(spec);
    h.runs.insert(run.clone());
    let _ = h.reconciler.reconcile(&run.key()).await;

    h.finish_pod(&run, "Failed", |name| (if name == "step-b" { 2 } else { 0 }, None));
    let _ = h.reconciler.reconcile(&run.key()).await;

    let status = h.stored(&run.key()).status;
    assert_eq!(status.reason(), Some(Reason::Failed));
    let message = status.condition.map(|c| c.message).unwrap_or_default();
    assert!(message.contains("\"step-b\" exited with code 2"), "{message}");
    assert_eq!(status.steps.len(), 2);
}

/// Given a succeeded pod whose exporter reported two results
/// When the run is reconciled
/// Then the run succeeds and carries both results
#[tokio::test]
async fn results_are_extracted_from_exporter() {
    let h = Harness::new();
    let spec = echo_task().with_output(ResourceDeclaration::new("myimage", ResourceType::Image));
    let run = Run::new("foo", "test-taskrun-results")
        .with_task_spec(spec)
        .with_output(ResourceBinding::inline("myimage", ResourceSpec::image("gcr.io/x/y")));
    h.runs.insert(run.clone());
    let _ = h.reconciler.reconcile(&run.key()).await;

    let message = r#"[{"name":"myimage","digest":"sha256:1234"},{"name":"tag","value":"v1"}]"#;
    h.complete_pod(&run, Some(message));
    let report = h.reconciler.reconcile_with_report(&run.key()).await.ok();

    assert_eq!(report.and_then(|r| r.extraction_error), None);
    let status = h.stored(&run.key()).status;
    assert_eq!(status.condition_status(), ConditionStatus::True);
    assert_eq!(status.reason(), Some(Reason::Succeeded));
    assert_eq!(status.results.len(), 2);
    assert_eq!(
        status.results.first().and_then(|r| r.digest.clone()).as_deref(),
        Some("sha256:1234")
    );
    assert!(status.completion_time.is_some());
}

/// Given a succeeded pod whose exporter wrote garbage
/// When the run is reconciled
/// Then the run still succeeds, results are untouched and the error is reported
#[tokio::test]
async fn malformed_results_do_not_fail_the_run() {
    let h = Harness::new();
    let spec = echo_task().with_output(ResourceDeclaration::new("myimage", ResourceType::Image));
    let run = Run::new("foo", "test-taskrun-garbage")
        .with_task_spec(spec)
        .with_output(ResourceBinding::inline("myimage", ResourceSpec::image("gcr.io/x/y")));
    h.runs.insert(run.clone());
    let _ = h.reconciler.reconcile(&run.key()).await;

    h.complete_pod(&run, Some(""));
    let report = h.reconciler.reconcile_with_report(&run.key()).await.ok();

    assert_eq!(report.and_then(|r| r.extraction_error), Some(ExtractError::Empty));
    let status = h.stored(&run.key()).status;
    assert_eq!(status.reason(), Some(Reason::Succeeded));
    assert!(status.results.is_empty());
}

fn two_event_run(h: &Harness, name: &str) -> Run {
    let spec = echo_task()
        .with_output(ResourceDeclaration::new("first", ResourceType::CloudEvent))
        .with_output(ResourceDeclaration::new("second", ResourceType::CloudEvent));
    let run = Run::new("foo", name)
        .with_task_spec(spec)
        .with_output(ResourceBinding::inline(
            "first",
            ResourceSpec::cloud_event("http://first:8080"),
        ))
        .with_output(ResourceBinding::inline(
            "second",
            ResourceSpec::cloud_event("http://second:8080"),
        ));
    h.runs.insert(run.clone());
    run
}

/// Given a run with two cloud-event outputs whose pod succeeded
/// When it is reconciled, and then reconciled again
/// Then both events are sent once and never resent
#[tokio::test]
async fn cloud_events_are_sent_once() {
    let h = Harness::new();
    let run = two_event_run(&h, "test-taskrun-events");
    let _ = h.reconciler.reconcile(&run.key()).await;
    h.complete_pod(&run, None);

    let outcome = h.reconciler.reconcile(&run.key()).await.ok();

    assert_eq!(outcome, Some(ReconcileOutcome::Done));
    let records = h.stored(&run.key()).status.cloud_events;
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| r.status == DeliveryStatus::Sent && r.attempts == 1));
    assert_eq!(h.sink.sent_count(), 2);

    let again = h.reconciler.reconcile(&run.key()).await.ok();
    assert_eq!(again, Some(ReconcileOutcome::Done));
    assert_eq!(h.sink.sent_count(), 2);
    assert_eq!(h.stored(&run.key()).status.cloud_events, records);
}

/// Given one unreachable event target and a budget of two attempts
/// When the finished run is reconciled repeatedly
/// Then the healthy record is sent, the failing one is retried and then given up
#[tokio::test]
async fn failing_delivery_is_retried_until_budget_is_spent() {
    let mut config = ControllerConfig::default();
    config.notification.max_attempts = 2;
    let h = Harness::with_config(config);
    h.sink.fail_target("http://second:8080");
    let run = two_event_run(&h, "test-taskrun-flaky");
    let _ = h.reconciler.reconcile(&run.key()).await;
    h.complete_pod(&run, None);

    let outcome = h.reconciler.reconcile(&run.key()).await.ok();
    assert!(matches!(outcome, Some(ReconcileOutcome::RetryAfter(_))));
    let records = h.stored(&run.key()).status.cloud_events;
    let second = records.iter().find(|r| r.resource == "second");
    assert_eq!(second.map(|r| (r.status, r.attempts)), Some((DeliveryStatus::Unknown, 1)));
    assert!(second.is_some_and(|r| !r.message.is_empty()));

    let outcome = h.reconciler.reconcile(&run.key()).await.ok();
    assert_eq!(outcome, Some(ReconcileOutcome::Done));
    let records = h.stored(&run.key()).status.cloud_events;
    let first = records.iter().find(|r| r.resource == "first");
    let second = records.iter().find(|r| r.resource == "second");
    assert_eq!(first.map(|r| (r.status, r.attempts)), Some((DeliveryStatus::Sent, 1)));
    assert_eq!(second.map(|r| (r.status, r.attempts)), Some((DeliveryStatus::Failed, 2)));
    assert_eq!(h.stored(&run.key()).status.reason(), Some(Reason::Succeeded));
}

/// Given a step without a command on an image known to the registry
/// When two runs use it
/// Then the registry is asked once and the pod runs the image's entrypoint
#[tokio::test]
async fn image_entrypoints_are_looked_up_once() {
    let h = Harness::new();
    h.registry.add_image(
        "index.docker.io/library/busybox",
        vec!["/bin/sh".to_string()],
        BUSYBOX_DIGEST,
    );
    let spec = TaskSpec::new().with_step(Step::new("shell", "busybox").with_args(["-c", "ls"]));
    h.tasks.add_task("foo", "shell-task", spec);
    let first = Run::new("foo", "shell-1").with_task_ref(TaskRef::task("shell-task"));
    let second = Run::new("foo", "shell-2").with_task_ref(TaskRef::task("shell-task"));
    h.runs.insert(first.clone());
    h.runs.insert(second.clone());

    let _ = h.reconciler.reconcile(&first.key()).await;
    let _ = h.reconciler.reconcile(&second.key()).await;

    assert_eq!(h.registry.fetch_count(), 1);
    let pod = h.only_pod();
    let args = pod
        .spec
        .and_then(|s| s.containers.into_iter().next())
        .and_then(|c| c.args)
        .unwrap_or_default();
    assert_eq!(flag_value(&args, "-entrypoint").as_deref(), Some("/bin/sh"));
    assert!(args.ends_with(&["-c".to_string(), "ls".to_string()]));
}

/// Given an image the registry does not know
/// When a step without a command uses it
/// Then the run fails resolution and no pod is created
#[tokio::test]
async fn unknown_image_fails_resolution() {
    let h = Harness::new();
    let spec = TaskSpec::new().with_step(Step::new("mystery", "gcr.io/nobody/nothing"));
    let run = Run::new("foo", "mystery").with_task_spec(spec);
    h.runs.insert(run.clone());

    let _ = h.reconciler.reconcile(&run.key()).await;

    assert_eq!(h.stored(&run.key()).status.reason(), Some(Reason::FailedResolution));
    assert_eq!(h.pods.create_count(), 0);
}

/// Given a run whose bound pod has disappeared
/// When it is reconciled
/// Then a new pod is created and the start time is kept
#[tokio::test]
async fn vanished_pod_is_recreated() {
    let h = Harness::new();
    h.tasks.add_task("foo", "test-task", echo_task());
    let run = Run::new("foo", "test-taskrun-gone").with_task_ref(TaskRef::task("test-task"));
    h.runs.insert(run.clone());
    let _ = h.reconciler.reconcile(&run.key()).await;
    let before = h.stored(&run.key()).status;

    if let Some(name) = before.pod_name.as_deref() {
        h.pods.modify("foo", name, |pod| pod.metadata.labels = None);
    }
    h.runs.modify(&run.key(), |r| r.status.pod_name = Some("missing-pod".to_string()));
    let _ = h.reconciler.reconcile(&run.key()).await;

    let after = h.stored(&run.key()).status;
    assert_eq!(h.pods.create_count(), 2);
    assert_ne!(after.pod_name.as_deref(), Some("missing-pod"));
    assert_eq!(after.start_time, before.start_time);
}

/// Given the pod store failing reads
/// When a run with a bound pod is reconciled
/// Then the pass returns an error for generic retry
#[tokio::test]
async fn pod_read_errors_are_returned() {
    let h = Harness::new();
    h.tasks.add_task("foo", "test-task", echo_task());
    let run = Run::new("foo", "test-taskrun-flaky-pods").with_task_ref(TaskRef::task("test-task"));
    h.runs.insert(run.clone());
    let _ = h.reconciler.reconcile(&run.key()).await;

    h.pods.fail_gets(Some(StoreError::other("connection reset")));
    let result = h.reconciler.reconcile(&run.key()).await;

    assert!(result.is_err());
    assert_eq!(h.stored(&run.key()).status.reason(), Some(Reason::Running));
}
