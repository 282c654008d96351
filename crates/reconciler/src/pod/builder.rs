use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource, EnvVar,
    ObjectFieldSelector, Pod, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use stepwise_core::{
    EntrypointPolicy, Images, NamedResource, ParamValue, Reason, Run, TaskKind, TaskSpec,
};
use itertools::Itertools;
use thiserror::Error;
use tracing::debug;

use super::names::pod_name;
use super::resources::{add_resource_variables, resource_containers};
use super::substitution::Substitutions;
use super::{
    post_file, DOWNWARD_DIR, DOWNWARD_VOLUME, ENTRYPOINT_BIN, ENTRYPOINT_SOURCE, HOME_DIR,
    HOME_VOLUME, PLACE_TOOLS_CONTAINER, READY_ANNOTATION, READY_FILE, READY_VALUE, STEP_PREFIX,
    TOOLS_DIR, TOOLS_VOLUME, WORKSPACE_DIR, WORKSPACE_VOLUME,
};
use crate::entrypoint::{resolve_entrypoints, EntrypointError, EntrypointResolver};

/// Failure to build a pod.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// Declared parameters have neither a binding nor a default.
    #[error("missing values for parameters: {names}")]
    MissingParameter { names: String },

    /// A step's image entrypoint could not be resolved.
    #[error("failed to resolve entrypoint: {0}")]
    Entrypoint(#[from] EntrypointError),
}

impl BuildError {
    /// Condition reason for this failure.
    #[must_use]
    pub const fn reason(&self) -> Reason {
        match self {
            Self::MissingParameter { .. } => Reason::FailedValidation,
            Self::Entrypoint(_) => Reason::FailedResolution,
        }
    }
}

/// A template with its resources resolved, ready to be built.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTask {
    /// Template name; `None` for embedded templates.
    pub name: Option<String>,
    /// Template kind.
    pub kind: TaskKind,
    /// The template.
    pub spec: TaskSpec,
    /// Bound input resources, in declaration order.
    pub inputs: Vec<NamedResource>,
    /// Bound output resources, in declaration order.
    pub outputs: Vec<NamedResource>,
}

impl ResolvedTask {
    /// An embedded template with no resources.
    #[must_use]
    pub fn embedded(spec: TaskSpec) -> Self {
        Self {
            name: None,
            kind: TaskKind::Task,
            spec,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// Turns a run and its resolved template into a pod.
pub struct PodBuilder {
    images: Images,
    resolver: Arc<dyn EntrypointResolver>,
    policy: EntrypointPolicy,
    default_service_account: String,
}

impl PodBuilder {
    /// Create a builder.
    pub fn new(
        images: Images,
        resolver: Arc<dyn EntrypointResolver>,
        policy: EntrypointPolicy,
        default_service_account: impl Into<String>,
    ) -> Self {
        Self {
            images,
            resolver,
            policy,
            default_service_account: default_service_account.into(),
        }
    }

    /// Build the pod for `run`.
    ///
    /// Labels, annotations other than the ready annotation, and the owner
    /// reference are left to the caller.
    ///
    /// The ready annotation is written into the pod as built, so the first
    /// step starts as soon as the pod is created. There is no later update
    /// that flips it once sidecars are up.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingParameter`] for unbound required
    /// parameters and [`BuildError::Entrypoint`] when a step's entrypoint
    /// cannot be resolved.
    pub async fn build(&self, run: &Run, task: &ResolvedTask) -> Result<Pod, BuildError> {
        let mut subs = Substitutions::new();
        for (name, value) in effective_params(run, &task.spec)? {
            let key = format!("inputs.params.{name}");
            match value {
                ParamValue::String(s) => subs.insert_string(key, s),
                ParamValue::Array(a) => subs.insert_array(key, a),
            }
        }
        add_resource_variables(&mut subs, &task.inputs, &task.outputs);

        let steps = task.spec.steps.iter().enumerate().map(|(i, step)| {
            let name = if step.name.is_empty() {
                format!("{STEP_PREFIX}unnamed-{i}")
            } else {
                format!("{STEP_PREFIX}{}", step.name)
            };
            let mut container = step.to_container(name);
            subs.apply_to_container(&mut container);
            container
        });

        let resources = resource_containers(&task.inputs, &task.outputs, &self.images);
        let mut containers: Vec<Container> = resources
            .front
            .into_iter()
            .chain(steps)
            .chain(resources.back)
            .collect();

        let service_account = run.service_account_or(&self.default_service_account);
        resolve_entrypoints(
            self.resolver.as_ref(),
            &run.metadata.namespace,
            service_account,
            &mut containers,
            self.policy,
        )
        .await?;

        let containers: Vec<Container> = containers
            .into_iter()
            .enumerate()
            .map(|(i, c)| wrap(c, i))
            .collect();

        let mut volumes = internal_volumes();
        volumes.extend(task.spec.volumes.iter().cloned().map(|mut v| {
            subs.apply_to_volume(&mut v);
            v
        }));

        debug!(
            run = %run.key(),
            containers = containers.len(),
            "built pod spec"
        );

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(pod_name(&run.metadata.name)),
                namespace: Some(run.metadata.namespace.clone()),
                annotations: Some(BTreeMap::from([(
                    READY_ANNOTATION.to_string(),
                    READY_VALUE.to_string(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                service_account_name: Some(service_account.to_string()),
                init_containers: Some(vec![place_tools(&self.images.entrypoint)]),
                containers,
                volumes: Some(volumes),
                ..PodSpec::default()
            }),
            status: None,
        })
    }
}

/// Template defaults overlaid with the run's bindings.
fn effective_params(run: &Run, spec: &TaskSpec) -> Result<HashMap<String, ParamValue>, BuildError> {
    let mut params: HashMap<String, ParamValue> = run
        .spec
        .params
        .iter()
        .map(|p| (p.name.clone(), p.value.clone()))
        .collect();

    let missing = spec
        .params
        .iter()
        .filter(|declared| !params.contains_key(&declared.name) && declared.default.is_none())
        .map(|declared| declared.name.as_str())
        .join(", ");
    if !missing.is_empty() {
        return Err(BuildError::MissingParameter { names: missing });
    }

    for declared in &spec.params {
        if let Some(default) = &declared.default {
            params
                .entry(declared.name.clone())
                .or_insert_with(|| default.clone());
        }
    }
    Ok(params)
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..VolumeMount::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    }
}

fn internal_volumes() -> Vec<Volume> {
    vec![
        empty_dir(WORKSPACE_VOLUME),
        empty_dir(HOME_VOLUME),
        empty_dir(TOOLS_VOLUME),
        Volume {
            name: DOWNWARD_VOLUME.to_string(),
            downward_api: Some(DownwardAPIVolumeSource {
                items: Some(vec![DownwardAPIVolumeFile {
                    path: "ready".to_string(),
                    field_ref: Some(ObjectFieldSelector {
                        field_path: format!("metadata.annotations['{READY_ANNOTATION}']"),
                        ..ObjectFieldSelector::default()
                    }),
                    ..DownwardAPIVolumeFile::default()
                }]),
                ..DownwardAPIVolumeSource::default()
            }),
            ..Volume::default()
        },
    ]
}

fn place_tools(entrypoint_image: &str) -> Container {
    Container {
        name: PLACE_TOOLS_CONTAINER.to_string(),
        image: Some(entrypoint_image.to_string()),
        command: Some(vec![
            "cp".to_string(),
            ENTRYPOINT_SOURCE.to_string(),
            ENTRYPOINT_BIN.to_string(),
        ]),
        volume_mounts: Some(vec![mount(TOOLS_VOLUME, TOOLS_DIR)]),
        ..Container::default()
    }
}

/// Rewrite container `index` to run under the entrypoint binary.
fn wrap(mut container: Container, index: usize) -> Container {
    let mut args = match index.checked_sub(1) {
        None => vec![
            "-wait_file".to_string(),
            READY_FILE.to_string(),
            "-wait_file_content".to_string(),
        ],
        Some(previous) => vec!["-wait_file".to_string(), post_file(previous)],
    };
    args.push("-post_file".to_string());
    args.push(post_file(index));

    let mut command = container.command.take().unwrap_or_default().into_iter();
    if let Some(program) = command.next() {
        args.push("-entrypoint".to_string());
        args.push(program);
        args.push("--".to_string());
        args.extend(command);
    }
    args.extend(container.args.take().unwrap_or_default());

    container.command = Some(vec![ENTRYPOINT_BIN.to_string()]);
    container.args = Some(args);

    if container.working_dir.as_deref().map_or(true, str::is_empty) {
        container.working_dir = Some(WORKSPACE_DIR.to_string());
    }

    let env = container.env.get_or_insert_with(Vec::new);
    if !env.iter().any(|e| e.name == "HOME") {
        env.push(EnvVar {
            name: "HOME".to_string(),
            value: Some(HOME_DIR.to_string()),
            value_from: None,
        });
    }

    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    let mut wanted = vec![mount(TOOLS_VOLUME, TOOLS_DIR)];
    if index == 0 {
        wanted.push(mount(DOWNWARD_VOLUME, DOWNWARD_DIR));
    }
    wanted.push(mount(WORKSPACE_VOLUME, WORKSPACE_DIR));
    wanted.push(mount(HOME_VOLUME, HOME_DIR));
    for m in wanted {
        if !mounts.iter().any(|existing| existing.mount_path == m.mount_path) {
            mounts.push(m);
        }
    }

    container
}
