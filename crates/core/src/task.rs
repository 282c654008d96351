//! Task templates: ordered steps plus parameter and resource declarations.

use std::fmt;

use k8s_openapi::api::core::v1::{Container, EnvVar, Volume, VolumeMount};
use serde::{Deserialize, Serialize};

use crate::resource::ResourceType;

/// Where a run's template comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaskKind {
    /// A namespaced task.
    #[default]
    Task,
    /// A cluster-scoped task.
    ClusterTask,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "Task"),
            Self::ClusterTask => write!(f, "ClusterTask"),
        }
    }
}

/// Reference to a stored task template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    /// Template name.
    pub name: String,
    /// Namespaced or cluster-scoped.
    #[serde(default)]
    pub kind: TaskKind,
}

impl TaskRef {
    /// Reference a namespaced task.
    pub fn task(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Task,
        }
    }

    /// Reference a cluster-scoped task.
    pub fn cluster_task(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::ClusterTask,
        }
    }
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// A single string.
    #[default]
    String,
    /// A list of strings.
    Array,
}

/// A parameter value: string or array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// A single string.
    String(String),
    /// A list of strings.
    Array(Vec<String>),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(value: Vec<String>) -> Self {
        Self::Array(value)
    }
}

/// A parameter declared by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: String,
    /// Declared type.
    #[serde(default, rename = "type")]
    pub param_type: ParamType,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Value used when the run supplies none.
    #[serde(default)]
    pub default: Option<ParamValue>,
}

impl ParamSpec {
    /// A required string parameter.
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: ParamType::String,
            description: String::new(),
            default: None,
        }
    }

    /// Set the default value.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<ParamValue>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// A resource slot declared by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDeclaration {
    /// Slot name.
    pub name: String,
    /// Required resource type.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Path under the workspace where an input is materialized.
    #[serde(default)]
    pub target_path: Option<String>,
}

impl ResourceDeclaration {
    /// Declare a resource slot.
    pub fn new(name: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            name: name.into(),
            resource_type,
            target_path: None,
        }
    }
}

/// One unit of execution, mapped to exactly one container.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Step name; the container is named `step-<name>`.
    #[serde(default)]
    pub name: String,
    /// Container image.
    pub image: String,
    /// Command; resolved from the image when empty.
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Environment.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Extra volume mounts.
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

impl Step {
    /// Create a step running `image`.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Self::default()
        }
    }

    /// Set the command.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        });
        self
    }

    /// Convert into an (unwrapped) container named `container_name`.
    #[must_use]
    pub fn to_container(&self, container_name: String) -> Container {
        Container {
            name: container_name,
            image: Some(self.image.clone()),
            command: non_empty(self.command.clone()),
            args: non_empty(self.args.clone()),
            working_dir: self.working_dir.clone().filter(|d| !d.is_empty()),
            env: non_empty(self.env.clone()),
            volume_mounts: non_empty(self.volume_mounts.clone()),
            ..Container::default()
        }
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// A reusable task template.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Steps, executed in order.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Declared parameters.
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Declared input resources.
    #[serde(default)]
    pub inputs: Vec<ResourceDeclaration>,
    /// Declared output resources.
    #[serde(default)]
    pub outputs: Vec<ResourceDeclaration>,
    /// Extra pod volumes.
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl TaskSpec {
    /// Create an empty template.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Declare a parameter.
    #[must_use]
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Declare an input resource.
    #[must_use]
    pub fn with_input(mut self, declaration: ResourceDeclaration) -> Self {
        self.inputs.push(declaration);
        self
    }

    /// Declare an output resource.
    #[must_use]
    pub fn with_output(mut self, declaration: ResourceDeclaration) -> Self {
        self.outputs.push(declaration);
        self
    }

    /// Add a pod volume.
    #[must_use]
    pub fn with_volume(mut self, volume: Volume) -> Self {
        self.volumes.push(volume);
        self
    }
}
