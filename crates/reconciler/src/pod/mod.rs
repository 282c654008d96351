//! Pod synthesis and interpretation.
//!
//! A run executes as one pod whose containers run strictly one after
//! another: each container is wrapped in the entrypoint binary, which waits
//! for the previous container's post file before exec'ing the real command
//! and writes its own post file when done.

mod builder;
mod names;
mod resources;
mod status;
mod substitution;

pub use builder::{BuildError, PodBuilder, ResolvedTask};
pub use names::{pod_name, random_suffix};
pub use status::{
    failure_message, interpret, step_states, termination_message, PodOutcome, RUNNING_MESSAGE,
    SUCCEEDED_MESSAGE,
};
pub use substitution::Substitutions;

/// Path of the entrypoint binary inside every wrapped container.
pub const ENTRYPOINT_BIN: &str = "/tekton/tools/entrypoint";
/// Where the entrypoint binary lives in the entrypoint image.
pub const ENTRYPOINT_SOURCE: &str = "/ko-app/entrypoint";
/// Shared directory holding the entrypoint binary and post files.
pub const TOOLS_DIR: &str = "/tekton/tools";
/// Mount point of the downward-API volume.
pub const DOWNWARD_DIR: &str = "/tekton/downward";
/// File the first container waits on; non-empty once the pod is ready.
pub const READY_FILE: &str = "/tekton/downward/ready";
/// Working directory shared by all steps.
pub const WORKSPACE_DIR: &str = "/workspace";
/// Parent directory of output resource directories.
pub const OUTPUT_DIR: &str = "/workspace/output";
/// `HOME` of every step.
pub const HOME_DIR: &str = "/tekton/home";

/// Volume backing [`WORKSPACE_DIR`].
pub const WORKSPACE_VOLUME: &str = "tekton-internal-workspace";
/// Volume backing [`HOME_DIR`].
pub const HOME_VOLUME: &str = "tekton-internal-home";
/// Volume backing [`TOOLS_DIR`].
pub const TOOLS_VOLUME: &str = "tekton-internal-tools";
/// Downward-API volume backing [`DOWNWARD_DIR`].
pub const DOWNWARD_VOLUME: &str = "tekton-internal-downward";

/// Annotation projected into [`READY_FILE`].
pub const READY_ANNOTATION: &str = "tekton.dev/ready";
/// Value of [`READY_ANNOTATION`] once the steps may start.
pub const READY_VALUE: &str = "READY";
/// Label carrying the owning run's name.
pub const RUN_LABEL: &str = "tekton.dev/taskRun";
/// Label carrying the template name.
pub const TASK_LABEL: &str = "tekton.dev/task";

/// Name of the init container that installs the entrypoint binary.
pub const PLACE_TOOLS_CONTAINER: &str = "place-tools";
/// Prefix of every step container name.
pub const STEP_PREFIX: &str = "step-";
/// Name prefix of the container that reports built image digests.
pub const DIGEST_EXPORTER_PREFIX: &str = "step-image-digest-exporter";

/// Post file written when container `index` finishes.
#[must_use]
pub fn post_file(index: usize) -> String {
    format!("{TOOLS_DIR}/{index}")
}

/// Input resource path for a declaration.
#[must_use]
pub fn input_path(declaration: &str, target_path: Option<&str>) -> String {
    let dir = target_path.filter(|p| !p.is_empty()).unwrap_or(declaration);
    format!("{WORKSPACE_DIR}/{}", dir.trim_start_matches('/'))
}

/// Output resource path for a declaration.
#[must_use]
pub fn output_path(declaration: &str) -> String {
    format!("{OUTPUT_DIR}/{declaration}")
}
