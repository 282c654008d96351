//! Projection of a pod's observed state onto run status.

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use stepwise_core::{StepPhase, StepState};

use super::STEP_PREFIX;

/// Message while steps are still executing.
pub const RUNNING_MESSAGE: &str = "Not all Steps in the Task have finished executing";
/// Message once every step completed.
pub const SUCCEEDED_MESSAGE: &str = "All Steps have completed executing";

/// Waiting reasons that are part of normal start-up.
const BENIGN_WAITING_REASONS: [&str; 2] = ["ContainerCreating", "PodInitializing"];

/// What a pod says about its run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodOutcome {
    /// Pending or running.
    Running { message: String },
    /// Every container exited zero.
    Succeeded,
    /// The pod failed.
    Failed { message: String },
}

/// Statuses of the pod's containers, in pod spec order.
fn ordered_statuses(pod: &Pod) -> Vec<&ContainerStatus> {
    let statuses: Vec<&ContainerStatus> = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|s| s.iter().collect())
        .unwrap_or_default();
    let Some(spec) = pod.spec.as_ref() else {
        return statuses;
    };
    spec.containers
        .iter()
        .filter_map(|c| statuses.iter().find(|s| s.name == c.name).copied())
        .collect()
}

/// Interpret the pod's phase.
#[must_use]
pub fn interpret(pod: &Pod) -> PodOutcome {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending");
    match phase {
        "Succeeded" => PodOutcome::Succeeded,
        "Failed" => PodOutcome::Failed {
            message: failure_message(pod),
        },
        _ => PodOutcome::Running {
            message: pending_message(pod).unwrap_or_else(|| RUNNING_MESSAGE.to_string()),
        },
    }
}

fn pending_message(pod: &Pod) -> Option<String> {
    ordered_statuses(pod).into_iter().find_map(|status| {
        let reason = status
            .state
            .as_ref()?
            .waiting
            .as_ref()?
            .reason
            .as_deref()
            .filter(|r| !r.is_empty() && !BENIGN_WAITING_REASONS.contains(r))?;
        Some(format!(
            "build step \"{}\" is pending with reason \"{reason}\"",
            status.name
        ))
    })
}

/// Message naming the first container that exited non-zero, else the pod's own message.
#[must_use]
pub fn failure_message(pod: &Pod) -> String {
    let failed_step = ordered_statuses(pod).into_iter().find_map(|status| {
        let terminated = status.state.as_ref()?.terminated.as_ref()?;
        if terminated.exit_code == 0 {
            return None;
        }
        let image = if status.image_id.is_empty() {
            &status.image
        } else {
            &status.image_id
        };
        Some(format!(
            "\"{}\" exited with code {} (image: \"{image}\")",
            status.name, terminated.exit_code
        ))
    });
    failed_step
        .or_else(|| {
            pod.status
                .as_ref()
                .and_then(|s| s.message.clone())
                .filter(|m| !m.is_empty())
        })
        .unwrap_or_else(|| "build failed for unspecified reasons.".to_string())
}

/// Current state of every step container.
#[must_use]
pub fn step_states(pod: &Pod) -> Vec<StepState> {
    ordered_statuses(pod)
        .into_iter()
        .filter_map(|status| {
            let name = status.name.strip_prefix(STEP_PREFIX)?;
            let state = status.state.as_ref();
            let phase = if let Some(t) = state.and_then(|s| s.terminated.as_ref()) {
                StepPhase::Terminated {
                    exit_code: t.exit_code,
                    reason: t.reason.clone(),
                }
            } else if state.and_then(|s| s.running.as_ref()).is_some() {
                StepPhase::Running
            } else {
                StepPhase::Waiting {
                    reason: state
                        .and_then(|s| s.waiting.as_ref())
                        .and_then(|w| w.reason.clone()),
                }
            };
            Some(StepState {
                name: name.to_string(),
                container_name: status.name.clone(),
                phase,
            })
        })
        .collect()
}

/// Termination message of the first terminated container whose name starts with `prefix`.
#[must_use]
pub fn termination_message(pod: &Pod, prefix: &str) -> Option<String> {
    ordered_statuses(pod)
        .into_iter()
        .filter(|s| s.name.starts_with(prefix))
        .find_map(|s| s.state.as_ref()?.terminated.as_ref()?.message.clone())
}
