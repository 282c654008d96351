//! Containers and variables contributed by a run's resources.

use k8s_openapi::api::core::v1::{Container, EnvVar};
use serde::Serialize;
use stepwise_core::{Images, NamedResource, ResourceType};

use super::names::with_random_suffix;
use super::substitution::Substitutions;
use super::{input_path, output_path, DIGEST_EXPORTER_PREFIX, STEP_PREFIX};

const GIT_INIT_BIN: &str = "/ko-app/git-init";
const DIGEST_EXPORTER_BIN: &str = "/ko-app/imagedigestexporter";
const DEFAULT_REVISION: &str = "master";
const RESOURCE_NAME_ENV: &str = "TEKTON_RESOURCE_NAME";

/// Entry of the digest exporter's `-images` argument.
#[derive(Debug, Serialize)]
struct ExportedImage<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    resource_type: &'static str,
    url: &'a str,
    digest: &'a str,
    #[serde(rename = "OutputImageDir")]
    output_image_dir: String,
}

/// Containers that run before and after the steps.
#[derive(Debug, Default)]
pub(super) struct ResourceContainers {
    pub front: Vec<Container>,
    pub back: Vec<Container>,
}

/// Define `inputs.resources.*` and `outputs.resources.*` variables.
pub(super) fn add_resource_variables(
    subs: &mut Substitutions,
    inputs: &[NamedResource],
    outputs: &[NamedResource],
) {
    let sides = [("inputs", inputs), ("outputs", outputs)];
    for (side, resources) in sides {
        for resource in resources {
            let prefix = format!("{side}.resources.{}", resource.declaration);
            let path = if side == "inputs" {
                input_path(&resource.declaration, resource.target_path.as_deref())
            } else {
                output_path(&resource.declaration)
            };
            subs.insert_string(format!("{prefix}.name"), resource.name.clone());
            subs.insert_string(format!("{prefix}.type"), resource.spec.resource_type.as_str());
            subs.insert_string(format!("{prefix}.path"), path);
            for param in &resource.spec.params {
                subs.insert_string(
                    format!("{prefix}.{}", param.name.to_ascii_lowercase()),
                    param.value.clone(),
                );
            }
            for known in resource.spec.resource_type.param_names() {
                if let Some(value) = resource.spec.param(known) {
                    subs.insert_string(format!("{prefix}.{known}"), value);
                }
            }
        }
    }
}

fn container(name: String, image: &str, command: &[&str], args: Vec<String>) -> Container {
    Container {
        name,
        image: Some(image.to_string()),
        command: Some(command.iter().map(ToString::to_string).collect()),
        args: Some(args),
        ..Container::default()
    }
}

fn git_source(resource: &NamedResource, images: &Images) -> Container {
    let url = resource.spec.param("url").unwrap_or_default();
    let revision = resource
        .spec
        .param("revision")
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REVISION);
    let path = input_path(&resource.declaration, resource.target_path.as_deref());
    let mut git = container(
        with_random_suffix(&format!("{STEP_PREFIX}git-source-{}", resource.name)),
        &images.git,
        &[GIT_INIT_BIN],
        vec![
            "-url".to_string(),
            url.to_string(),
            "-revision".to_string(),
            revision.to_string(),
            "-path".to_string(),
            path,
        ],
    );
    git.env = Some(vec![EnvVar {
        name: RESOURCE_NAME_ENV.to_string(),
        value: Some(resource.name.clone()),
        value_from: None,
    }]);
    git
}

fn storage_source(resource: &NamedResource, images: &Images) -> Container {
    let location = resource.spec.param("location").unwrap_or_default();
    container(
        with_random_suffix(&format!("{STEP_PREFIX}storage-source-{}", resource.name)),
        &images.gsutil,
        &["gsutil"],
        vec![
            "rsync".to_string(),
            "-d".to_string(),
            "-r".to_string(),
            location.to_string(),
            input_path(&resource.declaration, resource.target_path.as_deref()),
        ],
    )
}

fn storage_upload(resource: &NamedResource, images: &Images) -> Container {
    let location = resource.spec.param("location").unwrap_or_default();
    container(
        with_random_suffix(&format!("{STEP_PREFIX}upload-{}", resource.name)),
        &images.gsutil,
        &["gsutil"],
        vec![
            "rsync".to_string(),
            "-d".to_string(),
            "-r".to_string(),
            output_path(&resource.declaration),
            location.to_string(),
        ],
    )
}

fn create_dir(declaration: &str, images: &Images) -> Container {
    container(
        with_random_suffix(&format!("{STEP_PREFIX}create-dir-{declaration}")),
        &images.shell,
        &["mkdir"],
        vec!["-p".to_string(), output_path(declaration)],
    )
}

fn digest_exporter(image_outputs: &[&NamedResource], images: &Images) -> Container {
    let exported: Vec<ExportedImage<'_>> = image_outputs
        .iter()
        .map(|r| ExportedImage {
            name: &r.name,
            resource_type: ResourceType::Image.as_str(),
            url: r.spec.param("url").unwrap_or_default(),
            digest: r.spec.param("digest").unwrap_or_default(),
            output_image_dir: output_path(&r.declaration),
        })
        .collect();
    let json = serde_json::to_string(&exported).unwrap_or_else(|_| "[]".to_string());
    let mut exporter = container(
        with_random_suffix(DIGEST_EXPORTER_PREFIX),
        &images.image_digest_exporter,
        &[DIGEST_EXPORTER_BIN],
        vec!["-images".to_string(), json],
    );
    exporter.termination_message_policy = Some("FallbackToLogsOnError".to_string());
    exporter
}

/// Build the resource containers, in execution order.
pub(super) fn resource_containers(
    inputs: &[NamedResource],
    outputs: &[NamedResource],
    images: &Images,
) -> ResourceContainers {
    let mut containers = ResourceContainers::default();

    containers.front.extend(
        outputs
            .iter()
            .filter(|r| r.spec.resource_type != ResourceType::CloudEvent)
            .map(|r| create_dir(&r.declaration, images)),
    );

    containers
        .front
        .extend(inputs.iter().filter_map(|r| match r.spec.resource_type {
            ResourceType::Git => Some(git_source(r, images)),
            ResourceType::Storage => Some(storage_source(r, images)),
            ResourceType::Image | ResourceType::CloudEvent => None,
        }));

    containers.back.extend(
        outputs
            .iter()
            .filter(|r| r.spec.resource_type == ResourceType::Storage)
            .map(|r| storage_upload(r, images)),
    );

    let image_outputs: Vec<&NamedResource> = outputs
        .iter()
        .filter(|r| r.spec.resource_type == ResourceType::Image)
        .collect();
    if !image_outputs.is_empty() {
        containers.back.push(digest_exporter(&image_outputs, images));
    }

    containers
}
