//! Typed resources bound to a run's inputs and outputs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// A git repository (url, revision).
    #[serde(rename = "git")]
    Git,
    /// A container image (url, digest).
    #[serde(rename = "image")]
    Image,
    /// A blob-storage location.
    #[serde(rename = "storage")]
    Storage,
    /// A notification target receiving an event when the run finishes.
    #[serde(rename = "cloudEvent")]
    CloudEvent,
}

impl ResourceType {
    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Image => "image",
            Self::Storage => "storage",
            Self::CloudEvent => "cloudEvent",
        }
    }

    /// Parameters the type understands, spelled as variables expose them.
    #[must_use]
    pub const fn param_names(self) -> &'static [&'static str] {
        match self {
            Self::Git => &["url", "revision"],
            Self::Image => &["url", "digest"],
            Self::Storage => &["location"],
            Self::CloudEvent => &["targetURI"],
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named parameter of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceParam {
    /// Parameter name, matched case-insensitively.
    pub name: String,
    /// Parameter value.
    pub value: String,
}

/// A resource definition: a type plus its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// Resource kind.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Parameters (url, revision, location, targetURI, ...).
    #[serde(default)]
    pub params: Vec<ResourceParam>,
}

impl ResourceSpec {
    /// Create a resource with no parameters.
    #[must_use]
    pub const fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            params: Vec::new(),
        }
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push(ResourceParam {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// A git resource.
    #[must_use]
    pub fn git(url: impl Into<String>) -> Self {
        Self::new(ResourceType::Git).with_param("url", url)
    }

    /// An image resource.
    #[must_use]
    pub fn image(url: impl Into<String>) -> Self {
        Self::new(ResourceType::Image).with_param("url", url)
    }

    /// A storage resource.
    #[must_use]
    pub fn storage(location: impl Into<String>) -> Self {
        Self::new(ResourceType::Storage).with_param("location", location)
    }

    /// A cloud-event notification target.
    #[must_use]
    pub fn cloud_event(target_uri: impl Into<String>) -> Self {
        Self::new(ResourceType::CloudEvent).with_param("targetURI", target_uri)
    }

    /// Look up a parameter by case-insensitive name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_str())
    }
}

/// A resource bound to a run, with the name it is known by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedResource {
    /// Name of the declaration slot in the task.
    pub declaration: String,
    /// Name of the resource object (the binding name for embedded specs).
    pub name: String,
    /// The resolved definition.
    pub spec: ResourceSpec,
    /// Optional target path override from the task declaration.
    pub target_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_lookup_is_case_insensitive() {
        let spec = ResourceSpec::git("https://foo.git").with_param("Revision", "main");
        assert_eq!(spec.param("URL"), Some("https://foo.git"));
        assert_eq!(spec.param("revision"), Some("main"));
        assert_eq!(spec.param("missing"), None);
    }

    #[test]
    fn test_resource_type_wire_name() {
        let json = serde_json::to_string(&ResourceType::CloudEvent).ok();
        assert_eq!(json.as_deref(), Some("\"cloudEvent\""));
    }
}
