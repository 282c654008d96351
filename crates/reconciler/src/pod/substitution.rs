use std::collections::HashMap;
use std::sync::LazyLock;

use k8s_openapi::api::core::v1::{Container, Volume};
use regex::{Captures, Regex};

#[expect(clippy::expect_used)]
static REFERENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\(([^()$]+)\)").expect("hardcoded regex pattern is valid")
});

/// Variable table for `$(...)` references.
///
/// Substitution is total: references to unknown variables, and array
/// variables used inside a larger string, are left as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    strings: HashMap<String, String>,
    arrays: HashMap<String, Vec<String>>,
}

impl Substitutions {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a string variable.
    pub fn insert_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.strings.insert(name.into(), value.into());
    }

    /// Define an array variable.
    pub fn insert_array(&mut self, name: impl Into<String>, values: Vec<String>) {
        self.arrays.insert(name.into(), values);
    }

    /// Replace every known string reference in `input`.
    #[must_use]
    pub fn apply(&self, input: &str) -> String {
        REFERENCE_REGEX
            .replace_all(input, |caps: &Captures<'_>| {
                let whole = caps.get(0).map_or("", |m| m.as_str());
                caps.get(1)
                    .and_then(|name| self.strings.get(name.as_str().trim()))
                    .map_or_else(|| whole.to_string(), Clone::clone)
            })
            .into_owned()
    }

    /// Substitute a list of arguments; an argument that is exactly one
    /// array reference expands into the array's elements.
    #[must_use]
    pub fn apply_list(&self, args: &[String]) -> Vec<String> {
        args.iter()
            .flat_map(|arg| match self.exact_array(arg) {
                Some(values) => values.clone(),
                None => vec![self.apply(arg)],
            })
            .collect()
    }

    fn exact_array(&self, arg: &str) -> Option<&Vec<String>> {
        let caps = REFERENCE_REGEX.captures(arg)?;
        let whole = caps.get(0)?;
        if whole.start() != 0 || whole.end() != arg.len() {
            return None;
        }
        self.arrays.get(caps.get(1)?.as_str().trim())
    }

    /// Substitute the image, command, args, working dir and env values of a container.
    pub fn apply_to_container(&self, container: &mut Container) {
        if let Some(image) = container.image.as_mut() {
            *image = self.apply(image);
        }
        if let Some(command) = container.command.as_mut() {
            *command = self.apply_list(command);
        }
        if let Some(args) = container.args.as_mut() {
            *args = self.apply_list(args);
        }
        if let Some(dir) = container.working_dir.as_mut() {
            *dir = self.apply(dir);
        }
        for var in container.env.iter_mut().flatten() {
            if let Some(value) = var.value.as_mut() {
                *value = self.apply(value);
            }
        }
    }

    /// Substitute the config-map name, secret name and claim name of a volume.
    pub fn apply_to_volume(&self, volume: &mut Volume) {
        if let Some(name) = volume.config_map.as_mut().and_then(|c| c.name.as_mut()) {
            *name = self.apply(name);
        }
        if let Some(name) = volume.secret.as_mut().and_then(|s| s.secret_name.as_mut()) {
            *name = self.apply(name);
        }
        if let Some(claim) = volume.persistent_volume_claim.as_mut() {
            claim.claim_name = self.apply(&claim.claim_name);
        }
    }
}
