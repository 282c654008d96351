//! Controller configuration.
//!
//! Loaded from a TOML or JSON file, or from `STEPWISE_*` environment
//! variables layered over the defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::duration::{go_duration, parse_duration};
use crate::error::Error;
use crate::result::{GenericResultExt, Result};

/// Images used for the containers the controller adds to every pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Images {
    /// Image carrying the in-pod sequencing binary at `/ko-app/entrypoint`.
    pub entrypoint: String,
    /// Image carrying `/ko-app/git-init`.
    pub git: String,
    /// Image with a POSIX shell, used to prepare output directories.
    pub shell: String,
    /// Image with `gsutil`, used for storage resources.
    pub gsutil: String,
    /// Image carrying `/ko-app/imagedigestexporter`.
    pub image_digest_exporter: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            entrypoint: "override-with-entrypoint:latest".to_string(),
            git: "override-with-git:latest".to_string(),
            shell: "busybox".to_string(),
            gsutil: "google/cloud-sdk".to_string(),
            image_digest_exporter: "override-with-imagedigest-exporter-image:latest".to_string(),
        }
    }
}

/// Notification delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    /// Attempts per record before it is marked Failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before a pass retries pending records.
    #[serde(with = "go_duration", default = "default_retry_interval")]
    pub retry_interval: Duration,
    /// Timeout of a single delivery request.
    #[serde(with = "go_duration", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_interval: default_retry_interval(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// How step images are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntrypointPolicy {
    /// Also pin the image digest of steps that declare a command.
    pub pin_explicit_commands: bool,
}

/// Configuration of the reconciliation controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Images for controller-added containers.
    #[serde(default)]
    pub images: Images,

    /// Timeout applied to runs that do not set one.
    #[serde(with = "go_duration", default = "default_timeout")]
    pub default_timeout: Duration,

    /// Service account used when a run names none.
    #[serde(default = "default_service_account")]
    pub default_service_account: String,

    /// Number of concurrent reconcile workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Deadline for one reconcile pass.
    #[serde(with = "go_duration", default = "default_pass_timeout")]
    pub pass_timeout: Duration,

    /// First delay when a failed pass is requeued.
    #[serde(with = "go_duration", default = "default_requeue_base_delay")]
    pub requeue_base_delay: Duration,

    /// Cap on the requeue delay.
    #[serde(with = "go_duration", default = "default_requeue_max_delay")]
    pub requeue_max_delay: Duration,

    /// Notification delivery.
    #[serde(default)]
    pub notification: NotificationConfig,

    /// Entrypoint resolution.
    #[serde(default)]
    pub entrypoint: EntrypointPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            images: Images::default(),
            default_timeout: default_timeout(),
            default_service_account: default_service_account(),
            workers: default_workers(),
            pass_timeout: default_pass_timeout(),
            requeue_base_delay: default_requeue_base_delay(),
            requeue_max_delay: default_requeue_max_delay(),
            notification: NotificationConfig::default(),
            entrypoint: EntrypointPolicy::default(),
        }
    }
}

impl ControllerConfig {
    /// Set the default timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the number of workers.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the images.
    #[must_use]
    pub fn images(mut self, images: Images) -> Self {
        self.images = images;
        self
    }

    /// Load configuration from `STEPWISE_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let duration = |name: &str| {
            lookup(name).and_then(|raw| {
                parse_duration(&raw)
                    .map_err(|e| warn!(variable = name, error = %e, "ignoring invalid duration"))
                    .ok()
            })
        };
        let number = |name: &str| {
            lookup(name).and_then(|raw| {
                raw.trim()
                    .parse::<u32>()
                    .map_err(|e| warn!(variable = name, error = %e, "ignoring invalid number"))
                    .ok()
            })
        };

        if let Some(timeout) = duration("STEPWISE_DEFAULT_TIMEOUT") {
            config.default_timeout = timeout;
        }
        if let Some(sa) = lookup("STEPWISE_DEFAULT_SERVICE_ACCOUNT") {
            config.default_service_account = sa;
        }
        if let Some(workers) = number("STEPWISE_WORKERS") {
            config.workers = usize::try_from(workers).unwrap_or(config.workers);
        }
        if let Some(timeout) = duration("STEPWISE_PASS_TIMEOUT") {
            config.pass_timeout = timeout;
        }
        if let Some(delay) = duration("STEPWISE_REQUEUE_BASE_DELAY") {
            config.requeue_base_delay = delay;
        }
        if let Some(delay) = duration("STEPWISE_REQUEUE_MAX_DELAY") {
            config.requeue_max_delay = delay;
        }
        if let Some(attempts) = number("STEPWISE_NOTIFICATION_MAX_ATTEMPTS") {
            config.notification.max_attempts = attempts;
        }
        if let Some(interval) = duration("STEPWISE_NOTIFICATION_RETRY_INTERVAL") {
            config.notification.retry_interval = interval;
        }
        if let Some(timeout) = duration("STEPWISE_NOTIFICATION_REQUEST_TIMEOUT") {
            config.notification.request_timeout = timeout;
        }
        if let Some(pin) = lookup("STEPWISE_PIN_EXPLICIT_COMMANDS") {
            config.entrypoint.pin_explicit_commands =
                matches!(pin.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }

        let images = [
            ("STEPWISE_ENTRYPOINT_IMAGE", &mut config.images.entrypoint),
            ("STEPWISE_GIT_IMAGE", &mut config.images.git),
            ("STEPWISE_SHELL_IMAGE", &mut config.images.shell),
            ("STEPWISE_GSUTIL_IMAGE", &mut config.images.gsutil),
            (
                "STEPWISE_IMAGE_DIGEST_EXPORTER_IMAGE",
                &mut config.images.image_digest_exporter,
            ),
        ];
        for (name, slot) in images {
            if let Some(image) = lookup(name) {
                *slot = image;
            }
        }

        config
    }

    /// Load configuration from a file; `.json` files are JSON, anything else TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config_read_failed(path, e.to_string()))?;

        let parsed = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            toml::from_str(&content)
                .map_err(|e| Error::config_parse_failed(format!("failed to parse config: {e}")))
        };
        parsed.tap_ok(|_| debug!(path = %path.display(), "loaded controller config"))
    }
}

const fn default_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_service_account() -> String {
    "default".to_string()
}

const fn default_workers() -> usize {
    2
}

const fn default_pass_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_requeue_base_delay() -> Duration {
    Duration::from_millis(5)
}

const fn default_requeue_max_delay() -> Duration {
    Duration::from_secs(1000)
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_retry_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}
