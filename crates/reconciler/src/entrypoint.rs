//! Entrypoint resolution for steps that declare no command.
//!
//! The sequencing wrapper has to know which program to exec, so steps that
//! rely on the image's configured entrypoint are resolved against the
//! registry once and memoized.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Container;
use moka::future::Cache;
use stepwise_core::EntrypointPolicy;
use thiserror::Error;
use tracing::{debug, info};

use crate::image::{ImageDigest, ImageReference, InvalidReference};
use crate::store::{CredentialResolver, Credentials, StoreError};

/// Failure reported by an image registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry could not be reached.
    #[error("registry unreachable: {reason}")]
    Unreachable { reason: String },

    /// The image does not exist.
    #[error("image '{reference}' not found")]
    NotFound { reference: String },

    /// Credentials were rejected.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },
}

/// Image configuration relevant to entrypoint resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    /// Configured `Entrypoint`.
    pub entrypoint: Vec<String>,
    /// Configured `Cmd`, used when the entrypoint is empty.
    pub cmd: Vec<String>,
    /// Content digest of the image.
    pub digest: ImageDigest,
}

/// Access to image metadata.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Fetch the config of `reference`.
    async fn fetch_config(
        &self,
        reference: &ImageReference,
        credentials: &Credentials,
    ) -> Result<ImageConfig, RegistryError>;
}

/// Failure to resolve an entrypoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntrypointError {
    /// The image reference is malformed.
    #[error(transparent)]
    InvalidReference(#[from] InvalidReference),

    /// Pull credentials could not be obtained.
    #[error("failed to get pull credentials for '{service_account}': {source}")]
    Credentials {
        service_account: String,
        source: StoreError,
    },

    /// The registry call failed.
    #[error("failed to fetch config of '{image}': {source}")]
    Registry { image: String, source: RegistryError },

    /// The image declares neither entrypoint nor cmd.
    #[error("image '{image}' has no entrypoint or cmd")]
    EmptyEntrypoint { image: String },
}

/// Result of resolving one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// The canonical reference that was resolved.
    pub reference: ImageReference,
    /// Command to exec.
    pub entrypoint: Vec<String>,
    /// Content digest.
    pub digest: ImageDigest,
}

impl ResolvedImage {
    /// The digest-pinned image reference.
    #[must_use]
    pub fn pinned_image(&self) -> String {
        self.reference.pinned(&self.digest)
    }
}

/// Resolves an image's entrypoint and digest.
#[async_trait]
pub trait EntrypointResolver: Send + Sync {
    /// Resolve `image` as pulled by `service_account` in `namespace`.
    async fn get(
        &self,
        image: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<ResolvedImage, EntrypointError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    /// Content addressed, identical for every puller.
    Digest(String),
    Tag {
        reference: String,
        namespace: String,
        service_account: String,
    },
}

/// Memoizing [`EntrypointResolver`] backed by a registry.
///
/// Entries never expire; concurrent misses for one key may both hit the
/// registry and the last insert wins.
pub struct EntrypointCache {
    cache: Cache<CacheKey, Arc<ResolvedImage>>,
    credentials: Arc<dyn CredentialResolver>,
    registry: Arc<dyn ImageRegistry>,
}

impl EntrypointCache {
    /// Create an unbounded cache.
    pub fn new(credentials: Arc<dyn CredentialResolver>, registry: Arc<dyn ImageRegistry>) -> Self {
        Self {
            cache: Cache::builder().build(),
            credentials,
            registry,
        }
    }

    /// Create a cache holding at most `max_capacity` images.
    pub fn with_capacity(
        credentials: Arc<dyn CredentialResolver>,
        registry: Arc<dyn ImageRegistry>,
        max_capacity: u64,
    ) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_capacity).build(),
            credentials,
            registry,
        }
    }

    /// Number of cached images.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Run pending maintenance tasks so counts are exact.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    async fn fetch(
        &self,
        reference: ImageReference,
        image: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<ResolvedImage, EntrypointError> {
        let credentials = self
            .credentials
            .resolve(namespace, service_account)
            .await
            .map_err(|source| EntrypointError::Credentials {
                service_account: service_account.to_string(),
                source,
            })?;

        let config = self
            .registry
            .fetch_config(&reference, &credentials)
            .await
            .map_err(|source| EntrypointError::Registry {
                image: image.to_string(),
                source,
            })?;

        let entrypoint = if config.entrypoint.is_empty() {
            config.cmd
        } else {
            config.entrypoint
        };
        if entrypoint.is_empty() {
            return Err(EntrypointError::EmptyEntrypoint {
                image: image.to_string(),
            });
        }

        let digest = reference.digest().cloned().unwrap_or(config.digest);
        Ok(ResolvedImage {
            reference,
            entrypoint,
            digest,
        })
    }
}

#[async_trait]
impl EntrypointResolver for EntrypointCache {
    async fn get(
        &self,
        image: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<ResolvedImage, EntrypointError> {
        let reference = ImageReference::parse(image)?;
        let key = match reference.digest() {
            Some(digest) => CacheKey::Digest(reference.pinned(digest)),
            None => CacheKey::Tag {
                reference: reference.to_string(),
                namespace: namespace.to_string(),
                service_account: service_account.to_string(),
            },
        };

        if let Some(hit) = self.cache.get(&key).await {
            debug!(image, "entrypoint cache hit");
            return Ok(hit.as_ref().clone());
        }

        let resolved = self.fetch(reference, image, namespace, service_account).await?;
        info!(
            image,
            digest = %resolved.digest,
            entrypoint = ?resolved.entrypoint,
            "resolved image entrypoint"
        );
        self.cache.insert(key, Arc::new(resolved.clone())).await;
        Ok(resolved)
    }
}

/// Fill in the command of every container that has none and pin its image.
///
/// Containers with an explicit command are left alone (no registry call)
/// unless `policy.pin_explicit_commands` is set, in which case only their
/// image is pinned.
///
/// # Errors
///
/// Returns the first resolution failure; `containers` may then be partially
/// updated.
pub async fn resolve_entrypoints(
    resolver: &dyn EntrypointResolver,
    namespace: &str,
    service_account: &str,
    containers: &mut [Container],
    policy: EntrypointPolicy,
) -> Result<(), EntrypointError> {
    for container in containers.iter_mut() {
        let has_command = container.command.as_ref().is_some_and(|c| !c.is_empty());
        if has_command && !policy.pin_explicit_commands {
            continue;
        }
        let image = container.image.clone().unwrap_or_default();
        let resolved = resolver.get(&image, namespace, service_account).await?;
        if !has_command {
            container.command = Some(resolved.entrypoint.clone());
        }
        container.image = Some(resolved.pinned_image());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCredentialResolver, InMemoryImageRegistry};

    const DIGEST: &str = "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

    fn setup() -> (EntrypointCache, Arc<InMemoryImageRegistry>) {
        let registry = Arc::new(InMemoryImageRegistry::new());
        registry.add_image(
            "index.docker.io/library/my-image",
            vec!["/my/entrypoint".to_string()],
            DIGEST,
        );
        let cache = EntrypointCache::new(Arc::new(InMemoryCredentialResolver::new()), registry.clone());
        (cache, registry)
    }

    fn container(image: &str, command: &[&str]) -> Container {
        Container {
            name: "step-test".to_string(),
            image: Some(image.to_string()),
            command: if command.is_empty() {
                None
            } else {
                Some(command.iter().map(ToString::to_string).collect())
            },
            ..Container::default()
        }
    }

    /// Given a container with an explicit command
    /// When entrypoints are resolved
    /// Then the registry is never called
    #[tokio::test]
    async fn explicit_command_makes_no_registry_calls() {
        let (cache, registry) = setup();
        let mut containers = vec![container("my-image", &["echo"])];

        let result = resolve_entrypoints(&cache, "foo", "default", &mut containers, EntrypointPolicy::default()).await;

        assert!(result.is_ok());
        assert_eq!(registry.fetch_count(), 0);
        assert_eq!(containers.first().and_then(|c| c.image.as_deref()), Some("my-image"));
    }

    /// Given a container with no command
    /// When entrypoints are resolved twice
    /// Then the registry is called once and the image is pinned
    #[tokio::test]
    async fn empty_command_is_resolved_and_cached() {
        let (cache, registry) = setup();
        let mut first = vec![container("my-image", &[])];
        let mut second = vec![container("my-image", &[])];

        let a = resolve_entrypoints(&cache, "foo", "default", &mut first, EntrypointPolicy::default()).await;
        let b = resolve_entrypoints(&cache, "foo", "default", &mut second, EntrypointPolicy::default()).await;

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(registry.fetch_count(), 1);
        let resolved = first.first();
        assert_eq!(
            resolved.and_then(|c| c.command.clone()),
            Some(vec!["/my/entrypoint".to_string()])
        );
        assert_eq!(
            resolved.and_then(|c| c.image.clone()),
            Some(format!("index.docker.io/library/my-image@{DIGEST}"))
        );
        assert_eq!(first, second);
    }

    /// Given the pin policy is enabled
    /// When a container with an explicit command is resolved
    /// Then its image is pinned and its command kept
    #[tokio::test]
    async fn pin_policy_pins_explicit_commands() {
        let (cache, registry) = setup();
        let mut containers = vec![container("my-image", &["echo", "hi"])];
        let policy = EntrypointPolicy {
            pin_explicit_commands: true,
        };

        let result = resolve_entrypoints(&cache, "foo", "default", &mut containers, policy).await;

        assert!(result.is_ok());
        assert_eq!(registry.fetch_count(), 1);
        let resolved = containers.first();
        assert_eq!(
            resolved.and_then(|c| c.command.clone()),
            Some(vec!["echo".to_string(), "hi".to_string()])
        );
        assert!(resolved
            .and_then(|c| c.image.as_deref())
            .is_some_and(|i| i.ends_with(DIGEST)));
    }

    /// Given different service accounts
    /// When a tag reference is resolved for each
    /// Then each identity gets its own registry lookup
    #[tokio::test]
    async fn tag_references_are_keyed_per_identity() {
        let (cache, registry) = setup();

        let a = cache.get("my-image", "foo", "default").await;
        let b = cache.get("my-image", "foo", "builder").await;
        let c = cache.get("my-image", "foo", "default").await;

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(registry.fetch_count(), 2);
    }

    /// Given a digest reference
    /// When it is resolved from two namespaces
    /// Then the content-addressed entry is shared
    #[tokio::test]
    async fn digest_references_are_shared_across_identities() {
        let (cache, registry) = setup();
        let image = format!("my-image@{DIGEST}");

        let a = cache.get(&image, "foo", "default").await;
        let b = cache.get(&image, "bar", "other").await;

        assert_eq!(a.as_ref().ok().map(|r| r.digest.as_str()), Some(DIGEST));
        assert!(b.is_ok());
        assert_eq!(registry.fetch_count(), 1);
    }

    /// Given an image the registry does not know
    /// When it is resolved
    /// Then a registry error is returned and nothing is cached
    #[tokio::test]
    async fn unknown_image_fails() {
        let (cache, _) = setup();

        let result = cache.get("ghcr.io/nobody/nothing", "foo", "default").await;

        assert!(matches!(result, Err(EntrypointError::Registry { .. })));
        cache.run_pending_tasks().await;
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn malformed_reference_fails() {
        let (cache, registry) = setup();
        let result = cache.get("Not/A/Valid/Ref", "foo", "default").await;
        assert!(matches!(result, Err(EntrypointError::InvalidReference(_))));
        assert_eq!(registry.fetch_count(), 0);
    }
}
