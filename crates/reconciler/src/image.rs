//! Container image references.
//!
//! References are canonicalized the way the Docker CLI does it: the default
//! registry is `index.docker.io`, single-component Docker Hub names get a
//! `library/` prefix and a missing tag means `latest`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Registry used when a reference names none.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Tag used when a reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

#[expect(clippy::expect_used)]
static COMPONENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("hardcoded regex pattern is valid")
});

#[expect(clippy::expect_used)]
static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("hardcoded regex pattern is valid")
});

#[expect(clippy::expect_used)]
static DIGEST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^sha256:[a-f0-9]{64}$").expect("hardcoded regex pattern is valid")
});

/// A reference that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid image reference '{reference}': {reason}")]
pub struct InvalidReference {
    /// The rejected input.
    pub reference: String,
    /// What was wrong with it.
    pub reason: String,
}

impl InvalidReference {
    fn new(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}

/// A content digest (`sha256:<64 hex>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageDigest(String);

impl ImageDigest {
    /// Parse a digest.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidReference`] unless the input is `sha256:` followed
    /// by 64 lowercase hex characters.
    pub fn parse(input: &str) -> Result<Self, InvalidReference> {
        if DIGEST_REGEX.is_match(input) {
            Ok(Self(input.to_string()))
        } else {
            Err(InvalidReference::new(input, "digest must be sha256:<64 hex>"))
        }
    }

    /// The digest text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed, canonical image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<ImageDigest>,
}

impl ImageReference {
    /// Parse and canonicalize a reference.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidReference`] for empty input, upper-case or otherwise
    /// malformed repository names, bad tags and bad digests.
    pub fn parse(input: &str) -> Result<Self, InvalidReference> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(InvalidReference::new(input, "empty reference"));
        }

        let (name_and_tag, digest) = match raw.split_once('@') {
            Some((name, digest)) => (
                name,
                Some(ImageDigest::parse(digest).map_err(|e| InvalidReference::new(input, e.reason))?),
            ),
            None => (raw, None),
        };

        let (name, tag) = match name_and_tag.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => {
                if !TAG_REGEX.is_match(tag) {
                    return Err(InvalidReference::new(input, format!("invalid tag '{tag}'")));
                }
                (name, Some(tag.to_string()))
            }
            _ => (name_and_tag, None),
        };

        let (registry, path) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first, rest)
            }
            _ => (DEFAULT_REGISTRY, name),
        };
        let registry = if registry == "docker.io" {
            DEFAULT_REGISTRY
        } else {
            registry
        };

        let repository = if registry == DEFAULT_REGISTRY && !path.contains('/') {
            format!("library/{path}")
        } else {
            path.to_string()
        };

        if let Some(bad) = repository.split('/').find(|c| !COMPONENT_REGEX.is_match(c)) {
            return Err(InvalidReference::new(
                input,
                format!("invalid repository component '{bad}'"),
            ));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag,
            digest,
        })
    }

    /// Registry host.
    #[must_use]
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Effective tag; `latest` when neither tag nor digest was given.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => Some(tag),
            (None, None) => Some(DEFAULT_TAG),
            (None, Some(_)) => None,
        }
    }

    /// Digest, if the reference is content addressed.
    #[must_use]
    pub const fn digest(&self) -> Option<&ImageDigest> {
        self.digest.as_ref()
    }

    /// `registry/repository` without tag or digest.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The digest-pinned form `registry/repository@digest`.
    #[must_use]
    pub fn pinned(&self, digest: &ImageDigest) -> String {
        format!("{}@{digest}", self.name())
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(tag) = self.tag() {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
