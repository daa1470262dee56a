//! Container image reference parsing.
//!
//! This module parses image strings of the form
//! `[registry/]repository[:tag][@digest]` into their components. Parsing is
//! purely syntactic; no network access is performed and no digests are
//! resolved here.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Registry host assumed when an image string does not name one.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag assumed when an image string carries neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Namespace prepended to bare single-segment repositories on the default
/// registry (`nginx` becomes `library/nginx`).
const DEFAULT_NAMESPACE: &str = "library";

/// A parsed container image reference.
///
/// Exactly one of `tag` and `digest` is authoritative after parsing: a
/// digest, when present, pins the image regardless of any tag that also
/// appears in the string. An image string with neither resolves its tag to
/// [`DEFAULT_TAG`].
///
/// # Examples
///
/// ```rust
/// use dike_core::ImageReference;
///
/// let reference = ImageReference::parse("ghcr.io/acme/payments:signed")?;
/// assert_eq!(reference.registry, "ghcr.io");
/// assert_eq!(reference.repository, "acme/payments");
/// assert_eq!(reference.tag, "signed");
/// assert!(reference.digest.is_empty());
/// # Ok::<(), dike_core::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    /// The image string exactly as given.
    pub image: String,

    /// Registry host, possibly with a port (e.g. `ghcr.io`, `localhost:5000`).
    pub registry: String,

    /// Repository path below the registry (e.g. `acme/payments`).
    pub repository: String,

    /// The identifying suffix: the digest when present, the tag otherwise.
    pub identifier: String,

    /// Resolved tag. Empty when the reference is digest-only.
    pub tag: String,

    /// Resolved digest in `algorithm:hex` form. Empty when the reference
    /// carries only a tag.
    pub digest: String,
}

impl ImageReference {
    /// Parses an image string into an [`ImageReference`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidReference`] when the string cannot be parsed
    /// as `[registry/]repository[:tag][@digest]`.
    pub fn parse(image: &str) -> Result<Self> {
        if image.is_empty() {
            return Err(Error::invalid_reference(image, "empty image string"));
        }

        // Split off the digest first; '@' never appears in a valid name.
        let (name_part, digest) = match image.split_once('@') {
            Some((name, digest)) => {
                validate_digest(image, digest)?;
                (name, digest.to_string())
            }
            None => (image, String::new()),
        };

        if name_part.is_empty() {
            return Err(Error::invalid_reference(image, "missing repository"));
        }

        // A ':' after the last '/' separates the tag; a ':' before it is a
        // registry port (e.g. localhost:5000/app).
        let (name, tag) = match name_part.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag.to_string()),
            _ => (name_part, String::new()),
        };

        if !tag.is_empty() {
            validate_tag(image, &tag)?;
        }

        let (registry, mut repository) = match name.split_once('/') {
            Some((host, rest)) if is_registry_host(host) => (host.to_string(), rest.to_string()),
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        if repository.is_empty() {
            return Err(Error::invalid_reference(image, "missing repository"));
        }

        if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            repository = format!("{DEFAULT_NAMESPACE}/{repository}");
        }

        validate_repository(image, &repository)?;

        // A digest pins the image; the tag is only resolved to "latest" when
        // nothing else identifies it.
        let tag = if tag.is_empty() && digest.is_empty() {
            DEFAULT_TAG.to_string()
        } else {
            tag
        };

        let identifier = if digest.is_empty() {
            tag.clone()
        } else {
            digest.clone()
        };

        Ok(Self {
            image: image.to_string(),
            registry,
            repository,
            identifier,
            tag,
            digest,
        })
    }

    /// Returns the fully qualified name without tag or digest
    /// (`registry/repository`).
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Returns `true` if the reference pins a digest.
    #[must_use]
    pub fn has_digest(&self) -> bool {
        !self.digest.is_empty()
    }

    /// Returns the canonical string form: `registry/repository:tag@digest`
    /// when both are known, `registry/repository@digest` for digest-only
    /// references, and `registry/repository:tag` otherwise.
    #[must_use]
    pub fn canonical(&self) -> String {
        match (self.tag.is_empty(), self.digest.is_empty()) {
            (false, false) => format!("{}:{}@{}", self.name(), self.tag, self.digest),
            (true, false) => format!("{}@{}", self.name(), self.digest),
            _ => format!("{}:{}", self.name(), self.tag),
        }
    }

    /// Returns a copy of this reference resolved to the given digest.
    ///
    /// Used by the fetcher once the registry has reported the canonical
    /// digest for a tag-addressed image.
    #[must_use]
    pub fn with_digest(&self, digest: &str) -> Self {
        let mut resolved = self.clone();
        resolved.digest = digest.to_string();
        resolved.identifier = digest.to_string();
        resolved
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.image)
    }
}

/// Returns whether the first path segment names a registry host rather than
/// a repository namespace.
fn is_registry_host(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}

/// Validates a digest of the form `algorithm:hex`.
fn validate_digest(image: &str, digest: &str) -> Result<()> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(Error::invalid_reference(
            image,
            "digest must be of the form algorithm:hex",
        ));
    };

    if algorithm.is_empty() || !algorithm.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(Error::invalid_reference(image, "invalid digest algorithm"));
    }

    let valid_hex = !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
    if !valid_hex {
        return Err(Error::invalid_reference(image, "digest is not lowercase hex"));
    }

    if algorithm == "sha256" && hex.len() != 64 {
        return Err(Error::invalid_reference(
            image,
            "sha256 digest must be 64 hex characters",
        ));
    }

    Ok(())
}

/// Validates a tag: up to 128 word characters, dots and dashes, not starting
/// with a separator.
fn validate_tag(image: &str, tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if !first_ok || !rest_ok || tag.len() > 128 {
        return Err(Error::invalid_reference(image, format!("invalid tag '{tag}'")));
    }
    Ok(())
}

/// Validates a repository path: slash-separated segments of lowercase
/// alphanumerics with inner separators (`.`, `_`, `-`).
fn validate_repository(image: &str, repository: &str) -> Result<()> {
    for segment in repository.split('/') {
        let valid = !segment.is_empty()
            && segment.chars().next().is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            && segment.chars().last().is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));

        if !valid {
            return Err(Error::invalid_reference(
                image,
                format!("invalid repository segment '{segment}'"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:4a1c4b21597c1b4415bdbecb28a3296c6b5e23ca4f9feeb599860a1dac6a0108";

    #[test]
    fn test_parse_defaults_tag_to_latest() {
        let reference = ImageReference::parse("ghcr.io/acme/payments").unwrap();
        assert_eq!(reference.tag, "latest");
        assert_eq!(reference.identifier, "latest");
        assert!(reference.digest.is_empty());
    }

    #[test]
    fn test_parse_bare_name_uses_default_registry_and_namespace() {
        let reference = ImageReference::parse("nginx").unwrap();
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.repository, "library/nginx");
        assert_eq!(reference.tag, "latest");
    }

    #[test]
    fn test_parse_namespaced_name_keeps_default_registry() {
        let reference = ImageReference::parse("argoproj/argocd:v2.9.3").unwrap();
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.repository, "argoproj/argocd");
        assert_eq!(reference.tag, "v2.9.3");
    }

    #[test]
    fn test_parse_digest_only_reference() {
        let image = format!("ghcr.io/acme/payments@{DIGEST}");
        let reference = ImageReference::parse(&image).unwrap();
        assert_eq!(reference.digest, DIGEST);
        assert_eq!(reference.identifier, DIGEST);
        assert!(reference.tag.is_empty());
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let image = format!("ghcr.io/acme/payments:signed@{DIGEST}");
        let reference = ImageReference::parse(&image).unwrap();
        assert_eq!(reference.tag, "signed");
        assert_eq!(reference.digest, DIGEST);
        assert_eq!(reference.identifier, DIGEST);
    }

    #[test]
    fn test_parse_registry_with_port() {
        let reference = ImageReference::parse("localhost:5000/app:dev").unwrap();
        assert_eq!(reference.registry, "localhost:5000");
        assert_eq!(reference.repository, "app");
        assert_eq!(reference.tag, "dev");
    }

    #[test]
    fn test_canonical_forms() {
        let tagged = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        assert_eq!(tagged.canonical(), "ghcr.io/org/app:v1");

        let pinned = tagged.with_digest(DIGEST);
        assert_eq!(pinned.canonical(), format!("ghcr.io/org/app:v1@{DIGEST}"));

        let digest_only = ImageReference::parse(&format!("ghcr.io/org/app@{DIGEST}")).unwrap();
        assert_eq!(digest_only.canonical(), format!("ghcr.io/org/app@{DIGEST}"));
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(ImageReference::parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        assert!(ImageReference::parse("ghcr.io/org/app@sha256:short").is_err());
        assert!(ImageReference::parse("ghcr.io/org/app@nocolon").is_err());
    }

    #[test]
    fn test_parse_rejects_uppercase_repository() {
        assert!(ImageReference::parse("ghcr.io/Org/App:v1").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_tag() {
        assert!(ImageReference::parse("ghcr.io/org/app:-dev").is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn untagged_references_resolve_to_latest(
                repo in "[a-z][a-z0-9]{1,20}(/[a-z][a-z0-9]{1,20}){0,2}",
            ) {
                let image = format!("registry.example.com/{repo}");
                let reference = ImageReference::parse(&image).unwrap();
                prop_assert_eq!(reference.tag, "latest");
                prop_assert!(reference.digest.is_empty());
            }

            #[test]
            fn digest_references_carry_the_digest(hex in "[a-f0-9]{64}") {
                let image = format!("registry.example.com/app@sha256:{hex}");
                let reference = ImageReference::parse(&image).unwrap();
                prop_assert_eq!(reference.digest, format!("sha256:{hex}"));
                prop_assert!(reference.tag.is_empty());
            }
        }
    }
}
