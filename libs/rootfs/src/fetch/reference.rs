//! Image reference parsing.

use std::fmt;

use super::FetchError;

/// Registry host used for references without one.
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// A parsed `[registry/]repository[:tag|@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, optionally with a port.
    pub registry: String,
    /// Repository path, e.g. `library/alpine`.
    pub repository: String,
    /// Tag or `sha256:` digest.
    pub reference: String,
}

impl ImageReference {
    /// Parse an image reference into registry, repo, and tag/digest components.
    ///
    /// Examples:
    /// - `alpine:latest` -> (registry-1.docker.io, library/alpine, latest)
    /// - `ghcr.io/org/repo:v1` -> (ghcr.io, org/repo, v1)
    /// - `registry.example.com/foo/bar@sha256:abc...` -> (registry.example.com, foo/bar, sha256:abc...)
    ///
    /// A leading `docker://` transport prefix is accepted.
    pub fn parse(image_ref: &str) -> Result<Self, FetchError> {
        let trimmed = image_ref.trim();
        let trimmed = trimmed.strip_prefix("docker://").unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(FetchError::InvalidReference(image_ref.to_string()));
        }

        // Handle digest reference
        let (name_part, reference) = if let Some((name, digest)) = trimmed.rsplit_once('@') {
            // A tag next to a digest (`app:v1@sha256:...`) is informational only.
            (strip_tag(name), digest.to_string())
        } else if let Some((name, tag)) = trimmed.rsplit_once(':') {
            // Make sure this isn't a port number
            if tag.contains('/') {
                (trimmed, "latest".to_string())
            } else {
                (name, tag.to_string())
            }
        } else {
            (trimmed, "latest".to_string())
        };

        if name_part.is_empty() || reference.is_empty() {
            return Err(FetchError::InvalidReference(image_ref.to_string()));
        }

        let (registry, repository) = match name_part.split_once('/') {
            // No slash - Docker Hub library image
            None => (
                DOCKER_HUB_REGISTRY.to_string(),
                format!("library/{name_part}"),
            ),
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                let host = match host {
                    "docker.io" | "index.docker.io" => DOCKER_HUB_REGISTRY,
                    other => other,
                };
                let repository = if host == DOCKER_HUB_REGISTRY && !rest.contains('/') {
                    format!("library/{rest}")
                } else {
                    rest.to_string()
                };
                (host.to_string(), repository)
            }
            // Docker Hub user image
            Some(_) => (DOCKER_HUB_REGISTRY.to_string(), name_part.to_string()),
        };

        if repository.is_empty() || repository.ends_with('/') {
            return Err(FetchError::InvalidReference(image_ref.to_string()));
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Whether the reference pins a content digest rather than a tag.
    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }
}

/// Drop a trailing `:tag` from `name`, leaving a registry port alone.
fn strip_tag(name: &str) -> &str {
    let last_segment = name.rfind('/').map_or(0, |i| i + 1);
    match name[last_segment..].rfind(':') {
        Some(i) => &name[..last_segment + i],
        None => name,
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(
            f,
            "{}/{}{}{}",
            self.registry, self.repository, sep, self.reference
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("alpine:latest", DOCKER_HUB_REGISTRY, "library/alpine", "latest")]
    #[case("alpine", DOCKER_HUB_REGISTRY, "library/alpine", "latest")]
    #[case("alpine:3.18", DOCKER_HUB_REGISTRY, "library/alpine", "3.18")]
    #[case("myuser/myapp:v1", DOCKER_HUB_REGISTRY, "myuser/myapp", "v1")]
    #[case("ghcr.io/org/repo:v2", "ghcr.io", "org/repo", "v2")]
    #[case("gcr.io/project/image:latest", "gcr.io", "project/image", "latest")]
    #[case("alpine@sha256:abc123", DOCKER_HUB_REGISTRY, "library/alpine", "sha256:abc123")]
    #[case(
        "ghcr.io/org/app@sha256:abcdef1234567890",
        "ghcr.io",
        "org/app",
        "sha256:abcdef1234567890"
    )]
    #[case(
        "ghcr.io/org/app:v1@sha256:abc",
        "ghcr.io",
        "org/app",
        "sha256:abc"
    )]
    #[case("localhost:5000/myapp@sha256:abc", "localhost:5000", "myapp", "sha256:abc")]
    #[case("alpine:3.18@sha256:abc", DOCKER_HUB_REGISTRY, "library/alpine", "sha256:abc")]
    #[case("localhost:5000/myapp:test", "localhost:5000", "myapp", "test")]
    #[case("localhost:5000/myapp", "localhost:5000", "myapp", "latest")]
    #[case("docker.io/nginx:1.25", DOCKER_HUB_REGISTRY, "library/nginx", "1.25")]
    #[case(
        "docker://quay.io/jitesoft/alpine:latest",
        "quay.io",
        "jitesoft/alpine",
        "latest"
    )]
    fn test_parse_image_ref(
        #[case] input: &str,
        #[case] registry: &str,
        #[case] repository: &str,
        #[case] reference: &str,
    ) {
        let parsed = ImageReference::parse(input).unwrap();
        assert_eq!(parsed.registry, registry);
        assert_eq!(parsed.repository, repository);
        assert_eq!(parsed.reference, reference);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("alpine:")]
    #[case("alpine@")]
    #[case("ghcr.io/")]
    #[case(":v1@sha256:abc")]
    fn test_parse_image_ref_invalid(#[case] input: &str) {
        assert!(matches!(
            ImageReference::parse(input),
            Err(FetchError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_display() {
        let tag = ImageReference::parse("alpine:3.18").unwrap();
        assert_eq!(tag.to_string(), "registry-1.docker.io/library/alpine:3.18");
        let pinned = ImageReference::parse("ghcr.io/org/app@sha256:abc").unwrap();
        assert!(pinned.is_digest());
        assert_eq!(pinned.to_string(), "ghcr.io/org/app@sha256:abc");
    }
}
