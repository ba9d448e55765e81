//! Image reference parsing.
//!
//! Two levels: [`ImageReference`] is a registry reference such as
//! `ghcr.io/org/image:tag`, and [`Transport`] is a `scheme:spec` source URI
//! naming where an OCI image comes from.

use std::fmt;
use std::path::PathBuf;

use sbuild_core::error::{BuildError, Result};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed registry image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, possibly with a port
    pub registry: String,
    /// Repository path (e.g., "library/busybox")
    pub repository: String,
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a registry reference.
    ///
    /// - `busybox` → docker.io/library/busybox:latest
    /// - `user/image:1.0` → docker.io/user/image:1.0
    /// - `localhost:5000/image` → localhost:5000/image:latest
    /// - `ghcr.io/org/image@sha256:abc...` → digest pinned, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim().trim_start_matches("//");
        if reference.is_empty() {
            return Err(BuildError::Config("Empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(BuildError::Config(format!(
                        "Invalid digest format in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag colon only counts after the last slash, so registry ports
        // are never mistaken for tags.
        let last_segment_start = name_tag.rfind('/').map_or(0, |p| p + 1);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let split = last_segment_start + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };
        if tag.as_deref() == Some("") {
            return Err(BuildError::Config(format!(
                "Empty tag in reference '{}'",
                reference
            )));
        }

        let (registry, repository) = split_registry_repository(name)?;
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The reference as `registry/repository[:tag][@digest]`.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Whether the registry is Docker Hub under any of its names.
    pub fn is_docker_hub(&self) -> bool {
        matches!(
            self.registry.as_str(),
            "docker.io" | "index.docker.io" | "registry-1.docker.io"
        )
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

fn split_registry_repository(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(BuildError::Config(format!(
                    "Empty repository in reference '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

/// Where an OCI image is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// `docker://[registry/]repo[:tag]`
    Docker(ImageReference),
    /// `docker-archive:path[:ref]`, a `docker save` tarball
    DockerArchive { path: PathBuf, reference: Option<String> },
    /// `docker-daemon:name[:tag]`, exported from a running daemon
    DockerDaemon(String),
    /// `oci:dir[:tag]`, an OCI image layout directory
    Oci { path: PathBuf, tag: Option<String> },
    /// `oci-archive:file[:tag]`, a tarred OCI image layout
    OciArchive { path: PathBuf, tag: Option<String> },
}

impl Transport {
    /// Parse a `scheme:spec` source URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, spec) = uri.split_once(':').ok_or_else(|| {
            BuildError::Config(format!("Source '{}' has no transport scheme", uri))
        })?;

        match scheme {
            "docker" => {
                let spec = spec.strip_prefix("//").ok_or_else(|| {
                    BuildError::Config(format!("docker reference '{}' requires a host", uri))
                })?;
                Ok(Transport::Docker(ImageReference::parse(spec)?))
            }
            "docker-archive" => {
                let (path, reference) = split_path_suffix(spec);
                Ok(Transport::DockerArchive { path, reference })
            }
            "docker-daemon" => {
                let name = spec.trim_start_matches("//");
                if name.is_empty() {
                    return Err(BuildError::Config(format!(
                        "docker-daemon reference '{}' names no image",
                        uri
                    )));
                }
                Ok(Transport::DockerDaemon(name.to_string()))
            }
            "oci" => {
                let (path, tag) = split_path_suffix(spec);
                Ok(Transport::Oci { path, tag })
            }
            "oci-archive" => {
                let (path, tag) = split_path_suffix(spec);
                Ok(Transport::OciArchive { path, tag })
            }
            other => Err(BuildError::Config(format!(
                "Unsupported OCI transport '{}' in '{}'",
                other, uri
            ))),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Docker(_) => "docker",
            Transport::DockerArchive { .. } => "docker-archive",
            Transport::DockerDaemon(_) => "docker-daemon",
            Transport::Oci { .. } => "oci",
            Transport::OciArchive { .. } => "oci-archive",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Docker(r) => write!(f, "docker://{}", r),
            Transport::DockerArchive { path, reference } => {
                write!(f, "docker-archive:{}", path.display())?;
                reference.as_ref().map_or(Ok(()), |r| write!(f, ":{}", r))
            }
            Transport::DockerDaemon(name) => write!(f, "docker-daemon:{}", name),
            Transport::Oci { path, tag } | Transport::OciArchive { path, tag } => {
                write!(f, "{}:{}", self.scheme(), path.display())?;
                tag.as_ref().map_or(Ok(()), |t| write!(f, ":{}", t))
            }
        }
    }
}

/// Split `path[:suffix]`; a suffix containing `/` is part of the path.
fn split_path_suffix(spec: &str) -> (PathBuf, Option<String>) {
    match spec.rsplit_once(':') {
        Some((path, suffix)) if !path.is_empty() && !suffix.is_empty() && !suffix.contains('/') => {
            (PathBuf::from(path), Some(suffix.to_string()))
        }
        _ => (PathBuf::from(spec), None),
    }
}

/// Build the source URI for an OCI-family recipe.
///
/// `namespace` and then `registry` are prepended to `from`; the docker
/// scheme takes the `//` host marker.
pub fn source_uri(
    bootstrap: &str,
    from: &str,
    registry: Option<&str>,
    namespace: Option<&str>,
) -> String {
    let mut reference = from.trim().to_string();
    if let Some(ns) = namespace.filter(|n| !n.is_empty()) {
        reference = format!("{}/{}", ns.trim_end_matches('/'), reference);
    }
    if let Some(reg) = registry.filter(|r| !r.is_empty()) {
        reference = format!("{}/{}", reg.trim_end_matches('/'), reference);
    }
    match bootstrap {
        "docker" => format!("docker://{}", reference.trim_start_matches("//")),
        other => format!("{}:{}", other, reference),
    }
}
