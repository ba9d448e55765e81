//! OCI registry client.
//!
//! Uses the `oci-distribution` crate to pull images from container
//! registries into a local OCI image layout. Every blob is sha256-checked
//! before it is renamed into the layout or the shared cache.

use std::path::{Path, PathBuf};

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use sbuild_core::error::{BuildError, Result};
use sbuild_core::platform::Platform;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::credentials::RegistryCredential;
use super::reference::ImageReference;
use crate::cache::{sha256_bytes, sha256_file, sha256_hex, BlobCache};

const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Pulls images from one registry.
pub struct RegistryClient {
    client: Client,
    auth: OciRegistryAuth,
    registry: String,
}

impl RegistryClient {
    /// Client for `registry`, selecting multi-arch entries for `platform`.
    /// With `no_https`, the registry is spoken to over plain HTTP.
    pub fn new(
        registry: &str,
        credential: &RegistryCredential,
        platform: &Platform,
        no_https: bool,
    ) -> Self {
        let protocol = if no_https {
            ClientProtocol::HttpsExcept(vec![registry.to_string()])
        } else {
            ClientProtocol::Https
        };
        let wanted = platform.clone();
        let config = ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(move |entries: &[ImageIndexEntry]| {
                resolve_platform(entries, &wanted)
            })),
            ..Default::default()
        };

        Self {
            client: Client::new(config),
            auth: to_oci_auth(credential),
            registry: registry.to_string(),
        }
    }

    /// Pull `reference` into an OCI image layout at `layout_dir`.
    ///
    /// Blobs found in `cache` are reused; downloaded blobs are added to it.
    /// Returns the manifest digest.
    pub async fn pull_to_layout(
        &self,
        reference: &ImageReference,
        layout_dir: &Path,
        cache: Option<&BlobCache>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;

        tracing::info!(
            reference = %reference,
            target = %layout_dir.display(),
            "Pulling image from registry"
        );

        let blobs_dir = layout_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).map_err(|e| {
            BuildError::Other(format!(
                "Failed to create blobs directory {}: {}",
                blobs_dir.display(),
                e
            ))
        })?;

        let (manifest, _) = self.pull_manifest(&oci_ref, cancel).await?;

        self.fetch_blob(&oci_ref, &manifest.config, &blobs_dir, cache, cancel)
            .await?;
        for layer in &manifest.layers {
            self.fetch_blob(&oci_ref, layer, &blobs_dir, cache, cancel)
                .await?;
        }

        // The layout records the manifest exactly as written, so its digest
        // is taken from these bytes rather than the registry's.
        let manifest_json = serde_json::to_vec(&manifest)?;
        let manifest_digest = sha256_bytes(&manifest_json);
        write_file(
            &blobs_dir.join(sha256_hex(&manifest_digest)?),
            &manifest_json,
        )?;
        write_file(
            &layout_dir.join("oci-layout"),
            br#"{"imageLayoutVersion":"1.0.0"}"#,
        )?;
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": manifest.media_type.clone().unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string()),
                "digest": manifest_digest,
                "size": manifest_json.len()
            }]
        });
        write_file(
            &layout_dir.join("index.json"),
            serde_json::to_string_pretty(&index)?.as_bytes(),
        )?;

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            layers = manifest.layers.len(),
            "Image pulled"
        );
        Ok(manifest_digest)
    }

    /// Pull the single layer of an artifact whose media type is
    /// `media_type` to `dest`.
    pub async fn pull_artifact_layer(
        &self,
        reference: &ImageReference,
        media_type: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let oci_ref = to_oci_reference(reference)?;
        let (manifest, _) = self.pull_manifest(&oci_ref, cancel).await?;

        let layer = manifest
            .layers
            .iter()
            .find(|l| l.media_type == media_type)
            .ok_or_else(|| BuildError::Registry {
                registry: self.registry.clone(),
                message: format!("{} has no layer of type {}", reference, media_type),
            })?;

        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let staged = NamedTempFile::new_in(dir)?;
        self.download_verified(&oci_ref, layer, &staged, cancel).await?;
        staged.persist(dest).map_err(|e| {
            BuildError::Other(format!("Failed to write {}: {}", dest.display(), e.error))
        })?;

        tracing::info!(reference = %reference, dest = %dest.display(), "Pulled artifact layer");
        Ok(dest.to_path_buf())
    }

    async fn pull_manifest(
        &self,
        oci_ref: &Reference,
        cancel: &CancellationToken,
    ) -> Result<(OciImageManifest, String)> {
        tokio::select! {
            res = self.client.pull_image_manifest(oci_ref, &self.auth) => {
                res.map_err(|e| self.classify("Failed to pull manifest", e))
            }
            _ = cancel.cancelled() => Err(BuildError::Cancelled),
        }
    }

    /// Place one blob in `blobs_dir`, from the cache when possible.
    async fn fetch_blob(
        &self,
        oci_ref: &Reference,
        descriptor: &OciDescriptor,
        blobs_dir: &Path,
        cache: Option<&BlobCache>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let digest = descriptor.digest.as_str();
        let dest = blobs_dir.join(sha256_hex(digest)?);

        if let Some(cache) = cache {
            if cache.get(digest)?.is_none() {
                tracing::debug!(digest, size = descriptor.size, "Pulling blob into cache");
                let staged = cache.staging_file()?;
                self.download(oci_ref, descriptor, &staged, cancel).await?;
                cache.commit(digest, staged)?;
            }
            return cache.copy_to(digest, &dest);
        }

        tracing::debug!(digest, size = descriptor.size, "Pulling blob");
        let staged = NamedTempFile::new_in(blobs_dir)?;
        self.download_verified(oci_ref, descriptor, &staged, cancel)
            .await?;
        staged.persist(&dest).map_err(|e| {
            BuildError::Other(format!("Failed to write blob {}: {}", digest, e.error))
        })?;
        Ok(())
    }

    async fn download_verified(
        &self,
        oci_ref: &Reference,
        descriptor: &OciDescriptor,
        staged: &NamedTempFile,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.download(oci_ref, descriptor, staged, cancel).await?;
        let actual = sha256_file(staged.path())?;
        if actual != descriptor.digest {
            return Err(BuildError::Registry {
                registry: self.registry.clone(),
                message: format!(
                    "Digest mismatch for blob {}: got {}",
                    descriptor.digest, actual
                ),
            });
        }
        Ok(())
    }

    async fn download(
        &self,
        oci_ref: &Reference,
        descriptor: &OciDescriptor,
        staged: &NamedTempFile,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut file = tokio::fs::File::from_std(staged.reopen()?);
        tokio::select! {
            res = self.client.pull_blob(oci_ref, descriptor, &mut file) => {
                res.map_err(|e| self.classify(&format!("Failed to pull blob {}", descriptor.digest), e))?
            }
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
        }
        // tokio files complete writes in the background; settle them before
        // the blob is hashed.
        file.flush().await?;
        Ok(())
    }

    /// Authorization failures are kept apart from other registry errors so
    /// callers can tell "private image" from "network down".
    fn classify(&self, context: &str, err: impl std::fmt::Display) -> BuildError {
        let message = format!("{}: {}", context, err);
        if is_auth_failure(&message) {
            BuildError::RegistryAuth {
                registry: self.registry.clone(),
                message,
            }
        } else {
            BuildError::Registry {
                registry: self.registry.clone(),
                message,
            }
        }
    }
}

fn is_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["401", "403", "unauthorized", "denied", "authentication"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn to_oci_auth(credential: &RegistryCredential) -> OciRegistryAuth {
    match credential {
        RegistryCredential::Basic { username, password } => {
            OciRegistryAuth::Basic(username.clone(), password.clone())
        }
        RegistryCredential::Anonymous => OciRegistryAuth::Anonymous,
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.tag, &reference.digest) {
        (_, Some(digest)) => format!("{}/{}@{}", reference.registry, reference.repository, digest),
        (Some(tag), None) => format!("{}/{}:{}", reference.registry, reference.repository, tag),
        (None, None) => format!("{}/{}:latest", reference.registry, reference.repository),
    };
    ref_str
        .parse::<Reference>()
        .map_err(|e| BuildError::Config(format!("Invalid OCI reference '{}': {}", ref_str, e)))
}

/// Pick the index entry whose platform satisfies `wanted`.
fn resolve_platform(entries: &[ImageIndexEntry], wanted: &Platform) -> Option<String> {
    entries
        .iter()
        .find(|entry| {
            entry.platform.as_ref().is_some_and(|p| {
                Platform::new(p.os.clone(), &p.architecture, p.variant.as_deref())
                    .satisfies(wanted)
            })
        })
        .map(|entry| entry.digest.clone())
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data)
        .map_err(|e| BuildError::Other(format!("Failed to write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(arch: &str, variant: Option<&str>, digest: &str) -> ImageIndexEntry {
        serde_json::from_value(serde_json::json!({
            "mediaType": OCI_MANIFEST_MEDIA_TYPE,
            "digest": digest,
            "size": 1,
            "platform": {"architecture": arch, "os": "linux", "variant": variant}
        }))
        .unwrap()
    }

    #[test]
    fn test_resolve_platform() {
        let entries = vec![
            entry("amd64", None, "sha256:amd"),
            entry("arm", Some("v6"), "sha256:armv6"),
            entry("arm", Some("v7"), "sha256:armv7"),
        ];
        assert_eq!(
            resolve_platform(&entries, &Platform::new("linux", "amd64", None)).as_deref(),
            Some("sha256:amd")
        );
        assert_eq!(
            resolve_platform(&entries, &Platform::new("linux", "arm", Some("v7"))).as_deref(),
            Some("sha256:armv7")
        );
        assert_eq!(
            resolve_platform(&entries, &Platform::new("linux", "s390x", None)),
            None
        );
    }

    #[test]
    fn test_auth_failures_are_distinguished() {
        let client = RegistryClient::new(
            "ghcr.io",
            &RegistryCredential::Anonymous,
            &Platform::new("linux", "amd64", None),
            false,
        );
        assert!(matches!(
            client.classify("pull", "401 Unauthorized"),
            BuildError::RegistryAuth { .. }
        ));
        assert!(matches!(
            client.classify("pull", "requested access to the resource is denied"),
            BuildError::RegistryAuth { .. }
        ));
        assert!(matches!(
            client.classify("pull", "connection refused"),
            BuildError::Registry { .. }
        ));
    }

    #[test]
    fn test_to_oci_reference() {
        let r = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        assert_eq!(to_oci_reference(&r).unwrap().to_string(), "ghcr.io/org/app:v1");

        let r = ImageReference {
            registry: "docker.io".to_string(),
            repository: "library/busybox".to_string(),
            tag: None,
            digest: None,
        };
        assert!(to_oci_reference(&r).unwrap().to_string().ends_with(":latest"));
    }

    #[test]
    fn test_to_oci_auth() {
        assert!(matches!(
            to_oci_auth(&RegistryCredential::Anonymous),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            to_oci_auth(&RegistryCredential::basic("u", "p")),
            OciRegistryAuth::Basic(_, _)
        ));
    }

    #[tokio::test]
    #[ignore = "requires network access to docker.io"]
    async fn test_pull_busybox_layout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let client = RegistryClient::new(
            "docker.io",
            &RegistryCredential::Anonymous,
            &Platform::new("linux", "amd64", None),
            false,
        );
        let reference = ImageReference::parse("busybox:latest").unwrap();
        let cache = BlobCache::new(&tmp.path().join("cache")).unwrap();
        client
            .pull_to_layout(&reference, &tmp.path().join("layout"), Some(&cache), &CancellationToken::new())
            .await
            .unwrap();
        assert!(tmp.path().join("layout/index.json").is_file());
        assert!(cache.total_size().unwrap() > 0);
    }
}
