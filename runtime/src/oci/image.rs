//! Fetched OCI image handle.
//!
//! An [`OciImage`] is an image materialized on local disk, either as an OCI
//! image layout or as an unpacked `docker save` archive. Consumers only see
//! the config, the ordered layer list and the declared platform.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest};
use sbuild_core::error::{BuildError, Result};
use sbuild_core::platform::Platform;
use serde::Deserialize;

/// Annotation naming a manifest inside an OCI layout index.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Media type given to layers of a docker-archive, whose manifest has none.
pub const DOCKER_ARCHIVE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Whether `media_type` names a filesystem layer (as opposed to an
/// artifact blob such as a SIF file).
pub fn is_layer_media_type(media_type: &str) -> bool {
    media_type.starts_with("application/vnd.oci.image.layer.")
        || media_type.starts_with("application/vnd.docker.image.rootfs.")
}

fn is_index_media_type(media_type: &str) -> bool {
    media_type == "application/vnd.oci.image.index.v1+json"
        || media_type == "application/vnd.docker.distribution.manifest.list.v2+json"
}

/// One layer blob on disk.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    pub media_type: String,
    /// Content digest; docker-archive layers carry none
    pub digest: Option<String>,
    pub path: PathBuf,
}

impl LayerBlob {
    pub fn is_layer(&self) -> bool {
        is_layer_media_type(&self.media_type)
    }

    /// Open the compressed blob.
    pub fn open(&self) -> Result<BufReader<File>> {
        let file = File::open(&self.path).map_err(|e| {
            BuildError::ExtractionFailed(format!(
                "Failed to open layer {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(BufReader::new(file))
    }
}

/// An image materialized on local disk.
#[derive(Debug)]
pub struct OciImage {
    root_dir: PathBuf,
    config: ImageConfiguration,
    /// Layers, base first
    layers: Vec<LayerBlob>,
}

impl OciImage {
    /// Load an image from an OCI image layout.
    ///
    /// With `tag`, the index entry annotated with that ref name is used.
    /// Without, a single-entry index is used directly and a multi-entry one
    /// is resolved by platform. Nested indexes are resolved by platform.
    pub fn from_layout(path: impl AsRef<Path>, tag: Option<&str>, platform: &Platform) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();
        validate_layout(&root_dir)?;

        let index: ImageIndex = read_json(&root_dir.join("index.json"), "index.json")?;
        let mut descriptor = select_from_index(&index, tag, platform, &root_dir)?;

        // Follow nested indexes (multi-arch images) down to a manifest.
        while is_index_media_type(&descriptor.media_type().to_string()) {
            let nested: ImageIndex =
                read_json(&blob_path(&root_dir, descriptor.digest())?, "nested index")?;
            descriptor = select_from_index(&nested, None, platform, &root_dir)?;
        }

        let manifest: ImageManifest =
            read_json(&blob_path(&root_dir, descriptor.digest())?, "manifest")?;
        let config: ImageConfiguration =
            read_json(&blob_path(&root_dir, manifest.config().digest())?, "config")?;

        let layers = manifest
            .layers()
            .iter()
            .map(|layer| {
                Ok(LayerBlob {
                    media_type: layer.media_type().to_string(),
                    digest: Some(layer.digest().to_string()),
                    path: blob_path(&root_dir, layer.digest())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            layout = %root_dir.display(),
            manifest = %descriptor.digest(),
            layers = layers.len(),
            "Loaded OCI layout"
        );

        Ok(Self {
            root_dir,
            config,
            layers,
        })
    }

    /// Load an image from an unpacked `docker save` archive.
    ///
    /// `reference` picks the entry whose `RepoTags` contains it; otherwise
    /// the archive must hold exactly one image.
    pub fn from_docker_archive(path: impl AsRef<Path>, reference: Option<&str>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();
        let entries: Vec<DockerArchiveEntry> =
            read_json(&root_dir.join("manifest.json"), "docker-archive manifest.json")?;

        let entry = match reference {
            Some(reference) => entries
                .iter()
                .find(|e| e.repo_tags.iter().any(|t| t == reference))
                .ok_or_else(|| {
                    BuildError::Config(format!(
                        "docker-archive {} has no image tagged '{}'",
                        root_dir.display(),
                        reference
                    ))
                })?,
            None => match entries.as_slice() {
                [single] => single,
                [] => {
                    return Err(BuildError::Config(format!(
                        "docker-archive {} contains no images",
                        root_dir.display()
                    )))
                }
                _ => {
                    return Err(BuildError::Config(format!(
                        "docker-archive {} contains several images, name one",
                        root_dir.display()
                    )))
                }
            },
        };

        let config: ImageConfiguration =
            read_json(&contained(&root_dir, &entry.config)?, "docker-archive config")?;
        let layers = entry
            .layers
            .iter()
            .map(|layer| {
                Ok(LayerBlob {
                    media_type: DOCKER_ARCHIVE_LAYER.to_string(),
                    digest: None,
                    path: contained(&root_dir, layer)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root_dir,
            config,
            layers,
        })
    }

    /// Image configuration (entrypoint, cmd, env, labels, platform).
    pub fn config_file(&self) -> &ImageConfiguration {
        &self.config
    }

    /// Layers in application order, base first.
    pub fn layers(&self) -> &[LayerBlob] {
        &self.layers
    }

    /// Platform declared by the image config, if any.
    pub fn platform(&self) -> Option<Platform> {
        let os = self.config.os().to_string();
        let arch = self.config.architecture().to_string();
        if os.is_empty() || arch.is_empty() {
            return None;
        }
        Some(Platform::new(os, &arch, self.config.variant().as_deref()))
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn entrypoint(&self) -> Vec<String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.entrypoint().clone())
            .unwrap_or_default()
    }

    pub fn cmd(&self) -> Vec<String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.cmd().clone())
            .unwrap_or_default()
    }

    /// Environment as raw `KEY=VALUE` strings.
    pub fn env(&self) -> Vec<String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.env().clone())
            .unwrap_or_default()
    }

    pub fn labels(&self) -> std::collections::BTreeMap<String, String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.labels().clone())
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct DockerArchiveEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

fn validate_layout(root_dir: &Path) -> Result<()> {
    for required in ["oci-layout", "index.json", "blobs"] {
        if !root_dir.join(required).exists() {
            return Err(BuildError::Config(format!(
                "Not a valid OCI layout: missing {} in {}",
                required,
                root_dir.display()
            )));
        }
    }
    Ok(())
}

fn select_from_index(
    index: &ImageIndex,
    tag: Option<&str>,
    platform: &Platform,
    root_dir: &Path,
) -> Result<Descriptor> {
    let manifests = index.manifests();

    if let Some(tag) = tag {
        return manifests
            .iter()
            .find(|d| ref_name(d).is_some_and(|name| name == tag || name.ends_with(&format!(":{}", tag))))
            .cloned()
            .ok_or_else(|| {
                BuildError::Config(format!(
                    "No image tagged '{}' in OCI layout {}",
                    tag,
                    root_dir.display()
                ))
            });
    }

    match manifests.as_slice() {
        [] => Err(BuildError::Config(format!(
            "No manifests in index of OCI layout {}",
            root_dir.display()
        ))),
        [single] => Ok(single.clone()),
        many => many
            .iter()
            .find(|d| descriptor_platform(d).is_some_and(|p| p.satisfies(platform)))
            .cloned()
            .ok_or_else(|| BuildError::PlatformMismatch {
                required: platform.to_string(),
                image: many
                    .iter()
                    .filter_map(descriptor_platform)
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
    }
}

fn ref_name(descriptor: &Descriptor) -> Option<&str> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(REF_NAME_ANNOTATION))
        .map(String::as_str)
}

fn descriptor_platform(descriptor: &Descriptor) -> Option<Platform> {
    descriptor.platform().as_ref().map(|p| {
        Platform::new(
            p.os().to_string(),
            &p.architecture().to_string(),
            p.variant().as_deref(),
        )
    })
}

fn blob_path(root_dir: &Path, digest: &str) -> Result<PathBuf> {
    let (algorithm, hex) = digest.split_once(':').ok_or_else(|| {
        BuildError::Config(format!("Malformed digest '{}'", digest))
    })?;
    if hex.is_empty() || hex.contains('/') || algorithm.contains('/') {
        return Err(BuildError::Config(format!("Malformed digest '{}'", digest)));
    }
    Ok(root_dir.join("blobs").join(algorithm).join(hex))
}

/// Resolve an archive-relative path, refusing escapes.
fn contained(root_dir: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(BuildError::Config(format!(
            "docker-archive path '{}' escapes the archive",
            relative
        )));
    }
    Ok(root_dir.join(rel))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let mut content = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut content))
        .map_err(|e| {
            BuildError::Config(format!("Failed to read {} at {}: {}", what, path.display(), e))
        })?;
    serde_json::from_str(&content)
        .map_err(|e| BuildError::Config(format!("Failed to parse {} at {}: {}", what, path.display(), e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::sha256_bytes;
    use std::fs;
    use tempfile::TempDir;

    /// Write a blob into a layout and return its digest.
    pub(crate) fn write_blob(layout: &Path, data: &[u8]) -> String {
        let digest = sha256_bytes(data);
        let dir = layout.join("blobs").join("sha256");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(digest.trim_start_matches("sha256:")), data).unwrap();
        digest
    }

    pub(crate) fn config_json(arch: &str, entrypoint: &[&str], cmd: &[&str]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "architecture": arch,
            "os": "linux",
            "config": {
                "Entrypoint": entrypoint,
                "Cmd": cmd,
                "Env": ["PATH=/usr/bin:/bin", "HELLO=world"],
                "Labels": {"maintainer": "builder"}
            },
            "rootfs": {"type": "layers", "diff_ids": []}
        }))
        .unwrap()
    }

    /// Write a manifest for `layers` and return (digest, size).
    pub(crate) fn write_manifest(layout: &Path, config: &[u8], layers: &[(&str, Vec<u8>)]) -> (String, usize) {
        let config_digest = write_blob(layout, config);
        let layer_descs: Vec<_> = layers
            .iter()
            .map(|(media_type, data)| {
                serde_json::json!({
                    "mediaType": media_type,
                    "digest": write_blob(layout, data),
                    "size": data.len()
                })
            })
            .collect();
        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config.len()
            },
            "layers": layer_descs
        }))
        .unwrap();
        (write_blob(layout, &manifest), manifest.len())
    }

    pub(crate) fn write_index(layout: &Path, manifests: serde_json::Value) {
        fs::write(layout.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        fs::write(
            layout.join("index.json"),
            serde_json::to_vec(&serde_json::json!({"schemaVersion": 2, "manifests": manifests})).unwrap(),
        )
        .unwrap();
    }

    fn amd64() -> Platform {
        Platform::new("linux", "amd64", None)
    }

    #[test]
    fn test_missing_layout_parts() {
        let tmp = TempDir::new().unwrap();
        let err = OciImage::from_layout(tmp.path(), None, &amd64()).unwrap_err();
        assert!(err.to_string().contains("oci-layout"));
    }

    #[test]
    fn test_single_manifest_layout() {
        let tmp = TempDir::new().unwrap();
        let config = config_json("amd64", &[], &["sh"]);
        let (digest, size) = write_manifest(
            tmp.path(),
            &config,
            &[("application/vnd.oci.image.layer.v1.tar+gzip", b"layer".to_vec())],
        );
        write_index(
            tmp.path(),
            serde_json::json!([{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": digest,
                "size": size
            }]),
        );

        let image = OciImage::from_layout(tmp.path(), None, &amd64()).unwrap();
        assert_eq!(image.layers().len(), 1);
        assert!(image.layers()[0].is_layer());
        assert!(image.layers()[0].path.is_file());
        assert_eq!(image.cmd(), vec!["sh"]);
        assert!(image.entrypoint().is_empty());
        assert_eq!(image.platform().unwrap().to_string(), "linux/amd64");
        assert_eq!(image.labels().get("maintainer").map(String::as_str), Some("builder"));
    }

    #[test]
    fn test_tag_and_platform_selection() {
        let tmp = TempDir::new().unwrap();
        let (amd, amd_size) = write_manifest(tmp.path(), &config_json("amd64", &[], &["amd"]), &[]);
        let (arm, arm_size) = write_manifest(tmp.path(), &config_json("arm64", &[], &["arm"]), &[]);

        let nested = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "manifests": [
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": amd, "size": amd_size,
                 "platform": {"os": "linux", "architecture": "amd64"}},
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": arm, "size": arm_size,
                 "platform": {"os": "linux", "architecture": "arm64"}}
            ]
        }))
        .unwrap();
        let nested_digest = write_blob(tmp.path(), &nested);
        write_index(
            tmp.path(),
            serde_json::json!([
                {"mediaType": "application/vnd.oci.image.index.v1+json", "digest": nested_digest,
                 "size": nested.len(), "annotations": {REF_NAME_ANNOTATION: "v1"}},
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": amd,
                 "size": amd_size, "annotations": {REF_NAME_ANNOTATION: "other"}}
            ]),
        );

        let arm64 = Platform::new("linux", "arm64", None);
        let image = OciImage::from_layout(tmp.path(), Some("v1"), &arm64).unwrap();
        assert_eq!(image.cmd(), vec!["arm"]);

        let image = OciImage::from_layout(tmp.path(), Some("v1"), &amd64()).unwrap();
        assert_eq!(image.cmd(), vec!["amd"]);

        assert!(OciImage::from_layout(tmp.path(), Some("missing"), &amd64()).is_err());

        let riscv = Platform::new("linux", "riscv64", None);
        let err = OciImage::from_layout(tmp.path(), Some("v1"), &riscv).unwrap_err();
        assert!(matches!(err, BuildError::PlatformMismatch { .. }));
    }

    #[test]
    fn test_docker_archive() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("cfg.json"), config_json("amd64", &["/entry"], &[])).unwrap();
        fs::create_dir(tmp.path().join("abc")).unwrap();
        fs::write(tmp.path().join("abc/layer.tar"), b"tar").unwrap();
        fs::write(
            tmp.path().join("manifest.json"),
            r#"[{"Config":"cfg.json","RepoTags":["app:1"],"Layers":["abc/layer.tar"]}]"#,
        )
        .unwrap();

        let image = OciImage::from_docker_archive(tmp.path(), None).unwrap();
        assert_eq!(image.entrypoint(), vec!["/entry"]);
        assert_eq!(image.layers()[0].media_type, DOCKER_ARCHIVE_LAYER);
        assert!(image.layers()[0].is_layer());

        assert!(OciImage::from_docker_archive(tmp.path(), Some("app:1")).is_ok());
        assert!(OciImage::from_docker_archive(tmp.path(), Some("app:2")).is_err());
    }

    #[test]
    fn test_docker_archive_rejects_escape() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("manifest.json"),
            r#"[{"Config":"../cfg.json","Layers":[]}]"#,
        )
        .unwrap();
        assert!(OciImage::from_docker_archive(tmp.path(), None).is_err());
    }

    #[test]
    fn test_media_types() {
        assert!(is_layer_media_type("application/vnd.oci.image.layer.v1.tar+zstd"));
        assert!(is_layer_media_type("application/vnd.docker.image.rootfs.diff.tar.gzip"));
        assert!(!is_layer_media_type("application/vnd.sylabs.sif.layer.v1.sif"));
    }
}
