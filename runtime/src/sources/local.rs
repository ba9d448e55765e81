//! `Bootstrap: localimage`: build from an image already on disk.
//!
//! The file's magic bytes pick the packer. SIF images pass the signature
//! gate before anything is extracted; their primary partition is unpacked
//! and an embedded OCI config is carried into the bundle.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use super::verify::{check_signatures, DescriptorVerifier, SignatureVerifier};
use super::{normalize_perms, ConveyorPacker};
use crate::bundle::{Bundle, OCI_CONFIG_JSON};
use crate::image::sif::FsType;
use crate::image::{sniff, LocalImageKind, SifImage, OCI_CONFIG_DESCRIPTOR};
use crate::rootfs::make_base_env;
use crate::unpack::{unpack_ext3, unpack_sandbox, unpack_squashfs, ByteRange};

/// Packer for one kind of local image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalPacker {
    Sif(PathBuf),
    Squashfs(PathBuf),
    Ext3(PathBuf),
    Sandbox(PathBuf),
}

impl LocalPacker {
    /// Choose the packer for the image at `path`.
    pub fn for_path(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        Ok(match sniff(&path)? {
            LocalImageKind::Sif => Self::Sif(path),
            LocalImageKind::Squashfs => Self::Squashfs(path),
            LocalImageKind::Ext3 => Self::Ext3(path),
            LocalImageKind::Sandbox => Self::Sandbox(path),
        })
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Sif(p) | Self::Squashfs(p) | Self::Ext3(p) | Self::Sandbox(p) => p,
        }
    }

    /// Extract the image into the bundle's rootfs.
    pub async fn pack(&self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let rootfs = bundle.rootfs_path.clone();
        tracing::debug!(image = %self.path().display(), rootfs = %rootfs.display(), "Unpacking local image");
        match self {
            Self::Sif(path) => {
                let sif = SifImage::open(path)?;
                let partition = sif.primary_partition()?;
                let range = ByteRange {
                    offset: partition.offset,
                    size: partition.size,
                };
                match partition.fs_type() {
                    Some(FsType::Squashfs) => {
                        unpack_squashfs(path, Some(range), &rootfs, cancel).await?
                    }
                    Some(FsType::Ext3) => unpack_ext3(path, range, &rootfs, &bundle.tmp_dir)?,
                    other => {
                        return Err(BuildError::ExtractionFailed(format!(
                            "unrecognized partition format {:?} in {}",
                            other,
                            path.display()
                        )))
                    }
                }
                normalize_perms(bundle)?;
                if let Some(config) = sif.json_object(OCI_CONFIG_DESCRIPTOR)? {
                    bundle.json_objects.insert(OCI_CONFIG_JSON.to_string(), config);
                }
            }
            Self::Squashfs(path) => {
                unpack_squashfs(path, None, &rootfs, cancel).await?;
                normalize_perms(bundle)?;
            }
            Self::Ext3(path) => {
                let size = std::fs::metadata(path)?.len();
                unpack_ext3(path, ByteRange { offset: 0, size }, &rootfs, &bundle.tmp_dir)?;
                normalize_perms(bundle)?;
            }
            Self::Sandbox(path) => unpack_sandbox(path, &rootfs)?,
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LocalSource {
    packer: Option<LocalPacker>,
}

impl LocalSource {
    pub fn packer(&self) -> Option<&LocalPacker> {
        self.packer.as_ref()
    }
}

#[async_trait]
impl ConveyorPacker for LocalSource {
    async fn get(&mut self, bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        let from = bundle.recipe.require_header("localimage", "from")?;
        let path = PathBuf::from(from.strip_prefix("localimage://").unwrap_or(from));
        let packer = LocalPacker::for_path(&path)?;

        if let LocalPacker::Sif(image) = &packer {
            let default = DescriptorVerifier;
            let verifier: &dyn SignatureVerifier = match &bundle.opts.verifier {
                Some(v) => v.as_ref(),
                None => &default,
            };
            check_signatures(
                verifier,
                image,
                bundle.recipe.header("fingerprints"),
                &bundle.opts.key_server,
            )
            .await?;
        }

        self.packer = Some(packer);
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let packer = self
            .packer
            .as_ref()
            .ok_or_else(|| BuildError::Other("local image packed before fetching".to_string()))?;
        packer.pack(bundle, cancel).await?;
        make_base_env(&bundle.rootfs_path, false)
    }
}
