//! `Bootstrap: oras`: a SIF image stored as the single layer of an OCI
//! artifact.

use std::path::PathBuf;

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use super::local::LocalPacker;
use super::ConveyorPacker;
use crate::bundle::{make_temp_dir, Bundle};
use crate::oci::{resolve_credential, ImageReference, RegistryClient};
use crate::rootfs::make_base_env;

/// Media type of the SIF layer in an ORAS artifact.
pub const SIF_LAYER_MEDIA_TYPE: &str = "application/vnd.sylabs.sif.layer.v1.sif";

/// Registry reference of an `oras://` URI.
pub fn oras_reference(from: &str) -> Result<ImageReference> {
    let rest = from.strip_prefix("oras://").unwrap_or(from);
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        return Err(BuildError::header_missing("oras", "from"));
    }
    ImageReference::parse(rest)
}

#[derive(Debug, Default)]
pub struct OrasSource {
    image: Option<PathBuf>,
    packer: Option<LocalPacker>,
}

impl OrasSource {
    /// The downloaded SIF file, once `get` has run.
    pub fn image(&self) -> Option<&std::path::Path> {
        self.image.as_deref()
    }
}

#[async_trait]
impl ConveyorPacker for OrasSource {
    async fn get(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let reference = oras_reference(bundle.recipe.require_header("oras", "from")?)?;
        let credential = resolve_credential(&bundle.opts, &reference.registry)?;
        let platform = bundle.opts.resolve_platform()?;
        let client = RegistryClient::new(
            &reference.registry,
            &credential,
            &platform,
            bundle.opts.no_https,
        );

        let dir = make_temp_dir(&bundle.tmp_dir, "oras-")?;
        let image = client
            .pull_artifact_layer(&reference, SIF_LAYER_MEDIA_TYPE, &dir.join("image.sif"), cancel)
            .await?;

        make_base_env(&bundle.rootfs_path, true)?;
        self.packer = Some(LocalPacker::for_path(&image)?);
        self.image = Some(image);
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let packer = self
            .packer
            .as_ref()
            .ok_or_else(|| BuildError::Other("ORAS image packed before fetching".to_string()))?;
        packer.pack(bundle, cancel).await
    }
}
