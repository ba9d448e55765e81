//! OCI-family sources: `docker`, `docker-archive`, `docker-daemon`, `oci`
//! and `oci-archive`.

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use super::{normalize_perms, ConveyorPacker};
use crate::bundle::Bundle;
use crate::oci::{fetch_image, insert_oci_metadata, source_uri, OciImage, Transport};
use crate::rootfs::make_base_env;
use crate::unpack::{unpack_rootfs, UnpackMode};

#[derive(Debug, Default)]
pub struct OciSource {
    image: Option<OciImage>,
}

impl OciSource {
    /// The fetched image, once `get` has run.
    pub fn image(&self) -> Option<&OciImage> {
        self.image.as_ref()
    }
}

/// Transport for an OCI-family recipe: `From:` with the optional
/// `Registry:` and `Namespace:` headers prepended.
pub fn recipe_transport(bundle: &Bundle) -> Result<Transport> {
    let bootstrap = bundle
        .recipe
        .bootstrap()
        .ok_or_else(|| BuildError::header_missing("definition", "bootstrap"))?;
    let from = bundle.recipe.require_header(&bootstrap, "from")?;
    let uri = source_uri(
        &bootstrap,
        from,
        bundle.recipe.header("registry"),
        bundle.recipe.header("namespace"),
    );
    Transport::parse(&uri)
}

/// Extract `image` into the bundle, then install the base environment and
/// the OCI metadata. Extraction comes first so extracted files win over the
/// base environment's defaults.
pub(crate) fn pack_oci_image(bundle: &mut Bundle, image: &OciImage) -> Result<()> {
    unpack_rootfs(image, &bundle.rootfs_path, UnpackMode::detect())?;
    normalize_perms(bundle)?;
    make_base_env(&bundle.rootfs_path, false)?;
    insert_oci_metadata(bundle, image)
}

#[async_trait]
impl ConveyorPacker for OciSource {
    async fn get(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let transport = recipe_transport(bundle)?;
        let image = fetch_image(&transport, &bundle.opts, &bundle.tmp_dir, cancel).await?;
        self.image = Some(image);
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| BuildError::Other("OCI source packed before fetching".to_string()))?;
        pack_oci_image(bundle, image)
    }
}
