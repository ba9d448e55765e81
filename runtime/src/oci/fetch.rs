//! OCI fetcher: materializes any supported transport as an [`OciImage`].
//!
//! Registry pulls go through [`RegistryClient`] into a fresh layout under
//! the build's scratch directory, sharing blobs through the cache when one
//! is configured. Archives are extracted next to it; layouts on disk are
//! read in place.

use std::path::{Path, PathBuf};

use sbuild_core::error::Result;
use sbuild_core::platform::{check_image_platform, Platform};
use tokio_util::sync::CancellationToken;

use super::archive::extract_archive;
use super::credentials::resolve_credential;
use super::image::OciImage;
use super::reference::{ImageReference, Transport};
use super::registry::RegistryClient;
use crate::bundle::make_temp_dir;
use crate::options::BuildOptions;
use crate::tool::Tool;

/// Fetch the image named by `transport`, staging files under `tmp_dir`.
///
/// The image's declared platform is checked against the build's target
/// platform before it is returned.
pub async fn fetch_image(
    transport: &Transport,
    opts: &BuildOptions,
    tmp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<OciImage> {
    let platform = opts.resolve_platform()?;
    tracing::debug!(source = %transport, platform = %platform, "Fetching image");

    let image = match transport {
        Transport::Docker(reference) => {
            pull_registry_image(reference, opts, &platform, tmp_dir, cancel).await?
        }
        Transport::Oci { path, tag } => OciImage::from_layout(path, tag.as_deref(), &platform)?,
        Transport::OciArchive { path, tag } => {
            let layout = make_temp_dir(tmp_dir, "temp-oci-")?;
            extract_archive(path, &layout)?;
            OciImage::from_layout(&layout, tag.as_deref(), &platform)?
        }
        Transport::DockerArchive { path, reference } => {
            let dir = unpacked_docker_archive(path, tmp_dir)?;
            OciImage::from_docker_archive(&dir, reference.as_deref())?
        }
        Transport::DockerDaemon(name) => {
            let archive = save_from_daemon(name, opts, tmp_dir, cancel).await?;
            let dir = unpacked_docker_archive(&archive, tmp_dir)?;
            OciImage::from_docker_archive(&dir, None)?
        }
    };

    check_image_platform(&platform, image.platform().as_ref())?;
    tracing::info!(
        source = %transport,
        layers = image.layers().len(),
        "Fetched image"
    );
    Ok(image)
}

async fn pull_registry_image(
    reference: &ImageReference,
    opts: &BuildOptions,
    platform: &Platform,
    tmp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<OciImage> {
    let credential = resolve_credential(opts, &reference.registry)?;
    let client = RegistryClient::new(&reference.registry, &credential, platform, opts.no_https);
    let layout = make_temp_dir(tmp_dir, "oci-layout-")?;
    client
        .pull_to_layout(reference, &layout, opts.cache(), cancel)
        .await?;
    OciImage::from_layout(&layout, None, platform)
}

/// A docker-archive may be a `docker save` tarball or an already unpacked
/// directory.
fn unpacked_docker_archive(path: &Path, tmp_dir: &Path) -> Result<PathBuf> {
    if path.is_dir() {
        return Ok(path.to_path_buf());
    }
    let dir = make_temp_dir(tmp_dir, "temp-docker-")?;
    extract_archive(path, &dir)?;
    Ok(dir)
}

/// Export `name` from the docker daemon with `docker save`.
async fn save_from_daemon(
    name: &str,
    opts: &BuildOptions,
    tmp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let archive = make_temp_dir(tmp_dir, "docker-save-")?.join("image.tar");
    let mut save = docker_save_command(Tool::find("docker")?, name, &archive);
    if let Some(host) = &opts.docker_daemon_host {
        save = save.env("DOCKER_HOST", host);
    }
    save.run(cancel).await?;
    Ok(archive)
}

fn docker_save_command(docker: Tool, name: &str, archive: &Path) -> Tool {
    docker
        .arg("save")
        .arg("-o")
        .arg(archive.as_os_str())
        .arg(name)
}
