//! `Bootstrap: busybox`: a single static busybox binary plus its applet
//! links.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use super::distro::MINIMAL_RUNSCRIPT;
use super::ConveyorPacker;
use crate::bundle::Bundle;
use crate::http::fetch_file;
use crate::rootfs::{make_base_env, make_file, RUNSCRIPT_PATH};
use crate::tool::Tool;

const ETC_FILES: &[(&str, &str)] = &[
    ("etc/passwd", "root:!:0:0:root:/root:/bin/sh\n"),
    ("etc/group", "root:x:0:\n"),
    (
        "etc/hosts",
        "127.0.0.1   localhost localhost.localdomain localhost4 localhost4.localdomain4\n",
    ),
];

#[derive(Debug, Default, Clone, Copy)]
pub struct BusyboxSource;

#[async_trait]
impl ConveyorPacker for BusyboxSource {
    async fn get(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let mirror = bundle.recipe.require_header("busybox", "mirrorurl")?.to_string();
        let rootfs = bundle.rootfs_path.clone();

        make_base_env(&rootfs, true)?;
        for (rel, content) in ETC_FILES {
            make_file(&rootfs.join(rel), 0o664, content.as_bytes(), true)?;
        }

        let bin = rootfs.join("bin");
        match fs::DirBuilder::new().mode(0o755).create(&bin) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(BuildError::Other(format!(
                    "Failed to create {}: {}",
                    bin.display(),
                    e
                )))
            }
        }

        let busybox = bin.join("busybox");
        tracing::info!(url = %mirror, "Fetching busybox");
        let download = fetch_file(&mirror, &busybox, cancel).await?;
        tracing::debug!(bytes = download.written, "Busybox downloaded");
        fs::set_permissions(&busybox, fs::Permissions::from_mode(0o755)).map_err(|e| {
            BuildError::Other(format!("Failed to chmod {}: {}", busybox.display(), e))
        })?;

        Tool::new("busybox", &busybox)
            .arg("--install")
            .arg(&bin)
            .run(cancel)
            .await?;
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        make_file(
            &bundle.rootfs_path.join(RUNSCRIPT_PATH),
            0o755,
            MINIMAL_RUNSCRIPT,
            true,
        )
    }
}
