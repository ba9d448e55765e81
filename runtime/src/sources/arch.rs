//! `Bootstrap: arch`: an Arch Linux root built with pacstrap.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};
use sbuild_core::platform::host_arch;
use tokio_util::sync::CancellationToken;

use super::distro::{pack_distro, prepare_scaffold};
use super::ConveyorPacker;
use crate::bundle::{make_temp_dir, Bundle};
use crate::http::fetch_file;
use crate::tool::Tool;

/// pacman.conf used when the recipe has no `ConfURL:`.
pub const DEFAULT_PACMAN_CONF_URL: &str =
    "https://github.com/archlinux/svntogit-packages/raw/master/pacman/trunk/pacman.conf";

const DEFAULT_PACKAGES: &[&str] = &["base"];

/// Entropy daemon installed for keyring setup and removed afterwards.
const ENTROPY_PACKAGE: &str = "haveged";

const KEYRING_SETUP: &str =
    "haveged -w 1024; pacman-key --init; pacman-key --populate archlinux";

/// Packages to pacstrap: `Include:` replaces the default set.
pub fn package_list(include: Option<&str>) -> Vec<String> {
    match include.map(str::split_whitespace) {
        Some(packages) => packages.map(str::to_string).collect(),
        None => DEFAULT_PACKAGES.iter().map(|p| p.to_string()).collect(),
    }
}

pub fn pacstrap_args(conf: &Path, rootfs: &Path, packages: &[String]) -> Vec<String> {
    let mut args = vec![
        "-C".to_string(),
        conf.display().to_string(),
        "-c".to_string(),
        "-G".to_string(),
        "-M".to_string(),
        rootfs.display().to_string(),
        ENTROPY_PACKAGE.to_string(),
    ];
    args.extend(packages.iter().cloned());
    args
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ArchSource;

#[async_trait]
impl ConveyorPacker for ArchSource {
    async fn get(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let conf_url = bundle
            .recipe
            .header("confurl")
            .unwrap_or(DEFAULT_PACMAN_CONF_URL)
            .to_string();
        let packages = package_list(bundle.recipe.header("include"));

        let pacstrap = Tool::find("pacstrap")?;
        let arch = host_arch();
        if arch != "amd64" {
            return Err(BuildError::UnsupportedPlatform(format!(
                "{} architecture is not supported by the arch bootstrap",
                arch
            )));
        }

        let conf: PathBuf = make_temp_dir(&bundle.tmp_dir, "pac-conf-")?.join("pacman.conf");
        tracing::info!(url = %conf_url, "Fetching pacman config");
        fetch_file(&conf_url, &conf, cancel).await?;

        let rootfs = bundle.rootfs_path.clone();
        let _mounts = prepare_scaffold(&rootfs, &bundle.opts)?;

        tracing::debug!(conf = %conf.display(), rootfs = %rootfs.display(), packages = ?packages, "Running pacstrap");
        pacstrap
            .args(pacstrap_args(&conf, &rootfs, &packages))
            .run(cancel)
            .await?;

        let chroot = Tool::find("arch-chroot")?;
        chroot
            .clone()
            .arg(&rootfs)
            .args(["/bin/sh", "-c", KEYRING_SETUP])
            .run(cancel)
            .await?;
        chroot
            .arg(&rootfs)
            .args(["pacman", "-Rs", "--noconfirm", ENTROPY_PACKAGE])
            .run(cancel)
            .await?;
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        pack_distro(&bundle.rootfs_path)
    }
}
