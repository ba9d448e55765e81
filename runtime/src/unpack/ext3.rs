//! Ext3 extraction: loop-mount the filesystem read-only and copy it out.
//!
//! Needs privileges for the loop device and the mount. The mount is held
//! by a guard, so it is detached on every exit path.

use std::fs;
use std::path::Path;

use nix::mount::MsFlags;
use sbuild_core::error::{BuildError, Result};

use super::sandbox::copy_tree;
use super::squashfs::ByteRange;
use crate::mount::{LoopDevice, MountGuard};

const EXT3_MOUNT_DATA: &str = "errors=remount-ro";

/// Copy the ext3 filesystem in `range` of `image` into `rootfs`, using a
/// mount point under `tmp_dir`.
pub fn unpack_ext3(image: &Path, range: ByteRange, rootfs: &Path, tmp_dir: &Path) -> Result<()> {
    let mount_point = tempfile::Builder::new()
        .prefix("mnt-")
        .tempdir_in(tmp_dir)
        .map_err(|e| {
            BuildError::ExtractionFailed(format!(
                "Failed to create mount point in {}: {}",
                tmp_dir.display(),
                e
            ))
        })?;

    let loop_dev = LoopDevice::attach(image, range.offset, range.size)
        .map_err(|e| BuildError::ExtractionFailed(format!("while attaching image: {}", e)))?;

    let mut mounts = MountGuard::new();
    mounts
        .mount(
            loop_dev.path(),
            mount_point.path(),
            "ext3",
            MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            EXT3_MOUNT_DATA,
        )
        .map_err(|e| BuildError::ExtractionFailed(format!("while mounting image: {}", e)))?;
    loop_dev.release_to_kernel();

    tracing::debug!(
        image = %image.display(),
        mount = %mount_point.path().display(),
        rootfs = %rootfs.display(),
        "Copying ext3 image contents"
    );
    fs::create_dir_all(rootfs)?;
    copy_tree(mount_point.path(), rootfs, true)?;

    mounts
        .release()
        .map_err(|e| BuildError::ExtractionFailed(format!("while unmounting image: {}", e)))
}
