//! Mount helpers: bind mounts and loop-backed read-only mounts.
//!
//! Every mount is owned by a guard that detaches it on drop, so mounts never
//! outlive the scope that created them, whether that scope returns normally,
//! with an error, or through cancellation.

use std::fs::{File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use sbuild_core::error::{BuildError, Result};

const LOOP_CONTROL: &str = "/dev/loop-control";
const LOOP_CTL_GET_FREE: u32 = 0x4C82;
const LOOP_SET_FD: u32 = 0x4C00;
const LOOP_CLR_FD: u32 = 0x4C01;
const LOOP_SET_STATUS64: u32 = 0x4C04;
const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;
const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;
const LOOP_ATTACH_ATTEMPTS: usize = 10;

mod loop_ioctl {
    use super::*;

    nix::ioctl_none_bad!(loop_ctl_get_free, LOOP_CTL_GET_FREE);
    nix::ioctl_write_int_bad!(loop_set_fd, LOOP_SET_FD);
    nix::ioctl_none_bad!(loop_clr_fd, LOOP_CLR_FD);
    nix::ioctl_write_ptr_bad!(loop_set_status64, LOOP_SET_STATUS64, LoopInfo64);
}
use loop_ioctl::{loop_clr_fd, loop_ctl_get_free, loop_set_fd, loop_set_status64};

fn sys_mount(
    source: &Path,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    mount(Some(source), target, fstype, flags, data).map_err(|e| {
        BuildError::Other(format!(
            "Failed to mount {} on {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })
}

fn detach(target: &Path) -> nix::Result<()> {
    umount2(target, MntFlags::MNT_DETACH)
}

/// A set of mounts, detached in reverse order when dropped.
#[derive(Debug, Default)]
pub struct MountGuard {
    targets: Vec<PathBuf>,
}

impl MountGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `source` onto `target`.
    pub fn bind(&mut self, source: &Path, target: &Path) -> Result<()> {
        sys_mount(source, target, None, MsFlags::MS_BIND, None)?;
        tracing::debug!(source = %source.display(), target = %target.display(), "Bind mounted");
        self.targets.push(target.to_path_buf());
        Ok(())
    }

    /// Mount a filesystem and track it.
    pub fn mount(
        &mut self,
        source: &Path,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: &str,
    ) -> Result<()> {
        sys_mount(source, target, Some(fstype), flags, Some(data))?;
        self.targets.push(target.to_path_buf());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Detach everything now, reporting the first failure.
    pub fn release(mut self) -> Result<()> {
        self.release_all()
    }

    fn release_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(target) = self.targets.pop() {
            if let Err(e) = detach(&target) {
                tracing::warn!(target = %target.display(), error = %e, "Failed to unmount");
                first_err.get_or_insert_with(|| {
                    BuildError::Other(format!("Failed to unmount {}: {}", target.display(), e))
                });
            } else {
                tracing::debug!(target = %target.display(), "Unmounted");
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

/// A loop device bound to a byte range of an image file.
///
/// Attached with autoclear: the kernel releases it when the last user
/// (the mount) goes away. Dropping before mounting detaches it explicitly.
pub struct LoopDevice {
    path: PathBuf,
    device: Option<File>,
}

impl LoopDevice {
    /// Attach `image[offset..offset+size]` read-only.
    pub fn attach(image: &Path, offset: u64, size: u64) -> Result<Self> {
        let backing = File::open(image).map_err(|e| {
            BuildError::Other(format!("Failed to open image {}: {}", image.display(), e))
        })?;
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(LOOP_CONTROL)
            .map_err(|e| BuildError::Other(format!("Failed to open {}: {}", LOOP_CONTROL, e)))?;

        for _ in 0..LOOP_ATTACH_ATTEMPTS {
            // SAFETY: LOOP_CTL_GET_FREE takes no argument and returns an index.
            let index = unsafe { loop_ctl_get_free(control.as_raw_fd()) }.map_err(|e| {
                BuildError::Other(format!("Failed to find a free loop device: {}", e))
            })?;
            let path = PathBuf::from(format!("/dev/loop{}", index));
            let device = OpenOptions::new().read(true).open(&path).map_err(|e| {
                BuildError::Other(format!("Failed to open {}: {}", path.display(), e))
            })?;

            // SAFETY: LOOP_SET_FD takes the backing file descriptor.
            match unsafe { loop_set_fd(device.as_raw_fd(), backing.as_raw_fd()) } {
                Ok(_) => {}
                // Raced with another attach; try the next free device.
                Err(Errno::EBUSY) => continue,
                Err(e) => {
                    return Err(BuildError::Other(format!(
                        "Failed to attach {} to {}: {}",
                        image.display(),
                        path.display(),
                        e
                    )))
                }
            }

            let mut info = LoopInfo64 {
                lo_device: 0,
                lo_inode: 0,
                lo_rdevice: 0,
                lo_offset: offset,
                lo_sizelimit: size,
                lo_number: 0,
                lo_encrypt_type: 0,
                lo_encrypt_key_size: 0,
                lo_flags: LO_FLAGS_AUTOCLEAR | LO_FLAGS_READ_ONLY,
                lo_file_name: [0; LO_NAME_SIZE],
                lo_crypt_name: [0; LO_NAME_SIZE],
                lo_encrypt_key: [0; LO_KEY_SIZE],
                lo_init: [0; 2],
            };
            let name = image.as_os_str().as_bytes();
            let len = name.len().min(LO_NAME_SIZE - 1);
            info.lo_file_name[..len].copy_from_slice(&name[..len]);

            let loop_dev = LoopDevice {
                path,
                device: Some(device),
            };
            // SAFETY: info is a properly laid out loop_info64 that outlives the call.
            unsafe { loop_set_status64(loop_dev.raw_fd(), &info) }.map_err(|e| {
                BuildError::Other(format!(
                    "Failed to configure {}: {}",
                    loop_dev.path.display(),
                    e
                ))
            })?;

            tracing::debug!(
                device = %loop_dev.path.display(),
                image = %image.display(),
                offset,
                size,
                "Attached loop device"
            );
            return Ok(loop_dev);
        }

        Err(BuildError::Other(format!(
            "No free loop device for {} after {} attempts",
            image.display(),
            LOOP_ATTACH_ATTEMPTS
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn raw_fd(&self) -> i32 {
        self.device.as_ref().map_or(-1, |d| d.as_raw_fd())
    }

    /// Hand lifetime over to the kernel (autoclear) once mounted.
    pub fn release_to_kernel(mut self) {
        self.device.take();
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            // SAFETY: LOOP_CLR_FD takes no argument.
            if let Err(e) = unsafe { loop_clr_fd(device.as_raw_fd()) } {
                tracing::warn!(device = %self.path.display(), error = %e, "Failed to detach loop device");
            }
        }
    }
}
