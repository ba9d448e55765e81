//! Shared plumbing for sources that install a distribution with a host
//! package tool: the pre-chroot scaffold, header substitutions and the
//! common pack step.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use regex::Regex;
use sbuild_core::error::{BuildError, Result};

use crate::mount::MountGuard;
use crate::options::BuildOptions;
use crate::rootfs::{make_base_env, make_file, RUNSCRIPT_PATH};
use crate::tool::find_tool;
use crate::userns::needs_fakeroot_shims;

/// Character devices every package tool expects, with major/minor numbers.
pub const DEVICE_NODES: &[(&str, u32, u32)] = &[
    ("dev/null", 1, 3),
    ("dev/random", 1, 8),
    ("dev/urandom", 1, 9),
    ("dev/zero", 1, 5),
];

/// Runscript written for distro-built images.
pub const MINIMAL_RUNSCRIPT: &[u8] = b"#!/bin/sh\n";

fn mkdir_0755(path: &Path) -> Result<()> {
    match fs::DirBuilder::new().mode(0o755).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(BuildError::Other(format!(
            "Failed to create {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Create the pseudo-devices in `rootfs/dev` with mknod.
pub fn make_device_nodes(rootfs: &Path) -> Result<()> {
    mkdir_0755(&rootfs.join("dev"))?;
    for (rel, major, minor) in DEVICE_NODES {
        let path = rootfs.join(rel);
        if fs::symlink_metadata(&path).is_ok() {
            continue;
        }
        mknod(
            &path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(u64::from(*major), u64::from(*minor)),
        )
        .map_err(|e| {
            BuildError::Other(format!("Failed to create device {}: {}", path.display(), e))
        })?;
        // mknod honors the umask
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666))?;
    }
    Ok(())
}

/// Make a fakeroot session usable by package tools: `true` is bound over
/// the host `mount` and `umount` so the tool's own mount calls succeed
/// without doing anything, and `/proc` plus the pseudo-devices are bound
/// into the rootfs since mknod is not allowed. The returned guard undoes
/// every mount.
pub fn prepare_fakeroot_env(rootfs: &Path) -> Result<MountGuard> {
    let true_path = find_tool("true")?;
    let mount_path = find_tool("mount")?;
    let umount_path = find_tool("umount")?;

    let dev_path = rootfs.join("dev");
    let proc_path = rootfs.join("proc");
    mkdir_0755(&dev_path)?;
    mkdir_0755(&proc_path)?;

    let mut mounts = MountGuard::new();
    mounts.bind(&true_path, &mount_path)?;
    mounts.bind(&true_path, &umount_path)?;
    mounts.bind(Path::new("/proc"), &proc_path)?;

    for (rel, _, _) in DEVICE_NODES {
        let target = rootfs.join(rel);
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&target)
            .map_err(|e| {
                BuildError::Other(format!("Failed to create {}: {}", target.display(), e))
            })?;
        let host = PathBuf::from("/").join(rel);
        mounts.bind(&host, &target)?;
    }

    tracing::debug!(rootfs = %rootfs.display(), "Prepared fakeroot scaffold");
    Ok(mounts)
}

/// Whether the scaffold binds `/proc` and the devices instead of creating
/// nodes: requested through the options or detected from the namespace.
pub fn use_fakeroot_shims(opts: &BuildOptions) -> bool {
    opts.unprivilege || opts.fakeroot_path.is_some() || needs_fakeroot_shims()
}

/// Split a `src[:dest]` bind; the destination defaults to the source.
pub fn parse_bind(spec: &str) -> Result<(PathBuf, PathBuf)> {
    let (src, dest) = match spec.split_once(':') {
        Some((src, dest)) => (src, dest),
        None => (spec, spec),
    };
    if src.is_empty() || dest.is_empty() {
        return Err(BuildError::Config(format!("invalid bind '{}'", spec)));
    }
    let dest = Path::new(dest);
    if dest.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(BuildError::Config(format!(
            "bind destination '{}' must not contain '..'",
            dest.display()
        )));
    }
    Ok((PathBuf::from(src), dest.to_path_buf()))
}

/// Bind each of `binds` into `rootfs`, creating the mount point with the
/// same type as the source.
fn bind_extra(mounts: &mut MountGuard, rootfs: &Path, binds: &[String]) -> Result<()> {
    for spec in binds {
        let (src, dest) = parse_bind(spec)?;
        let target = rootfs.join(dest.strip_prefix("/").unwrap_or(&dest));
        let src_meta = fs::metadata(&src).map_err(|e| {
            BuildError::Config(format!("bind source {}: {}", src.display(), e))
        })?;
        if src_meta.is_dir() {
            fs::create_dir_all(&target)?;
        } else if fs::symlink_metadata(&target).is_err() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::File::create(&target).map_err(|e| {
                BuildError::Other(format!("Failed to create {}: {}", target.display(), e))
            })?;
        }
        mounts.bind(&src, &target)?;
    }
    Ok(())
}

/// Pre-chroot scaffold: bind mounts in a fakeroot session, device nodes
/// otherwise, then the extra binds from the options. Mounts live as long
/// as the returned guard.
pub fn prepare_scaffold(rootfs: &Path, opts: &BuildOptions) -> Result<MountGuard> {
    let mut mounts = if use_fakeroot_shims(opts) {
        prepare_fakeroot_env(rootfs)?
    } else {
        make_device_nodes(rootfs)?;
        MountGuard::new()
    };
    bind_extra(&mut mounts, rootfs, &opts.binds)?;
    Ok(mounts)
}

/// Replace `%{OSVERSION}` (any case) in `url`. A placeholder without an
/// `OSVersion:` header is an error.
pub fn substitute_osversion(bootstrap: &str, url: &str, osversion: Option<&str>) -> Result<String> {
    let placeholder = Regex::new(r"(?i)%\{OSVERSION\}")
        .map_err(|e| BuildError::Other(format!("Invalid placeholder pattern: {}", e)))?;
    if !placeholder.is_match(url) {
        return Ok(url.to_string());
    }
    let version = osversion.ok_or_else(|| BuildError::header_missing(bootstrap, "osversion"))?;
    Ok(placeholder.replace_all(url, regex::NoExpand(version)).into_owned())
}

/// Packages to install: the defaults, the `Include:` header and the
/// `INCLUDE` environment variable, whitespace separated.
pub fn include_list(defaults: &[&str], header: Option<&str>) -> Vec<String> {
    let env = std::env::var("INCLUDE").ok();
    merge_includes(defaults, header, env.as_deref())
}

fn merge_includes(defaults: &[&str], header: Option<&str>, env: Option<&str>) -> Vec<String> {
    defaults
        .iter()
        .copied()
        .chain(header.unwrap_or("").split_whitespace())
        .chain(env.unwrap_or("").split_whitespace())
        .map(str::to_string)
        .collect()
}

/// Pack step shared by all distro sources.
pub fn pack_distro(rootfs: &Path) -> Result<()> {
    make_base_env(rootfs, true)?;
    make_file(&rootfs.join(RUNSCRIPT_PATH), 0o755, MINIMAL_RUNSCRIPT, true)
}
