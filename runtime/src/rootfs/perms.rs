//! Post-extraction permission handling.
//!
//! Images often contain directories and files the owner cannot write or
//! read. For sandbox builds that would leave a tree the user cannot manage
//! or even delete, so the tree is either fixed or scanned with a warning.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use sbuild_core::error::{BuildError, Result};
use walkdir::WalkDir;

/// Ensure owner `rwx` on directories and owner `rw` on regular files,
/// keeping all other bits. Per-entry errors are logged and counted.
pub fn fix_perms(rootfs: &Path) -> Result<()> {
    let mut errors = 0usize;
    fix_tree(rootfs, &mut errors);
    if errors > 0 {
        return Err(BuildError::PermsPartialFix { errors });
    }
    Ok(())
}

/// A directory is widened before it is read, so entries under a directory
/// the owner could not open are still reached.
fn fix_tree(path: &Path, errors: &mut usize) {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Unable to stat path");
            *errors += 1;
            return;
        }
    };
    let is_dir = meta.file_type().is_dir();
    let wanted = if is_dir {
        0o700
    } else if meta.file_type().is_file() {
        0o600
    } else {
        return;
    };

    let mode = meta.permissions().mode() & 0o7777;
    if mode & wanted != wanted {
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode | wanted)) {
            tracing::error!(path = %path.display(), error = %e, "Error setting permission");
            *errors += 1;
            return;
        }
    }
    if !is_dir {
        return;
    }

    let children = match fs::read_dir(path) {
        Ok(children) => children,
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Unable to access path while fixing permissions"
            );
            *errors += 1;
            return;
        }
    };
    for child in children {
        match child {
            Ok(child) => fix_tree(&child.path(), errors),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Unable to read directory entry");
                *errors += 1;
            }
        }
    }
}

/// Warn once if any directory lacks owner `rwx`. Never fails the build.
pub fn check_perms(rootfs: &Path) {
    for entry in WalkDir::new(rootfs).follow_links(false).into_iter().flatten() {
        if !entry.file_type().is_dir() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.permissions().mode() & 0o700 != 0o700 {
            tracing::warn!(
                path = %entry.path().display(),
                "Directory cannot be accessed by its owner; the sandbox may not be removable \
                 without 'chmod -R u+rwX'. Rebuild with --fix-perms to avoid this"
            );
            return;
        }
    }
}
