//! Base environment installer.
//!
//! Writes the directories, symlinks and scripts that define a container's
//! execution contract. OCI sources install it after extraction so extracted
//! files are kept; distro sources install it before running the package tool.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use sbuild_core::error::{BuildError, Result};

use super::layout::{BASE_DIRS, BASE_FILES, BASE_SYMLINKS};

/// Install the base environment into `rootfs`.
///
/// With `overwrite` false, existing files keep their content (their mode is
/// still widened); with `overwrite` true every file is rewritten.
pub fn make_base_env(rootfs: &Path, overwrite: bool) -> Result<()> {
    let meta = fs::metadata(rootfs).map_err(|e| {
        BuildError::Other(format!(
            "Failed to stat rootfs {}: {}",
            rootfs.display(),
            e
        ))
    })?;
    let mode = meta.permissions().mode();
    if mode & 0o200 == 0 {
        tracing::info!(
            rootfs = %rootfs.display(),
            "Adding owner write permission to build path"
        );
        fs::set_permissions(rootfs, fs::Permissions::from_mode(mode | 0o200)).map_err(|e| {
            BuildError::Other(format!(
                "Failed to make rootfs {} writable: {}",
                rootfs.display(),
                e
            ))
        })?;
    }

    make_dirs(rootfs)?;
    make_symlinks(rootfs)?;
    for file in BASE_FILES {
        make_file(&rootfs.join(file.path), file.mode, file.content.as_bytes(), overwrite)?;
    }

    tracing::debug!(rootfs = %rootfs.display(), overwrite, "Installed base environment");
    Ok(())
}

fn make_dirs(rootfs: &Path) -> Result<()> {
    for dir in BASE_DIRS {
        let path = rootfs.join(dir);
        if fs::symlink_metadata(&path).is_ok() {
            continue;
        }
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&path)
            .map_err(|e| {
                BuildError::Other(format!(
                    "Failed to create directory {}: {}",
                    path.display(),
                    e
                ))
            })?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn make_symlinks(rootfs: &Path) -> Result<()> {
    for (link, target) in BASE_SYMLINKS {
        let path = rootfs.join(link);
        if fs::symlink_metadata(&path).is_ok() {
            continue;
        }
        std::os::unix::fs::symlink(target, &path).map_err(|e| {
            BuildError::Other(format!(
                "Failed to create symlink {} -> {}: {}",
                path.display(),
                target,
                e
            ))
        })?;
    }
    Ok(())
}

/// Write one file. An existing file is chmod'ed to `mode` first, since
/// image layers often ship files like `etc/hosts` without owner write.
pub(crate) fn make_file(path: &Path, mode: u32, content: &[u8], overwrite: bool) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_file() => {
            let current = meta.permissions().mode() & 0o7777;
            if current | mode != current {
                fs::set_permissions(path, fs::Permissions::from_mode(current | mode)).map_err(
                    |e| {
                        BuildError::Other(format!(
                            "Failed to change permissions of {}: {}",
                            path.display(),
                            e
                        ))
                    },
                )?;
            }
            if !overwrite {
                tracing::debug!(path = %path.display(), "File exists, not overwriting");
                return Ok(());
            }
        }
        Ok(_) if !overwrite => {
            tracing::debug!(path = %path.display(), "Path exists, not overwriting");
            return Ok(());
        }
        Ok(_) => {
            fs::remove_file(path).or_else(|e| match e.kind() {
                io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })?;
        }
        Err(_) => {}
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|e| {
            BuildError::Other(format!("Failed to open {}: {}", path.display(), e))
        })?;
    file.write_all(content)
        .map_err(|e| BuildError::Other(format!("Failed to write {}: {}", path.display(), e)))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rootfs::layout::RUNSCRIPT_PATH;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn snapshot(root: &Path) -> BTreeMap<String, (u32, Vec<u8>)> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let meta = fs::symlink_metadata(e.path()).unwrap();
                let content = if meta.file_type().is_file() {
                    fs::read(e.path()).unwrap()
                } else if meta.file_type().is_symlink() {
                    fs::read_link(e.path())
                        .unwrap()
                        .to_string_lossy()
                        .into_owned()
                        .into_bytes()
                } else {
                    Vec::new()
                };
                (
                    e.path().strip_prefix(root).unwrap().display().to_string(),
                    (meta.permissions().mode(), content),
                )
            })
            .collect()
    }

    #[test]
    fn test_creates_layout() {
        let tmp = TempDir::new().unwrap();
        make_base_env(tmp.path(), true).unwrap();

        for dir in BASE_DIRS {
            assert!(tmp.path().join(dir).is_dir(), "{} missing", dir);
        }
        for (link, target) in BASE_SYMLINKS {
            assert_eq!(
                fs::read_link(tmp.path().join(link)).unwrap(),
                Path::new(target)
            );
        }
        for file in BASE_FILES {
            let meta = fs::metadata(tmp.path().join(file.path)).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, file.mode, "{}", file.path);
        }
        assert_eq!(fs::read(tmp.path().join("etc/hosts")).unwrap(), b"");
    }

    #[test]
    fn test_keeps_existing_without_overwrite() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        let hosts = tmp.path().join("etc/hosts");
        fs::write(&hosts, b"127.0.0.1 localhost\n").unwrap();
        fs::set_permissions(&hosts, fs::Permissions::from_mode(0o444)).unwrap();

        make_base_env(tmp.path(), false).unwrap();

        assert_eq!(fs::read(&hosts).unwrap(), b"127.0.0.1 localhost\n");
        let mode = fs::metadata(&hosts).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn test_overwrite_rewrites_readonly_file() {
        let tmp = TempDir::new().unwrap();
        make_base_env(tmp.path(), true).unwrap();
        let runscript = tmp.path().join(RUNSCRIPT_PATH);
        fs::write(&runscript, b"#!/bin/sh\nexec custom\n").unwrap();
        fs::set_permissions(&runscript, fs::Permissions::from_mode(0o500)).unwrap();

        make_base_env(tmp.path(), true).unwrap();

        let content = fs::read_to_string(&runscript).unwrap();
        assert!(content.contains("There is no runscript defined"));
    }

    #[test]
    fn test_existing_symlink_is_kept() {
        let tmp = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/custom", tmp.path().join("environment")).unwrap();
        make_base_env(tmp.path(), true).unwrap();
        assert_eq!(
            fs::read_link(tmp.path().join("environment")).unwrap(),
            Path::new("/custom")
        );
    }

    #[test]
    fn test_existing_dir_mode_untouched() {
        let tmp = TempDir::new().unwrap();
        let t = tmp.path().join("tmp");
        fs::create_dir(&t).unwrap();
        fs::set_permissions(&t, fs::Permissions::from_mode(0o1777)).unwrap();
        make_base_env(tmp.path(), true).unwrap();
        assert_eq!(fs::metadata(&t).unwrap().permissions().mode() & 0o7777, 0o1777);
    }

    #[test]
    fn test_second_pass_without_overwrite_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        make_base_env(tmp.path(), true).unwrap();
        let before = snapshot(tmp.path());
        make_base_env(tmp.path(), false).unwrap();
        assert_eq!(before, snapshot(tmp.path()));
    }

    #[test]
    fn test_widens_readonly_rootfs() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir(&rootfs).unwrap();
        fs::set_permissions(&rootfs, fs::Permissions::from_mode(0o555)).unwrap();
        make_base_env(&rootfs, true).unwrap();
        let mode = fs::metadata(&rootfs).unwrap().permissions().mode();
        assert_ne!(mode & 0o200, 0);
    }
}
