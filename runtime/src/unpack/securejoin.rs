//! Symlink-safe path resolution inside a root directory.

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use sbuild_core::error::{BuildError, Result};

/// Symlinks followed before resolution is abandoned.
const MAX_SYMLINKS: usize = 255;

/// Resolve `unsafe_path` under `root` as if `root` were `/`.
///
/// Symlinks in every component are followed, absolute targets restart at
/// `root`, and `..` never climbs above it. Missing components resolve
/// lexically.
pub fn secure_join(root: &Path, unsafe_path: &Path) -> Result<PathBuf> {
    // Stack of pending components, next one on top.
    let mut pending: Vec<OsString> = Vec::new();
    push_components(&mut pending, unsafe_path);

    let mut resolved = PathBuf::new();
    let mut followed = 0usize;

    while let Some(component) = pending.pop() {
        if component == ".." {
            resolved.pop();
            continue;
        }

        let candidate = resolved.join(&component);
        let full = root.join(&candidate);
        match fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => {
                followed += 1;
                if followed > MAX_SYMLINKS {
                    return Err(BuildError::ExtractionFailed(format!(
                        "Too many symlinks resolving {} under {}",
                        unsafe_path.display(),
                        root.display()
                    )));
                }
                let target = fs::read_link(&full).map_err(|e| {
                    BuildError::ExtractionFailed(format!(
                        "Failed to read symlink {}: {}",
                        full.display(),
                        e
                    ))
                })?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                push_components(&mut pending, &target);
            }
            _ => resolved = candidate,
        }
    }

    Ok(root.join(resolved))
}

/// Push the components of `path` so that the first ends up on top.
fn push_components(stack: &mut Vec<OsString>, path: &Path) {
    let components: Vec<OsString> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect();
    stack.extend(components.into_iter().rev());
}
