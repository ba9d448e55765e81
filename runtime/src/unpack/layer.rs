//! OCI layer application.
//!
//! Layers are applied strictly in order onto the destination, with
//! whiteouts resolved against what earlier layers wrote:
//!
//! - `.wh.<name>` removes `<name>` (a symlink is removed, never followed)
//! - `.wh..wh..opq` hides everything in its directory that this layer did
//!   not itself write
//!
//! Every path is resolved with [`secure_join`], so neither `..` entries nor
//! symlinks planted by earlier layers can write outside the destination.

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use sbuild_core::error::{BuildError, Result};
use tar::EntryType;

use super::securejoin::secure_join;
use crate::bundle::force_remove_all;
use crate::oci::{LayerBlob, OciImage};
use crate::userns::{effective_ids, is_unprivileged, IdMapping};

/// Whiteout file prefix.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Opaque whiteout marker filename.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// How ownership and special files are handled during extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackMode {
    /// Real root: ownership, xattrs and device nodes are restored.
    Privileged,
    /// Rootless: container root maps to the builder and nothing else maps.
    Rootless { uid_map: IdMapping, gid_map: IdMapping },
}

impl UnpackMode {
    /// Mode for the current process.
    pub fn detect() -> Self {
        if is_unprivileged() {
            let (uid, gid) = effective_ids();
            Self::rootless(uid, gid)
        } else {
            UnpackMode::Privileged
        }
    }

    pub fn rootless(uid: u32, gid: u32) -> Self {
        UnpackMode::Rootless {
            uid_map: IdMapping::root_to(uid),
            gid_map: IdMapping::root_to(gid),
        }
    }

    fn is_rootless(&self) -> bool {
        matches!(self, UnpackMode::Rootless { .. })
    }
}

/// Extract all layers of `image` into `dest`, base first.
pub fn unpack_rootfs(image: &OciImage, dest: &Path, mode: UnpackMode) -> Result<()> {
    if !image.layers().iter().any(LayerBlob::is_layer) {
        return Err(BuildError::NotExtractable(
            "no extractable OCI/Docker tar layers found in this image".to_string(),
        ));
    }

    for (index, layer) in image.layers().iter().enumerate() {
        if !layer.is_layer() {
            tracing::debug!(media_type = %layer.media_type, "Skipping non-layer blob");
            continue;
        }
        tracing::debug!(
            index,
            digest = layer.digest.as_deref().unwrap_or("-"),
            media_type = %layer.media_type,
            "Applying layer"
        );
        let reader = decompress(layer.open()?, &layer.media_type)?;
        apply_layer(reader, dest, mode).map_err(|e| match e {
            BuildError::ExtractionFailed(msg) => BuildError::ExtractionFailed(format!(
                "layer {} ({}): {}",
                index,
                layer.path.display(),
                msg
            )),
            other => other,
        })?;
    }

    tracing::info!(
        dest = %dest.display(),
        layers = image.layers().len(),
        rootless = mode.is_rootless(),
        "Extracted image layers"
    );
    Ok(())
}

/// Wrap a layer stream in the decompressor its media type or magic bytes
/// call for.
pub fn decompress<R: BufRead + 'static>(mut reader: R, media_type: &str) -> Result<Box<dyn Read>> {
    let by_type = if media_type.ends_with("gzip") {
        Some(Compression::Gzip)
    } else if media_type.ends_with("zstd") {
        Some(Compression::Zstd)
    } else {
        None
    };

    let compression = match by_type {
        Some(c) => c,
        None => {
            let head = reader.fill_buf().map_err(|e| {
                BuildError::ExtractionFailed(format!("Failed to read layer header: {}", e))
            })?;
            if head.starts_with(GZIP_MAGIC) {
                Compression::Gzip
            } else if head.starts_with(ZSTD_MAGIC) {
                Compression::Zstd
            } else {
                Compression::None
            }
        }
    };

    Ok(match compression {
        Compression::Gzip => Box::new(GzDecoder::new(reader)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(reader).map_err(
            |e| BuildError::ExtractionFailed(format!("Failed to start zstd decoder: {}", e)),
        )?),
        Compression::None => Box::new(reader),
    })
}

#[derive(Debug, Clone, Copy)]
enum Compression {
    Gzip,
    Zstd,
    None,
}

/// Apply one uncompressed tar stream onto `dest`.
pub fn apply_layer(reader: impl Read, dest: &Path, mode: UnpackMode) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(!mode.is_rootless());
    archive.set_preserve_ownerships(!mode.is_rootless());

    let mut state = LayerState {
        dest,
        mode,
        written: HashSet::new(),
        widened: Vec::new(),
        unmapped: 0,
    };

    let entries = archive.entries().map_err(|e| {
        BuildError::ExtractionFailed(format!("Failed to read layer entries: {}", e))
    })?;
    let result = entries
        .map(|entry| {
            let entry = entry.map_err(|e| {
                BuildError::ExtractionFailed(format!("Failed to read layer entry: {}", e))
            })?;
            state.apply_entry(entry)
        })
        .collect::<Result<()>>();

    state.restore_modes();
    if state.unmapped > 0 {
        tracing::debug!(
            entries = state.unmapped,
            "Entries owned by ids outside the rootless mapping were assigned to the builder"
        );
    }
    result
}

struct LayerState<'a> {
    dest: &'a Path,
    mode: UnpackMode,
    /// Paths written by this layer, relative to `dest`
    written: HashSet<PathBuf>,
    /// Directories temporarily given owner rwx, with their original modes
    widened: Vec<(PathBuf, u32)>,
    unmapped: usize,
}

impl LayerState<'_> {
    fn apply_entry<R: Read>(&mut self, mut entry: tar::Entry<'_, R>) -> Result<()> {
        let raw = entry
            .path()
            .map_err(|e| BuildError::ExtractionFailed(format!("Invalid entry path: {}", e)))?
            .into_owned();
        let rel = clean_relative(&raw)?;
        let Some(name) = rel.file_name().map(|n| n.to_os_string()) else {
            // The archive root itself.
            return Ok(());
        };
        let parent_rel = rel.parent().map(Path::to_path_buf).unwrap_or_default();
        let name_str = name.to_string_lossy();

        if name_str == OPAQUE_WHITEOUT {
            let dir = secure_join(self.dest, &parent_rel)?;
            if fs::symlink_metadata(&dir).is_ok_and(|m| m.is_dir()) {
                self.make_writable(&dir)?;
                self.clear_opaque(&dir, &parent_rel)?;
            }
            return Ok(());
        }

        if let Some(target_name) = name_str.strip_prefix(WHITEOUT_PREFIX) {
            if matches!(target_name, "" | "." | "..") || target_name.contains('/') {
                return Err(BuildError::ExtractionFailed(format!(
                    "Invalid whiteout {}",
                    rel.display()
                )));
            }
            let parent = secure_join(self.dest, &parent_rel)?;
            let target = parent.join(target_name);
            if !target.starts_with(self.dest) || target == self.dest {
                return Err(BuildError::ExtractionFailed(format!(
                    "Whiteout {} resolves outside {}",
                    rel.display(),
                    self.dest.display()
                )));
            }
            if fs::symlink_metadata(&target).is_ok() {
                self.make_writable(&parent)?;
                remove_path(&target)?;
                tracing::trace!(path = %target.display(), "Whiteout removed");
            }
            return Ok(());
        }

        let parent = secure_join(self.dest, &parent_rel)?;
        self.ensure_dir(&parent)?;
        let target = parent.join(&name);

        let entry_type = entry.header().entry_type();
        if let Ok(existing) = fs::symlink_metadata(&target) {
            let keep = entry_type.is_dir() && existing.is_dir();
            if !keep {
                remove_path(&target)?;
            }
        }

        if let UnpackMode::Rootless { uid_map, gid_map } = self.mode {
            let uid = entry.header().uid().unwrap_or(0) as u32;
            let gid = entry.header().gid().unwrap_or(0) as u32;
            if uid_map.to_host(uid).is_none() || gid_map.to_host(gid).is_none() {
                self.unmapped += 1;
            }
        }

        match entry_type {
            EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(|e| BuildError::ExtractionFailed(format!("Invalid hardlink: {}", e)))?
                    .ok_or_else(|| {
                        BuildError::ExtractionFailed(format!(
                            "Hardlink {} has no target",
                            rel.display()
                        ))
                    })?;
                let source = secure_join(self.dest, &clean_relative(&link)?)?;
                fs::hard_link(&source, &target).map_err(|e| {
                    BuildError::ExtractionFailed(format!(
                        "Failed to link {} to {}: {}",
                        target.display(),
                        source.display(),
                        e
                    ))
                })?;
            }
            EntryType::Char | EntryType::Block if self.mode.is_rootless() => {
                if let Err(e) = entry.unpack(&target) {
                    tracing::warn!(
                        path = %rel.display(),
                        error = %e,
                        "Cannot create device node without privileges, skipping"
                    );
                    return Ok(());
                }
            }
            _ => {
                entry.unpack(&target).map_err(|e| {
                    BuildError::ExtractionFailed(format!(
                        "Failed to extract {}: {}",
                        rel.display(),
                        e
                    ))
                })?;
            }
        }

        if entry_type.is_dir() && self.mode.is_rootless() {
            self.make_writable(&target)?;
        }
        self.written.insert(rel);
        Ok(())
    }

    /// Remove everything in `dir` not written by this layer. Directories
    /// this layer wrote are opaque too, so they are cleared recursively.
    fn clear_opaque(&mut self, dir: &Path, dir_rel: &Path) -> Result<()> {
        let children = fs::read_dir(dir).map_err(|e| {
            BuildError::ExtractionFailed(format!("Failed to read {}: {}", dir.display(), e))
        })?;
        for child in children {
            let child = child?;
            let child_rel = dir_rel.join(child.file_name());
            let child_path = child.path();
            if !self.written.contains(&child_rel) {
                remove_path(&child_path)?;
            } else if fs::symlink_metadata(&child_path).is_ok_and(|m| m.is_dir()) {
                self.make_writable(&child_path)?;
                self.clear_opaque(&child_path, &child_rel)?;
            }
        }
        Ok(())
    }

    /// Create missing parents of an entry.
    fn ensure_dir(&mut self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| {
                BuildError::ExtractionFailed(format!(
                    "Failed to create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        self.make_writable(dir)
    }

    /// Rootless builders cannot write into directories lacking owner rwx,
    /// so such directories are widened until the layer is done.
    fn make_writable(&mut self, dir: &Path) -> Result<()> {
        if !self.mode.is_rootless() {
            return Ok(());
        }
        let Ok(meta) = fs::symlink_metadata(dir) else {
            return Ok(());
        };
        let mode = meta.permissions().mode() & 0o7777;
        if meta.is_dir() && mode & 0o700 != 0o700 {
            fs::set_permissions(dir, fs::Permissions::from_mode(mode | 0o700)).map_err(|e| {
                BuildError::ExtractionFailed(format!(
                    "Failed to make {} writable: {}",
                    dir.display(),
                    e
                ))
            })?;
            self.widened.push((dir.to_path_buf(), mode));
        }
        Ok(())
    }

    fn restore_modes(&mut self) {
        while let Some((dir, mode)) = self.widened.pop() {
            if let Err(e) = fs::set_permissions(&dir, fs::Permissions::from_mode(mode)) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to restore directory mode");
                }
            }
        }
    }
}

/// Normalize an archive path to a plain relative path. `..` is refused.
fn clean_relative(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => clean.push(name),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(BuildError::ExtractionFailed(format!(
                    "Refusing archive path with parent reference: {}",
                    path.display()
                )))
            }
        }
    }
    Ok(clean)
}

/// Remove a path without following a final symlink.
fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let res = if meta.is_dir() {
        force_remove_all(path)
    } else {
        fs::remove_file(path)
    };
    res.map_err(|e| {
        BuildError::ExtractionFailed(format!("Failed to remove {}: {}", path.display(), e))
    })
}
