//! Structure-preserving directory copy.
//!
//! The source tree is streamed through a tar archive into the destination
//! so symlinks stay links, modes and mtimes are kept, and special files are
//! recreated rather than read.

use std::fs;
use std::os::unix::net::UnixStream;
use std::path::Path;

use sbuild_core::error::{BuildError, Result};

use crate::userns::is_unprivileged;

/// Copy the tree at `src` into `dest`.
pub fn unpack_sandbox(src: &Path, dest: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(BuildError::ExtractionFailed(format!(
            "sandbox source {} is not a directory",
            src.display()
        )));
    }
    fs::create_dir_all(dest).map_err(|e| {
        BuildError::ExtractionFailed(format!("Failed to create {}: {}", dest.display(), e))
    })?;
    tracing::debug!(src = %src.display(), dest = %dest.display(), "Copying sandbox");
    copy_tree(src, dest, !is_unprivileged())
}

/// Stream `src` into `dest` through a tar pipe. Ownership is restored only
/// when `preserve_owner` is set.
pub(crate) fn copy_tree(src: &Path, dest: &Path, preserve_owner: bool) -> Result<()> {
    let (writer, reader) = UnixStream::pair()?;

    std::thread::scope(|scope| {
        let producer = scope.spawn(move || -> std::io::Result<()> {
            let mut builder = tar::Builder::new(writer);
            builder.follow_symlinks(false);
            builder.mode(tar::HeaderMode::Complete);
            builder.append_dir_all(".", src)?;
            builder.into_inner()?.shutdown(std::net::Shutdown::Write)
        });

        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_overwrite(true);
        archive.set_unpack_xattrs(preserve_owner);
        archive.set_preserve_ownerships(preserve_owner);
        let unpacked = archive.unpack(dest);
        // Unblock the producer if the consumer stopped early.
        drop(archive);

        let produced = producer
            .join()
            .map_err(|_| BuildError::ExtractionFailed("tar producer panicked".to_string()))?;
        produced.map_err(|e| {
            BuildError::ExtractionFailed(format!("Failed to read {}: {}", src.display(), e))
        })?;
        unpacked.map_err(|e| {
            BuildError::ExtractionFailed(format!(
                "Failed to copy {} to {}: {}",
                src.display(),
                dest.display(),
                e
            ))
        })
    })
}
