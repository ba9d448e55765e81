//! Plain archive extraction for `oci-archive` and `docker-archive` files.
//!
//! Only directories and regular files are written and ownership is never
//! restored, so the extraction works the same with or without privileges.
//! Entries resolving outside the destination are rejected.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use sbuild_core::error::{BuildError, Result};
use tar::EntryType;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// Extract the (optionally gzipped) tar archive `src` into `dst`.
pub fn extract_archive(src: &Path, dst: &Path) -> Result<()> {
    let file = fs::File::open(src).map_err(|e| {
        BuildError::ExtractionFailed(format!("Failed to open archive {}: {}", src.display(), e))
    })?;
    let mut reader = BufReader::new(file);
    let gzipped = reader.fill_buf()?.starts_with(GZIP_MAGIC);
    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    fs::create_dir_all(dst)?;
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|e| read_error(src, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| read_error(src, e))?;
        let name = entry.path().map_err(|e| read_error(src, e))?.into_owned();
        let target = contained_target(dst, &name)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                if !target.exists() {
                    fs::DirBuilder::new()
                        .recursive(true)
                        .mode(0o755)
                        .create(&target)?;
                }
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = fs::File::create(&target).map_err(|e| {
                    BuildError::ExtractionFailed(format!(
                        "Failed to create {}: {}",
                        target.display(),
                        e
                    ))
                })?;
                std::io::copy(&mut entry, &mut out).map_err(|e| read_error(src, e))?;
            }
            other => {
                tracing::debug!(path = %name.display(), kind = ?other, "Skipping archive entry");
            }
        }
    }
    Ok(())
}

/// Join `name` onto `dst`, refusing absolute paths and `..`.
fn contained_target(dst: &Path, name: &Path) -> Result<PathBuf> {
    let mut target = dst.to_path_buf();
    for component in name.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            _ => {
                return Err(BuildError::ExtractionFailed(format!(
                    "{}: illegal extraction path",
                    name.display()
                )))
            }
        }
    }
    Ok(target)
}

fn read_error(src: &Path, e: std::io::Error) -> BuildError {
    BuildError::ExtractionFailed(format!("Failed to read archive {}: {}", src.display(), e))
}
