//! Squashfs extraction through the host `unsquashfs`.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use sbuild_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use crate::tool::Tool;
use crate::userns::is_unprivileged;

/// Filter matching every path that is not under `dev/`, used with `-r` so
/// device nodes are skipped when they cannot be created.
const EXCLUDE_DEV_REGEX: &str = r"^(.{0}[^d]|.{1}[^e]|.{2}[^v]|.{3}[^\x2f]).*$";

/// Byte range of a filesystem inside a larger file (a SIF partition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub size: u64,
}

/// Extract the squashfs filesystem in `image` (or in `range` of it) into
/// `dest`.
pub async fn unpack_squashfs(
    image: &Path,
    range: Option<ByteRange>,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let tool = Tool::find("unsquashfs")?;
    let staging_dir = dest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);

    // unsquashfs needs a plain file; a partition is copied out first.
    let staged = match range {
        Some(range) => Some(stage_partition(image, range, &staging_dir)?),
        None => None,
    };
    let source: PathBuf = match &staged {
        Some(file) => file.path().to_path_buf(),
        None => image.to_path_buf(),
    };

    let rootless = is_unprivileged();
    let args = unsquashfs_args(dest, &source, rootless, user_xattrs_supported(&staging_dir));

    // -f would merge into a leftover empty dir; let unsquashfs create it.
    let _ = fs::remove_dir(dest);

    tracing::debug!(image = %source.display(), dest = %dest.display(), rootless, "Extracting squashfs");
    tool.args(&args).run(cancel).await.map_err(|e| match e {
        BuildError::ToolFailed { stderr, .. } => {
            BuildError::ExtractionFailed(format!("extract command failed: {}", stderr))
        }
        other => other,
    })?;

    if rootless {
        fs::DirBuilder::new()
            .mode(0o755)
            .recursive(true)
            .create(dest.join("dev"))
            .map_err(|e| {
                BuildError::ExtractionFailed(format!(
                    "Failed to create {}: {}",
                    dest.join("dev").display(),
                    e
                ))
            })?;
    }
    Ok(())
}

/// Argument list for `unsquashfs`.
pub(crate) fn unsquashfs_args(
    dest: &Path,
    source: &Path,
    rootless: bool,
    user_xattrs: bool,
) -> Vec<String> {
    let mut args = Vec::new();
    if rootless {
        if user_xattrs {
            args.push("-user-xattrs".to_string());
        } else {
            args.push("-no-xattrs".to_string());
        }
        args.push("-r".to_string());
    }
    args.push("-f".to_string());
    args.push("-d".to_string());
    args.push(dest.display().to_string());
    args.push(source.display().to_string());
    if rootless {
        args.push(EXCLUDE_DEV_REGEX.to_string());
    }
    args
}

fn stage_partition(image: &Path, range: ByteRange, dir: &Path) -> Result<tempfile::NamedTempFile> {
    let mut staged = tempfile::Builder::new()
        .prefix("archive-")
        .tempfile_in(dir)
        .map_err(|e| {
            BuildError::ExtractionFailed(format!(
                "Failed to create staging file in {}: {}",
                dir.display(),
                e
            ))
        })?;
    let mut src = File::open(image)?;
    src.seek(SeekFrom::Start(range.offset))?;
    let copied = io::copy(&mut src.take(range.size), staged.as_file_mut())?;
    if copied != range.size {
        return Err(BuildError::ExtractionFailed(format!(
            "partition in {} is truncated: {} of {} bytes",
            image.display(),
            copied,
            range.size
        )));
    }
    Ok(staged)
}

/// Whether files in `dir` accept `user.*` extended attributes.
fn user_xattrs_supported(dir: &Path) -> bool {
    let Ok(probe) = tempfile::Builder::new().prefix(".xattr-").tempfile_in(dir) else {
        return false;
    };
    let Ok(path) = CString::new(probe.path().as_os_str().as_bytes()) else {
        return false;
    };
    let value = b"1";
    // SAFETY: path and the attribute name are valid NUL-terminated strings
    // and value outlives the call.
    let rc = unsafe {
        libc::setxattr(
            path.as_ptr(),
            b"user.sbuild-probe\0".as_ptr() as *const libc::c_char,
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    rc == 0
}
