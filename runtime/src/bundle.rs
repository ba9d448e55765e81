//! Build bundle: the on-disk workspace of a single build.
//!
//! ```text
//! <parent>/rootfs          populated by the bootstrap source
//! <tmp>/bundle-temp-XXXX   scratch space, removed independently
//! ```
//!
//! The rootfs must sit on a filesystem that allows ownership changes when
//! building as root. When the requested parent fails that probe, the rootfs
//! is relocated under the scratch root.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::getuid;
use sbuild_core::error::{BuildError, Result};
use sbuild_core::recipe::Recipe;

use crate::options::BuildOptions;

/// Key of the OCI image config in [`Bundle::json_objects`].
pub const OCI_CONFIG_JSON: &str = "oci-config";

/// Name of the ownership probe file.
const CHOWN_PROBE: &str = ".chownTest";

/// A build workspace.
#[derive(Debug)]
pub struct Bundle {
    /// Root filesystem being built
    pub rootfs_path: PathBuf,
    /// Scratch directory for downloads and intermediate files
    pub tmp_dir: PathBuf,
    /// Caller-requested parent of the rootfs
    pub parent_path: PathBuf,
    pub recipe: Recipe,
    pub opts: BuildOptions,
    /// Auxiliary objects for image assembly, keyed by descriptor tag
    pub json_objects: BTreeMap<String, Vec<u8>>,
    /// Parent actually holding the rootfs after a relocation
    rootfs_parent: PathBuf,
}

impl Bundle {
    /// Create a bundle under `parent_path`, with scratch space under `temp_dir`.
    ///
    /// Image encryption, when requested, travels in
    /// `opts.encryption_key_info`.
    pub fn create(
        parent_path: impl Into<PathBuf>,
        temp_dir: impl AsRef<Path>,
        recipe: Recipe,
        opts: BuildOptions,
    ) -> Result<Self> {
        let parent_path = parent_path.into();
        let temp_dir = temp_dir.as_ref();

        let tmp_dir = make_temp_dir(temp_dir, "bundle-temp-")?;

        let mut rootfs_parent = parent_path.clone();
        let mut rootfs_path = parent_path.join("rootfs");
        create_dir_0755(&rootfs_path)?;

        if !can_chown(&rootfs_path)? {
            let relocated = make_temp_dir(temp_dir, "build-temp-")?;
            let relocated_rootfs = relocated.join("rootfs");
            tracing::warn!(
                requested = %rootfs_path.display(),
                relocated = %relocated_rootfs.display(),
                "Filesystem does not support ownership changes, relocating rootfs"
            );
            let _ = fs::remove_dir(&rootfs_path);
            create_dir_0755(&relocated_rootfs)?;

            if !can_chown(&relocated_rootfs)? {
                tracing::error!(
                    path = %relocated_rootfs.display(),
                    "Could not set files/folders ownership, if you are on NFS or a similar \
                     filesystem, try setting TMPDIR=/var/tmp"
                );
                let _ = force_remove_all(&relocated);
                let _ = force_remove_all(&tmp_dir);
                return Err(BuildError::FsChownUnsupported {
                    path: relocated_rootfs.display().to_string(),
                    message: "ownership change not allowed in the rootfs or the temporary directory"
                        .to_string(),
                });
            }
            rootfs_parent = relocated;
            rootfs_path = relocated_rootfs;
        }

        tracing::debug!(
            rootfs = %rootfs_path.display(),
            tmp = %tmp_dir.display(),
            "Created build bundle"
        );

        Ok(Self {
            rootfs_path,
            tmp_dir,
            parent_path,
            recipe,
            opts,
            json_objects: BTreeMap::new(),
            rootfs_parent,
        })
    }

    /// Whether the named section should run under `opts.sections`.
    /// `no_test` always skips `test`.
    pub fn run_section(&self, name: &str) -> bool {
        let sections = &self.opts.sections;
        if sections.iter().any(|s| s == "none") || (name == "test" && self.opts.no_test) {
            return false;
        }
        sections.iter().any(|s| s == "all" || s == name)
    }

    /// Whether the rootfs was moved away from the requested parent.
    pub fn relocated(&self) -> bool {
        self.rootfs_parent != self.parent_path
    }

    /// Remove the scratch dir and the rootfs parent(s). Every removal is
    /// attempted; failures are reported together.
    pub fn remove(&self) -> Result<()> {
        let mut targets = vec![&self.tmp_dir, &self.parent_path];
        if self.relocated() {
            targets.push(&self.rootfs_parent);
        }

        let mut failures = Vec::new();
        for path in targets {
            if let Err(e) = force_remove_all(path) {
                failures.push(format!("{}: {}", path.display(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Other(format!(
                "Failed to remove bundle paths: {}",
                failures.join("; ")
            )))
        }
    }
}

/// Create a fresh uniquely named directory under `root` with mode 0755.
pub(crate) fn make_temp_dir(root: &Path, prefix: &str) -> Result<PathBuf> {
    fs::create_dir_all(root).map_err(|e| {
        BuildError::Other(format!(
            "Failed to create temporary root {}: {}",
            root.display(),
            e
        ))
    })?;
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(root)
        .map_err(|e| {
            BuildError::Other(format!(
                "Failed to create temporary directory in {}: {}",
                root.display(),
                e
            ))
        })?
        .keep();
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
    Ok(dir)
}

fn create_dir_0755(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        BuildError::Other(format!(
            "Failed to create directory {}: {}",
            path.display(),
            e
        ))
    })?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// Probe whether files under `dir` can be chowned.
///
/// Unprivileged builders never chown, so the probe passes for them.
fn can_chown(dir: &Path) -> Result<bool> {
    if !getuid().is_root() {
        return Ok(true);
    }

    let probe = dir.join(CHOWN_PROBE);
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .custom_flags(libc::O_NOFOLLOW)
        .open(&probe)
        .map_err(|e| {
            BuildError::Other(format!(
                "Failed to create ownership probe {}: {}",
                probe.display(),
                e
            ))
        })?;

    let chowned = std::os::unix::fs::chown(&probe, Some(1), Some(1));
    let removed = fs::remove_file(&probe);

    let allowed = match chowned {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => false,
        Err(e) => {
            return Err(BuildError::Other(format!(
                "Failed to chown ownership probe {}: {}",
                probe.display(),
                e
            )))
        }
    };
    removed.map_err(|e| {
        BuildError::Other(format!(
            "Failed to remove ownership probe {}: {}",
            probe.display(),
            e
        ))
    })?;
    Ok(allowed)
}

/// Recursive removal that also copes with directories lacking owner write.
/// A missing path counts as removed.
pub(crate) fn force_remove_all(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) if e.kind() != io::ErrorKind::PermissionDenied => return Err(e),
        Err(_) => {}
    }

    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if entry.file_type().is_dir() {
            if let Ok(meta) = entry.metadata() {
                let mode = meta.permissions().mode();
                if mode & 0o700 != 0o700 {
                    let _ = fs::set_permissions(
                        entry.path(),
                        fs::Permissions::from_mode(mode | 0o700),
                    );
                }
            }
        }
    }

    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
