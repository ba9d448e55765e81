//! Build driver: one recipe in, one populated sandbox directory out.
//!
//! ```text
//! Recipe ──Source::for_recipe──▶ get ──▶ pack ──▶ move rootfs to dest ──▶ clean up
//! ```
//!
//! The bundle lives in a fresh directory under the scratch root so a
//! failed build never leaves a half-written destination behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sbuild_core::error::{BuildError, Result};
use sbuild_core::recipe::Recipe;
use tokio_util::sync::CancellationToken;

use crate::bundle::{force_remove_all, make_temp_dir, Bundle};
use crate::options::BuildOptions;
use crate::sources::{Source, SourceKind};
use crate::unpack::sandbox::copy_tree;
use crate::userns::is_unprivileged;

/// Result of a finished build.
#[derive(Debug)]
pub struct BuildOutput {
    /// The populated root filesystem
    pub rootfs: PathBuf,
    /// Source that produced it
    pub source: SourceKind,
    /// Auxiliary objects for image assembly, e.g. the OCI config
    pub json_objects: BTreeMap<String, Vec<u8>>,
    /// Recipe sections left for the assembly stage, in recipe order,
    /// filtered by `sections` and `no_test`
    pub pending_sections: Vec<String>,
}

/// Build `recipe` into the sandbox directory `dest`.
///
/// An existing non-empty `dest` is only replaced when `opts.force` is set.
pub async fn build(
    recipe: Recipe,
    opts: BuildOptions,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<BuildOutput> {
    prepare_destination(dest, opts.force)?;
    let mut source = Source::for_recipe(&recipe)?;
    let kind = source.kind();

    let scratch = opts.scratch_root();
    let parent = make_temp_dir(&scratch, "build-")?;
    let mut bundle = create_bundle(&parent, &scratch, recipe, opts)?;

    tracing::info!(
        source = %kind,
        rootfs = %bundle.rootfs_path.display(),
        dest = %dest.display(),
        "Starting build"
    );

    let built = async {
        source.get(&mut bundle, cancel).await?;
        source.pack(&mut bundle, cancel).await?;
        move_rootfs(&bundle.rootfs_path, dest)
    }
    .await;

    if let Err(e) = built {
        tracing::error!(component = %kind, kind = e.kind(), error = %e, "Build failed");
        if let Err(clean) = source.clean_up(&bundle) {
            tracing::warn!(error = %clean, "Failed to clean up build bundle");
        }
        return Err(e);
    }

    let pending_sections = bundle
        .recipe
        .sections
        .iter()
        .map(|s| s.name.clone())
        .filter(|name| bundle.run_section(name))
        .collect();
    let output = BuildOutput {
        rootfs: dest.to_path_buf(),
        source: kind,
        json_objects: std::mem::take(&mut bundle.json_objects),
        pending_sections,
    };
    if let Err(e) = source.clean_up(&bundle) {
        tracing::warn!(error = %e, "Failed to clean up build bundle");
    }
    tracing::info!(rootfs = %dest.display(), "Build complete");
    Ok(output)
}

/// Create the bundle under `parent`, removing `parent` again on failure.
fn create_bundle(
    parent: &Path,
    temp_dir: &Path,
    recipe: Recipe,
    opts: BuildOptions,
) -> Result<Bundle> {
    Bundle::create(parent, temp_dir, recipe, opts).inspect_err(|_| {
        if let Err(e) = force_remove_all(parent) {
            tracing::warn!(path = %parent.display(), error = %e, "Failed to remove build directory");
        }
    })
}

fn prepare_destination(dest: &Path, force: bool) -> Result<()> {
    let occupied = match fs::read_dir(dest) {
        Ok(mut entries) => entries.next().is_some(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => true,
        Err(e) => {
            return Err(BuildError::Other(format!(
                "Failed to inspect {}: {}",
                dest.display(),
                e
            )))
        }
    };
    if !occupied {
        return Ok(());
    }
    if !force {
        return Err(BuildError::Config(format!(
            "destination {} already exists, use --force to overwrite it",
            dest.display()
        )));
    }
    tracing::warn!(dest = %dest.display(), "Overwriting existing destination");
    force_remove_all(dest).map_err(|e| {
        BuildError::Other(format!("Failed to remove {}: {}", dest.display(), e))
    })
}

/// Move the finished rootfs into place, copying across filesystems.
fn move_rootfs(rootfs: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            BuildError::Other(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }
    // an empty leftover directory would make rename fail
    let _ = fs::remove_dir(dest);

    match fs::rename(rootfs, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            tracing::debug!(
                from = %rootfs.display(),
                to = %dest.display(),
                "Rootfs is on another filesystem, copying"
            );
            fs::create_dir_all(dest).map_err(|e| {
                BuildError::Other(format!("Failed to create {}: {}", dest.display(), e))
            })?;
            copy_tree(rootfs, dest, !is_unprivileged())
        }
        Err(e) => Err(BuildError::Other(format!(
            "Failed to move {} to {}: {}",
            rootfs.display(),
            dest.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rootfs::RUNSCRIPT_PATH;
    use tempfile::TempDir;

    fn opts(dir: &TempDir) -> BuildOptions {
        BuildOptions::default().with_tmp_dir(dir.path().join("scratch"))
    }

    #[tokio::test]
    async fn test_scratch_build() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out/sandbox");
        let output = build(
            Recipe::new("scratch"),
            opts(&dir),
            &dest,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(output.source, SourceKind::Scratch);
        assert_eq!(output.rootfs, dest);
        assert!(dest.join(".singularity.d/actions/exec").exists());
        assert!(dest.join(RUNSCRIPT_PATH).exists());
        // bundle scratch space is gone
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("scratch"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[tokio::test]
    async fn test_existing_destination_needs_force() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sandbox");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("old"), b"x").unwrap();

        let err = build(
            Recipe::new("scratch"),
            opts(&dir),
            &dest,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
        assert!(dest.join("old").exists());

        let mut forced = opts(&dir);
        forced.force = true;
        build(Recipe::new("scratch"), forced, &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!dest.join("old").exists());
        assert!(dest.join(".singularity.d").is_dir());
    }

    #[tokio::test]
    async fn test_failed_build_cleans_up() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sandbox");
        let recipe = Recipe::new("localimage")
            .with_header("from", dir.path().join("missing").display().to_string());
        let err = build(recipe, opts(&dir), &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_no_cleanup_keeps_bundle() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sandbox");
        let recipe = Recipe::new("localimage")
            .with_header("from", dir.path().join("missing").display().to_string());
        let opts = opts(&dir).with_no_cleanup(true);
        build(recipe, opts, &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(fs::read_dir(dir.path().join("scratch")).unwrap().count() > 0);
    }

    #[tokio::test]
    async fn test_pending_sections_follow_options() {
        let dir = TempDir::new().unwrap();
        let recipe = Recipe::new("scratch")
            .with_section("setup", "true")
            .with_section("post", "echo hi")
            .with_section("test", "true");
        let mut opts = opts(&dir);
        opts.no_test = true;
        let output = build(recipe, opts, &dir.path().join("sandbox"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.pending_sections, vec!["setup", "post"]);
    }

    #[test]
    fn test_bundle_failure_removes_build_dir() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let parent = make_temp_dir(&scratch, "build-").unwrap();
        // a regular file cannot hold the bundle's scratch dir
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();

        let err = create_bundle(&parent, &blocker, Recipe::new("scratch"), BuildOptions::default());
        assert!(err.is_err());
        assert!(!parent.exists());
    }

    #[tokio::test]
    async fn test_unknown_bootstrap() {
        let dir = TempDir::new().unwrap();
        let err = build(
            Recipe::new("floppy"),
            opts(&dir),
            &dir.path().join("sandbox"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BuildError::RecipeHeaderMalformed { .. }));
    }
}
