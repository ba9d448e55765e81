//! Bootstrap sources.
//!
//! Each `Bootstrap:` kind has a conveyor/packer: `get` fetches or installs
//! the raw root filesystem into the bundle, `pack` finalizes it with the
//! base environment and metadata. The recipe header selects the source.

pub mod arch;
pub mod buildkit;
pub mod busybox;
pub mod debootstrap;
pub mod distro;
pub mod library;
pub mod local;
pub mod oci;
pub mod oras;
pub mod scratch;
pub mod shub;
pub mod verify;
pub mod yum;
pub mod zypper;

use std::fmt;

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};
use sbuild_core::recipe::Recipe;
use tokio_util::sync::CancellationToken;

use crate::bundle::Bundle;
use crate::rootfs::{check_perms, fix_perms};

pub use arch::ArchSource;
pub use buildkit::BuildKitSource;
pub use busybox::BusyboxSource;
pub use debootstrap::DebootstrapSource;
pub use library::LibrarySource;
pub use local::{LocalPacker, LocalSource};
pub use oci::OciSource;
pub use oras::OrasSource;
pub use scratch::ScratchSource;
pub use shub::ShubSource;
pub use verify::{check_signatures, DescriptorVerifier, SignatureVerifier};
pub use yum::YumSource;
pub use zypper::ZypperSource;

/// The two build phases every source implements.
#[async_trait]
pub trait ConveyorPacker: Send {
    /// Populate `bundle.rootfs_path` with the raw source content.
    async fn get(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()>;

    /// Finalize the root filesystem: base environment, runscripts and
    /// metadata.
    async fn pack(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()>;
}

/// Kind of bootstrap source, after alias resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Oci,
    BuildKit,
    Library,
    Oras,
    Shub,
    LocalImage,
    Yum,
    Zypper,
    Arch,
    Debootstrap,
    Busybox,
    Scratch,
}

impl SourceKind {
    /// Resolve a `Bootstrap:` value, case-insensitively.
    pub fn from_bootstrap(bootstrap: &str) -> Option<Self> {
        let kind = match bootstrap.to_lowercase().as_str() {
            "docker" | "docker-archive" | "docker-daemon" | "oci" | "oci-archive" => Self::Oci,
            "buildkit" => Self::BuildKit,
            "library" => Self::Library,
            "oras" => Self::Oras,
            "shub" => Self::Shub,
            "localimage" => Self::LocalImage,
            "yum" | "dnf" => Self::Yum,
            "zypper" => Self::Zypper,
            "arch" | "pacstrap" => Self::Arch,
            "debootstrap" => Self::Debootstrap,
            "busybox" => Self::Busybox,
            "scratch" => Self::Scratch,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Oci => "oci",
            Self::BuildKit => "buildkit",
            Self::Library => "library",
            Self::Oras => "oras",
            Self::Shub => "shub",
            Self::LocalImage => "localimage",
            Self::Yum => "yum",
            Self::Zypper => "zypper",
            Self::Arch => "arch",
            Self::Debootstrap => "debootstrap",
            Self::Busybox => "busybox",
            Self::Scratch => "scratch",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A bootstrap source selected from a recipe.
#[derive(Debug)]
pub enum Source {
    Oci(OciSource),
    BuildKit(BuildKitSource),
    Library(LibrarySource),
    Oras(OrasSource),
    Shub(ShubSource),
    Local(LocalSource),
    Yum(YumSource),
    Zypper(ZypperSource),
    Arch(ArchSource),
    Debootstrap(DebootstrapSource),
    Busybox(BusyboxSource),
    Scratch(ScratchSource),
}

impl Source {
    /// Select the source named by the recipe's `Bootstrap:` header.
    pub fn for_recipe(recipe: &Recipe) -> Result<Self> {
        let bootstrap = recipe
            .bootstrap()
            .ok_or_else(|| BuildError::header_missing("definition", "bootstrap"))?;
        let kind = SourceKind::from_bootstrap(&bootstrap).ok_or_else(|| {
            BuildError::RecipeHeaderMalformed {
                key: "bootstrap".to_string(),
                message: format!("unknown bootstrap agent '{}'", bootstrap),
            }
        })?;
        Ok(Self::new(kind))
    }

    pub fn new(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Oci => Self::Oci(OciSource::default()),
            SourceKind::BuildKit => Self::BuildKit(BuildKitSource::default()),
            SourceKind::Library => Self::Library(LibrarySource::default()),
            SourceKind::Oras => Self::Oras(OrasSource::default()),
            SourceKind::Shub => Self::Shub(ShubSource),
            SourceKind::LocalImage => Self::Local(LocalSource::default()),
            SourceKind::Yum => Self::Yum(YumSource),
            SourceKind::Zypper => Self::Zypper(ZypperSource),
            SourceKind::Arch => Self::Arch(ArchSource),
            SourceKind::Debootstrap => Self::Debootstrap(DebootstrapSource),
            SourceKind::Busybox => Self::Busybox(BusyboxSource),
            SourceKind::Scratch => Self::Scratch(ScratchSource),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Oci(_) => SourceKind::Oci,
            Self::BuildKit(_) => SourceKind::BuildKit,
            Self::Library(_) => SourceKind::Library,
            Self::Oras(_) => SourceKind::Oras,
            Self::Shub(_) => SourceKind::Shub,
            Self::Local(_) => SourceKind::LocalImage,
            Self::Yum(_) => SourceKind::Yum,
            Self::Zypper(_) => SourceKind::Zypper,
            Self::Arch(_) => SourceKind::Arch,
            Self::Debootstrap(_) => SourceKind::Debootstrap,
            Self::Busybox(_) => SourceKind::Busybox,
            Self::Scratch(_) => SourceKind::Scratch,
        }
    }

    fn inner(&mut self) -> &mut dyn ConveyorPacker {
        match self {
            Self::Oci(s) => s,
            Self::BuildKit(s) => s,
            Self::Library(s) => s,
            Self::Oras(s) => s,
            Self::Shub(s) => s,
            Self::Local(s) => s,
            Self::Yum(s) => s,
            Self::Zypper(s) => s,
            Self::Arch(s) => s,
            Self::Debootstrap(s) => s,
            Self::Busybox(s) => s,
            Self::Scratch(s) => s,
        }
    }

    pub async fn get(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(source = %self.kind(), rootfs = %bundle.rootfs_path.display(), "Fetching bootstrap source");
        self.inner().get(bundle, cancel).await
    }

    pub async fn pack(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(source = %self.kind(), "Packing root filesystem");
        self.inner().pack(bundle, cancel).await
    }

    /// Remove the bundle unless the options keep it for debugging.
    pub fn clean_up(&self, bundle: &Bundle) -> Result<()> {
        if bundle.opts.no_cleanup {
            tracing::info!(
                rootfs = %bundle.rootfs_path.display(),
                tmp = %bundle.tmp_dir.display(),
                "Keeping build bundle"
            );
            return Ok(());
        }
        bundle.remove()
    }
}

/// Apply the permission policy after extracting an image: fix owner access
/// when asked to, otherwise warn about what a sandbox user cannot manage.
pub(crate) fn normalize_perms(bundle: &Bundle) -> Result<()> {
    if bundle.opts.fix_perms {
        tracing::debug!(rootfs = %bundle.rootfs_path.display(), "Modifying permissions for file/directory owners");
        return fix_perms(&bundle.rootfs_path);
    }
    if bundle.opts.sandbox_target {
        check_perms(&bundle.rootfs_path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_aliases() {
        for alias in ["docker", "Docker-Archive", "docker-daemon", "oci", "oci-archive"] {
            assert_eq!(SourceKind::from_bootstrap(alias), Some(SourceKind::Oci));
        }
        assert_eq!(SourceKind::from_bootstrap("dnf"), Some(SourceKind::Yum));
        assert_eq!(SourceKind::from_bootstrap("yum"), Some(SourceKind::Yum));
        assert_eq!(SourceKind::from_bootstrap("pacstrap"), Some(SourceKind::Arch));
        assert_eq!(SourceKind::from_bootstrap("localimage"), Some(SourceKind::LocalImage));
        assert_eq!(SourceKind::from_bootstrap("apt"), None);
    }

    #[test]
    fn test_for_recipe() {
        let source = Source::for_recipe(&Recipe::new("docker-archive")).unwrap();
        assert_eq!(source.kind(), SourceKind::Oci);

        let source = Source::for_recipe(&Recipe::new("Scratch")).unwrap();
        assert_eq!(source.kind(), SourceKind::Scratch);

        let err = Source::for_recipe(&Recipe::new("nope")).unwrap_err();
        assert!(matches!(err, BuildError::RecipeHeaderMalformed { .. }));

        let err = Source::for_recipe(&Recipe::default()).unwrap_err();
        assert!(matches!(err, BuildError::RecipeHeaderMissing { .. }));
    }

    #[test]
    fn test_kind_round_trips_through_name() {
        for kind in [
            SourceKind::Oci,
            SourceKind::BuildKit,
            SourceKind::Library,
            SourceKind::Oras,
            SourceKind::Shub,
            SourceKind::LocalImage,
            SourceKind::Yum,
            SourceKind::Zypper,
            SourceKind::Arch,
            SourceKind::Debootstrap,
            SourceKind::Busybox,
            SourceKind::Scratch,
        ] {
            assert_eq!(SourceKind::from_bootstrap(kind.name()), Some(kind));
            assert_eq!(Source::new(kind).kind(), kind);
        }
    }
}
