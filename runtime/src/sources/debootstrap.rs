//! `Bootstrap: debootstrap`: Debian and Ubuntu roots.

use std::path::Path;

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};
use sbuild_core::platform::{default_platform, Platform};
use tokio_util::sync::CancellationToken;

use super::distro::{include_list, pack_distro, prepare_scaffold, substitute_osversion};
use super::ConveyorPacker;
use crate::bundle::Bundle;
use crate::tool::Tool;

/// Debian architecture name for an OCI platform.
pub fn debian_arch(platform: &Platform) -> Result<&'static str> {
    let arch = match (platform.architecture.as_str(), platform.variant.as_deref()) {
        ("amd64", _) => "amd64",
        ("arm64", _) => "arm64",
        ("arm", Some("v7") | None) => "armhf",
        ("arm", Some(_)) => "armel",
        ("386", _) => "i386",
        ("ppc64le", _) => "ppc64el",
        ("s390x", _) => "s390x",
        ("mips64le", _) => "mips64el",
        ("riscv64", _) => "riscv64",
        _ => {
            return Err(BuildError::UnsupportedPlatform(format!(
                "{} has no Debian architecture",
                platform
            )))
        }
    };
    Ok(arch)
}

/// Resolved debootstrap invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebootstrapRequest {
    pub osversion: String,
    pub mirror_url: String,
    pub arch: String,
    pub includes: Vec<String>,
}

impl DebootstrapRequest {
    pub fn from_bundle(bundle: &Bundle, platform: &Platform) -> Result<Self> {
        let recipe = &bundle.recipe;
        let osversion = recipe.require_header("debootstrap", "osversion")?;
        let mirror = recipe.require_header("debootstrap", "mirrorurl")?;
        Ok(Self {
            osversion: osversion.to_string(),
            mirror_url: substitute_osversion("debootstrap", mirror, Some(osversion))?,
            arch: debian_arch(platform)?.to_string(),
            includes: include_list(&[], recipe.header("include")),
        })
    }

    pub fn args(&self, rootfs: &Path) -> Vec<String> {
        let mut args = vec![
            "--variant=minbase".to_string(),
            "--exclude=openssl".to_string(),
            format!("--arch={}", self.arch),
        ];
        if !self.includes.is_empty() {
            args.push(format!("--include={}", self.includes.join(",")));
        }
        args.push(self.osversion.clone());
        args.push(rootfs.display().to_string());
        args.push(self.mirror_url.clone());
        args
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DebootstrapSource;

#[async_trait]
impl ConveyorPacker for DebootstrapSource {
    async fn get(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let debootstrap = Tool::find("debootstrap")?;
        let request = DebootstrapRequest::from_bundle(bundle, &default_platform()?)?;
        let rootfs = bundle.rootfs_path.clone();

        let _mounts = prepare_scaffold(&rootfs, &bundle.opts)?;
        tracing::debug!(
            osversion = %request.osversion,
            mirror = %request.mirror_url,
            arch = %request.arch,
            includes = ?request.includes,
            "Running debootstrap"
        );
        debootstrap.args(request.args(&rootfs)).run(cancel).await?;
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        pack_distro(&bundle.rootfs_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BuildOptions;
    use sbuild_core::recipe::Recipe;
    use tempfile::TempDir;

    #[test]
    fn test_debian_arch() {
        let cases = [
            (Platform::new("linux", "amd64", None), "amd64"),
            (Platform::new("linux", "arm64", Some("v8")), "arm64"),
            (Platform::new("linux", "arm", Some("v7")), "armhf"),
            (Platform::new("linux", "arm", Some("v6")), "armel"),
            (Platform::new("linux", "386", None), "i386"),
            (Platform::new("linux", "ppc64le", None), "ppc64el"),
        ];
        for (platform, expected) in cases {
            assert_eq!(debian_arch(&platform).unwrap(), expected, "{}", platform);
        }
        assert!(matches!(
            debian_arch(&Platform::new("linux", "wasm", None)).unwrap_err(),
            BuildError::UnsupportedPlatform(_)
        ));
    }

    #[test]
    fn test_request_args() {
        let dir = TempDir::new().unwrap();
        let recipe = Recipe::new("debootstrap")
            .with_header("osversion", "jammy")
            .with_header("mirrorurl", "http://archive.ubuntu.com/ubuntu/")
            .with_header("include", "apt python3 ");
        let bundle = Bundle::create(
            dir.path().join("out"),
            dir.path().join("tmp"),
            recipe,
            BuildOptions::default(),
        )
        .unwrap();
        let request =
            DebootstrapRequest::from_bundle(&bundle, &Platform::new("linux", "amd64", None))
                .unwrap();
        let args = request.args(Path::new("/build/rootfs"));
        assert_eq!(&args[..3], &["--variant=minbase", "--exclude=openssl", "--arch=amd64"]);
        assert!(args[3].starts_with("--include=apt,python3"));
        assert_eq!(
            &args[args.len() - 3..],
            &["jammy", "/build/rootfs", "http://archive.ubuntu.com/ubuntu/"]
        );
    }

    #[test]
    fn test_request_requires_osversion() {
        let dir = TempDir::new().unwrap();
        let recipe = Recipe::new("debootstrap").with_header("mirrorurl", "http://deb.debian.org/debian/");
        let bundle = Bundle::create(
            dir.path().join("out"),
            dir.path().join("tmp"),
            recipe,
            BuildOptions::default(),
        )
        .unwrap();
        let err = DebootstrapRequest::from_bundle(&bundle, &Platform::new("linux", "amd64", None))
            .unwrap_err();
        assert!(matches!(err, BuildError::RecipeHeaderMissing { ref key, .. } if key == "osversion"));
    }
}
