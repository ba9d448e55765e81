//! OCI platform triples: host detection, alias normalization, matching.
//!
//! A platform is `os/architecture[/variant]`. Only Linux platforms are
//! accepted, since the produced root filesystems are Linux images.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

/// Short architecture names accepted by the `arch` build option, mapped to
/// an OCI `(architecture, variant)` pair.
pub const ARCH_ALIASES: &[(&str, &str, &str)] = &[
    ("amd64", "amd64", ""),
    ("386", "386", ""),
    ("arm", "arm", "v7"),
    ("arm32v5", "arm", "v5"),
    ("arm32v6", "arm", "v6"),
    ("arm32v7", "arm", "v7"),
    ("arm64", "arm64", "v8"),
    ("arm64v8", "arm64", "v8"),
    ("ppc64le", "ppc64le", ""),
    ("riscv64", "riscv64", ""),
    ("s390x", "s390x", ""),
    ("mips64le", "mips64le", ""),
];

/// An OCI platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Create a platform, normalizing the architecture and variant.
    pub fn new(os: impl Into<String>, architecture: &str, variant: Option<&str>) -> Self {
        let (architecture, variant) = normalize_arch(architecture, variant.unwrap_or(""));
        Self {
            os: os.into().to_lowercase(),
            architecture,
            variant,
        }
    }

    /// Parse an `os/arch[/variant]` string. Only `linux` is accepted.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let platform = match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Platform::new(*os, arch, None),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() => {
                Platform::new(*os, arch, Some(*variant))
            }
            _ => {
                return Err(BuildError::Config(format!(
                    "invalid platform '{}': expected os/arch[/variant]",
                    s
                )))
            }
        };
        if platform.os != "linux" {
            return Err(BuildError::UnsupportedPlatform(format!(
                "{}: only linux platforms are supported",
                platform
            )));
        }
        Ok(platform)
    }

    /// Override architecture and variant from an `arch` short alias.
    pub fn with_arch_alias(mut self, alias: &str) -> Result<Self> {
        let (arch, variant) = arch_from_alias(alias)?;
        let (arch, variant) = normalize_arch(&arch, variant.as_deref().unwrap_or(""));
        self.architecture = arch;
        self.variant = variant;
        Ok(self)
    }

    /// Whether an image with platform `self` satisfies `required`.
    ///
    /// OS and architecture must match; the variant only matters when the
    /// requirement names one.
    pub fn satisfies(&self, required: &Platform) -> bool {
        if self.os != required.os || self.architecture != required.architecture {
            return false;
        }
        match &required.variant {
            Some(v) => self.variant.as_deref() == Some(v.as_str()),
            None => true,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = &self.variant {
            write!(f, "/{}", v)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Platform::parse(s)
    }
}

/// Normalize an architecture/variant pair to canonical OCI values.
///
/// Values not in the table pass through unchanged.
pub fn normalize_arch(arch: &str, variant: &str) -> (String, Option<String>) {
    let arch = arch.to_lowercase();
    let variant = variant.to_lowercase();
    let (arch, variant): (&str, &str) = match arch.as_str() {
        "i386" | "i686" | "x86" => ("386", ""),
        "x86_64" | "x86-64" | "amd64" => {
            let v = if variant == "v1" { "" } else { variant.as_str() };
            ("amd64", v)
        }
        "aarch64" | "arm64" => {
            let v = match variant.as_str() {
                "8" | "v8" => "",
                other => other,
            };
            ("arm64", v)
        }
        "armhf" => ("arm", "v7"),
        "armel" => ("arm", "v6"),
        "arm" => {
            let v = match variant.as_str() {
                "" | "7" => "v7",
                "5" => "v5",
                "6" => "v6",
                "8" => "v8",
                other => other,
            };
            ("arm", v)
        }
        "powerpc64le" | "ppc64le" => ("ppc64le", variant.as_str()),
        other => (other, variant.as_str()),
    };
    let variant = if variant.is_empty() {
        None
    } else {
        Some(variant.to_string())
    };
    (arch.to_string(), variant)
}

/// Resolve an `arch` short alias to an OCI `(architecture, variant)` pair.
pub fn arch_from_alias(alias: &str) -> Result<(String, Option<String>)> {
    ARCH_ALIASES
        .iter()
        .find(|(name, _, _)| *name == alias)
        .map(|(_, arch, variant)| {
            let variant = if variant.is_empty() {
                None
            } else {
                Some(variant.to_string())
            };
            (arch.to_string(), variant)
        })
        .ok_or_else(|| BuildError::ArchUnknown {
            arch: alias.to_string(),
            known: ARCH_ALIASES
                .iter()
                .map(|(name, _, _)| *name)
                .collect::<Vec<_>>()
                .join(", "),
        })
}

/// The platform of the running host.
pub fn default_platform() -> Result<Platform> {
    if std::env::consts::OS != "linux" {
        return Err(BuildError::UnsupportedPlatform(format!(
            "{}: image builds require a linux host",
            std::env::consts::OS
        )));
    }
    let variant = cpu_variant();
    Ok(Platform::new("linux", host_arch(), variant.as_deref()))
}

/// Host architecture in OCI terms before alias normalization.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" if cfg!(target_endian = "little") => "ppc64le",
        "powerpc64" => "ppc64",
        "mips64" if cfg!(target_endian = "little") => "mips64le",
        other => other,
    }
}

/// CPU variant of the running host, where the architecture has variants.
fn cpu_variant() -> Option<String> {
    match std::env::consts::ARCH {
        "arm" => {
            let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
            cpuinfo
                .lines()
                .find(|l| l.starts_with("CPU architecture"))
                .and_then(|l| l.split(':').nth(1))
                .map(|v| format!("v{}", v.trim()))
        }
        "aarch64" => Some("v8".to_string()),
        _ => None,
    }
}

/// Check the image's declared platform against the requested one.
///
/// A missing image platform is accepted with a warning.
pub fn check_image_platform(required: &Platform, image: Option<&Platform>) -> Result<()> {
    let Some(image) = image else {
        tracing::warn!(
            required = %required,
            "Image does not declare a platform, assuming it is compatible"
        );
        return Ok(());
    };
    let image = Platform::new(
        image.os.clone(),
        &image.architecture,
        image.variant.as_deref(),
    );
    if image.satisfies(required) {
        Ok(())
    } else {
        Err(BuildError::PlatformMismatch {
            required: required.to_string(),
            image: image.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(normalize_arch("aarch64", ""), ("arm64".to_string(), None));
        assert_eq!(normalize_arch("arm64", "v8"), ("arm64".to_string(), None));
        assert_eq!(
            normalize_arch("arm", ""),
            ("arm".to_string(), Some("v7".to_string()))
        );
        assert_eq!(normalize_arch("386", ""), ("386".to_string(), None));
        assert_eq!(normalize_arch("x86_64", ""), ("amd64".to_string(), None));
        assert_eq!(normalize_arch("amd64", ""), ("amd64".to_string(), None));
    }

    #[test]
    fn test_normalize_passthrough() {
        assert_eq!(normalize_arch("loong64", ""), ("loong64".to_string(), None));
    }

    #[test]
    fn test_parse_platform() {
        let p = Platform::parse("linux/arm/v6").unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "arm");
        assert_eq!(p.variant.as_deref(), Some("v6"));
        assert_eq!(p.to_string(), "linux/arm/v6");

        let p: Platform = "linux/aarch64".parse().unwrap();
        assert_eq!(p.to_string(), "linux/arm64");
    }

    #[test]
    fn test_parse_rejects_non_linux() {
        let err = Platform::parse("windows/amd64").unwrap_err();
        assert!(matches!(err, BuildError::UnsupportedPlatform(_)));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Platform::parse("linux").is_err());
        assert!(Platform::parse("linux/").is_err());
        assert!(Platform::parse("a/b/c/d").is_err());
    }

    #[test]
    fn test_arch_from_alias() {
        assert_eq!(
            arch_from_alias("arm32v7").unwrap(),
            ("arm".to_string(), Some("v7".to_string()))
        );
        assert_eq!(arch_from_alias("amd64").unwrap(), ("amd64".to_string(), None));
        let err = arch_from_alias("sparc").unwrap_err();
        assert!(matches!(err, BuildError::ArchUnknown { .. }));
        assert!(err.to_string().contains("arm64v8"));
    }

    #[test]
    fn test_check_image_platform_matches() {
        let required = Platform::new("linux", "amd64", None);
        let image = Platform::new("linux", "x86_64", None);
        assert!(check_image_platform(&required, Some(&image)).is_ok());
    }

    #[test]
    fn test_check_image_platform_variant_only_when_required() {
        let required = Platform::new("linux", "arm", Some("v6"));
        let image = Platform::new("linux", "arm", Some("v7"));
        let err = check_image_platform(&required, Some(&image)).unwrap_err();
        assert!(matches!(err, BuildError::PlatformMismatch { .. }));

        let loose = Platform {
            os: "linux".to_string(),
            architecture: "arm".to_string(),
            variant: None,
        };
        assert!(check_image_platform(&loose, Some(&image)).is_ok());
    }

    #[test]
    fn test_check_image_platform_mismatch_arch() {
        let required = Platform::new("linux", "amd64", None);
        let image = Platform::new("linux", "arm64", None);
        match check_image_platform(&required, Some(&image)).unwrap_err() {
            BuildError::PlatformMismatch { required, image } => {
                assert_eq!(required, "linux/amd64");
                assert_eq!(image, "linux/arm64");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_image_platform_absent_is_accepted() {
        let required = Platform::new("linux", "amd64", None);
        assert!(check_image_platform(&required, None).is_ok());
    }

    #[test]
    fn test_with_arch_alias_overrides() {
        let p = Platform::new("linux", "amd64", None)
            .with_arch_alias("arm32v6")
            .unwrap();
        assert_eq!(p.architecture, "arm");
        assert_eq!(p.variant.as_deref(), Some("v6"));

        let p = Platform::new("linux", "amd64", None)
            .with_arch_alias("arm64v8")
            .unwrap();
        assert_eq!(p.to_string(), "linux/arm64");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_default_platform_is_linux() {
        let p = default_platform().unwrap();
        assert_eq!(p.os, "linux");
        assert!(!p.architecture.is_empty());
    }
}
