//! `Bootstrap: yum` (and `dnf`): install an RPM distribution into the
//! rootfs with the host's dnf or yum.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use super::distro::{include_list, pack_distro, prepare_scaffold, substitute_osversion};
use super::ConveyorPacker;
use crate::bundle::Bundle;
use crate::tool::{find_tool, Tool};

/// Config file written into the rootfs, relative to it.
pub const YUM_CONF: &str = "etc/bootstrap-yum.conf";

/// Package cache used during the bootstrap and removed afterwards.
const YUM_CACHE: &str = "var/cache/yum-bootstrap";

const DEFAULT_INCLUDES: &[&str] = &["/etc/redhat-release", "coreutils"];

/// Settings collected from the recipe headers and the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YumOptions {
    pub mirror_url: String,
    pub update_url: Option<String>,
    pub osversion: String,
    pub includes: Vec<String>,
    pub setopt: Option<String>,
    /// URL of a GPG key to import before installing (`GPG` env var)
    pub gpg: Option<String>,
}

impl YumOptions {
    pub fn from_bundle(bundle: &Bundle) -> Result<Self> {
        let recipe = &bundle.recipe;
        let osversion = recipe.header("osversion");
        let mirror = recipe.require_header("yum", "mirrorurl")?;
        let mirror_url = substitute_osversion("yum", mirror, osversion)?;
        let update_url = recipe
            .header("updateurl")
            .map(|url| substitute_osversion("yum", url, osversion))
            .transpose()?;

        Ok(Self {
            mirror_url,
            update_url,
            osversion: osversion.unwrap_or_default().to_string(),
            includes: include_list(DEFAULT_INCLUDES, recipe.header("include")),
            setopt: recipe.header("setopt").map(str::to_string),
            gpg: std::env::var("GPG").ok().filter(|g| !g.is_empty()),
        })
    }

    fn gpgcheck(&self) -> &'static str {
        if self.gpg.is_some() {
            "gpgcheck=1\n"
        } else {
            "gpgcheck=0\n"
        }
    }

    /// Content of the bootstrap yum config.
    pub fn config(&self) -> String {
        let mut conf = String::from("[main]\n");
        conf.push_str("cachedir=/var/cache/yum-bootstrap\n");
        conf.push_str("keepcache=0\n");
        conf.push_str("debuglevel=2\n");
        conf.push_str("logfile=/var/log/yum.log\n");
        conf.push_str("syslog_device=/dev/null\n");
        conf.push_str("exactarch=1\n");
        conf.push_str("obsoletes=1\n");
        conf.push_str(self.gpgcheck());
        conf.push_str("plugins=1\n");
        conf.push_str("reposdir=0\n");
        conf.push_str("deltarpm=0\n");
        conf.push('\n');
        conf.push_str("[base]\n");
        conf.push_str("name=Linux $releasever - $basearch\n");
        conf.push_str(&format!("baseurl={}\n", self.mirror_url));
        conf.push_str("enabled=1\n");
        conf.push_str(self.gpgcheck());

        if let Some(update) = &self.update_url {
            conf.push_str("[updates]\n");
            conf.push_str("name=Linux $releasever - $basearch updates\n");
            conf.push_str(&format!("baseurl={}\n", update));
            conf.push_str("enabled=1\n");
            conf.push_str(self.gpgcheck());
            conf.push('\n');
        }
        conf
    }

    /// Arguments of the install command.
    pub fn install_args(&self, rootfs: &Path) -> Vec<String> {
        let mut args = vec![
            "--noplugins".to_string(),
            "-c".to_string(),
            rootfs.join(YUM_CONF).display().to_string(),
            "--installroot".to_string(),
            rootfs.display().to_string(),
            format!("--releasever={}", self.osversion),
            "-y".to_string(),
        ];
        if let Some(setopt) = &self.setopt {
            args.push("--setopt".to_string());
            args.push(setopt.clone());
        }
        args.push("install".to_string());
        args.extend(self.includes.iter().cloned());
        args
    }
}

/// Check the host rpm database location. `backend` and `dbpath` are the
/// expanded `_db_backend` and `_dbpath` macros, `None` when undefined.
pub fn check_rpm_db(backend: Option<&str>, dbpath: Option<&str>, home: &str) -> Result<()> {
    match backend {
        Some(backend) if backend != "bdb" => {
            tracing::warn!("Your host system is using the {} RPM database backend.", backend);
            tracing::warn!("Bootstrapping of older distributions that use the bdb backend will fail.");
        }
        Some(_) => {}
        None => tracing::debug!("Undefined macro _db_backend is ignored"),
    }

    let dbpath =
        dbpath.ok_or_else(|| BuildError::Config("rpm macro _dbpath is undefined".to_string()))?;
    match dbpath {
        "/var/lib/rpm" => Ok(()),
        "/usr/lib/sysimage/rpm" => {
            tracing::warn!("Your host system is using a new RPM database path: {}", dbpath);
            tracing::warn!("Bootstrapping of older distributions that use /var/lib/rpm will fail.");
            Ok(())
        }
        other => Err(BuildError::Config(format!(
            "rpm database is using a non-standard path: {}\n\
             You are probably running this bootstrap on Debian or Ubuntu.\n\
             There is a way to work around this problem:\n\
             Create a file at path {}/.rpmmacros.\n\
             Place the following lines into the '.rpmmacros' file:\n\
             %_var /var\n\
             %_dbpath %{{_var}}/lib/rpm\n\
             After creating the file, re-run the bootstrap",
            other, home
        ))),
    }
}

/// Expand an rpm macro; an undefined macro echoes itself back.
async fn rpm_macro(rpm: &Path, name: &str, cancel: &CancellationToken) -> Result<Option<String>> {
    let literal = format!("%{{{}}}", name);
    let out = Tool::new("rpm", rpm)
        .arg("--eval")
        .arg(&literal)
        .capture_stdout()
        .run(cancel)
        .await?;
    let value = out.stdout_text();
    if value.is_empty() || value == literal {
        Ok(None)
    } else {
        Ok(Some(value))
    }
}

fn find_installer() -> Result<Tool> {
    for name in ["dnf", "yum"] {
        if let Ok(path) = find_tool(name) {
            tracing::debug!(tool = name, path = %path.display(), "Found installer");
            return Ok(Tool::new(name, path));
        }
    }
    Err(BuildError::ToolMissing("yum".to_string()))
}

fn write_config(rootfs: &Path, content: &str) -> Result<()> {
    let etc = rootfs.join("etc");
    match fs::DirBuilder::new().mode(0o775).create(&etc) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(BuildError::Other(format!(
                "Failed to create {}: {}",
                etc.display(),
                e
            )))
        }
    }
    let path = rootfs.join(YUM_CONF);
    fs::write(&path, content)
        .and_then(|_| fs::set_permissions(&path, fs::Permissions::from_mode(0o664)))
        .map_err(|e| BuildError::Other(format!("Failed to write {}: {}", path.display(), e)))
}

async fn import_gpg_key(
    rpm: &Path,
    rootfs: &Path,
    key: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    tracing::info!("Preparing RPM database for GPG key import");
    if !key.starts_with("https://") {
        return Err(BuildError::Config(
            "gpg key must be fetched with https".to_string(),
        ));
    }
    // rpm shells out to curl for remote keys
    find_tool("curl")?;

    Tool::new("rpm", rpm)
        .arg("--root")
        .arg(rootfs)
        .arg("--initdb")
        .run(cancel)
        .await?;
    Tool::new("rpm", rpm)
        .arg("--root")
        .arg(rootfs)
        .arg("--import")
        .arg(key)
        .run(cancel)
        .await?;
    tracing::info!("GPG key import complete");
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct YumSource;

#[async_trait]
impl ConveyorPacker for YumSource {
    async fn get(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let installer = find_installer()?;
        let rpm: PathBuf = find_tool("rpm")?;

        let backend = rpm_macro(&rpm, "_db_backend", cancel).await?;
        let dbpath = rpm_macro(&rpm, "_dbpath", cancel).await?;
        let home = std::env::var("HOME").unwrap_or_default();
        check_rpm_db(backend.as_deref(), dbpath.as_deref(), &home)?;

        let opts = YumOptions::from_bundle(bundle)?;
        let rootfs = bundle.rootfs_path.clone();

        write_config(&rootfs, &opts.config())?;
        match &opts.gpg {
            Some(key) => import_gpg_key(&rpm, &rootfs, key, cancel).await?,
            None => tracing::info!("Skipping GPG key import"),
        }

        let _mounts = prepare_scaffold(&rootfs, &bundle.opts)?;

        tracing::debug!(
            installer = installer.name(),
            osversion = %opts.osversion,
            mirror = %opts.mirror_url,
            update = ?opts.update_url,
            includes = ?opts.includes,
            setopt = ?opts.setopt,
            "Bootstrapping with yum"
        );
        installer.args(opts.install_args(&rootfs)).run(cancel).await?;

        let cache = rootfs.join(YUM_CACHE);
        if let Err(e) = fs::remove_dir_all(&cache) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %cache.display(), error = %e, "Failed to remove yum cache");
            }
        }
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        pack_distro(&bundle.rootfs_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> YumOptions {
        YumOptions {
            mirror_url: "http://mirror.local/9/BaseOS/x86_64/os/".to_string(),
            update_url: None,
            osversion: "9".to_string(),
            includes: vec![
                "/etc/redhat-release".to_string(),
                "coreutils".to_string(),
                "vim".to_string(),
            ],
            setopt: None,
            gpg: None,
        }
    }

    #[test]
    fn test_config_without_updates() {
        let conf = options().config();
        assert!(conf.starts_with("[main]\ncachedir=/var/cache/yum-bootstrap\nkeepcache=0\n"));
        assert!(conf.contains("obsoletes=1\ngpgcheck=0\nplugins=1\nreposdir=0\ndeltarpm=0\n\n[base]\n"));
        assert!(conf.ends_with(
            "[base]\nname=Linux $releasever - $basearch\nbaseurl=http://mirror.local/9/BaseOS/x86_64/os/\nenabled=1\ngpgcheck=0\n"
        ));
        assert!(!conf.contains("[updates]"));
    }

    #[test]
    fn test_config_with_updates_and_gpg() {
        let opts = YumOptions {
            update_url: Some("http://mirror.local/9/updates/".to_string()),
            gpg: Some("https://keys.local/RPM-GPG-KEY".to_string()),
            ..options()
        };
        let conf = opts.config();
        assert_eq!(conf.matches("gpgcheck=1\n").count(), 3);
        assert!(conf.ends_with(
            "[updates]\nname=Linux $releasever - $basearch updates\nbaseurl=http://mirror.local/9/updates/\nenabled=1\ngpgcheck=1\n\n"
        ));
    }

    #[test]
    fn test_install_args() {
        let rootfs = Path::new("/build/rootfs");
        let opts = YumOptions {
            setopt: Some("install_weak_deps=False".to_string()),
            ..options()
        };
        assert_eq!(
            opts.install_args(rootfs),
            vec![
                "--noplugins",
                "-c",
                "/build/rootfs/etc/bootstrap-yum.conf",
                "--installroot",
                "/build/rootfs",
                "--releasever=9",
                "-y",
                "--setopt",
                "install_weak_deps=False",
                "install",
                "/etc/redhat-release",
                "coreutils",
                "vim",
            ]
        );
    }

    #[test]
    fn test_check_rpm_db() {
        assert!(check_rpm_db(Some("bdb"), Some("/var/lib/rpm"), "/root").is_ok());
        assert!(check_rpm_db(Some("sqlite"), Some("/usr/lib/sysimage/rpm"), "/root").is_ok());
        assert!(check_rpm_db(None, Some("/var/lib/rpm"), "/root").is_ok());

        let err = check_rpm_db(None, Some("/home/u/.rpmdb"), "/home/u").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("non-standard path: /home/u/.rpmdb"));
        assert!(msg.contains("/home/u/.rpmmacros"));
        assert!(msg.contains("%_dbpath %{_var}/lib/rpm"));

        assert!(matches!(
            check_rpm_db(Some("bdb"), None, "/root").unwrap_err(),
            BuildError::Config(_)
        ));
    }

    #[test]
    fn test_write_config_modes() {
        let dir = tempfile::TempDir::new().unwrap();
        write_config(dir.path(), "[main]\n").unwrap();
        let path = dir.path().join(YUM_CONF);
        assert_eq!(fs::read_to_string(&path).unwrap(), "[main]\n");
        assert_eq!(
            fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o664
        );
    }
}
