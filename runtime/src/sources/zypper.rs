//! `Bootstrap: zypper`: openSUSE and SLE installs with the host's zypper.
//!
//! Three flavors are handled:
//! - plain mirrors (`MirrorURL:`/`UpdateURL:`),
//! - SLE with SCC registration (`Product:`, `User:` and `Regcode:`
//!   together), which runs SUSEConnect against the new root,
//! - a host that is itself registered (SCC credentials present), where
//!   `container-suseconnect` is installed and the credentials are bound in.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};
use sbuild_core::recipe::Recipe;
use tokio_util::sync::CancellationToken;

use super::distro::{pack_distro, prepare_scaffold, substitute_osversion};
use super::ConveyorPacker;
use crate::bundle::Bundle;
use crate::tool::{ExitDisposition, Tool};

/// Config file written into the rootfs, relative to it.
pub const ZYPP_CONF: &str = "etc/zypp/zypp.conf";
pub const ZYPP_CONF_CONTENT: &str = "[main]\ncachedir=/var/cache/zypp-bootstrap\n\n";

const OS_RELEASE: &str = "/etc/os-release";
const SCC_CREDENTIALS: &str = "/etc/zypp/credentials.d/SCCcredentials";
/// SUSE package signing keys looked up in the host rpm database.
const SUSE_GPG_KEYS: &[&str] = &["gpg-pubkey-307e3d54-5aaa90a5", "gpg-pubkey-39db7c82-5f68629b"];
const MAX_OTHER_URLS: usize = 20;

/// zypper exits 107 when packages installed but some RPM scriptlets failed.
pub const ZYPPER_EXIT_SCRIPTLETS_FAILED: i32 = 107;

/// Exit-code interpreter for the install step.
pub fn zypper_install_exit(code: i32) -> ExitDisposition {
    match code {
        0 => ExitDisposition::Success,
        ZYPPER_EXIT_SCRIPTLETS_FAILED => {
            ExitDisposition::Warn("Bootstrap succeeded, some RPM scripts failed".to_string())
        }
        _ => ExitDisposition::Fail,
    }
}

/// Facts about the build host that shape a zypper bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuseHost {
    /// `VERSION` from the host os-release
    pub version: Option<String>,
    /// Armored SUSE signing key from the host rpm database
    pub gpg_key: Option<String>,
    /// The host is registered with SCC
    pub has_scc: bool,
    /// `uname -m` style machine name
    pub machine: String,
}

impl SuseHost {
    pub async fn detect(cancel: &CancellationToken) -> Self {
        let release = fs::read_to_string(OS_RELEASE)
            .map(|text| parse_os_release(&text))
            .unwrap_or_default();

        let gpg_key = match Tool::find("rpm") {
            Ok(rpm) => rpm
                .args(["-q", "--qf", "%{PUBKEYS:armor}"])
                .args(SUSE_GPG_KEYS.iter().copied())
                .capture_stdout()
                .run(cancel)
                .await
                .ok()
                .map(|out| out.stdout_text())
                .filter(|key| !key.is_empty()),
            Err(_) => None,
        };

        Self {
            version: release.get("VERSION").cloned(),
            gpg_key,
            has_scc: Path::new(SCC_CREDENTIALS).is_file(),
            machine: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Parse `KEY=value` lines of an os-release file, unquoting values.
pub fn parse_os_release(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| v.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(v);
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}

/// SCC registration of the new root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// `--product` for the base product, `name/version/arch`
    pub product: String,
    /// `version/arch` suffix for extra modules
    pub module_version: String,
    pub user: String,
    pub regcode: String,
    pub url: Option<String>,
    pub modules: Vec<String>,
}

impl Registration {
    pub fn register_args(&self, rootfs: &Path) -> Vec<String> {
        let mut args = vec![
            "--root".to_string(),
            rootfs.display().to_string(),
            "--product".to_string(),
            self.product.clone(),
            "--email".to_string(),
            self.user.clone(),
            "--regcode".to_string(),
            self.regcode.clone(),
        ];
        if let Some(url) = &self.url {
            args.push("--url".to_string());
            args.push(url.clone());
        }
        args
    }

    pub fn module_products(&self) -> Vec<String> {
        self.modules
            .iter()
            .map(|m| format!("{}/{}", m, self.module_version))
            .collect()
    }
}

/// Everything a zypper bootstrap will do, resolved from the recipe and
/// the host before any command runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZypperPlan {
    pub osversion: String,
    pub mirror_url: Option<String>,
    pub update_url: Option<String>,
    pub registration: Option<Registration>,
    /// Major version of a registered SLE install
    pub sle_major: Option<u32>,
    /// Armored signing key to import into the new rpm database
    pub pgp_key: Option<String>,
    pub other_urls: Vec<String>,
    pub includes: Vec<String>,
    /// Install `container-suseconnect` using the host registration
    pub container_suseconnect: bool,
}

fn malformed(key: &str, message: impl Into<String>) -> BuildError {
    BuildError::RecipeHeaderMalformed {
        key: key.to_string(),
        message: message.into(),
    }
}

fn other_urls(recipe: &Recipe) -> Vec<String> {
    let start = if recipe.header("otherurl0").is_some() { 0 } else { 1 };
    (start..start + MAX_OTHER_URLS)
        .map_while(|i| recipe.header(&format!("otherurl{}", i)).map(str::to_string))
        .collect()
}

impl ZypperPlan {
    pub fn resolve(recipe: &Recipe, host: &SuseHost, include_env: Option<&str>) -> Result<Self> {
        let header_osversion = recipe.header("osversion");
        let mut plan = Self {
            osversion: header_osversion
                .or(host.version.as_deref())
                .unwrap_or_default()
                .to_string(),
            pgp_key: recipe
                .header("productpgp")
                .map(str::to_string)
                .or_else(|| host.gpg_key.clone()),
            other_urls: other_urls(recipe),
            includes: {
                let mut includes = vec!["aaa_base".to_string()];
                includes.extend(
                    recipe
                        .header("include")
                        .unwrap_or("")
                        .split_whitespace()
                        .chain(include_env.unwrap_or("").split_whitespace())
                        .map(str::to_string),
                );
                includes
            },
            ..Self::default()
        };

        let mirror = recipe.header("mirrorurl");
        let product = recipe.header("product");
        let user = recipe.header("user");
        let regcode = recipe.header("regcode");

        if product.is_some() || user.is_some() || regcode.is_some() {
            let (Some(product), Some(user), Some(regcode)) = (product, user, regcode) else {
                return Err(BuildError::Config(
                    "for installation of SLE 'Product', 'User' and 'Regcode' need to be set"
                        .to_string(),
                ));
            };
            let osversion = header_osversion
                .ok_or_else(|| BuildError::header_missing("zypper", "osversion"))?;
            if plan.pgp_key.is_none() && mirror.is_none() {
                return Err(BuildError::Config(
                    "no 'ProductPGP' and no 'MirrorURL' defined in bootstrap definition"
                        .to_string(),
                ));
            }

            let mut parts = osversion.splitn(2, '.');
            let major_str = parts.next().unwrap_or_default();
            let minor_str = parts.next();
            let major: u32 = major_str
                .parse()
                .map_err(|e| malformed("osversion", format!("{}: {}", osversion, e)))?;
            let minor: u32 = match minor_str {
                Some(m) => m
                    .parse()
                    .map_err(|e| malformed("osversion", format!("{}: {}", osversion, e)))?,
                None => 0,
            };
            if major > 12 && mirror.is_none() {
                return Err(BuildError::header_missing("zypper", "mirrorurl"));
            }

            // SP0 releases have no service pack component in URLs
            let release = if minor > 0 {
                format!("{}.{}", major, minor)
            } else {
                major.to_string()
            };
            plan.mirror_url = mirror
                .map(|m| substitute_osversion("zypper", m, Some(release.as_str())))
                .transpose()?;

            let product = substitute_osversion("zypper", product, Some(release.as_str()))?;
            let fields: Vec<&str> = product.split('/').collect();
            let machine = fields
                .get(2)
                .copied()
                .unwrap_or(host.machine.as_str())
                .to_string();
            let product = match fields.len() {
                1 => format!("{}/{}/{}", product, osversion, machine),
                2 => format!("{}/{}", product, machine),
                3 => product.clone(),
                _ => return Err(malformed("product", format!("{} has too many components", product))),
            };
            let module_version = match minor_str {
                Some(m) => format!("{}.{}/{}", major_str, m, machine),
                None => format!("{}/{}", major_str, machine),
            };

            plan.registration = Some(Registration {
                product,
                module_version,
                user: user.to_string(),
                regcode: regcode.to_string(),
                url: recipe.header("registerurl").map(str::to_string),
                modules: recipe
                    .header("modules")
                    .map(|m| {
                        m.split(',')
                            .map(str::trim)
                            .filter(|m| !m.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            });
            plan.sle_major = Some(major);
            plan.includes.push("SUSEConnect".to_string());
        } else if let Some(mirror) = mirror {
            plan.mirror_url = Some(substitute_osversion("zypper", mirror, header_osversion)?);
            plan.update_url = recipe
                .header("updateurl")
                .map(|u| substitute_osversion("zypper", u, header_osversion))
                .transpose()?;
        } else if host.has_scc {
            plan.container_suseconnect = true;
            plan.includes.push("container-suseconnect".to_string());
            plan.includes.push("zypper".to_string());
        } else if plan.other_urls.is_empty() {
            return Err(BuildError::header_missing("zypper", "mirrorurl"));
        }

        Ok(plan)
    }

    /// Arguments of the install command.
    pub fn install_args(&self, rootfs: &Path) -> Vec<String> {
        let root = rootfs.display().to_string();
        let mut args = vec![
            "--non-interactive".to_string(),
            "-c".to_string(),
            rootfs.join(ZYPP_CONF).display().to_string(),
        ];
        if self.container_suseconnect {
            args.extend(["--installroot".to_string(), root]);
        } else {
            args.extend([
                "--root".to_string(),
                root,
                format!("--releasever={}", self.osversion),
            ]);
        }
        args.extend(
            ["-n", "install", "--auto-agree-with-licenses", "--download-in-advance"]
                .map(str::to_string),
        );
        args.extend(self.includes.iter().cloned());
        args
    }

    /// Database directory layout for the key import: `(base, legacy, rel)`
    /// where `legacy/rpm` becomes a symlink `rel + base/rpm`.
    pub fn rpm_db_layout(&self) -> (&'static str, &'static str, &'static str) {
        if self.sle_major == Some(12) {
            ("var/lib", "usr/lib/sysimage", "../../..")
        } else {
            ("usr/lib/sysimage", "var/lib", "../..")
        }
    }
}

/// Check the unexpanded `_dbpath` from `rpm --showrc` output.
pub fn check_rpm_showrc(showrc: &str, home: &str) -> Result<()> {
    let dbpath = showrc
        .lines()
        .filter(|line| line.contains("_dbpath\t"))
        .filter_map(|line| line.split_whitespace().nth(2))
        .last()
        .unwrap_or("");
    if dbpath == "%{_var}/lib/rpm" || dbpath == "%{_usr}/lib/sysimage/rpm" {
        return Ok(());
    }
    Err(BuildError::Config(format!(
        "rpm database is using a non-standard path: {}\n\
         There is a way to work around this problem:\n\
         Create a file at path {}/.rpmmacros.\n\
         Place the following lines into the '.rpmmacros' file:\n\
         %_var /var\n\
         %_dbpath %{{_var}}/lib/rpm\n\
         After creating the file, re-run the bootstrap.",
        dbpath, home
    )))
}

fn create_dir(path: &Path, mode: u32) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| BuildError::Other(format!("Failed to create {}: {}", path.display(), e)))
}

fn write_config(rootfs: &Path) -> Result<()> {
    create_dir(&rootfs.join("etc/zypp"), 0o775)?;
    let path = rootfs.join(ZYPP_CONF);
    fs::write(&path, ZYPP_CONF_CONTENT)
        .and_then(|_| fs::set_permissions(&path, fs::Permissions::from_mode(0o664)))
        .map_err(|e| BuildError::Other(format!("Failed to write {}: {}", path.display(), e)))
}

/// Point the legacy rpm database path at the one the target expects so
/// the imported key lands where the installed rpm will look.
fn link_rpm_db(rootfs: &Path, plan: &ZypperPlan) -> Result<()> {
    let (base, legacy, rel) = plan.rpm_db_layout();
    create_dir(&rootfs.join(base).join("rpm"), 0o755)?;
    create_dir(&rootfs.join(legacy), 0o755)?;
    let link = rootfs.join(legacy).join("rpm");
    match fs::remove_dir_all(&link).or_else(|_| fs::remove_file(&link)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BuildError::Other(format!(
                "Failed to remove {}: {}",
                link.display(),
                e
            )))
        }
    }
    let target = format!("{}/{}/rpm", rel, base);
    std::os::unix::fs::symlink(&target, &link)
        .map_err(|e| BuildError::Other(format!("Failed to link {}: {}", link.display(), e)))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ZypperSource;

impl ZypperSource {
    async fn add_repo(
        zypper: &Tool,
        rootfs: &Path,
        url: &str,
        alias: &str,
        autorefresh: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut add = zypper.clone().arg("--root").arg(rootfs).arg("ar");
        if autorefresh {
            add = add.arg("-f");
        }
        add.arg(url).arg(alias).run(cancel).await?;

        let mut refresh = zypper
            .clone()
            .arg("--root")
            .arg(rootfs)
            .arg("--gpg-auto-import-keys")
            .arg("refresh");
        if autorefresh {
            refresh = refresh.arg("-r").arg(alias);
        }
        refresh.run(cancel).await?;
        Ok(())
    }
}

#[async_trait]
impl ConveyorPacker for ZypperSource {
    async fn get(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let zypper = Tool::find("zypper")?;

        let showrc = Tool::find("rpm")?
            .arg("--showrc")
            .capture_stdout()
            .run(cancel)
            .await?;
        let home = std::env::var("HOME").unwrap_or_default();
        check_rpm_showrc(&String::from_utf8_lossy(&showrc.stdout), &home)?;

        let host = SuseHost::detect(cancel).await;
        let include_env = std::env::var("INCLUDE").ok();
        let plan = ZypperPlan::resolve(&bundle.recipe, &host, include_env.as_deref())?;
        let suseconnect = match plan.registration {
            Some(_) => Some(Tool::find("SUSEConnect")?),
            None => None,
        };
        if plan.container_suseconnect {
            bundle
                .opts
                .binds
                .push(format!("{}:{}", SCC_CREDENTIALS, SCC_CREDENTIALS));
        }

        let rootfs = bundle.rootfs_path.clone();
        write_config(&rootfs)?;
        let _mounts = prepare_scaffold(&rootfs, &bundle.opts)?;

        if let Some(mirror) = &plan.mirror_url {
            Self::add_repo(&zypper, &rootfs, mirror, "repo", false, cancel).await?;
            if let Some(update) = &plan.update_url {
                Self::add_repo(&zypper, &rootfs, update, "update", true, cancel).await?;
            }
        }

        if let Some(key) = &plan.pgp_key {
            let mut keyfile = tempfile::Builder::new()
                .prefix("sbuild-pgp-")
                .tempfile_in(&bundle.tmp_dir)
                .map_err(|e| BuildError::Other(format!("Failed to create pgp file: {}", e)))?;
            writeln!(keyfile, "{}", key)
                .map_err(|e| BuildError::Other(format!("Failed to write pgp file: {}", e)))?;

            link_rpm_db(&rootfs, &plan)?;
            Tool::find("rpmkeys")?
                .arg("--root")
                .arg(&rootfs)
                .arg("--import")
                .arg(keyfile.path())
                .run(cancel)
                .await?;
        }

        if let (Some(suseconnect), Some(registration)) = (&suseconnect, &plan.registration) {
            tracing::info!(product = %registration.product, "Registering with SCC");
            suseconnect
                .clone()
                .args(registration.register_args(&rootfs))
                .run(cancel)
                .await?;
            for module in registration.module_products() {
                suseconnect
                    .clone()
                    .arg("--root")
                    .arg(&rootfs)
                    .arg("--product")
                    .arg(&module)
                    .run(cancel)
                    .await?;
            }
        }

        for (i, url) in plan.other_urls.iter().enumerate() {
            let alias = format!("repo-{}", i);
            Self::add_repo(&zypper, &rootfs, url, &alias, true, cancel).await?;
        }

        if plan.container_suseconnect {
            let credentials = rootfs.join("etc/zypp/credentials.d");
            create_dir(&credentials, 0o755)?;
            let scc = credentials.join("SCCcredentials");
            fs::File::create(&scc).map_err(|e| {
                BuildError::Other(format!("Failed to create {}: {}", scc.display(), e))
            })?;
        }

        tracing::debug!(
            osversion = %plan.osversion,
            mirror = ?plan.mirror_url,
            includes = ?plan.includes,
            "Bootstrapping with zypper"
        );
        zypper
            .args(plan.install_args(&rootfs))
            .run_with(cancel, zypper_install_exit)
            .await?;
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        pack_distro(&bundle.rootfs_path)
    }
}
