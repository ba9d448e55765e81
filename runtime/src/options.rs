//! Per-build policy options.
//!
//! `BuildOptions` is threaded through every bootstrap source. Shared handles
//! (the blob cache, the signature verifier) live here instead of in globals.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use sbuild_core::error::Result;
use sbuild_core::platform::{default_platform, Platform};

use crate::cache::BlobCache;
use crate::sources::verify::SignatureVerifier;

/// Default library endpoint for `library://` pulls.
pub const DEFAULT_LIBRARY_URL: &str = "https://library.sylabs.io";

/// Explicit registry credentials, in the shape of a Docker `auths` entry.
#[derive(Clone, Default)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// base64 `username:password`
    pub auth: Option<String>,
    pub identity_token: Option<String>,
    pub registry_token: Option<String>,
}

/// Credentials given through the docker-style login flags.
#[derive(Clone, Default)]
pub struct DockerAuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub identity_token: Option<String>,
}

/// Connection settings handed to the signature verifier's keyserver.
#[derive(Debug, Clone, Default)]
pub struct KeyServerOptions {
    pub url: Option<String>,
    pub auth_token: Option<String>,
    pub insecure: bool,
}

/// Kind of key material used to encrypt the final image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionKeyFormat {
    Passphrase,
    PemPath,
    PemData,
}

/// Encryption request carried through to image assembly.
#[derive(Clone)]
pub struct EncryptionKeyInfo {
    pub format: EncryptionKeyFormat,
    pub material: String,
}

/// Build options.
#[derive(Clone)]
pub struct BuildOptions {
    /// Sections to run: `all`, `none` or an explicit list
    pub sections: Vec<String>,
    /// Scratch root override
    pub tmp_dir: Option<PathBuf>,
    pub library_url: String,
    pub library_auth_token: Option<String>,
    /// Host fakeroot helper; when set the distro scaffold uses bind shims
    pub fakeroot_path: Option<PathBuf>,
    /// Handed to the signature verifier
    pub key_server: KeyServerOptions,
    /// Takes precedence over `docker_auth_config`
    pub oci_auth_config: Option<AuthConfig>,
    pub docker_auth_config: Option<DockerAuthConfig>,
    /// Socket URI for the docker-daemon transport
    pub docker_daemon_host: Option<String>,
    pub encryption_key_info: Option<EncryptionKeyInfo>,
    /// Content-addressed blob cache; `None` disables caching
    pub img_cache: Option<Arc<BlobCache>>,
    pub no_test: bool,
    pub force: bool,
    pub no_https: bool,
    pub no_cleanup: bool,
    pub no_cache: bool,
    pub fix_perms: bool,
    pub sandbox_target: bool,
    /// Build without host root: the distro scaffold uses bind shims
    pub unprivilege: bool,
    /// Extra `src[:dest]` binds mounted into the distro scaffold
    pub binds: Vec<String>,
    /// Short architecture alias (`amd64`, `arm64`, ...)
    pub arch: Option<String>,
    /// Explicit docker credential file
    pub req_auth_file: Option<PathBuf>,
    pub platform: Option<Platform>,
    /// Verifier used by the signature gate; a SIF descriptor scan when unset
    pub verifier: Option<Arc<dyn SignatureVerifier>>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            sections: vec!["all".to_string()],
            tmp_dir: None,
            library_url: DEFAULT_LIBRARY_URL.to_string(),
            library_auth_token: None,
            fakeroot_path: None,
            key_server: KeyServerOptions::default(),
            oci_auth_config: None,
            docker_auth_config: None,
            docker_daemon_host: None,
            encryption_key_info: None,
            img_cache: None,
            no_test: false,
            force: false,
            no_https: false,
            no_cleanup: false,
            no_cache: false,
            fix_perms: false,
            sandbox_target: false,
            unprivilege: false,
            binds: Vec::new(),
            arch: None,
            req_auth_file: None,
            platform: None,
            verifier: None,
        }
    }
}

impl BuildOptions {
    /// Defaults overlaid with the environment (`TMPDIR`, docker host).
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(tmp) = std::env::var_os("TMPDIR").filter(|v| !v.is_empty()) {
            opts.tmp_dir = Some(PathBuf::from(tmp));
        }
        opts.docker_daemon_host = std::env::var("APPTAINER_DOCKER_HOST")
            .ok()
            .or_else(|| std::env::var("DOCKER_HOST").ok())
            .filter(|v| !v.is_empty());
        opts
    }

    pub fn with_sections(mut self, sections: Vec<String>) -> Self {
        self.sections = sections;
        self
    }

    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = Some(dir.into());
        self
    }

    pub fn with_cache(mut self, cache: Arc<BlobCache>) -> Self {
        self.img_cache = Some(cache);
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_fix_perms(mut self, fix: bool) -> Self {
        self.fix_perms = fix;
        self
    }

    pub fn with_sandbox_target(mut self, sandbox: bool) -> Self {
        self.sandbox_target = sandbox;
        self
    }

    pub fn with_no_cleanup(mut self, no_cleanup: bool) -> Self {
        self.no_cleanup = no_cleanup;
        self
    }

    pub fn with_no_https(mut self, no_https: bool) -> Self {
        self.no_https = no_https;
        self
    }

    /// Scratch root: the override, or the system temp dir.
    pub fn scratch_root(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// The cache to use for this build, honoring `no_cache`.
    pub fn cache(&self) -> Option<&BlobCache> {
        if self.no_cache {
            return None;
        }
        self.img_cache.as_deref()
    }

    /// Target platform: explicit platform or host default, with the
    /// `arch` alias applied on top.
    pub fn resolve_platform(&self) -> Result<Platform> {
        let platform = match &self.platform {
            Some(p) => p.clone(),
            None => default_platform()?,
        };
        match &self.arch {
            Some(arch) if !arch.is_empty() => platform.with_arch_alias(arch),
            _ => Ok(platform),
        }
    }
}

impl fmt::Debug for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildOptions")
            .field("sections", &self.sections)
            .field("tmp_dir", &self.tmp_dir)
            .field("library_url", &self.library_url)
            .field("library_auth_token", &self.library_auth_token.as_ref().map(|_| "<redacted>"))
            .field("fakeroot_path", &self.fakeroot_path)
            .field("oci_auth_config", &self.oci_auth_config.as_ref().map(|_| "<redacted>"))
            .field("docker_auth_config", &self.docker_auth_config.as_ref().map(|_| "<redacted>"))
            .field("docker_daemon_host", &self.docker_daemon_host)
            .field("encrypted", &self.encryption_key_info.is_some())
            .field("img_cache", &self.img_cache.as_ref().map(|c| c.root().to_path_buf()))
            .field("no_https", &self.no_https)
            .field("no_cleanup", &self.no_cleanup)
            .field("no_cache", &self.no_cache)
            .field("fix_perms", &self.fix_perms)
            .field("sandbox_target", &self.sandbox_target)
            .field("arch", &self.arch)
            .field("req_auth_file", &self.req_auth_file)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}
