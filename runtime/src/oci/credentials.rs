//! Registry credentials.
//!
//! Credentials come from, in order: the explicit OCI auth config in the
//! options, the docker-style login flags, or a Docker-format `config.json`
//! (the requested file, or the first one found on the default search path).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use sbuild_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};

use crate::options::{AuthConfig, BuildOptions};

/// Docker Hub's key in `config.json`.
pub const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

/// Credentials handed to a registry client.
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryCredential {
    Anonymous,
    Basic { username: String, password: String },
}

impl RegistryCredential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        RegistryCredential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, RegistryCredential::Anonymous)
    }
}

impl std::fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryCredential::Anonymous => write!(f, "Anonymous"),
            RegistryCredential::Basic { username, .. } => {
                write!(f, "Basic({}, <redacted>)", username)
            }
        }
    }
}

/// One `auths` entry of a Docker `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerAuthEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identitytoken: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registrytoken: Option<String>,
}

/// Docker `config.json` contents relevant to authentication.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DockerConfigFile {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuthEntry>,
}

impl DockerConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| BuildError::AuthConfigUnreadable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&data).map_err(|e| BuildError::AuthConfigUnreadable {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Entry for `registry`, trying the bare host, URL forms and the Docker
    /// Hub special key.
    pub fn entry_for(&self, registry: &str) -> Option<&DockerAuthEntry> {
        let registry = normalize_registry(registry);
        if registry == "index.docker.io" {
            if let Some(entry) = self.auths.get(DOCKER_HUB_AUTH_KEY) {
                return Some(entry);
            }
        }
        self.auths
            .iter()
            .find(|(key, _)| normalize_registry(&host_of(key)) == registry)
            .map(|(_, entry)| entry)
    }
}

/// Default `config.json` search path.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".apptainer").join("docker-config.json"));
    }
    if let Some(dir) = std::env::var_os("DOCKER_CONFIG").filter(|v| !v.is_empty()) {
        paths.push(PathBuf::from(dir).join("config.json"));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".docker").join("config.json"));
    }
    paths
}

/// Resolve the credential to use against `registry`.
pub fn resolve_credential(opts: &BuildOptions, registry: &str) -> Result<RegistryCredential> {
    if let Some(auth) = &opts.oci_auth_config {
        return Ok(from_auth_config(auth, registry));
    }
    if let Some(docker) = &opts.docker_auth_config {
        let converted = AuthConfig {
            username: docker.username.clone(),
            password: docker.password.clone(),
            identity_token: docker.identity_token.clone(),
            ..Default::default()
        };
        return Ok(from_auth_config(&converted, registry));
    }

    if let Some(path) = &opts.req_auth_file {
        let file = DockerConfigFile::load(path)?;
        return Ok(file
            .entry_for(registry)
            .map(|e| from_entry(e, registry))
            .unwrap_or(RegistryCredential::Anonymous));
    }

    for path in default_config_paths() {
        if !path.is_file() {
            continue;
        }
        match DockerConfigFile::load(&path) {
            Ok(file) => {
                if let Some(entry) = file.entry_for(registry) {
                    tracing::debug!(registry, config = %path.display(), "Using stored registry credentials");
                    return Ok(from_entry(entry, registry));
                }
            }
            Err(e) => {
                tracing::warn!(config = %path.display(), error = %e, "Ignoring unreadable credentials file");
            }
        }
    }

    Ok(RegistryCredential::Anonymous)
}

fn from_auth_config(auth: &AuthConfig, registry: &str) -> RegistryCredential {
    from_entry(
        &DockerAuthEntry {
            auth: auth.auth.clone(),
            username: auth.username.clone(),
            password: auth.password.clone(),
            identitytoken: auth.identity_token.clone(),
            registrytoken: auth.registry_token.clone(),
        },
        registry,
    )
}

/// Convert a stored entry. Only basic credentials are supported; an
/// identity token is presented as a basic password for `<token>`.
fn from_entry(entry: &DockerAuthEntry, registry: &str) -> RegistryCredential {
    if let (Some(u), Some(p)) = (&entry.username, &entry.password) {
        if !u.is_empty() {
            return RegistryCredential::basic(u, p);
        }
    }
    if let Some(encoded) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
        match decode_auth(encoded) {
            Some((u, p)) => return RegistryCredential::basic(u, p),
            None => tracing::warn!(registry, "Malformed auth field in credentials, ignoring"),
        }
    }
    if let Some(token) = entry.identitytoken.as_deref().filter(|t| !t.is_empty()) {
        return RegistryCredential::basic("<token>", token);
    }
    if entry.registrytoken.is_some() {
        tracing::debug!(registry, "Registry bearer tokens are not supported, pulling anonymously");
    }
    RegistryCredential::Anonymous
}

fn decode_auth(encoded: &str) -> Option<(String, String)> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let text = String::from_utf8(bytes).ok()?;
    let (u, p) = text.split_once(':')?;
    Some((u.to_string(), p.to_string()))
}

/// Docker-format `config.json` carrying `credential` for `registry`, for
/// tools that read credentials from `DOCKER_CONFIG`.
pub fn docker_config_for(registry: &str, credential: &RegistryCredential) -> DockerConfigFile {
    let mut file = DockerConfigFile::default();
    if let RegistryCredential::Basic { username, password } = credential {
        let key = if normalize_registry(registry) == "index.docker.io" {
            DOCKER_HUB_AUTH_KEY.to_string()
        } else {
            registry.to_string()
        };
        let auth = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        file.auths.insert(
            key,
            DockerAuthEntry {
                auth: Some(auth),
                ..Default::default()
            },
        );
    }
    file
}

/// Host part of a config key, which may be a bare host or a URL.
fn host_of(key: &str) -> String {
    let without_scheme = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

/// Normalize registry names (Docker Hub aliases → "index.docker.io").
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DockerAuthConfig;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, json: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn test_docker_hub_special_key() {
        let dir = TempDir::new().unwrap();
        let auth = base64::engine::general_purpose::STANDARD.encode("hubuser:hubpass");
        let path = write_config(
            &dir,
            &format!(r#"{{"auths":{{"https://index.docker.io/v1/":{{"auth":"{}"}}}}}}"#, auth),
        );
        let opts = BuildOptions {
            req_auth_file: Some(path),
            ..Default::default()
        };
        for registry in ["docker.io", "index.docker.io"] {
            assert_eq!(
                resolve_credential(&opts, registry).unwrap(),
                RegistryCredential::basic("hubuser", "hubpass")
            );
        }
        assert!(resolve_credential(&opts, "ghcr.io").unwrap().is_anonymous());
    }

    #[test]
    fn test_url_keys_match_host() {
        let file: DockerConfigFile = serde_json::from_str(
            r#"{"auths":{"https://quay.io/v2/":{"username":"u","password":"p"}}}"#,
        )
        .unwrap();
        let entry = file.entry_for("quay.io").unwrap();
        assert_eq!(
            from_entry(entry, "quay.io"),
            RegistryCredential::basic("u", "p")
        );
    }

    #[test]
    fn test_identity_and_registry_tokens() {
        let identity = DockerAuthEntry {
            identitytoken: Some("tok".to_string()),
            ..Default::default()
        };
        assert_eq!(
            from_entry(&identity, "r"),
            RegistryCredential::basic("<token>", "tok")
        );

        let bearer = DockerAuthEntry {
            registrytoken: Some("bearer".to_string()),
            ..Default::default()
        };
        assert!(from_entry(&bearer, "r").is_anonymous());
    }

    #[test]
    fn test_unreadable_requested_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{not json");
        let opts = BuildOptions {
            req_auth_file: Some(path),
            ..Default::default()
        };
        let err = resolve_credential(&opts, "docker.io").unwrap_err();
        assert!(matches!(err, BuildError::AuthConfigUnreadable { .. }));

        let opts = BuildOptions {
            req_auth_file: Some(dir.path().join("missing.json")),
            ..Default::default()
        };
        assert!(matches!(
            resolve_credential(&opts, "docker.io").unwrap_err(),
            BuildError::AuthConfigUnreadable { .. }
        ));
    }

    #[test]
    fn test_explicit_configs_take_precedence() {
        let opts = BuildOptions {
            oci_auth_config: Some(AuthConfig {
                username: Some("oci".to_string()),
                password: Some("1".to_string()),
                ..Default::default()
            }),
            docker_auth_config: Some(DockerAuthConfig {
                username: Some("docker".to_string()),
                password: Some("2".to_string()),
                identity_token: None,
            }),
            req_auth_file: Some(PathBuf::from("/nonexistent")),
            ..Default::default()
        };
        assert_eq!(
            resolve_credential(&opts, "ghcr.io").unwrap(),
            RegistryCredential::basic("oci", "1")
        );

        let opts = BuildOptions {
            oci_auth_config: None,
            ..opts
        };
        assert_eq!(
            resolve_credential(&opts, "ghcr.io").unwrap(),
            RegistryCredential::basic("docker", "2")
        );
    }

    #[test]
    fn test_docker_config_for_round_trips() {
        let cred = RegistryCredential::basic("a", "b");
        let file = docker_config_for("docker.io", &cred);
        let entry = file.entry_for("docker.io").unwrap();
        assert_eq!(from_entry(entry, "docker.io"), cred);
        assert!(docker_config_for("x", &RegistryCredential::Anonymous)
            .auths
            .is_empty());
    }

    #[test]
    fn test_debug_redacts_password() {
        let dbg = format!("{:?}", RegistryCredential::basic("user", "hunter2"));
        assert!(!dbg.contains("hunter2"));
    }
}
