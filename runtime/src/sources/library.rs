//! `Bootstrap: library`: SIF images from a container library service.
//!
//! References look like `library://[host/]entity/collection/container[:tag]`.
//! Image metadata comes from `/v1/images/<path>:<tag>` and the file from
//! `/v1/imagefile/<path>:<tag>`. Images whose hash is a sha256 are cached
//! by content.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::StatusCode;
use sbuild_core::error::{BuildError, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::local::LocalPacker;
use super::ConveyorPacker;
use crate::bundle::Bundle;
use crate::cache::{sha256_file, BlobCache};
use crate::http::{self, Download};
use crate::options::BuildOptions;
use crate::rootfs::make_base_env;

pub const DEFAULT_TAG: &str = "latest";

/// A parsed library reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryRef {
    /// Library host named in the reference itself
    pub host: Option<String>,
    pub path: String,
    pub tags: Vec<String>,
}

impl LibraryRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let rest = reference.strip_prefix("library://").unwrap_or(reference);
        let rest = rest.trim_start_matches('/');

        // More than two slashes means the first component is a host.
        let (host, path_ref) = if rest.matches('/').count() > 2 {
            match rest.split_once('/') {
                Some((host, path)) => (Some(host.to_string()), path),
                None => (None, rest),
            }
        } else {
            (None, rest)
        };

        let (path, tags) = match path_ref.split_once(':') {
            Some((path, tags)) => (
                path,
                tags.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
            ),
            None => (path_ref, Vec::new()),
        };
        if path.is_empty() {
            return Err(BuildError::RecipeHeaderMalformed {
                key: "from".to_string(),
                message: format!("library reference '{}' has no image path", reference),
            });
        }
        let tags = if tags.is_empty() {
            vec![DEFAULT_TAG.to_string()]
        } else {
            tags
        };
        Ok(Self {
            host,
            path: path.to_string(),
            tags,
        })
    }

    /// The tag used for pulling.
    pub fn tag(&self) -> &str {
        self.tags.first().map_or(DEFAULT_TAG, String::as_str)
    }
}

impl fmt::Display for LibraryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("library://")?;
        if let Some(host) = &self.host {
            write!(f, "{}/", host)?;
        }
        write!(f, "{}:{}", self.path, self.tags.join(","))
    }
}

/// Library base URL: a host in the reference wins, then the `Library:`
/// header, then the options.
pub fn library_base_url(opts: &BuildOptions, header: Option<&str>, reference: &LibraryRef) -> String {
    if let Some(host) = &reference.host {
        let scheme = if opts.no_https { "http" } else { "https" };
        return format!("{}://{}", scheme, host);
    }
    header
        .unwrap_or(&opts.library_url)
        .trim_end_matches('/')
        .to_string()
}

/// Image metadata returned by the library.
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryImage {
    pub hash: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: LibraryImage,
}

/// `sha256:<hex>` for a library `sha256.<hex>` hash.
fn hash_digest(hash: &str) -> Option<String> {
    hash.strip_prefix("sha256.").map(|hex| format!("sha256:{}", hex))
}

/// Client for one library service.
#[derive(Debug, Clone)]
pub struct LibraryClient {
    base_url: String,
    auth_token: Option<String>,
    http: reqwest::Client,
}

impl LibraryClient {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into(),
            auth_token,
            http: http::client()?,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(url);
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn classify(&self, status: StatusCode, what: &str) -> BuildError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BuildError::RegistryAuth {
                registry: self.base_url.clone(),
                message: format!("access to {} denied ({})", what, status),
            },
            StatusCode::NOT_FOUND => BuildError::Registry {
                registry: self.base_url.clone(),
                message: format!("image does not exist in the library: {}", what),
            },
            other => BuildError::Registry {
                registry: self.base_url.clone(),
                message: format!("{} returned {}", what, other),
            },
        }
    }

    /// Metadata of `reference` for `arch`.
    pub async fn image(
        &self,
        reference: &LibraryRef,
        arch: &str,
        cancel: &CancellationToken,
    ) -> Result<LibraryImage> {
        let what = format!("{}:{} ({})", reference.path, reference.tag(), arch);
        let url = format!(
            "{}/v1/images/{}:{}?arch={}",
            self.base_url,
            reference.path,
            reference.tag(),
            arch
        );
        let response = tokio::select! {
            r = self.get(&url).send() => r.map_err(|e| BuildError::Network(format!("Failed to query {}: {}", url, e)))?,
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
        };
        if !response.status().is_success() {
            return Err(self.classify(response.status(), &what));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| BuildError::Network(format!("Failed to read {}: {}", url, e)))?;
        let parsed: ImageResponse = serde_json::from_slice(&body)?;
        Ok(parsed.data)
    }

    /// Download the image file of `reference` to `dest`.
    pub async fn download(
        &self,
        reference: &LibraryRef,
        arch: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<Download> {
        let url = format!(
            "{}/v1/imagefile/{}:{}?arch={}",
            self.base_url,
            reference.path,
            reference.tag(),
            arch
        );
        tracing::info!(reference = %reference, "Downloading library image");
        let download = http::download_to(self.get(&url), dest, cancel).await?;
        download.check_length(&url)?;
        tracing::info!(bytes = download.written, "Downloaded library image");
        Ok(download)
    }

    /// Fetch `reference` through `cache` when the image hash allows it,
    /// otherwise into a fresh file under `tmp_dir`.
    pub async fn pull(
        &self,
        reference: &LibraryRef,
        arch: &str,
        cache: Option<&BlobCache>,
        tmp_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let image = self.image(reference, arch, cancel).await?;
        let digest = hash_digest(&image.hash);

        if let (Some(cache), Some(digest)) = (cache, digest.as_deref()) {
            if let Some(path) = cache.get(digest)? {
                tracing::info!(digest = %digest, "Using cached image");
                return Ok(path);
            }
            let staged = cache.staging_file()?;
            self.download(reference, arch, staged.path(), cancel).await?;
            return cache.commit(digest, staged);
        }

        let dest = tempfile::Builder::new()
            .prefix("sbuild-tmp-cache-")
            .tempfile_in(tmp_dir)
            .map_err(|e| {
                BuildError::Other(format!(
                    "Failed to create temporary file in {}: {}",
                    tmp_dir.display(),
                    e
                ))
            })?
            .into_temp_path()
            .keep()
            .map_err(|e| BuildError::Other(format!("Failed to keep temporary file: {}", e)))?;
        tracing::info!(path = %dest.display(), "Downloading library image to tmp cache");
        self.download(reference, arch, &dest, cancel).await?;

        match digest {
            Some(expected) => {
                let actual = sha256_file(&dest)?;
                if actual != expected {
                    return Err(BuildError::Other(format!(
                        "downloaded file hash ({}) and expected hash ({}) do not match",
                        actual, expected
                    )));
                }
            }
            None => tracing::debug!(hash = %image.hash, "Library hash is not a sha256, skipping check"),
        }
        Ok(dest)
    }
}

#[derive(Debug, Default)]
pub struct LibrarySource {
    packer: Option<LocalPacker>,
}

#[async_trait]
impl ConveyorPacker for LibrarySource {
    async fn get(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let from = bundle.recipe.require_header("library", "from")?;
        let reference = LibraryRef::parse(from)?;
        let base_url = library_base_url(&bundle.opts, bundle.recipe.header("library"), &reference);
        tracing::debug!(library = %base_url, reference = %reference, "Resolved library image");

        let arch = bundle.opts.resolve_platform()?.architecture;
        let client = LibraryClient::new(base_url, bundle.opts.library_auth_token.clone())?;
        let image = client
            .pull(&reference, &arch, bundle.opts.cache(), &bundle.tmp_dir, cancel)
            .await?;

        make_base_env(&bundle.rootfs_path, true)?;
        self.packer = Some(LocalPacker::for_path(&image)?);
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let packer = self
            .packer
            .as_ref()
            .ok_or_else(|| BuildError::Other("library image packed before fetching".to_string()))?;
        packer.pack(bundle, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::sha256_bytes;
    use crate::http::test_server::serve_routes;
    use tempfile::TempDir;

    #[test]
    fn test_parse_library_ref() {
        let r = LibraryRef::parse("library://alpine").unwrap();
        assert_eq!(r.host, None);
        assert_eq!(r.path, "alpine");
        assert_eq!(r.tag(), "latest");

        let r = LibraryRef::parse("library://entity/collection/container:1.0,stable").unwrap();
        assert_eq!(r.host, None);
        assert_eq!(r.path, "entity/collection/container");
        assert_eq!(r.tags, vec!["1.0", "stable"]);

        let r = LibraryRef::parse("library://lib.example.org/entity/collection/container:2").unwrap();
        assert_eq!(r.host.as_deref(), Some("lib.example.org"));
        assert_eq!(r.path, "entity/collection/container");
        assert_eq!(r.to_string(), "library://lib.example.org/entity/collection/container:2");

        assert!(LibraryRef::parse("library://").is_err());
    }

    #[test]
    fn test_library_base_url() {
        let opts = BuildOptions::default();
        let plain = LibraryRef::parse("alpine").unwrap();
        assert_eq!(library_base_url(&opts, None, &plain), "https://library.sylabs.io");
        assert_eq!(
            library_base_url(&opts, Some("https://lib.local/"), &plain),
            "https://lib.local"
        );

        let hosted = LibraryRef::parse("lib.local/e/c/i").unwrap();
        assert_eq!(library_base_url(&opts, Some("https://x"), &hosted), "https://lib.local");
        let insecure = BuildOptions::default().with_no_https(true);
        assert_eq!(library_base_url(&insecure, None, &hosted), "http://lib.local");
    }

    fn metadata(hash: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({"data": {"hash": hash, "size": 5}})).unwrap()
    }

    #[tokio::test]
    async fn test_pull_through_cache() {
        let dir = TempDir::new().unwrap();
        let cache = BlobCache::new(&dir.path().join("cache")).unwrap();
        let body = b"image".to_vec();
        let digest = sha256_bytes(&body);
        let hash = digest.replace("sha256:", "sha256.");
        let url = serve_routes(vec![
            ("/v1/images/", metadata(&hash)),
            ("/v1/imagefile/", body.clone()),
        ])
        .await;

        let client = LibraryClient::new(url, Some("token".to_string())).unwrap();
        let reference = LibraryRef::parse("e/c/image:1").unwrap();
        let cancel = CancellationToken::new();
        let path = client
            .pull(&reference, "amd64", Some(&cache), dir.path(), &cancel)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert_eq!(cache.get(&digest).unwrap(), Some(path.clone()));

        let again = client
            .pull(&reference, "amd64", Some(&cache), dir.path(), &cancel)
            .await
            .unwrap();
        assert_eq!(again, path);
    }

    #[tokio::test]
    async fn test_pull_without_cache_checks_hash() {
        let dir = TempDir::new().unwrap();
        let wrong = sha256_bytes(b"other").replace("sha256:", "sha256.");
        let url = serve_routes(vec![
            ("/v1/images/", metadata(&wrong)),
            ("/v1/imagefile/", b"image".to_vec()),
        ])
        .await;

        let client = LibraryClient::new(url, None).unwrap();
        let reference = LibraryRef::parse("image").unwrap();
        let err = client
            .pull(&reference, "amd64", None, dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("do not match"));
    }

    #[tokio::test]
    async fn test_missing_image() {
        let url = serve_routes(Vec::new()).await;
        let client = LibraryClient::new(url, None).unwrap();
        let err = client
            .image(&LibraryRef::parse("nope").unwrap(), "amd64", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Registry { .. }));
        assert!(err.to_string().contains("does not exist"));
    }
}
