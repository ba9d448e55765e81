//! Plain HTTP downloads for sources that fetch files outside a registry:
//! static binaries, library images and tool configuration files.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use sbuild_core::error::{BuildError, Result};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Connection setup budget, covering the TLS handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a finished download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Download {
    /// Bytes written to the destination
    pub written: u64,
    /// Length announced by the server, if any
    pub content_length: Option<u64>,
}

impl Download {
    /// Fail when the server announced a length that was not delivered.
    pub fn check_length(&self, url: &str) -> Result<()> {
        match self.content_length {
            Some(expected) if expected != self.written => Err(BuildError::Network(format!(
                "short download from {}: wrote {} of {} bytes",
                url, self.written, expected
            ))),
            _ => Ok(()),
        }
    }
}

/// HTTP client with the build's connection timeout.
pub fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| BuildError::Network(format!("Failed to create HTTP client: {}", e)))
}

/// Stream the response of `request` into `dest`, racing every chunk
/// against `cancel`.
pub async fn download_to(
    request: reqwest::RequestBuilder,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<Download> {
    let response = tokio::select! {
        r = request.send() => r.map_err(|e| BuildError::Network(format!("Request failed: {}", e)))?,
        _ = cancel.cancelled() => return Err(BuildError::Cancelled),
    };
    let url = response.url().to_string();
    if !response.status().is_success() {
        return Err(BuildError::Network(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }
    let content_length = response.content_length();

    let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
        BuildError::Other(format!("Failed to create {}: {}", dest.display(), e))
    })?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    loop {
        let chunk = tokio::select! {
            c = stream.next() => c,
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
        };
        let Some(chunk) = chunk else { break };
        let chunk =
            chunk.map_err(|e| BuildError::Network(format!("Failed reading {}: {}", url, e)))?;
        file.write_all(&chunk).await.map_err(|e| {
            BuildError::Other(format!("Failed to write {}: {}", dest.display(), e))
        })?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| {
        BuildError::Other(format!("Failed to write {}: {}", dest.display(), e))
    })?;

    tracing::debug!(url = %url, dest = %dest.display(), bytes = written, "Downloaded");
    Ok(Download {
        written,
        content_length,
    })
}

/// GET `url` into `dest` and require the announced length to match.
pub async fn fetch_file(url: &str, dest: &Path, cancel: &CancellationToken) -> Result<Download> {
    let download = download_to(client()?.get(url), dest, cancel).await?;
    download.check_length(url)?;
    Ok(download)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_length() {
        let ok = Download {
            written: 10,
            content_length: Some(10),
        };
        assert!(ok.check_length("http://x").is_ok());

        let unknown = Download {
            written: 10,
            content_length: None,
        };
        assert!(unknown.check_length("http://x").is_ok());

        let short = Download {
            written: 9,
            content_length: Some(10),
        };
        let err = short.check_length("http://x").unwrap_err();
        assert!(matches!(err, BuildError::Network(_)));
        assert!(err.to_string().contains("9 of 10"));
    }

    #[tokio::test]
    async fn test_download_cancelled_before_send() {
        let dir = tempfile::TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = client().unwrap().get("http://127.0.0.1:9/never");
        let err = download_to(request, &dir.path().join("out"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled | BuildError::Network(_)));
    }

    #[tokio::test]
    async fn test_fetch_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = test_server::serve_once(b"payload".to_vec(), None).await;
        let dest = dir.path().join("out");
        let download = fetch_file(&format!("{}/file", url), &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(download.written, 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_fetch_file_truncated() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = test_server::serve_once(b"short".to_vec(), Some(100)).await;
        let err = fetch_file(&url, &dir.path().join("out"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Network(_)));
    }
}
