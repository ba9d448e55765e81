//! Signature gate for local SIF sources.
//!
//! A recipe may pin the keys that must have signed the source image with a
//! `Fingerprints:` header. Pinned keys are enforced; without them the image
//! is verified on a best-effort basis and the build always continues.

use std::path::Path;

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};

use crate::image::SifImage;
use crate::options::KeyServerOptions;

/// Checks the signatures of a SIF image.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Verify `image`. With `fingerprints`, every listed key must have a
    /// valid signature; without, any valid signature is enough.
    /// An unsigned image yields [`BuildError::SignatureNotFound`].
    async fn verify(
        &self,
        image: &Path,
        fingerprints: Option<&[String]>,
        key_server: &KeyServerOptions,
    ) -> Result<()>;

    /// Whether a successful `verify` means the signature payloads were
    /// checked, not just the signer identities.
    fn validates_payloads(&self) -> bool {
        true
    }
}

/// Verifier that inspects the SIF signature descriptors and matches the
/// signing entity of each against the requested fingerprints. It does not
/// check signature payloads; plug in a keyring-backed verifier through
/// `BuildOptions::with_verifier` for that.
#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorVerifier;

#[async_trait]
impl SignatureVerifier for DescriptorVerifier {
    async fn verify(
        &self,
        image: &Path,
        fingerprints: Option<&[String]>,
        key_server: &KeyServerOptions,
    ) -> Result<()> {
        if let Some(url) = &key_server.url {
            tracing::debug!(key_server = %url, "Descriptor scan does not contact the keyserver");
        }
        let sif = SifImage::open(image)?;
        let entities: Vec<String> = sif.signatures().filter_map(|d| d.signing_entity()).collect();
        if entities.is_empty() {
            return Err(BuildError::SignatureNotFound(image.display().to_string()));
        }

        let Some(wanted) = fingerprints else {
            tracing::debug!(image = %image.display(), signers = ?entities, "Signatures present");
            return Ok(());
        };

        let missing: Vec<&str> = wanted
            .iter()
            .filter(|fp| !entities.iter().any(|e| e.eq_ignore_ascii_case(fp)))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::FingerprintMismatch(format!(
                "image {} is not signed by {}",
                image.display(),
                missing.join(", ")
            )));
        }
        Ok(())
    }

    fn validates_payloads(&self) -> bool {
        false
    }
}

/// Fingerprints listed in a `Fingerprints:` header. Anything after `#` is a
/// comment; entries are comma separated.
pub fn parse_fingerprints(header: Option<&str>) -> Vec<String> {
    let Some(header) = header else {
        return Vec::new();
    };
    let value = header.split('#').next().unwrap_or("");
    value
        .split(',')
        .map(str::trim)
        .filter(|fp| !fp.is_empty())
        .map(str::to_string)
        .collect()
}

/// Run the gate for `image`. Pinned fingerprints that fail abort the build;
/// advisory failures are logged.
pub async fn check_signatures(
    verifier: &dyn SignatureVerifier,
    image: &Path,
    fingerprints_header: Option<&str>,
    key_server: &KeyServerOptions,
) -> Result<()> {
    let fingerprints = parse_fingerprints(fingerprints_header);

    if !fingerprints.is_empty() {
        tracing::info!(image = %image.display(), fingerprints = ?fingerprints, "Checking bootstrap image signatures");
        return verifier
            .verify(image, Some(&fingerprints), key_server)
            .await
            .map_err(|e| match e {
                BuildError::FingerprintMismatch(_) | BuildError::Cancelled => e,
                other => BuildError::FingerprintMismatch(format!(
                    "while checking fingerprint: {}",
                    other
                )),
            });
    }

    match verifier.verify(image, None, key_server).await {
        Ok(()) if verifier.validates_payloads() => {
            tracing::info!(image = %image.display(), "Bootstrap image verified")
        }
        Ok(()) => tracing::info!(
            image = %image.display(),
            "Bootstrap image signer fingerprints matched; signature payloads were not cryptographically checked"
        ),
        Err(BuildError::SignatureNotFound(_)) => {
            tracing::debug!(image = %image.display(), "Bootstrap image is not signed")
        }
        Err(BuildError::Cancelled) => return Err(BuildError::Cancelled),
        Err(e) => {
            tracing::warn!(image = %image.display(), error = %e, "Verification failed");
            tracing::warn!("Bootstrap image could not be verified, but build will continue.");
        }
    }
    Ok(())
}
