//! sbuild runtime: the container image build pipeline.
//!
//! A recipe names a bootstrap source; the source fetches its bits into a
//! [`Bundle`] (`get`) and finalizes the rootfs metadata (`pack`). The
//! result is a sandbox directory ready to be assembled into an image.

#![allow(clippy::result_large_err)]

pub mod bundle;
pub mod cache;
pub mod http;
pub mod image;
pub mod mount;
pub mod oci;
pub mod options;
pub mod pipeline;
pub mod rootfs;
pub mod sources;
pub mod tool;
pub mod unpack;
pub mod userns;

// Re-export common types
pub use bundle::{Bundle, OCI_CONFIG_JSON};
pub use cache::BlobCache;
pub use image::{sniff, LocalImageKind, SifImage};
pub use oci::{fetch_image, ImageReference, OciImage, Transport};
pub use options::{AuthConfig, BuildOptions, DockerAuthConfig, DEFAULT_LIBRARY_URL};
pub use pipeline::{build, BuildOutput};
pub use rootfs::{check_perms, fix_perms, make_base_env};
pub use sources::{
    check_signatures, ConveyorPacker, DescriptorVerifier, SignatureVerifier, Source, SourceKind,
};
pub use tool::{ExitDisposition, Tool};

/// sbuild runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
