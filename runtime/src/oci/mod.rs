//! OCI image acquisition.
//!
//! ```text
//! Transport ──fetch_image──▶ OciImage ──unpack_rootfs──▶ rootfs
//!  docker://      registry pull into a scratch layout (+ blob cache)
//!  oci:           layout read in place
//!  oci-archive:   extracted to scratch
//!  docker-archive:/docker-daemon: `docker save` tarball
//! ```
//!
//! [`runscript`] turns the image config into the runscript, environment
//! script and labels of the built rootfs.

pub mod archive;
pub mod credentials;
pub mod fetch;
pub mod image;
pub mod reference;
pub mod registry;
pub mod runscript;

pub use archive::extract_archive;
pub use credentials::{resolve_credential, DockerConfigFile, RegistryCredential};
pub use fetch::fetch_image;
pub use image::{is_layer_media_type, LayerBlob, OciImage};
pub use reference::{source_uri, ImageReference, Transport};
pub use registry::RegistryClient;
pub use runscript::insert_oci_metadata;
