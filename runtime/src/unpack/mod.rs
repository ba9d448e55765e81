//! Rootfs unpackers: OCI layer chains, squashfs and ext3 filesystem images,
//! and sandbox directories.

pub mod ext3;
pub mod layer;
pub mod sandbox;
pub mod securejoin;
pub mod squashfs;

pub use ext3::unpack_ext3;
pub use layer::{apply_layer, decompress, unpack_rootfs, UnpackMode};
pub use sandbox::unpack_sandbox;
pub use securejoin::secure_join;
pub use squashfs::{unpack_squashfs, ByteRange};
