//! Image blob cache.
//!
//! `BlobCache` is the only state shared between builds. It is handed to a
//! build through its options and never reached through a global.

pub mod blob_cache;

pub use blob_cache::{sha256_bytes, sha256_file, sha256_hex, BlobCache, BlobMeta};
