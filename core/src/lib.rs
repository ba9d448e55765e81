//! sbuild core - foundational types for the image build pipeline.
//!
//! This crate holds the pieces shared by every bootstrap source: the error
//! taxonomy, OCI platform handling, and the recipe data model.

pub mod error;
pub mod platform;
pub mod recipe;

// Re-export commonly used types
pub use error::{BuildError, Result};
pub use platform::{check_image_platform, default_platform, Platform};
pub use recipe::{Recipe, Section};

/// sbuild version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
