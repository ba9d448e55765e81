//! Root filesystem scaffolding.
//!
//! Every built rootfs carries the same base environment: a fixed set of
//! directories, entry-point symlinks and scripts under `/.singularity.d`.
//! This module writes that environment and normalizes permissions after
//! extraction.

mod base_env;
pub mod layout;
mod perms;

pub use base_env::make_base_env;
pub(crate) use base_env::make_file;
pub use layout::{
    BUILDKIT_LOG_PATH, DOCKER_ENV_PATH, LABELS_PATH, METADATA_DIR, RUNSCRIPT_PATH,
    STARTSCRIPT_PATH,
};
pub use perms::{check_perms, fix_perms};
