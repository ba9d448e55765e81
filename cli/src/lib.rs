//! sbuild CLI: build a container root filesystem from a definition file
//! or an image URI.

pub mod commands;
pub mod output;
pub mod resolve;
