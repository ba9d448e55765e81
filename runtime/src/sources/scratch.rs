//! `Bootstrap: scratch`: an empty root filesystem holding only the base
//! environment.

use async_trait::async_trait;
use sbuild_core::error::Result;
use tokio_util::sync::CancellationToken;

use super::ConveyorPacker;
use crate::bundle::Bundle;
use crate::rootfs::make_base_env;

#[derive(Debug, Default, Clone, Copy)]
pub struct ScratchSource;

#[async_trait]
impl ConveyorPacker for ScratchSource {
    async fn get(&mut self, bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        make_base_env(&bundle.rootfs_path, true)
    }

    async fn pack(&mut self, _bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }
}
