//! `Bootstrap: shub`. Singularity Hub is offline and no client ships with
//! this builder, so the source always reports its tool as missing.

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use super::ConveyorPacker;
use crate::bundle::Bundle;

#[derive(Debug, Default, Clone, Copy)]
pub struct ShubSource;

#[async_trait]
impl ConveyorPacker for ShubSource {
    async fn get(&mut self, bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        tracing::error!(
            from = bundle.recipe.header("from").unwrap_or(""),
            "Singularity Hub images cannot be fetched by this builder"
        );
        Err(BuildError::ToolMissing("shub client".to_string()))
    }

    async fn pack(&mut self, _bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        Err(BuildError::ToolMissing("shub client".to_string()))
    }
}
