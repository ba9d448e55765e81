//! `sbuild build` command: build a sandbox directory.
//!
//! Resolves the definition file or source URI into a recipe, assembles the build options
//! and runs the pipeline. Ctrl-C cancels the build and cleans up.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use sbuild_core::platform::Platform;
use sbuild_runtime::{BlobCache, BuildOptions, BuildOutput};
use tokio_util::sync::CancellationToken;

use crate::resolve::resolve_recipe;

#[derive(Args)]
pub struct BuildArgs {
    /// Destination sandbox directory
    pub output: PathBuf,

    /// Definition file or image URI (e.g. docker://alpine:3.19)
    pub spec: String,

    /// Overwrite an existing destination
    #[arg(short = 'F', long)]
    pub force: bool,

    /// Sections to run (all, none, or a list of names)
    #[arg(long = "section", default_value = "all", value_delimiter = ',')]
    pub sections: Vec<String>,

    /// Skip the %test section
    #[arg(short = 'T', long = "notest")]
    pub no_test: bool,

    /// Make every extracted file owner-writable and owner-readable
    #[arg(long)]
    pub fix_perms: bool,

    /// Keep the build bundle after the build finishes
    #[arg(long)]
    pub no_cleanup: bool,

    /// Target architecture (amd64, arm64, arm64v8, ...)
    #[arg(long)]
    pub arch: Option<String>,

    /// Target platform (os/arch[/variant]), overrides --arch
    #[arg(long)]
    pub platform: Option<String>,

    /// Scratch directory for build bundles
    #[arg(long)]
    pub tmpdir: Option<PathBuf>,

    /// Talk plain HTTP to registries and the library
    #[arg(long)]
    pub no_https: bool,

    /// Bypass the blob cache
    #[arg(long)]
    pub disable_cache: bool,

    /// Blob cache directory (default: ~/.cache/sbuild)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Library API base URL
    #[arg(long)]
    pub library: Option<String>,

    /// Print the build result as JSON
    #[arg(long)]
    pub json: bool,
}

impl BuildArgs {
    fn options(&self) -> Result<BuildOptions, Box<dyn std::error::Error>> {
        let mut opts = BuildOptions::from_env()
            .with_sections(self.sections.clone())
            .with_fix_perms(self.fix_perms)
            .with_sandbox_target(true)
            .with_no_cleanup(self.no_cleanup)
            .with_no_https(self.no_https);
        opts.force = self.force;
        opts.no_test = self.no_test;
        opts.no_cache = self.disable_cache;

        if let Some(dir) = &self.tmpdir {
            opts = opts.with_tmp_dir(dir);
        }
        if let Some(arch) = &self.arch {
            opts = opts.with_arch(arch);
        }
        if let Some(platform) = &self.platform {
            opts = opts.with_platform(Platform::parse(platform)?);
        }
        if let Some(url) = &self.library {
            opts.library_url = url.clone();
        }
        if !self.disable_cache {
            let dir = self
                .cache_dir
                .clone()
                .unwrap_or_else(super::default_cache_dir);
            opts = opts.with_cache(Arc::new(BlobCache::new(&dir)?));
        }
        Ok(opts)
    }
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let recipe = resolve_recipe(&args.spec)?;
    let opts = args.options()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling build");
            on_signal.cancel();
        }
    });

    let output = sbuild_runtime::build(recipe, opts, &args.output, &cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary(&output))?);
    } else {
        println!("Build complete: {}", output.rootfs.display());
        if !output.pending_sections.is_empty() {
            println!("Sections left to run: {}", output.pending_sections.join(", "));
        }
    }
    Ok(())
}

fn summary(output: &BuildOutput) -> serde_json::Value {
    serde_json::json!({
        "rootfs": output.rootfs,
        "source": output.source.name(),
        "objects": output.json_objects.keys().collect::<Vec<_>>(),
        "sections": output.pending_sections,
    })
}
