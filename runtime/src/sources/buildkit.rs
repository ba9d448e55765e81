//! `Bootstrap: buildkit`: build a Dockerfile context with a host builder,
//! then treat the result like any other OCI archive.
//!
//! Two producers can run the build: `buildctl` against a BuildKit daemon,
//! or the Docker CLI. Both hand back an archive transport, so extraction is
//! the same whichever ran.

use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sbuild_core::error::{BuildError, Result};
use sbuild_core::platform::Platform;
use sbuild_core::recipe::Recipe;
use tokio_util::sync::CancellationToken;

use super::oci::pack_oci_image;
use super::ConveyorPacker;
use crate::bundle::{make_temp_dir, Bundle};
use crate::oci::credentials::{docker_config_for, DOCKER_HUB_AUTH_KEY};
use crate::oci::{fetch_image, resolve_credential, OciImage, Transport};
use crate::options::BuildOptions;
use crate::rootfs::{BUILDKIT_LOG_PATH, METADATA_DIR};
use crate::tool::{find_tool, Tool};

pub const DEFAULT_FRONTEND: &str = "dockerfile.v0";
pub const DEFAULT_FILENAME: &str = "Dockerfile";
/// Socket `buildctl` talks to when `BUILDKIT_HOST` is unset.
pub const DEFAULT_BUILDKIT_SOCKET: &str = "/run/buildkit/buildkitd.sock";

/// What to build, from the recipe header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildKitRequest {
    /// Build context directory
    pub context: PathBuf,
    /// Stage to build
    pub target: Option<String>,
    pub frontend: String,
    pub filename: String,
    pub build_args: Vec<(String, String)>,
    /// Platform in `os/arch[/variant]` form
    pub platform: String,
}

impl BuildKitRequest {
    pub fn from_recipe(recipe: &Recipe, platform: &Platform) -> Result<Self> {
        let context = PathBuf::from(recipe.require_header("buildkit", "from")?);
        let meta = fs::metadata(&context).map_err(|e| {
            BuildError::Config(format!(
                "Build context {} is not accessible: {}",
                context.display(),
                e
            ))
        })?;
        if !meta.is_dir() {
            return Err(BuildError::Config(format!(
                "Build context {} is not a directory",
                context.display()
            )));
        }

        Ok(Self {
            context,
            target: recipe.header("target").map(str::to_string),
            frontend: recipe.header("frontend").unwrap_or(DEFAULT_FRONTEND).to_string(),
            filename: recipe.header("filename").unwrap_or(DEFAULT_FILENAME).to_string(),
            build_args: parse_build_args(recipe.header("buildargs")),
            platform: platform.to_string(),
        })
    }
}

/// `KEY=VALUE` pairs separated by spaces; anything else is ignored.
pub fn parse_build_args(header: Option<&str>) -> Vec<(String, String)> {
    header
        .unwrap_or("")
        .split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Argument list of the `buildctl build` invocation.
pub fn buildctl_args(request: &BuildKitRequest, output: &Path, ref_file: &Path) -> Vec<String> {
    let context = request.context.display();
    let mut args = vec![
        "build".to_string(),
        format!("--frontend={}", request.frontend),
        "--local".to_string(),
        format!("context={}", context),
        "--local".to_string(),
        format!("dockerfile={}", context),
        "--opt".to_string(),
        format!("filename={}", request.filename),
        "--opt".to_string(),
        format!("platform={}", request.platform),
    ];
    if let Some(target) = &request.target {
        args.push("--opt".to_string());
        args.push(format!("target={}", target));
    }
    for (key, value) in &request.build_args {
        args.push("--opt".to_string());
        args.push(format!("build-arg:{}={}", key, value));
    }
    args.push("--output".to_string());
    args.push(format!("type=oci,dest={}", output.display()));
    args.push("--ref-file".to_string());
    args.push(ref_file.display().to_string());
    args
}

/// Argument list of the `docker build` invocation.
pub fn docker_build_args(request: &BuildKitRequest) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "--quiet".to_string(),
        "--file".to_string(),
        request.context.join(&request.filename).display().to_string(),
        "--platform".to_string(),
        request.platform.clone(),
        request.context.display().to_string(),
    ];
    if let Some(target) = &request.target {
        args.push("--target".to_string());
        args.push(target.clone());
    }
    for (key, value) in &request.build_args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }
    args
}

/// Environment handed to the producer.
#[derive(Debug, Clone, Default)]
pub struct ProducerEnv {
    pub vars: Vec<(OsString, OsString)>,
}

impl ProducerEnv {
    fn apply(&self, mut tool: Tool) -> Tool {
        for (k, v) in &self.vars {
            tool = tool.env(k, v);
        }
        tool
    }
}

/// Something that turns a build request into an OCI or Docker archive.
#[async_trait]
pub trait OciProducer: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Build `request` into an archive at `output`, with the build log at
    /// `log`. Returns the transport of the archive.
    async fn produce(
        &self,
        request: &BuildKitRequest,
        output: &Path,
        log: &Path,
        env: &ProducerEnv,
        cancel: &CancellationToken,
    ) -> Result<Transport>;
}

/// `buildctl` against a BuildKit daemon.
#[derive(Debug, Clone)]
pub struct Buildctl {
    program: PathBuf,
}

impl Buildctl {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    fn check_daemon() -> Result<()> {
        if std::env::var_os("BUILDKIT_HOST").is_some() {
            return Ok(());
        }
        if Path::new(DEFAULT_BUILDKIT_SOCKET).exists() {
            return Ok(());
        }
        Err(BuildError::Config(format!(
            "cannot connect to the BuildKit daemon at unix://{}. Is the buildkit daemon running?",
            DEFAULT_BUILDKIT_SOCKET
        )))
    }
}

#[async_trait]
impl OciProducer for Buildctl {
    fn name(&self) -> &'static str {
        "buildctl"
    }

    async fn produce(
        &self,
        request: &BuildKitRequest,
        output: &Path,
        log: &Path,
        env: &ProducerEnv,
        cancel: &CancellationToken,
    ) -> Result<Transport> {
        Self::check_daemon()?;
        let ref_file = output.with_extension("ref");

        let build = env.apply(Tool::new("buildctl", &self.program))
            .args(buildctl_args(request, output, &ref_file));
        build.run(cancel).await?;

        let build_ref = fs::read_to_string(&ref_file).map_err(|e| {
            BuildError::Other(format!("Failed to read {}: {}", ref_file.display(), e))
        })?;
        let logs = env
            .apply(Tool::new("buildctl", &self.program))
            .args(["debug", "logs", build_ref.trim()])
            .capture_stdout()
            .run(cancel)
            .await?;
        fs::write(log, logs.stdout_text()).map_err(|e| {
            BuildError::Other(format!("Failed to write build log {}: {}", log.display(), e))
        })?;

        Ok(Transport::OciArchive {
            path: output.to_path_buf(),
            tag: None,
        })
    }
}

/// `docker build` followed by `docker save`.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: PathBuf,
}

impl DockerCli {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

#[async_trait]
impl OciProducer for DockerCli {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn produce(
        &self,
        request: &BuildKitRequest,
        output: &Path,
        _log: &Path,
        env: &ProducerEnv,
        cancel: &CancellationToken,
    ) -> Result<Transport> {
        let built = env
            .apply(Tool::new("docker", &self.program))
            .args(docker_build_args(request))
            .capture_stdout()
            .run(cancel)
            .await?;
        let id = built.stdout_text().trim().to_string();
        if id.is_empty() {
            return Err(BuildError::Other(
                "docker build did not report an image id".to_string(),
            ));
        }

        env.apply(Tool::new("docker", &self.program))
            .arg("save")
            .arg("--output")
            .arg(output)
            .arg(&id)
            .run(cancel)
            .await?;

        Ok(Transport::DockerArchive {
            path: output.to_path_buf(),
            reference: None,
        })
    }
}

/// Pick the producer from what is installed. `DOCKER_BUILDKIT` in the
/// environment prefers the Docker CLI.
pub fn select_producer() -> Result<Box<dyn OciProducer>> {
    let prefer_docker = std::env::var_os("DOCKER_BUILDKIT").map_or(false, |v| !v.is_empty());
    choose_producer(
        find_tool("buildctl").ok(),
        find_tool("docker").ok(),
        prefer_docker,
    )
}

fn choose_producer(
    buildctl: Option<PathBuf>,
    docker: Option<PathBuf>,
    prefer_docker: bool,
) -> Result<Box<dyn OciProducer>> {
    match (buildctl, docker) {
        (None, None) => Err(BuildError::BuildToolMissing),
        (Some(_), None) if prefer_docker => Err(BuildError::ToolMissing("docker".to_string())),
        (Some(buildctl), None) => Ok(Box::new(Buildctl::new(buildctl))),
        (Some(buildctl), Some(_)) if !prefer_docker => Ok(Box::new(Buildctl::new(buildctl))),
        (_, Some(docker)) => Ok(Box::new(DockerCli::new(docker))),
    }
}

/// A throwaway `DOCKER_CONFIG` carrying the build's credentials and
/// pointing at the user's CLI plugins.
fn docker_config_dir(opts: &BuildOptions, tmp_dir: &Path) -> Result<PathBuf> {
    let dir = make_temp_dir(tmp_dir, "docker-config-")?;

    if opts.oci_auth_config.is_some() || opts.docker_auth_config.is_some() {
        let credential = resolve_credential(opts, DOCKER_HUB_AUTH_KEY)?;
        let config = docker_config_for(DOCKER_HUB_AUTH_KEY, &credential);
        let path = dir.join("config.json");
        fs::write(&path, serde_json::to_vec(&config)?).map_err(|e| {
            BuildError::Other(format!("Failed to write {}: {}", path.display(), e))
        })?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }

    if let Some(home) = dirs::home_dir() {
        for name in ["cli-plugins", "buildx"] {
            let link = dir.join(name);
            std::os::unix::fs::symlink(home.join(".docker").join(name), &link).map_err(|e| {
                BuildError::Other(format!("Failed to create {}: {}", link.display(), e))
            })?;
        }
    }
    Ok(dir)
}

#[derive(Debug, Default)]
pub struct BuildKitSource {
    image: Option<OciImage>,
}

#[async_trait]
impl ConveyorPacker for BuildKitSource {
    async fn get(&mut self, bundle: &mut Bundle, cancel: &CancellationToken) -> Result<()> {
        let platform = bundle.opts.resolve_platform()?;
        let request = BuildKitRequest::from_recipe(&bundle.recipe, &platform)?;
        let producer = select_producer()?;

        let config_dir = docker_config_dir(&bundle.opts, &bundle.tmp_dir)?;
        let env = ProducerEnv {
            vars: vec![("DOCKER_CONFIG".into(), config_dir.into_os_string())],
        };

        let metadata = bundle.rootfs_path.join(METADATA_DIR);
        fs::create_dir_all(&metadata).map_err(|e| {
            BuildError::Other(format!("Failed to create {}: {}", metadata.display(), e))
        })?;
        let log = bundle.rootfs_path.join(BUILDKIT_LOG_PATH);
        let output = make_temp_dir(&bundle.tmp_dir, "buildkit-")?.join("image.tar");

        tracing::info!(
            producer = producer.name(),
            context = %request.context.display(),
            platform = %request.platform,
            "Building OCI image"
        );
        let transport = producer
            .produce(&request, &output, &log, &env, cancel)
            .await?;

        let image = fetch_image(&transport, &bundle.opts, &bundle.tmp_dir, cancel).await?;
        self.image = Some(image);
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle, _cancel: &CancellationToken) -> Result<()> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| BuildError::Other("BuildKit image packed before building".to_string()))?;
        pack_oci_image(bundle, image)
    }
}
