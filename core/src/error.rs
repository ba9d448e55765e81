use thiserror::Error;

/// Build pipeline error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// The bundle rootfs lives on a filesystem that refuses chown
    #[error("ownership change not allowed in {path}: {message}")]
    FsChownUnsupported { path: String, message: String },

    /// Host operating system is not Linux
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Image platform does not satisfy the requested one
    #[error("image platform {image} does not satisfy required platform {required}")]
    PlatformMismatch { required: String, image: String },

    /// Architecture alias not in the alias table
    #[error("arch {arch} is not supported, supported values: {known}")]
    ArchUnknown { arch: String, known: String },

    /// A required host tool is not on PATH
    #[error("{0} is not in PATH")]
    ToolMissing(String),

    /// Neither buildctl nor the docker CLI is available
    #[error("neither buildctl nor docker is available for a buildkit build")]
    BuildToolMissing,

    /// Image has no layers with an extractable media type
    #[error("not extractable: {0}")]
    NotExtractable(String),

    /// Layer, squashfs or ext3 extraction failed
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// Permission fixup finished with per-file errors
    #[error("{errors} errors were encountered when setting permissions")]
    PermsPartialFix { errors: usize },

    /// Signature gate rejected the image
    #[error("fingerprint verification failed: {0}")]
    FingerprintMismatch(String),

    /// Requested credentials file could not be parsed
    #[error("unable to read auth config {path}: {message}")]
    AuthConfigUnreadable { path: String, message: String },

    /// Required recipe header is absent
    #[error("invalid {bootstrap} header, no {key} specified")]
    RecipeHeaderMissing { bootstrap: String, key: String },

    /// Recipe header present but unusable
    #[error("invalid {key} header: {message}")]
    RecipeHeaderMalformed { key: String, message: String },

    /// The build was cancelled
    #[error("build cancelled")]
    Cancelled,

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Registry rejected the credentials (or lack of them)
    #[error("Registry authentication failed: {registry} - {message}")]
    RegistryAuth { registry: String, message: String },

    /// HTTP transfer error
    #[error("Network error: {0}")]
    Network(String),

    /// A host tool exited unsuccessfully
    #[error("{tool} exited with status {code}: {stderr}")]
    ToolFailed {
        tool: String,
        code: i32,
        stderr: String,
    },

    /// The image carries no signatures
    #[error("signature not found: {0}")]
    SignatureNotFound(String),

    /// Signature verification failed for a reason other than absence
    #[error("verification error: {0}")]
    Verification(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BuildError {
    /// Stable kind name used in error log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::FsChownUnsupported { .. } => "fs_chown_unsupported",
            BuildError::UnsupportedPlatform(_) => "unsupported_platform",
            BuildError::PlatformMismatch { .. } => "platform_mismatch",
            BuildError::ArchUnknown { .. } => "arch_unknown",
            BuildError::ToolMissing(_) => "tool_missing",
            BuildError::BuildToolMissing => "build_tool_missing",
            BuildError::NotExtractable(_) => "not_extractable",
            BuildError::ExtractionFailed(_) => "extraction_failed",
            BuildError::PermsPartialFix { .. } => "perms_partial_fix",
            BuildError::FingerprintMismatch(_) => "fingerprint_mismatch",
            BuildError::AuthConfigUnreadable { .. } => "auth_config_unreadable",
            BuildError::RecipeHeaderMissing { .. } => "recipe_header_missing",
            BuildError::RecipeHeaderMalformed { .. } => "recipe_header_malformed",
            BuildError::Cancelled => "cancelled",
            BuildError::Registry { .. } => "registry",
            BuildError::RegistryAuth { .. } => "registry_auth",
            BuildError::Network(_) => "network",
            BuildError::ToolFailed { .. } => "tool_failed",
            BuildError::SignatureNotFound(_) => "signature_not_found",
            BuildError::Verification(_) => "verification",
            BuildError::Io(_) => "io",
            BuildError::Serialization(_) => "serialization",
            BuildError::Config(_) => "config",
            BuildError::Other(_) => "other",
        }
    }

    /// Shorthand for a missing recipe header.
    pub fn header_missing(bootstrap: &str, key: &str) -> Self {
        BuildError::RecipeHeaderMissing {
            bootstrap: bootstrap.to_string(),
            key: key.to_string(),
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for build pipeline operations
pub type Result<T> = std::result::Result<T, BuildError>;
