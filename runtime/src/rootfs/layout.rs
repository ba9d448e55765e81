//! Base environment layout constants.
//!
//! Defines the fixed directory structure, entry-point symlinks and scripts
//! that every built root filesystem carries under `/.singularity.d`.

/// Metadata directory inside the rootfs.
pub const METADATA_DIR: &str = ".singularity.d";

/// Runscript path relative to the rootfs.
pub const RUNSCRIPT_PATH: &str = ".singularity.d/runscript";

/// Startscript path relative to the rootfs.
pub const STARTSCRIPT_PATH: &str = ".singularity.d/startscript";

/// Labels file path relative to the rootfs.
pub const LABELS_PATH: &str = ".singularity.d/labels.json";

/// Environment fragment written for OCI-derived images.
pub const DOCKER_ENV_PATH: &str = ".singularity.d/env/10-docker2singularity.sh";

/// BuildKit log path relative to the rootfs.
pub const BUILDKIT_LOG_PATH: &str = ".singularity.d/buildkit_build.log";

/// Directories created in every rootfs (mode 0755).
pub const BASE_DIRS: &[&str] = &[
    ".singularity.d/libs",
    ".singularity.d/actions",
    ".singularity.d/env",
    "dev",
    "proc",
    "root",
    "var/tmp",
    "tmp",
    "etc",
    "sys",
    "home",
];

/// `(link, target)` pairs, created only when the link path is free.
pub const BASE_SYMLINKS: &[(&str, &str)] = &[
    ("singularity", ".singularity.d/runscript"),
    (".run", ".singularity.d/actions/run"),
    (".exec", ".singularity.d/actions/exec"),
    (".test", ".singularity.d/actions/test"),
    (".shell", ".singularity.d/actions/shell"),
    ("environment", ".singularity.d/env/90-environment.sh"),
];

/// A file written by the base environment installer.
#[derive(Debug, Clone, Copy)]
pub struct BaseFile {
    pub path: &'static str,
    pub mode: u32,
    pub content: &'static str,
}

/// Files written by the base environment installer, in write order.
pub const BASE_FILES: &[BaseFile] = &[
    BaseFile { path: "etc/hosts", mode: 0o644, content: "" },
    BaseFile { path: "etc/resolv.conf", mode: 0o644, content: "" },
    BaseFile {
        path: ".singularity.d/actions/exec",
        mode: 0o755,
        content: include_str!("scripts/exec"),
    },
    BaseFile {
        path: ".singularity.d/actions/run",
        mode: 0o755,
        content: include_str!("scripts/run"),
    },
    BaseFile {
        path: ".singularity.d/actions/shell",
        mode: 0o755,
        content: include_str!("scripts/shell"),
    },
    BaseFile {
        path: ".singularity.d/actions/start",
        mode: 0o755,
        content: include_str!("scripts/start"),
    },
    BaseFile {
        path: ".singularity.d/actions/test",
        mode: 0o755,
        content: include_str!("scripts/test"),
    },
    BaseFile {
        path: ".singularity.d/env/01-base.sh",
        mode: 0o755,
        content: include_str!("scripts/01-base.sh"),
    },
    BaseFile {
        path: ".singularity.d/env/90-environment.sh",
        mode: 0o755,
        content: include_str!("scripts/90-environment.sh"),
    },
    BaseFile {
        path: ".singularity.d/env/95-apps.sh",
        mode: 0o755,
        content: include_str!("scripts/95-apps.sh"),
    },
    BaseFile {
        path: ".singularity.d/env/99-base.sh",
        mode: 0o755,
        content: include_str!("scripts/99-base.sh"),
    },
    BaseFile {
        path: ".singularity.d/env/99-runtimevars.sh",
        mode: 0o755,
        content: include_str!("scripts/99-runtimevars.sh"),
    },
    BaseFile {
        path: RUNSCRIPT_PATH,
        mode: 0o755,
        content: include_str!("scripts/runscript"),
    },
    BaseFile {
        path: STARTSCRIPT_PATH,
        mode: 0o755,
        content: include_str!("scripts/startscript"),
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_are_posix_shell() {
        for file in BASE_FILES.iter().filter(|f| f.mode == 0o755) {
            assert!(
                file.content.starts_with("#!/bin/sh\n"),
                "{} lacks a /bin/sh shebang",
                file.path
            );
        }
    }

    #[test]
    fn test_symlink_targets_are_written() {
        for (_, target) in BASE_SYMLINKS {
            assert!(
                BASE_FILES.iter().any(|f| f.path == *target),
                "symlink target {} is not installed",
                target
            );
        }
    }

    #[test]
    fn test_actions_source_env_dir() {
        for file in BASE_FILES
            .iter()
            .filter(|f| f.path.starts_with(".singularity.d/actions/"))
        {
            assert!(file.content.contains("/.singularity.d/env/*.sh"), "{}", file.path);
        }
    }
}
