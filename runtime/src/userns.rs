//! User namespace and privilege detection.

use std::path::PathBuf;
use std::sync::OnceLock;

use nix::unistd::{getegid, geteuid};
use sbuild_core::error::{BuildError, Result};

/// Size of the identity mapping in the initial user namespace.
const FULL_RANGE: u64 = 4_294_967_295;

/// One line of a `uid_map`/`gid_map` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    /// The single-entry map used for rootless extraction: container 0 is
    /// the invoking user.
    pub fn root_to(host_id: u32) -> Self {
        Self {
            container_id: 0,
            host_id,
            size: 1,
        }
    }

    /// Host id for a container id, if this mapping covers it.
    pub fn to_host(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        (offset < self.size).then(|| self.host_id + offset)
    }
}

/// Parse a `/proc/<pid>/uid_map` style table.
pub fn parse_id_map(content: &str) -> Vec<(u64, u64, u64)> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace().map(|f| f.parse::<u64>());
            match (fields.next(), fields.next(), fields.next()) {
                (Some(Ok(c)), Some(Ok(h)), Some(Ok(s))) => Some((c, h, s)),
                _ => None,
            }
        })
        .collect()
}

/// Whether the build runs without real host root.
///
/// True when the effective uid is not 0, or when uid 0 is only root inside
/// a user namespace. Detected once per process.
pub fn is_unprivileged() -> bool {
    static UNPRIVILEGED: OnceLock<bool> = OnceLock::new();
    *UNPRIVILEGED.get_or_init(|| {
        if !geteuid().is_root() {
            return true;
        }
        match std::fs::read_to_string("/proc/self/uid_map") {
            Ok(content) => !maps_host_root(&parse_id_map(&content)),
            Err(e) => {
                tracing::debug!(error = %e, "Cannot read uid_map, assuming host namespace");
                false
            }
        }
    })
}

/// Whether container uid 0 is host uid 0 in the given map.
fn maps_host_root(map: &[(u64, u64, u64)]) -> bool {
    map.iter().any(|&(container, host, size)| {
        (container == 0 && host == 0) || (container == 0 && size == FULL_RANGE)
    })
}

/// User namespace state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserNamespaceState {
    /// Process runs in a non-initial user namespace
    pub inside: bool,
    /// `setgroups` is allowed in that namespace
    pub setgroups_allowed: bool,
}

/// Inspect the user namespace of `pid` (`None` for this process).
pub fn user_namespace_state(pid: Option<u32>) -> Result<UserNamespaceState> {
    let base = match pid {
        Some(pid) => PathBuf::from(format!("/proc/{}", pid)),
        None => PathBuf::from("/proc/self"),
    };
    let uid_map = std::fs::read_to_string(base.join("uid_map")).map_err(|e| {
        BuildError::Other(format!(
            "Failed to read {}: {}",
            base.join("uid_map").display(),
            e
        ))
    })?;
    let inside = !parse_id_map(&uid_map)
        .iter()
        .any(|&(c, h, s)| c == 0 && h == 0 && s == FULL_RANGE);

    let setgroups_allowed = match std::fs::read_to_string(base.join("setgroups")) {
        Ok(content) => content == "allow\n",
        Err(_) => !inside,
    };

    Ok(UserNamespaceState {
        inside,
        setgroups_allowed,
    })
}

/// Whether mount-bypass shims are needed: inside a user namespace that
/// still allows setgroups, which is how fakeroot sessions run.
pub fn needs_fakeroot_shims() -> bool {
    match user_namespace_state(None) {
        Ok(state) => state.inside && state.setgroups_allowed,
        Err(e) => {
            tracing::debug!(error = %e, "Cannot inspect user namespace");
            false
        }
    }
}

/// Effective uid and gid of the builder.
pub fn effective_ids() -> (u32, u32) {
    (geteuid().as_raw(), getegid().as_raw())
}
