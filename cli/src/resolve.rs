//! Resolution of the build source argument.
//!
//! The argument is a definition file when one exists at that path,
//! otherwise a `scheme:ref` image URI (`docker://alpine`, `oci-archive:x.tar`).

use std::path::Path;

use sbuild_core::error::{BuildError, Result};
use sbuild_core::recipe::Recipe;

/// Turn the build spec argument into a recipe.
pub fn resolve_recipe(spec: &str) -> Result<Recipe> {
    let path = Path::new(spec);
    if path.is_file() {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!(
                "Failed to read definition file {}: {}",
                path.display(),
                e
            ))
        })?;
        tracing::debug!(file = %path.display(), "Parsing definition file");
        return Recipe::parse(&text);
    }
    if spec.contains(':') {
        return Recipe::from_uri(spec);
    }
    Err(BuildError::Config(format!(
        "'{}' is neither a definition file nor a scheme:ref URI",
        spec
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_definition_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.def");
        std::fs::write(&file, "Bootstrap: docker\nFrom: alpine:3.19\n\n%post\n    apk add curl\n")
            .unwrap();
        let recipe = resolve_recipe(&file.display().to_string()).unwrap();
        assert_eq!(recipe.bootstrap().as_deref(), Some("docker"));
        assert_eq!(recipe.header("from"), Some("alpine:3.19"));
    }

    #[test]
    fn test_uri() {
        let recipe = resolve_recipe("docker://alpine:3.19").unwrap();
        assert_eq!(recipe.bootstrap().as_deref(), Some("docker"));
    }

    #[test]
    fn test_neither() {
        let err = resolve_recipe("no-such-file.def").unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }
}
