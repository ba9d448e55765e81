//! Build recipes: a bootstrap header plus ordered script sections.
//!
//! A definition file looks like:
//!
//! ```text
//! Bootstrap: docker
//! From: alpine:3.19
//!
//! %post
//!     apk add curl
//!
//! %runscript
//!     exec curl "$@"
//! ```
//!
//! Header keys are case-insensitive and stored lowercase.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

/// Section names that open a new block in a definition file.
const SECTION_NAMES: &[&str] = &[
    "arguments",
    "pre",
    "setup",
    "files",
    "post",
    "test",
    "runscript",
    "startscript",
    "environment",
    "labels",
    "help",
    "appinstall",
    "appfiles",
    "appenv",
    "apphelp",
    "applabels",
    "apprun",
    "apptest",
    "appstart",
];

/// URI schemes that can stand in for a whole definition file.
const URI_BOOTSTRAPS: &[&str] = &[
    "docker",
    "docker-archive",
    "docker-daemon",
    "oci",
    "oci-archive",
    "library",
    "oras",
    "shub",
    "localimage",
];

/// A named block of shell text from the definition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Section name without the leading `%`
    pub name: String,
    /// Text following the section name on its opening line
    pub args: String,
    /// Section body
    pub script: String,
}

/// An immutable build recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// Header keys (lowercase) to values
    pub header: BTreeMap<String, String>,
    /// Sections in file order
    pub sections: Vec<Section>,
}

impl Recipe {
    /// Create a recipe with only a bootstrap header.
    pub fn new(bootstrap: impl Into<String>) -> Self {
        let mut header = BTreeMap::new();
        header.insert("bootstrap".to_string(), bootstrap.into());
        Self {
            header,
            sections: Vec::new(),
        }
    }

    /// Add or replace a header value.
    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.header.insert(key.to_lowercase(), value.into());
        self
    }

    /// Append a section.
    pub fn with_section(mut self, name: &str, script: impl Into<String>) -> Self {
        self.sections.push(Section {
            name: name.to_string(),
            args: String::new(),
            script: script.into(),
        });
        self
    }

    /// The bootstrap kind, lowercased.
    pub fn bootstrap(&self) -> Option<String> {
        self.header("bootstrap").map(|b| b.to_lowercase())
    }

    /// A trimmed, non-empty header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.header
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// A header value that the given bootstrap cannot proceed without.
    pub fn require_header(&self, bootstrap: &str, key: &str) -> Result<&str> {
        self.header(key)
            .ok_or_else(|| BuildError::header_missing(bootstrap, key))
    }

    /// First section with the given name.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Parse a definition file.
    pub fn parse(text: &str) -> Result<Self> {
        let mut recipe = Recipe::default();
        let mut current: Option<Section> = None;

        for (lineno, raw) in text.lines().enumerate() {
            if let Some((name, args)) = section_start(raw) {
                if let Some(done) = current.take() {
                    recipe.sections.push(done);
                }
                current = Some(Section {
                    name,
                    args,
                    script: String::new(),
                });
                continue;
            }

            if let Some(section) = current.as_mut() {
                section.script.push_str(raw);
                section.script.push('\n');
                continue;
            }

            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                BuildError::RecipeHeaderMalformed {
                    key: line.to_string(),
                    message: format!("line {} is not a 'Key: value' pair", lineno + 1),
                }
            })?;
            let key = key.trim().to_lowercase();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(BuildError::RecipeHeaderMalformed {
                    key,
                    message: format!("line {} has an invalid header key", lineno + 1),
                });
            }
            recipe.header.insert(key, value.trim().to_string());
        }

        if let Some(done) = current.take() {
            recipe.sections.push(done);
        }

        if recipe.header("bootstrap").is_none() {
            return Err(BuildError::header_missing("definition", "bootstrap"));
        }
        Ok(recipe)
    }

    /// Build a recipe from a `scheme:ref` URI, as when a build is started
    /// from an image reference instead of a definition file.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri.split_once(':').ok_or_else(|| {
            BuildError::RecipeHeaderMalformed {
                key: "from".to_string(),
                message: format!("'{}' is not a scheme:ref URI", uri),
            }
        })?;
        if !URI_BOOTSTRAPS.contains(&scheme) {
            return Err(BuildError::RecipeHeaderMalformed {
                key: "bootstrap".to_string(),
                message: format!("unsupported URI scheme '{}'", scheme),
            });
        }
        let from = rest.strip_prefix("//").unwrap_or(rest);
        if from.is_empty() {
            return Err(BuildError::header_missing(scheme, "from"));
        }
        Ok(Recipe::new(scheme).with_header("from", from))
    }
}

/// Recognize a `%name args` line that opens a section.
fn section_start(line: &str) -> Option<(String, String)> {
    let rest = line.trim_start().strip_prefix('%')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next()?.to_lowercase();
    if !SECTION_NAMES.contains(&name.as_str()) {
        return None;
    }
    let args = parts.next().unwrap_or("").trim().to_string();
    Some((name, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEF: &str = "\
# comment
Bootstrap: docker
From: alpine:3.19
Registry: ghcr.io

%post
    echo building %{not-a-section}
    apk add curl

%runscript
    exec curl \"$@\"

%apprun tool
    exec tool
";

    #[test]
    fn test_parse_header() {
        let recipe = Recipe::parse(DEF).unwrap();
        assert_eq!(recipe.bootstrap().as_deref(), Some("docker"));
        assert_eq!(recipe.header("from"), Some("alpine:3.19"));
        assert_eq!(recipe.header("registry"), Some("ghcr.io"));
        assert_eq!(recipe.header("namespace"), None);
    }

    #[test]
    fn test_parse_sections_in_order() {
        let recipe = Recipe::parse(DEF).unwrap();
        let names: Vec<&str> = recipe.sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["post", "runscript", "apprun"]);
        assert!(recipe.section("post").unwrap().script.contains("apk add curl"));
        assert!(recipe
            .section("post")
            .unwrap()
            .script
            .contains("%{not-a-section}"));
        assert_eq!(recipe.section("apprun").unwrap().args, "tool");
    }

    #[test]
    fn test_parse_missing_bootstrap() {
        let err = Recipe::parse("From: alpine\n").unwrap_err();
        assert!(matches!(err, BuildError::RecipeHeaderMissing { .. }));
    }

    #[test]
    fn test_parse_malformed_header() {
        let err = Recipe::parse("Bootstrap docker\n").unwrap_err();
        assert!(matches!(err, BuildError::RecipeHeaderMalformed { .. }));
    }

    #[test]
    fn test_header_value_with_colon() {
        let recipe = Recipe::parse("Bootstrap: yum\nMirrorURL: http://mirror/%{OSVERSION}/\n")
            .unwrap();
        assert_eq!(recipe.header("mirrorurl"), Some("http://mirror/%{OSVERSION}/"));
    }

    #[test]
    fn test_require_header() {
        let recipe = Recipe::new("busybox");
        let err = recipe.require_header("busybox", "mirrorurl").unwrap_err();
        assert_eq!(err.to_string(), "invalid busybox header, no mirrorurl specified");

        let recipe = recipe.with_header("MirrorURL", "https://example/busybox");
        assert_eq!(
            recipe.require_header("busybox", "mirrorurl").unwrap(),
            "https://example/busybox"
        );
    }

    #[test]
    fn test_blank_header_is_absent() {
        let recipe = Recipe::new("docker").with_header("from", "   ");
        assert_eq!(recipe.header("from"), None);
    }

    #[test]
    fn test_from_uri() {
        let recipe = Recipe::from_uri("docker://busybox:latest").unwrap();
        assert_eq!(recipe.bootstrap().as_deref(), Some("docker"));
        assert_eq!(recipe.header("from"), Some("busybox:latest"));

        let recipe = Recipe::from_uri("oci-archive:/tmp/image.tar").unwrap();
        assert_eq!(recipe.bootstrap().as_deref(), Some("oci-archive"));
        assert_eq!(recipe.header("from"), Some("/tmp/image.tar"));
    }

    #[test]
    fn test_from_uri_rejects_unknown_scheme() {
        assert!(Recipe::from_uri("ftp://host/image").is_err());
        assert!(Recipe::from_uri("busybox").is_err());
        assert!(Recipe::from_uri("docker://").is_err());
    }
}
