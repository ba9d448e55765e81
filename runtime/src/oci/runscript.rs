//! Metadata synthesized for OCI-origin images: the runscript encoding
//! ENTRYPOINT and CMD, the environment export script, labels and the raw
//! OCI config.

use std::collections::BTreeMap;

use sbuild_core::error::Result;
use serde::Serialize;

use super::image::OciImage;
use crate::bundle::{Bundle, OCI_CONFIG_JSON};
use crate::rootfs::{make_file, DOCKER_ENV_PATH, LABELS_PATH, RUNSCRIPT_PATH};

/// Dispatch appended after the `OCI_ENTRYPOINT` / `OCI_CMD` assignments.
///
/// With `SINGULARITY_NO_EVAL` set, arguments are prepended to `$@` and run
/// as-is. Otherwise the command line is assembled as one string and
/// evaluated by the shell first.
const NO_EVAL_HEAD: &str = r#"
# When SINGULARITY_NO_EVAL set, use OCI compatible behavior that does
# not evaluate resolved CMD / ENTRYPOINT / ARGS through the shell, and
# does not modify expected quoting behavior of args.
if [ -n "$SINGULARITY_NO_EVAL" ]; then
"#;

const EVAL_BODY: &str = r#"
# Standard behavior evaluates CMD / ENTRYPOINT / ARGS combination
# through shell before exec, and requires special quoting due to
# concatenation of CMDLINE_ARGS.
CMDLINE_ARGS=""
for arg in "$@"; do
    CMDLINE_ARGS="${CMDLINE_ARGS} \"$arg\""
done

if [ -z "$OCI_CMD" ] && [ -n "$OCI_ENTRYPOINT" ]; then
    # ENTRYPOINT only - run entrypoint plus args
    if [ $# -gt 0 ]; then
        SINGULARITY_OCI_RUN="${OCI_ENTRYPOINT} ${CMDLINE_ARGS}"
    else
        SINGULARITY_OCI_RUN="${OCI_ENTRYPOINT}"
    fi
elif [ -n "$OCI_CMD" ] && [ -z "$OCI_ENTRYPOINT" ]; then
    # CMD only - run CMD or override with args
    if [ $# -gt 0 ]; then
        SINGULARITY_OCI_RUN="${CMDLINE_ARGS}"
    else
        SINGULARITY_OCI_RUN="${OCI_CMD}"
    fi
else
    # ENTRYPOINT and CMD - run ENTRYPOINT with CMD as default args,
    # overridden by user provided args
    if [ $# -gt 0 ]; then
        SINGULARITY_OCI_RUN="${OCI_ENTRYPOINT} ${CMDLINE_ARGS}"
    else
        SINGULARITY_OCI_RUN="${OCI_ENTRYPOINT} ${OCI_CMD}"
    fi
fi

# Evaluate shell expressions first and set arguments accordingly,
# then execute final command as first container process
eval "set -- ${SINGULARITY_OCI_RUN}"
exec "$@"
"#;

/// Escape `\`, `"`, `` ` `` and `$` for use inside double quotes.
pub fn shell_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '"' | '`' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape single quotes for use inside a single-quoted string.
pub fn escape_single_quotes(s: &str) -> String {
    s.replace('\'', r#"'"'"'"#)
}

/// Each argument double-quoted and escaped, joined by spaces.
pub fn args_quoted(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("\"{}\"", shell_escape(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shell lines prepending `args` to `$@`, last argument first.
fn prepend_lines(args: &[String], indent: &str) -> String {
    args.iter()
        .rev()
        .map(|a| format!("{}set -- '{}' \"$@\"\n", indent, escape_single_quotes(a)))
        .collect()
}

/// Runscript for an image with the given ENTRYPOINT and CMD.
pub fn runscript(entrypoint: &[String], cmd: &[String]) -> String {
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&format!(
        "OCI_ENTRYPOINT='{}'\n",
        escape_single_quotes(&args_quoted(entrypoint))
    ));
    script.push_str(&format!("OCI_CMD='{}'\n", escape_single_quotes(&args_quoted(cmd))));

    let prepend_ep = prepend_lines(entrypoint, "        ");
    let prepend_cmd = prepend_lines(cmd, "            ");

    script.push_str(NO_EVAL_HEAD);
    script.push_str("    # ENTRYPOINT only - run entrypoint plus args\n");
    script.push_str("    if [ -z \"$OCI_CMD\" ] && [ -n \"$OCI_ENTRYPOINT\" ]; then\n");
    script.push_str(&prepend_ep);
    script.push_str("        exec \"$@\"\n    fi\n\n");

    script.push_str("    # CMD only - run CMD or override with args\n");
    script.push_str("    if [ -n \"$OCI_CMD\" ] && [ -z \"$OCI_ENTRYPOINT\" ]; then\n");
    if !cmd.is_empty() {
        script.push_str("        if [ $# -eq 0 ]; then\n");
        script.push_str(&prepend_cmd);
        script.push_str("        fi\n");
    }
    script.push_str("        exec \"$@\"\n    fi\n\n");

    script.push_str("    # ENTRYPOINT and CMD - run ENTRYPOINT with CMD as default args,\n");
    script.push_str("    # overridden by user provided args\n");
    if !entrypoint.is_empty() {
        script.push_str("    if [ $# -gt 0 ]; then\n");
        script.push_str(&prepend_lines(entrypoint, "        "));
        script.push_str("    else\n");
        script.push_str(&prepend_lines(cmd, "        "));
        script.push_str(&prepend_lines(entrypoint, "        "));
        script.push_str("    fi\n");
    } else if !cmd.is_empty() {
        script.push_str("    if [ $# -eq 0 ]; then\n");
        script.push_str(&prepend_lines(cmd, "        "));
        script.push_str("    fi\n");
    }
    script.push_str("    exec \"$@\"\nfi\n");
    script.push_str(EVAL_BODY);
    script
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Export script for an image's `KEY=VALUE` environment.
///
/// Values are defaults: a variable already set at runtime wins, except
/// `PATH`, which is always set. Invalid keys are skipped.
pub fn env_script(env: &[String]) -> String {
    let mut script = String::from("#!/bin/sh\n");
    for entry in env {
        let (key, value) = match entry.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (entry.as_str(), None),
        };
        if !is_valid_env_key(key) {
            tracing::debug!(entry = %entry, "Skipping environment entry with invalid name");
            continue;
        }
        let line = match value {
            None => format!("export {0}=\"${{{0}:-}}\"\n", key),
            Some(v) if key == "PATH" => format!("export PATH=\"{}\"\n", shell_escape(v)),
            Some(v) => format!("export {0}=\"${{{0}:-{1}}}\"\n", key, shell_escape(v)),
        };
        script.push_str(&line);
    }
    script
}

/// Labels serialized as tab-indented JSON.
pub fn labels_json(labels: &BTreeMap<String, String>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    labels.serialize(&mut ser)?;
    Ok(out)
}

/// Write the runscript, environment script, OCI config and labels for
/// `image` into `bundle`, in that order.
pub fn insert_oci_metadata(bundle: &mut Bundle, image: &OciImage) -> Result<()> {
    let rootfs = bundle.rootfs_path.clone();

    let script = runscript(&image.entrypoint(), &image.cmd());
    make_file(&rootfs.join(RUNSCRIPT_PATH), 0o755, script.as_bytes(), true)?;

    let env = env_script(&image.env());
    make_file(&rootfs.join(DOCKER_ENV_PATH), 0o755, env.as_bytes(), true)?;

    let config = match image.config_file().config() {
        Some(config) => serde_json::to_vec(config)?,
        None => b"{}".to_vec(),
    };
    bundle.json_objects.insert(OCI_CONFIG_JSON.to_string(), config);

    let labels = labels_json(&image.labels())?;
    make_file(&rootfs.join(LABELS_PATH), 0o644, &labels, true)?;

    tracing::debug!(rootfs = %rootfs.display(), "Inserted OCI metadata");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    /// Run `script` with `args` and return the argv the final exec sees.
    fn exec_argv(script: &str, args: &[&str], no_eval: bool) -> Vec<String> {
        // Replace the final exec so the script prints its argv instead.
        let probe = script.replace("exec \"$@\"", "printf '%s\\n' \"$@\"; exit 0");
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(probe).arg("runscript").args(args);
        cmd.env_remove("SINGULARITY_NO_EVAL");
        if no_eval {
            cmd.env("SINGULARITY_NO_EVAL", "1");
        }
        let out = cmd.output().unwrap();
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        String::from_utf8(out.stdout)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_runscript_header() {
        let script = runscript(&[], &strings(&["sh"]));
        assert!(script.starts_with("#!/bin/sh\nOCI_ENTRYPOINT=''\nOCI_CMD='\"sh\"'\n"));
    }

    #[test]
    fn test_single_quotes_are_escaped() {
        let script = runscript(&strings(&["echo", "it's"]), &[]);
        assert!(script.contains(r#"OCI_ENTRYPOINT='"echo" "it'"'"'s"'"#));
    }

    #[test]
    fn test_no_eval_semantics() {
        let ep = strings(&["/entry", "--flag"]);
        let cmd = strings(&["default", "arg"]);

        let both = runscript(&ep, &cmd);
        assert_eq!(exec_argv(&both, &[], true), vec!["/entry", "--flag", "default", "arg"]);
        assert_eq!(exec_argv(&both, &["user"], true), vec!["/entry", "--flag", "user"]);

        let ep_only = runscript(&ep, &[]);
        assert_eq!(exec_argv(&ep_only, &["a b"], true), vec!["/entry", "--flag", "a b"]);

        let cmd_only = runscript(&[], &cmd);
        assert_eq!(exec_argv(&cmd_only, &[], true), vec!["default", "arg"]);
        assert_eq!(exec_argv(&cmd_only, &["x"], true), vec!["x"]);
    }

    #[test]
    fn test_eval_semantics() {
        let ep = strings(&["/entry"]);
        let cmd = strings(&["a b", "c"]);

        let both = runscript(&ep, &cmd);
        assert_eq!(exec_argv(&both, &[], false), vec!["/entry", "a b", "c"]);
        assert_eq!(exec_argv(&both, &["x y"], false), vec!["/entry", "x y"]);

        let cmd_only = runscript(&[], &cmd);
        assert_eq!(exec_argv(&cmd_only, &[], false), vec!["a b", "c"]);
        assert_eq!(exec_argv(&cmd_only, &["z"], false), vec!["z"]);
    }

    #[test]
    fn test_env_script() {
        let script = env_script(&strings(&[
            "PATH=/usr/local/bin:/usr/bin",
            "GREETING=hello \"world\" $HOME",
            "EMPTY",
            "1BAD=x",
            "ALSO-BAD=y",
        ]));
        assert_eq!(
            script,
            "#!/bin/sh\n\
             export PATH=\"/usr/local/bin:/usr/bin\"\n\
             export GREETING=\"${GREETING:-hello \\\"world\\\" \\$HOME}\"\n\
             export EMPTY=\"${EMPTY:-}\"\n"
        );
    }

    #[test]
    fn test_env_script_values_survive_shell() {
        let script = env_script(&strings(&["GREETING=hello \"world\" $HOME `x`"]));
        let out = Command::new("/bin/sh")
            .arg("-c")
            .arg(format!("{}\nprintf '%s' \"$GREETING\"", script))
            .env_remove("GREETING")
            .output()
            .unwrap();
        assert_eq!(String::from_utf8(out.stdout).unwrap(), "hello \"world\" $HOME `x`");
    }

    #[test]
    fn test_labels_json() {
        assert_eq!(labels_json(&BTreeMap::new()).unwrap(), b"{}");
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        labels.insert("b".to_string(), "2".to_string());
        assert_eq!(
            String::from_utf8(labels_json(&labels).unwrap()).unwrap(),
            "{\n\t\"a\": \"1\",\n\t\"b\": \"2\"\n}"
        );
    }
}
