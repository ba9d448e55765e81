//! Host tool invocation.
//!
//! Every external program (package managers, buildctl, unsquashfs, ...) is
//! run through [`Tool`]: the child is tied to the build's cancellation
//! token, its output is streamed line by line to the log, and stderr is kept
//! so failures can report it. Tool-specific behavior is expressed as an
//! argument list plus an exit-code interpreter.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use sbuild_core::error::{BuildError, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Number of trailing stderr lines kept for error reports.
const STDERR_TAIL: usize = 20;

/// Locate a program on `PATH`.
pub fn find_tool(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| BuildError::ToolMissing(name.to_string()))
}

/// How a finished process should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDisposition {
    Success,
    /// Finished with a problem worth logging but not failing for
    Warn(String),
    Fail,
}

/// Exit code 0 is success, anything else fails.
pub fn strict_exit(code: i32) -> ExitDisposition {
    if code == 0 {
        ExitDisposition::Success
    } else {
        ExitDisposition::Fail
    }
}

/// Output of a finished tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code, or -1 when killed by a signal
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    /// Stdout as trimmed text.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// An external program invocation.
#[derive(Debug, Clone)]
pub struct Tool {
    name: String,
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
    capture_stdout: bool,
}

impl Tool {
    /// Resolve `name` on `PATH`.
    pub fn find(name: &str) -> Result<Self> {
        Ok(Self::new(name, find_tool(name)?))
    }

    /// Use an explicit program path.
    pub fn new(name: &str, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            capture_stdout: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Keep stdout for the caller instead of logging it.
    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Argument list, for logging and tests.
    pub fn argv(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Run to completion; a non-zero exit fails.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ToolOutput> {
        self.run_with(cancel, strict_exit).await
    }

    /// Run to completion, interpreting the exit code with `interpret`.
    pub async fn run_with(
        &self,
        cancel: &CancellationToken,
        interpret: impl Fn(i32) -> ExitDisposition,
    ) -> Result<ToolOutput> {
        let output = self.spawn_and_wait(cancel).await?;
        match interpret(output.code) {
            ExitDisposition::Success => Ok(output),
            ExitDisposition::Warn(message) => {
                tracing::warn!(tool = %self.name, code = output.code, "{}", message);
                Ok(output)
            }
            ExitDisposition::Fail => Err(BuildError::ToolFailed {
                tool: self.name.clone(),
                code: output.code,
                stderr: output.stderr.clone(),
            }),
        }
    }

    async fn spawn_and_wait(&self, cancel: &CancellationToken) -> Result<ToolOutput> {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        tracing::debug!(tool = %self.name, program = %self.program.display(), args = ?self.argv(), "Running host tool");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BuildError::ToolMissing(self.name.clone())
            } else {
                BuildError::Other(format!(
                    "Failed to start {} ({}): {}",
                    self.name,
                    self.program.display(),
                    e
                ))
            }
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(drain(
            stdout,
            self.name.clone(),
            "stdout",
            self.capture_stdout,
        ));
        let stderr_task = tokio::spawn(drain(stderr, self.name.clone(), "stderr", false));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                BuildError::Other(format!("Failed to wait for {}: {}", self.name, e))
            })?,
            _ = cancel.cancelled() => {
                tracing::warn!(tool = %self.name, "Build cancelled, killing host tool");
                let _ = child.kill().await;
                return Err(BuildError::Cancelled);
            }
        };

        let stdout_lines = stdout_task
            .await
            .map_err(|e| BuildError::Other(format!("stdout reader for {} failed: {}", self.name, e)))?;
        let stderr_lines = stderr_task
            .await
            .map_err(|e| BuildError::Other(format!("stderr reader for {} failed: {}", self.name, e)))?;

        let stderr_tail = stderr_lines
            .iter()
            .skip(stderr_lines.len().saturating_sub(STDERR_TAIL))
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutput {
            code: status.code().unwrap_or(-1),
            stdout: stdout_lines.join("\n").into_bytes(),
            stderr: stderr_tail,
        })
    }
}

/// Read a child stream line by line, logging each line unless `quiet`.
async fn drain<R>(stream: Option<R>, tool: String, channel: &'static str, quiet: bool) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = Vec::new();
    let Some(stream) = stream else {
        return lines;
    };
    let mut reader = BufReader::new(stream).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if quiet {
            tracing::trace!(tool = %tool, stream = channel, "{}", line);
        } else if channel == "stderr" {
            tracing::warn!(tool = %tool, stream = channel, "{}", line);
        } else {
            tracing::info!(tool = %tool, stream = channel, "{}", line);
        }
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_tool_missing() {
        let err = find_tool("definitely-not-a-real-tool-xyz").unwrap_err();
        assert!(matches!(err, BuildError::ToolMissing(ref t) if t == "definitely-not-a-real-tool-xyz"));
        assert_eq!(err.to_string(), "definitely-not-a-real-tool-xyz is not in PATH");
    }

    #[test]
    fn test_argv() {
        let tool = Tool::new("dnf", "/usr/bin/dnf").args(["-y", "install"]).arg("bash");
        assert_eq!(tool.argv(), vec!["-y", "install", "bash"]);
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let cancel = CancellationToken::new();
        let out = Tool::new("sh", "/bin/sh")
            .args(["-c", "echo hello; echo world"])
            .capture_stdout()
            .run(&cancel)
            .await
            .unwrap();
        assert_eq!(out.code, 0);
        assert_eq!(out.stdout_text(), "hello\nworld");
    }

    #[tokio::test]
    async fn test_failure_keeps_stderr() {
        let cancel = CancellationToken::new();
        let err = Tool::new("sh", "/bin/sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .run(&cancel)
            .await
            .unwrap_err();
        match err {
            BuildError::ToolFailed { tool, code, stderr } => {
                assert_eq!(tool, "sh");
                assert_eq!(code, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_exit_interpreter_downgrades() {
        let cancel = CancellationToken::new();
        let out = Tool::new("sh", "/bin/sh")
            .args(["-c", "exit 107"])
            .run_with(&cancel, |code| match code {
                0 => ExitDisposition::Success,
                107 => ExitDisposition::Warn("scripts failed".to_string()),
                _ => ExitDisposition::Fail,
            })
            .await
            .unwrap();
        assert_eq!(out.code, 107);
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let out = Tool::new("sh", "/bin/sh")
            .args(["-c", "echo $GREETING; pwd"])
            .env("GREETING", "hi")
            .current_dir(tmp.path())
            .capture_stdout()
            .run(&cancel)
            .await
            .unwrap();
        let text = out.stdout_text();
        assert!(text.starts_with("hi\n"));
        assert!(text.ends_with(&tmp.path().canonicalize().unwrap().display().to_string()));
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = Tool::new("sleep", "/bin/sh")
            .args(["-c", "sleep 30"])
            .run(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let cancel = CancellationToken::new();
        let err = Tool::new("ghost", "/nonexistent/ghost")
            .run(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::ToolMissing(_)));
    }
}
