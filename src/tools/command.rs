//! Running untrusted external tooling (VCS clients, package-manager CLIs)

use crate::error::ToolError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// A fully described invocation of an external program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// `program arg1 arg2`, for logs
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion; a non-zero exit is an error
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError>;
}

/// Runs commands as child processes of the worker
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError> {
        debug!(command = %spec.display(), cwd = ?spec.cwd, "Running external command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let child = command.spawn().map_err(|e| ToolError::Spawn {
            program: spec.program.clone(),
            message: e.to_string(),
        })?;

        let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::Spawn {
                    program: spec.program.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    command = %spec.display(),
                    seconds = spec.timeout.as_secs(),
                    "External command timed out"
                );
                return Err(ToolError::Timeout {
                    program: spec.program.clone(),
                    seconds: spec.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let status = output.status.code().unwrap_or(-1);
            warn!(command = %spec.display(), status, "External command failed");
            debug!(command = %spec.display(), %stderr, "External command stderr");
            return Err(ToolError::Failed {
                program: spec.program.clone(),
                status,
                stderr,
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = CommandSpec::new("git", Duration::from_secs(5))
            .args(["fetch", "--depth", "1"])
            .arg("origin")
            .cwd("/tmp/repo")
            .env("GIT_TERMINAL_PROMPT", "0");

        assert_eq!(spec.display(), "git fetch --depth 1 origin");
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp/repo")));
        assert_eq!(spec.env["GIT_TERMINAL_PROMPT"], "0");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_process_runner_captures_stdout() {
        let spec = CommandSpec::new("sh", Duration::from_secs(5)).args(["-c", "echo hello"]);
        let output = ProcessRunner.run(&spec).await.unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_process_runner_reports_failure() {
        let spec = CommandSpec::new("sh", Duration::from_secs(5)).args(["-c", "echo oops >&2; exit 3"]);
        match ProcessRunner.run(&spec).await.unwrap_err() {
            ToolError::Failed { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert!(stderr.contains("oops"));
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_process_runner_times_out() {
        let spec = CommandSpec::new("sh", Duration::from_millis(100)).args(["-c", "sleep 5"]);
        let err = ProcessRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_process_runner_missing_program() {
        let spec = CommandSpec::new("vendorbox-no-such-tool", Duration::from_secs(1));
        let err = ProcessRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
