//! Logged external process execution.
//!
//! Thin wrapper around [`tokio::process::Command`] that logs every command
//! (with its extra environment) before running it, and maps non-zero exits
//! to a typed error so state handlers can match specific exit codes.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },
}

impl ExecError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::Failed { status, .. } => status.code(),
            ExecError::Io { .. } => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    /// Wrap `command` in `sudo`, preserving the given environment variables
    /// across the privilege boundary.
    pub fn sudo_command<S: AsRef<str>>(
        command: &[S],
        env: &HashMap<String, String>,
    ) -> Vec<String> {
        let mut wrapped = vec!["sudo".to_string()];
        if !env.is_empty() {
            let mut keys: Vec<&str> = env.keys().map(String::as_str).collect();
            keys.sort_unstable();
            wrapped.push(format!("--preserve-env={}", keys.join(",")));
        }
        wrapped.extend(command.iter().map(|part| part.as_ref().to_string()));
        wrapped
    }

    fn build<S: AsRef<str>>(&self, command: &[S], env: &HashMap<String, String>) -> Command {
        let parts: Vec<&str> = command.iter().map(AsRef::as_ref).collect();
        if env.is_empty() {
            info!("executing command: {parts:?}");
        } else {
            info!("executing command: {parts:?} with env {env:?}");
        }

        let mut cmd = Command::new(parts[0]);
        cmd.args(&parts[1..]);
        cmd.envs(env);
        cmd
    }

    /// Run to completion, erroring on a non-zero exit.
    pub async fn check_call<S: AsRef<str>>(
        &self,
        command: &[S],
        env: &HashMap<String, String>,
    ) -> Result<(), ExecError> {
        let program = command[0].as_ref().to_string();
        let status = self
            .build(command, env)
            .status()
            .await
            .map_err(|source| ExecError::Io {
                program: program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Failed { program, status })
        }
    }

    /// Run with `input` piped to stdin, erroring on a non-zero exit.
    pub async fn check_call_with_input<S: AsRef<str>>(
        &self,
        command: &[S],
        env: &HashMap<String, String>,
        input: &[u8],
    ) -> Result<(), ExecError> {
        let program = command[0].as_ref().to_string();
        let io_error = |source| ExecError::Io {
            program: program.clone(),
            source,
        };

        let mut child = self
            .build(command, env)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(io_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await.map_err(io_error)?;
        }

        let status = child.wait().await.map_err(io_error)?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Failed { program, status })
        }
    }

    /// Run to completion capturing stdout, erroring on a non-zero exit.
    pub async fn check_output<S: AsRef<str>>(
        &self,
        command: &[S],
        env: &HashMap<String, String>,
    ) -> Result<Vec<u8>, ExecError> {
        let program = command[0].as_ref().to_string();
        let output = self
            .build(command, env)
            .output()
            .await
            .map_err(|source| ExecError::Io {
                program: program.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(ExecError::Failed {
                program,
                status: output.status,
            })
        }
    }

    /// Spawn a long-running process with stdin closed and stdout/stderr
    /// appended to files, and wait for it to exit. The exit status is
    /// returned rather than mapped to an error so callers decide how to
    /// react to a failed run.
    pub async fn run_redirected<S: AsRef<str>>(
        &self,
        command: &[S],
        env: &HashMap<String, String>,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<ExitStatus, ExecError> {
        let program = command[0].as_ref().to_string();
        let io_error = |source| ExecError::Io {
            program: program.clone(),
            source,
        };

        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(stdout_path)
            .map_err(io_error)?;
        let stderr = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(stderr_path)
            .map_err(io_error)?;

        let mut child = self
            .build(command, env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(io_error)?;

        child.wait().await.map_err(io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn sudo_preserves_env_keys() {
        let wrapped = Executor::sudo_command(
            &["podman", "run", "alpine"],
            &env(&[("CONTAINERS_CONF", "/tmp/x"), ("A_FIRST", "1")]),
        );
        assert_eq!(
            wrapped,
            vec![
                "sudo",
                "--preserve-env=A_FIRST,CONTAINERS_CONF",
                "podman",
                "run",
                "alpine",
            ]
        );
    }

    #[test]
    fn sudo_without_env_adds_no_preserve_flag() {
        let wrapped = Executor::sudo_command(&["mount", "-t", "tmpfs"], &HashMap::new());
        assert_eq!(wrapped, vec!["sudo", "mount", "-t", "tmpfs"]);
    }

    #[tokio::test]
    async fn check_output_captures_stdout() {
        let output = Executor::new()
            .check_output(&["echo", "hello"], &HashMap::new())
            .await
            .unwrap();
        assert_eq!(String::from_utf8(output).unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn check_call_surfaces_the_exit_code() {
        let error = Executor::new()
            .check_call(&["sh", "-c", "exit 125"], &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(error.exit_code(), Some(125));
    }

    #[tokio::test]
    async fn check_call_with_input_feeds_stdin() {
        Executor::new()
            .check_call_with_input(
                &["sh", "-c", "grep -q needle"],
                &HashMap::new(),
                b"hay needle stack",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn run_redirected_appends_to_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let stdout_path = dir.path().join("out.log");
        let stderr_path = dir.path().join("err.log");

        let status = Executor::new()
            .run_redirected(
                &["sh", "-c", "echo to-stdout; echo to-stderr >&2"],
                &HashMap::new(),
                &stdout_path,
                &stderr_path,
            )
            .await
            .unwrap();

        assert!(status.success());
        assert!(
            std::fs::read_to_string(&stdout_path)
                .unwrap()
                .contains("to-stdout")
        );
        assert!(
            std::fs::read_to_string(&stderr_path)
                .unwrap()
                .contains("to-stderr")
        );
    }
}
