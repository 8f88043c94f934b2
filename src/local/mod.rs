//! Local command execution.
//!
//! Runs a command through an interpreter on this machine, captures stdout
//! and stderr, and forwards output lines to the log according to the
//! command's [`Logging`] mode.

use anyhow::Context;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};

/// Which output streams are copied to the log while a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Logging {
    /// Capture stdout in logs but not stderr
    Stdout,
    /// Capture stderr in logs but not stdout
    Stderr,
    /// Capture stdout and stderr in logs
    #[default]
    StdoutAndStderr,
    /// Capture no logs
    None,
}

impl Logging {
    pub fn logs_stdout(self) -> bool {
        matches!(self, Logging::Stdout | Logging::StdoutAndStderr)
    }

    pub fn logs_stderr(self) -> bool {
        matches!(self, Logging::Stderr | Logging::StdoutAndStderr)
    }
}

/// A command run on the local machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCommand {
    /// Program and leading arguments; the command string is appended last.
    /// Defaults to `/bin/sh -c` (`cmd /C` on Windows).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Added on top of the inherited environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
    pub create: String,
    /// Falls back to `create` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,
    /// Written to the command's stdin, which is otherwise closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Logging>,
}

/// Captured output of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Child pid followed by 8 random hex characters.
    pub id: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command exited with {}: {stderr}", exit_description(.code))]
    Failed {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

fn default_interpreter() -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".to_string(), "/C".to_string()]
    } else {
        vec!["/bin/sh".to_string(), "-c".to_string()]
    }
}

impl LocalCommand {
    pub fn new(create: impl Into<String>) -> Self {
        Self {
            interpreter: None,
            dir: None,
            environment: None,
            create: create.into(),
            update: None,
            delete: None,
            stdin: None,
            logging: None,
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("invalid local command")
    }

    pub async fn run_create(&self) -> anyhow::Result<CommandOutput> {
        self.run(&self.create).await
    }

    pub async fn run_update(&self) -> anyhow::Result<CommandOutput> {
        self.run(self.update.as_deref().unwrap_or(&self.create)).await
    }

    /// Returns `None` without running anything when no delete command is set.
    pub async fn run_delete(&self) -> anyhow::Result<Option<CommandOutput>> {
        match &self.delete {
            Some(command) => self.run(command).await.map(Some),
            None => Ok(None),
        }
    }

    fn argv(&self, command: &str) -> Vec<String> {
        let mut argv = match &self.interpreter {
            Some(interpreter) if !interpreter.is_empty() => interpreter.clone(),
            _ => default_interpreter(),
        };
        argv.push(command.to_string());
        argv
    }

    async fn run(&self, command: &str) -> anyhow::Result<CommandOutput> {
        let argv = self.argv(command);
        let (program, args) = argv
            .split_first()
            .context("interpreter is empty")?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        if let Some(environment) = &self.environment {
            cmd.envs(environment);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", program))?;
        let pid = child.id().unwrap_or_default();
        log::debug!("Started local command (pid {}): {}", pid, command);

        let stdout = child.stdout.take().context("stdout was not captured")?;
        let stderr = child.stderr.take().context("stderr was not captured")?;
        let stdin = child.stdin.take();
        let input = self.stdin.as_deref();
        let logging = self.logging.unwrap_or_default();

        let feed = async move {
            if let (Some(mut pipe), Some(input)) = (stdin, input) {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        let (stdout, stderr, fed, status) = tokio::join!(
            read_stream(stdout, logging.logs_stdout(), "stdout"),
            read_stream(stderr, logging.logs_stderr(), "stderr"),
            feed,
            child.wait(),
        );
        let status = status.context("failed to wait for command")?;
        let stdout = stdout.context("failed to read stdout")?;
        let stderr = stderr.context("failed to read stderr")?;
        if let Err(e) = fed {
            // The child may exit without reading its input.
            log::warn!("Writing stdin to pid {} failed: {}", pid, e);
        }

        if !status.success() {
            return Err(CommandError::Failed {
                code: status.code(),
                stdout,
                stderr,
            }
            .into());
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            id: unique_id(pid)?,
        })
    }
}

/// Collect a stream line by line, logging each line if asked to.
///
/// Bytes that are not valid UTF-8 become U+FFFD and carriage returns are
/// kept. Only the final trailing `\n` is dropped.
async fn read_stream<R>(reader: R, log_lines: bool, stream: &'static str) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut out = String::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let chunk = String::from_utf8_lossy(&buf);
        if log_lines {
            log::info!("[{}] {}", stream, chunk.trim_end_matches(['\r', '\n']));
        }
        out.push_str(&chunk);
    }
    if out.ends_with('\n') {
        out.pop();
    }
    Ok(out)
}

fn unique_id(pid: u32) -> anyhow::Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 4];
    rng.fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("RNG failed"))?;
    let suffix: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("{}{}", pid, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_streams() {
        assert!(Logging::Stdout.logs_stdout());
        assert!(!Logging::Stdout.logs_stderr());
        assert!(!Logging::Stderr.logs_stdout());
        assert!(Logging::Stderr.logs_stderr());
        assert!(Logging::StdoutAndStderr.logs_stdout() && Logging::StdoutAndStderr.logs_stderr());
        assert!(!Logging::None.logs_stdout() && !Logging::None.logs_stderr());
        assert_eq!(Logging::default(), Logging::StdoutAndStderr);
    }

    #[test]
    fn test_logging_json() {
        assert_eq!(
            serde_json::to_string(&Logging::StdoutAndStderr).unwrap(),
            "\"stdoutAndStderr\""
        );
        let parsed: Logging = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(parsed, Logging::None);
    }

    #[test]
    fn test_from_json() {
        let cmd = LocalCommand::from_json(
            r#"{"create": "echo hi", "environment": {"A": "1"}, "logging": "stderr"}"#,
        )
        .unwrap();
        assert_eq!(cmd.create, "echo hi");
        assert_eq!(cmd.logging, Some(Logging::Stderr));
        assert_eq!(cmd.environment.unwrap()["A"], "1");

        assert!(LocalCommand::from_json(r#"{"delete": "rm x"}"#).is_err());
    }

    #[test]
    fn test_argv() {
        let mut cmd = LocalCommand::new("ls -la");
        assert_eq!(cmd.argv("ls -la").last().unwrap(), "ls -la");
        assert_eq!(cmd.argv("ls -la").len(), 3);

        cmd.interpreter = Some(vec!["/usr/bin/env".into(), "bash".into(), "-c".into()]);
        assert_eq!(cmd.argv("ls"), ["/usr/bin/env", "bash", "-c", "ls"]);

        cmd.interpreter = Some(Vec::new());
        assert_eq!(cmd.argv("ls"), [default_interpreter(), vec!["ls".to_string()]].concat());
    }

    #[test]
    fn test_unique_id() {
        let a = unique_id(4242).unwrap();
        let b = unique_id(4242).unwrap();
        assert!(a.starts_with("4242"));
        assert_eq!(a.len(), 4 + 8);
        assert!(a[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_create_captures_output() {
        let out = LocalCommand::new("echo hello; echo oops 1>&2")
            .run_create()
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr, "oops");
        assert!(out.id.len() > 8);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_multiline_output() {
        let out = LocalCommand::new("printf 'a\\nb\\n'").run_create().await.unwrap();
        assert_eq!(out.stdout, "a\nb");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_output_is_replaced() {
        let out = LocalCommand::new("printf 'ok\\377\\n'").run_create().await.unwrap();
        assert_eq!(out.stdout, "ok\u{FFFD}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_carriage_returns_kept() {
        let out = LocalCommand::new("printf 'a\\r\\nb\\r\\n'").run_create().await.unwrap();
        assert_eq!(out.stdout, "a\r\nb\r");

        let out = LocalCommand::new("printf 'no newline'").run_create().await.unwrap();
        assert_eq!(out.stdout, "no newline");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_environment_and_dir() {
        let mut cmd = LocalCommand::new("echo \"$REXEC_TEST_VAR\"; pwd");
        cmd.environment = Some(HashMap::from([(
            "REXEC_TEST_VAR".to_string(),
            "from-env".to_string(),
        )]));
        cmd.dir = Some("/".to_string());
        cmd.logging = Some(Logging::None);

        let out = cmd.run_create().await.unwrap();
        assert_eq!(out.stdout, "from-env\n/");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_is_fed() {
        let mut cmd = LocalCommand::new("cat");
        cmd.stdin = Some("piped input".to_string());
        let out = cmd.run_create().await.unwrap();
        assert_eq!(out.stdout, "piped input");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_carries_status() {
        let err = LocalCommand::new("echo bad 1>&2; exit 3")
            .run_create()
            .await
            .unwrap_err();
        match err.downcast_ref::<CommandError>() {
            Some(CommandError::Failed { code, stderr, .. }) => {
                assert_eq!(*code, Some(3));
                assert_eq!(stderr, "bad");
            }
            None => panic!("unexpected error: {err}"),
        }
        assert!(err.to_string().contains("status 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_update_and_delete() {
        let mut cmd = LocalCommand::new("echo created");
        assert_eq!(cmd.run_update().await.unwrap().stdout, "created");
        assert!(cmd.run_delete().await.unwrap().is_none());

        cmd.update = Some("echo updated".to_string());
        cmd.delete = Some("echo deleted".to_string());
        assert_eq!(cmd.run_update().await.unwrap().stdout, "updated");
        assert_eq!(cmd.run_delete().await.unwrap().unwrap().stdout, "deleted");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_interpreter() {
        let mut cmd = LocalCommand::new("anything");
        cmd.interpreter = Some(vec!["/nonexistent/interpreter".to_string()]);
        assert!(cmd.run_create().await.is_err());
    }
}
