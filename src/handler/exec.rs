//! Subprocess handler transport.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::Handler;
use crate::config::ExecHandlerConfig;
use crate::error::{Error, Result};

/// How much trailing stderr to carry in an exit error.
const STDERR_TAIL_BYTES: usize = 2048;

/// Launches the configured command per invocation, feeds the request on
/// stdin and reads the response from stdout until EOF.
pub struct ExecHandler {
    config: ExecHandlerConfig,
}

impl ExecHandler {
    /// Create a handler for the given command configuration.
    pub fn new(config: ExecHandlerConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.config.working_dir.is_empty() {
            cmd.current_dir(&self.config.working_dir);
        }
        // Detach from our process group so the whole handler tree dies
        // together on timeout, not with the runtime's signals.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl Handler for ExecHandler {
    async fn invoke(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to launch '{}': {e}", self.config.command)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("handler stdin unavailable".into()))?;
        stdin.write_all(request).await?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("handler stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Transport("handler stderr unavailable".into()))?;

        let stderr_task = tokio::spawn(collect_stderr(
            stderr,
            self.config.debug,
            self.config.command.clone(),
        ));

        #[cfg(unix)]
        let child_pid = child.id();

        let work = async move {
            let mut output = Vec::new();
            let mut stdout = stdout;
            stdout.read_to_end(&mut output).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, output))
        };

        let (status, output) = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Err(_) => {
                    stderr_task.abort();
                    // kill_on_drop only signals the direct child; the
                    // handler runs in its own process group, so signal the
                    // group to take any grandchildren down with it.
                    #[cfg(unix)]
                    if let Some(pid) = child_pid {
                        unsafe {
                            libc::kill(-(pid as i32), libc::SIGKILL);
                        }
                    }
                    return Err(Error::HandlerTimeout(limit));
                }
                Ok(result) => result?,
            },
            None => work.await?,
        };

        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(Error::HandlerExit {
                command: self.config.command.clone(),
                status: status.code().unwrap_or(-1),
                stderr: tail(&stderr_text, STDERR_TAIL_BYTES),
            });
        }

        Ok(output)
    }
}

async fn collect_stderr(
    stderr: tokio::process::ChildStderr,
    stream_to_log: bool,
    command: String,
) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut collected = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if stream_to_log {
            debug!(handler = %command, "{line}");
        }
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim_end();
    match trimmed.char_indices().rev().nth(max.saturating_sub(1)) {
        Some((idx, _)) => trimmed[idx..].to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn config(command: &str, args: &[&str]) -> ExecHandlerConfig {
        ExecHandlerConfig {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..ExecHandlerConfig::default()
        }
    }

    #[tokio::test]
    async fn echoes_stdin_to_stdout() {
        let handler = ExecHandler::new(config("/bin/cat", &[]));
        let out = handler.invoke(b"{\"object\":{}}").await.unwrap();
        assert_eq!(out, b"{\"object\":{}}");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let handler = ExecHandler::new(config(
            "/bin/sh",
            &["-c", "echo boom >&2; exit 3"],
        ));
        let err = handler.invoke(b"{}").await.unwrap_err();
        match err {
            Error::HandlerExit { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Gone, or a zombie waiting on its reaper.
    fn process_dead(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_handler_and_its_children() {
        // The handler forks a grandchild; the timeout kill must take down
        // the whole process group, not just the shell.
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("grandchild.pid");

        let mut cfg = config("/bin/sh", &["-c", "sleep 60 & echo $! > \"$PIDFILE\"; wait"]);
        cfg.env = BTreeMap::from([("PIDFILE".to_string(), pidfile.display().to_string())]);
        cfg.timeout = Some(Duration::from_millis(300));
        let handler = ExecHandler::new(cfg);

        let start = std::time::Instant::now();
        let err = handler.invoke(b"{}").await.unwrap_err();
        assert!(matches!(err, Error::HandlerTimeout(_)));
        assert!(start.elapsed() < Duration::from_secs(5));

        let pid: i32 = std::fs::read_to_string(&pidfile)
            .expect("handler wrote the grandchild pid before the timeout")
            .trim()
            .parse()
            .unwrap();
        let mut dead = false;
        for _ in 0..40 {
            dead = process_dead(pid);
            if dead {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(dead, "grandchild {pid} survived the timeout kill");
    }

    #[tokio::test]
    async fn environment_reaches_the_handler() {
        let mut cfg = config("/bin/sh", &["-c", "printf '%s' \"$GREETING\""]);
        cfg.env = BTreeMap::from([("GREETING".to_string(), "hi".to_string())]);
        let handler = ExecHandler::new(cfg);
        let out = handler.invoke(b"").await.unwrap();
        assert_eq!(out, b"hi");
    }
}
