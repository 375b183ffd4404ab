//! One-shot shell command execution inside the working root.

use crate::error::AgentError;
use crate::sandbox::PathSandbox;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Upper bound accepted for a per-request timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A piece of output in arrival order.
#[derive(Debug, Clone, Serialize)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<OutputChunk>>,
}

impl CommandOutput {
    fn failed(err: AgentError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    sandbox: PathSandbox,
    shell: String,
    default_timeout: Duration,
}

impl CommandRunner {
    pub fn new(sandbox: PathSandbox, shell: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            sandbox,
            shell: shell.into(),
            default_timeout,
        }
    }

    /// Run `command` to completion and return its aggregated output.
    ///
    /// Only an invalid working directory is an `Err`; spawn failures and
    /// timeouts come back as an unsuccessful [`CommandOutput`].
    pub async fn run_buffered(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, AgentError> {
        self.execute(command, cwd, timeout, None).await
    }

    /// Like [`run_buffered`](Self::run_buffered), but hands every chunk to
    /// `on_chunk` as it arrives and keeps the interleaved chunk list in
    /// [`CommandOutput::output`]. The same timeout applies.
    pub async fn run_streaming<F>(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
        on_chunk: F,
    ) -> Result<CommandOutput, AgentError>
    where
        F: FnMut(&OutputChunk) + Send,
    {
        self.execute(command, cwd, timeout, Some(Box::new(on_chunk)))
            .await
    }

    async fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
        mut on_chunk: Option<Box<dyn FnMut(&OutputChunk) + Send + '_>>,
    ) -> Result<CommandOutput, AgentError> {
        if command.trim().is_empty() {
            return Err(AgentError::InvalidRequest("command is empty".to_string()));
        }
        let dir = self.sandbox.resolve_or_root(cwd)?;
        let timeout = timeout.unwrap_or(self.default_timeout).min(MAX_TIMEOUT);

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(command, error = %err, "failed to spawn command");
                return Ok(CommandOutput::failed(AgentError::SpawnFailure(
                    err.to_string(),
                )));
            }
        };
        let pid = child.id();
        info!(command, pid = ?pid, cwd = %self.sandbox.relative(&dir), "running command");

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut chunks = on_chunk.as_ref().map(|_| Vec::new());

        let collect = async {
            while let Some((stream, bytes)) = rx.recv().await {
                if let Some(chunks) = chunks.as_mut() {
                    let chunk = OutputChunk {
                        stream,
                        data: String::from_utf8_lossy(&bytes).into_owned(),
                    };
                    if let Some(callback) = on_chunk.as_mut() {
                        callback(&chunk);
                    }
                    chunks.push(chunk);
                }
                match stream {
                    StreamKind::Stdout => stdout.extend_from_slice(&bytes),
                    StreamKind::Stderr => stderr.extend_from_slice(&bytes),
                }
            }
            child.wait().await
        };

        let outcome = tokio::time::timeout(timeout, collect).await;
        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                return Ok(CommandOutput::failed(AgentError::Internal(format!(
                    "waiting for command: {err}"
                ))));
            }
            Err(_) => {
                warn!(
                    command,
                    pid = ?pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "command timed out"
                );
                terminate(&mut child).await;
                let mut output = CommandOutput::failed(AgentError::Timeout(timeout));
                output.stdout = String::from_utf8_lossy(&stdout).into_owned();
                output.stderr = String::from_utf8_lossy(&stderr).into_owned();
                output.output = chunks;
                return Ok(output);
            }
        };

        let (exit_code, signal) = exit_parts(&status);
        info!(command, exit_code = ?exit_code, signal = ?signal, "command finished");
        Ok(CommandOutput {
            success: status.success(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            signal,
            error: None,
            output: chunks,
        })
    }
}

async fn pump<R>(
    mut reader: R,
    stream: StreamKind,
    tx: mpsc::UnboundedSender<(StreamKind, Vec<u8>)>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).is_err() {
                    break;
                }
            }
        }
    }
}

/// Kill the whole process group and reap the child.
async fn terminate(child: &mut Child) {
    kill_group(child.id());
    if let Err(err) = child.kill().await {
        warn!(error = %err, "failed to kill timed out command");
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn exit_parts(status: &std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn exit_parts(status: &std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}
