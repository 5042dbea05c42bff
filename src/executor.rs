//! Execution units that run the conversion capability for a worker slot.
//!
//! The capability has no cancellation hook, so stopping a running
//! conversion means killing whatever runs it. [`ProcessExecutor`] keeps a
//! long-lived child process (the hidden `child` subcommand) that converts
//! one request per line, is killed on stop, and is recycled after a fixed
//! number of jobs. [`InlineExecutor`] runs the capability on a blocking
//! thread; a stopped conversion keeps running in the background until it
//! returns, so it is meant for embedding and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write as _};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::converter::Converter;

/// Subcommand that starts the conversion child loop.
pub const CHILD_SUBCOMMAND: &str = "child";

/// Grace period for a recycled child to exit on its own.
const RECYCLE_GRACE: Duration = Duration::from_secs(5);

/// How one execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The capability returned; `Err` carries its diagnostic message.
    Finished(Result<(), String>),
    /// Stopped through the token before the capability returned.
    Stopped,
    /// The execution unit itself failed.
    Crashed(String),
}

#[async_trait]
pub trait Executor: Send {
    /// Runs one conversion. Cancelling `stop` terminates it.
    async fn run(&mut self, input: &Path, output: &Path, stop: &CancellationToken) -> ExecOutcome;

    /// Releases any resources held between jobs.
    async fn terminate(&mut self);
}

#[derive(Debug, Serialize, Deserialize)]
struct ChildRequest {
    input: PathBuf,
    output: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChildResponse {
    success: bool,
    error: Option<String>,
}

struct ChildHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    completed: u32,
}

impl ChildHandle {
    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "Failed to kill conversion process");
        }
    }

    async fn retire(self) {
        let ChildHandle { mut child, stdin, .. } = self;
        drop(stdin);
        match tokio::time::timeout(RECYCLE_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Conversion process exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to reap conversion process"),
            Err(_) => {
                warn!("Conversion process did not exit, killing it");
                let _ = child.kill().await;
            }
        }
    }
}

/// Runs conversions in a recycled child process.
pub struct ProcessExecutor {
    program: PathBuf,
    max_tasks_per_child: u32,
    child: Option<ChildHandle>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, max_tasks_per_child: u32) -> Self {
        Self {
            program: program.into(),
            max_tasks_per_child: max_tasks_per_child.max(1),
            child: None,
        }
    }

    /// Uses the running binary as the child program.
    pub fn current_exe(max_tasks_per_child: u32) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, max_tasks_per_child))
    }

    /// Process id of the current child, if one is running.
    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|h| h.child.id())
    }

    fn spawn_child(&self) -> std::io::Result<ChildHandle> {
        let mut child = Command::new(&self.program)
            .arg(CHILD_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout unavailable"))?;

        debug!(pid = ?child.id(), "Started conversion process");
        Ok(ChildHandle {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            completed: 0,
        })
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn run(&mut self, input: &Path, output: &Path, stop: &CancellationToken) -> ExecOutcome {
        let mut handle = match self.child.take() {
            Some(handle) => handle,
            None => match self.spawn_child() {
                Ok(handle) => handle,
                Err(e) => return ExecOutcome::Crashed(format!("failed to start conversion process: {e}")),
            },
        };

        let request = ChildRequest {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
        };
        let mut line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => return ExecOutcome::Crashed(format!("failed to encode request: {e}")),
        };
        line.push('\n');

        if let Err(e) = handle.stdin.write_all(line.as_bytes()).await {
            handle.kill().await;
            return ExecOutcome::Crashed(format!("conversion process unavailable: {e}"));
        }
        if let Err(e) = handle.stdin.flush().await {
            handle.kill().await;
            return ExecOutcome::Crashed(format!("conversion process unavailable: {e}"));
        }

        let reply = tokio::select! {
            reply = handle.stdout.next_line() => Some(reply),
            _ = stop.cancelled() => None,
        };

        let reply = match reply {
            None => {
                info!(pid = ?handle.child.id(), "Terminating conversion process");
                handle.kill().await;
                return ExecOutcome::Stopped;
            }
            Some(Ok(Some(reply))) => reply,
            Some(Ok(None)) => {
                let status = handle.child.wait().await;
                return ExecOutcome::Crashed(format!(
                    "conversion process exited unexpectedly ({})",
                    status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string())
                ));
            }
            Some(Err(e)) => {
                handle.kill().await;
                return ExecOutcome::Crashed(format!("failed to read conversion result: {e}"));
            }
        };

        let response: ChildResponse = match serde_json::from_str(&reply) {
            Ok(response) => response,
            Err(e) => {
                handle.kill().await;
                return ExecOutcome::Crashed(format!("malformed conversion result: {e}"));
            }
        };

        handle.completed += 1;
        if handle.completed >= self.max_tasks_per_child {
            info!(
                completed = handle.completed,
                "Recycling conversion process after task limit"
            );
            handle.retire().await;
        } else {
            self.child = Some(handle);
        }

        if response.success {
            ExecOutcome::Finished(Ok(()))
        } else {
            ExecOutcome::Finished(Err(response
                .error
                .unwrap_or_else(|| "conversion failed".to_string())))
        }
    }

    async fn terminate(&mut self) {
        if let Some(handle) = self.child.take() {
            handle.kill().await;
        }
    }
}

/// Child side of [`ProcessExecutor`]: serves requests from stdin until EOF.
///
/// Stdout carries only protocol lines; logs go to stderr.
pub fn serve_child<C: Converter>(converter: &C) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ChildRequest>(&line) {
            Ok(request) => match converter.convert(&request.input, &request.output) {
                Ok(()) => ChildResponse {
                    success: true,
                    error: None,
                },
                Err(e) => ChildResponse {
                    success: false,
                    error: Some(e.to_string()),
                },
            },
            Err(e) => ChildResponse {
                success: false,
                error: Some(format!("malformed request: {e}")),
            },
        };
        serde_json::to_writer(&mut stdout, &response)?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
    }
    Ok(())
}

/// Runs conversions on the blocking thread pool.
pub struct InlineExecutor<C> {
    converter: Arc<C>,
}

impl<C> InlineExecutor<C> {
    pub fn new(converter: Arc<C>) -> Self {
        Self { converter }
    }
}

impl<C> Clone for InlineExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            converter: self.converter.clone(),
        }
    }
}

#[async_trait]
impl<C: Converter + 'static> Executor for InlineExecutor<C> {
    async fn run(&mut self, input: &Path, output: &Path, stop: &CancellationToken) -> ExecOutcome {
        let converter = self.converter.clone();
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        let handle = tokio::task::spawn_blocking(move || converter.convert(&input, &output));

        tokio::select! {
            joined = handle => match joined {
                Ok(Ok(())) => ExecOutcome::Finished(Ok(())),
                Ok(Err(e)) => ExecOutcome::Finished(Err(e.to_string())),
                Err(e) if e.is_panic() => ExecOutcome::Crashed(format!("conversion panicked: {}", panic_message(e.into_panic()))),
                Err(e) => ExecOutcome::Crashed(e.to_string()),
            },
            _ = stop.cancelled() => ExecOutcome::Stopped,
        }
    }

    async fn terminate(&mut self) {}
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
