// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! External tool invocation: argv-only, line-streamed, group-killable.
//!
//! Tools always run in their own process group so cancellation and
//! timeouts can signal the whole tree (TERM, then KILL after the grace
//! period). Stdout and stderr are read line by line and forwarded to the
//! caller; the last few KB are kept as a tail for error reporting.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

/// Retained tail size for error messages.
const TAIL_BYTES: usize = 4096;

/// Result of a completed (exited) tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit code; -1 when killed by a signal.
    pub exit_code: i32,
    /// Last few KB of combined stdout/stderr.
    pub tail: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the process died to a signal rather than exiting.
    pub fn signalled(&self) -> bool {
        self.exit_code == -1
    }
}

/// Failures that prevent a tool from producing an exit code.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn { tool: String, source: std::io::Error },

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run `program args...` in `cwd`, forwarding each output line to
/// `on_line`.
///
/// The call resolves when the process exits, the token is cancelled, or
/// the timeout elapses; in the latter two cases the process group is
/// terminated (TERM, then KILL after `kill_grace`) before returning.
pub async fn run_streamed(
    program: &Path,
    args: &[String],
    cwd: &Path,
    cancel: &CancellationToken,
    timeout: Duration,
    kill_grace: Duration,
    mut on_line: impl FnMut(&str),
) -> Result<ToolOutput, SubprocessError> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    tracing::debug!(tool = %program.display(), ?args, cwd = %cwd.display(), "spawning tool");
    let mut child = cmd.spawn().map_err(|source| SubprocessError::Spawn {
        tool: program.display().to_string(),
        source,
    })?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut tail = Tail::new(TAIL_BYTES);

    // Drain both pipes first; the process cannot be reaped while output is
    // still buffered without losing lines.
    while !out_done || !err_done {
        let interrupted = tokio::select! {
            line = out_lines.next_line(), if !out_done => match line? {
                Some(line) => {
                    tail.push(&line);
                    on_line(&line);
                    None
                }
                None => {
                    out_done = true;
                    None
                }
            },
            line = err_lines.next_line(), if !err_done => match line? {
                Some(line) => {
                    tail.push(&line);
                    on_line(&line);
                    None
                }
                None => {
                    err_done = true;
                    None
                }
            },
            () = cancel.cancelled() => Some(SubprocessError::Cancelled),
            () = tokio::time::sleep_until(deadline) => Some(SubprocessError::TimedOut(timeout)),
        };
        if let Some(err) = interrupted {
            terminate_group(pid, &mut child, kill_grace).await;
            return Err(err);
        }
    }

    enum Waited {
        Exited(std::process::ExitStatus),
        Cancelled,
        TimedOut,
    }

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status?),
        () = cancel.cancelled() => Waited::Cancelled,
        () = tokio::time::sleep_until(deadline) => Waited::TimedOut,
    };
    match waited {
        Waited::Exited(status) => {
            let exit_code = status.code().unwrap_or(-1);
            tracing::debug!(tool = %program.display(), exit_code, "tool exited");
            Ok(ToolOutput { exit_code, tail: tail.into_string() })
        }
        Waited::Cancelled => {
            terminate_group(pid, &mut child, kill_grace).await;
            Err(SubprocessError::Cancelled)
        }
        Waited::TimedOut => {
            terminate_group(pid, &mut child, kill_grace).await;
            Err(SubprocessError::TimedOut(timeout))
        }
    }
}

/// TERM the process group, escalating to KILL after the grace period.
async fn terminate_group(pid: Option<u32>, child: &mut Child, grace: Duration) {
    let Some(pid) = pid else {
        let _ = child.kill().await;
        return;
    };
    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    tracing::warn!(pid, "tool ignored SIGTERM, killing process group");
    let _ = killpg(pgid, Signal::SIGKILL);
    let _ = child.wait().await;
}

/// Rolling byte-bounded text buffer.
struct Tail {
    buf: String,
    cap: usize,
}

impl Tail {
    fn new(cap: usize) -> Self {
        Self { buf: String::new(), cap }
    }

    fn push(&mut self, line: &str) {
        if !self.buf.is_empty() {
            self.buf.push('\n');
        }
        self.buf.push_str(line);
        if self.buf.len() > self.cap {
            let mut start = self.buf.len() - self.cap;
            while start < self.buf.len() && !self.buf.is_char_boundary(start) {
                start += 1;
            }
            self.buf = self.buf.split_off(start);
        }
    }

    fn into_string(self) -> String {
        self.buf
    }
}

#[cfg(test)]
#[path = "subprocess_tests.rs"]
mod tests;
