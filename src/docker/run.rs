use std::io::BufRead;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use tracing::debug;

use super::types::{CancelToken, ContainerCommand, ContainerResult, OutputLine};
use crate::error::{Error, Result};

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(200);

// How often a running `docker` child is checked for exit, cancel and timeout.
const CHILD_POLL: Duration = Duration::from_millis(20);

/// Spawn `docker` and return a channel that streams its output.
///
/// The caller receives [`OutputLine::Stdout`]/[`OutputLine::Stderr`] as they
/// arrive, followed by exactly one [`OutputLine::Done`] carrying the final
/// result. The process is killed once `cancel` fires or the command's timeout
/// elapses.
pub fn spawn(cmd: ContainerCommand, cancel: CancelToken) -> Result<Receiver<OutputLine>> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    debug!(args = ?cmd.args, "running docker");
    let mut child = Command::new("docker")
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            Error::RuntimeUnavailable(format!("failed to invoke `docker`: {e}"))
        })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        return Err(Error::Runtime("docker output was not captured".into()));
    };

    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        orchestrate(child, stdout, stderr, tx, cancel, cmd.timeout);
    });

    Ok(rx)
}

/// Run a command to completion, forwarding each stdout line to `on_line`.
///
/// A non-zero exit becomes [`Error::Runtime`] carrying stderr; callers
/// classify it further.
pub fn run(
    cmd: ContainerCommand,
    cancel: &CancelToken,
    mut on_line: impl FnMut(&str),
) -> Result<ContainerResult> {
    let label = cmd.label();
    let rx = spawn(cmd, cancel.clone())?;

    for line in rx {
        match line {
            OutputLine::Stdout(s) => on_line(&s),
            OutputLine::Stderr(_) => {}
            OutputLine::Done(result) => {
                if result.cancelled {
                    return Err(Error::Cancelled);
                }
                if result.timed_out {
                    return Err(Error::TimedOut { command: label });
                }
                if !result.success {
                    let reason = match result.stderr.trim() {
                        "" => format!("`docker {label}` exited with {:?}", result.exit_code),
                        msg => msg.to_string(),
                    };
                    return Err(Error::Runtime(reason));
                }
                return Ok(result);
            }
        }
    }

    Err(Error::Runtime(format!("`docker {label}` ended without a result")))
}

fn orchestrate(
    mut child: std::process::Child,
    stdout: std::process::ChildStdout,
    stderr: std::process::ChildStderr,
    tx: Sender<OutputLine>,
    cancel: CancelToken,
    timeout: Duration,
) {
    // --- reader threads ---------------------------------------------------
    let tx_out = tx.clone();
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = String::new();
        let reader = std::io::BufReader::new(stdout);
        for line in reader.lines() {
            match line {
                Ok(l) => {
                    buf.push_str(&l);
                    buf.push('\n');
                    // Receiver may be dropped; ignore send errors.
                    let _ = tx_out.send(OutputLine::Stdout(l));
                }
                Err(_) => break,
            }
        }
        buf
    });

    let tx_err = tx.clone();
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = String::new();
        let reader = std::io::BufReader::new(stderr);
        for line in reader.lines() {
            match line {
                Ok(l) => {
                    buf.push_str(&l);
                    buf.push('\n');
                    let _ = tx_err.send(OutputLine::Stderr(l));
                }
                Err(_) => break,
            }
        }
        buf
    });

    // --- poll loop ---------------------------------------------------------
    let start = Instant::now();
    let mut cancelled = false;
    let mut timed_out = false;

    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(_) => break None,
        }

        if cancel.is_cancelled() {
            cancelled = true;
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }

        if start.elapsed() > timeout {
            timed_out = true;
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }

        std::thread::sleep(CHILD_POLL);
    };

    // --- finalize ----------------------------------------------------------
    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    let exit_code = exit_status.and_then(|s| s.code());
    let _ = tx.send(OutputLine::Done(ContainerResult {
        success: exit_code == Some(0),
        exit_code,
        stdout,
        stderr,
        cancelled,
        timed_out,
    }));
}
