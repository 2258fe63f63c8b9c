//! Running sandboxed commands with a deadline and cancellation.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};

use wait_timeout::ChildExt;

use crate::cancel::CancelToken;
use crate::command::SandboxCommand;
use crate::error::SandboxError;

/// Interval between deadline and cancellation checks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a sandboxed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    /// Terminated by a signal it did not handle.
    Signaled,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub status: ExitKind,
    /// Combined stdout and stderr of the process.
    pub log: PathBuf,
    pub duration: Duration,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.status == ExitKind::Exited(0)
    }
}

/// Execute `cmd`, writing stdout and stderr to `log_path`.
///
/// Returns once the process exits, its timeout expires, or `cancel` fires.
/// In the last two cases the whole process group is killed before returning.
///
/// # Errors
/// Returns an error if the log cannot be created or the process cannot be
/// spawned or waited on. A failing build is not an error; inspect
/// [`ExecOutcome::status`].
pub fn run(
    cmd: &SandboxCommand,
    log_path: &Path,
    cancel: &CancelToken,
) -> Result<ExecOutcome, SandboxError> {
    if let Some(parent) = log_path.parent() {
        kiln_util::fs::ensure_dir(parent)?;
    }
    let log = File::create(log_path).map_err(|source| SandboxError::Io {
        path: log_path.to_path_buf(),
        source,
    })?;
    let log_err = log.try_clone().map_err(|source| SandboxError::Io {
        path: log_path.to_path_buf(),
        source,
    })?;

    let mut command = cmd.to_command()?;
    command.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
        program: format!("{:?}", command.get_program()),
        source,
    })?;
    tracing::debug!(pid = child.id(), log = %log_path.display(), "spawned build");

    // A timeout past the representable range means no deadline.
    let deadline = cmd.timeout_value().and_then(|t| start.checked_add(t));
    let status = loop {
        let wait_for = match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(POLL_INTERVAL),
            None => POLL_INTERVAL,
        };
        if let Some(status) = child
            .wait_timeout(wait_for)
            .map_err(|source| SandboxError::Wait { source })?
        {
            break match status.code() {
                Some(code) => ExitKind::Exited(code),
                None => ExitKind::Signaled,
            };
        }
        if cancel.is_cancelled() {
            terminate(&mut child)?;
            break ExitKind::Cancelled;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            terminate(&mut child)?;
            break ExitKind::TimedOut;
        }
    };

    let duration = start.elapsed();
    tracing::debug!(?status, ?duration, "build process finished");
    Ok(ExecOutcome {
        status,
        log: log_path.to_path_buf(),
        duration,
    })
}

/// Kill the child's process group (so helpers it started die too) and reap it.
fn terminate(child: &mut Child) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id()) {
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
    // Covers platforms without process groups.
    let _ = child.kill();
    child
        .wait()
        .map_err(|source| SandboxError::Wait { source })?;
    Ok(())
}

/// Read the last `max_lines` lines of a log file.
///
/// Reads at most the final 64 KiB. Missing or unreadable logs yield an empty
/// string.
pub fn read_log_tail(path: &Path, max_lines: usize) -> String {
    const TAIL_BYTES: u64 = 64 * 1024;

    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > TAIL_BYTES && file.seek(SeekFrom::Start(len - TAIL_BYTES)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    let text = String::from_utf8_lossy(&buf);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(max_lines);
    lines.into_iter().skip(skip).collect::<Vec<_>>().join("\n")
}
