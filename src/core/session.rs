//! Keeps `jobman run <id>` alive in the background, detached from the
//! terminal that started it.

use crate::tmux;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::Path;

/// A backend that owns long-running job processes by an opaque handle.
/// Only the handle is persisted in the registry.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessSupervisor: Send + Sync {
    /// Tag recorded with the job, e.g. `"tmux"`.
    fn backend(&self) -> &'static str;

    /// Whether the backend can be used on this host.
    fn available(&self) -> bool;

    /// Starts `command` under `handle`.
    fn spawn(&self, handle: &str, command: &str) -> Result<()>;

    fn is_alive(&self, handle: &str) -> bool;

    /// Forcibly stops the process behind `handle`.
    fn terminate(&self, handle: &str) -> Result<()>;
}

pub fn session_name(job_id: &str) -> String {
    format!("job_{job_id}")
}

/// Runs each job inside a detached tmux session; the session exits with the job.
#[derive(Debug, Default, Clone)]
pub struct TmuxSupervisor;

impl ProcessSupervisor for TmuxSupervisor {
    fn backend(&self) -> &'static str {
        "tmux"
    }

    fn available(&self) -> bool {
        tmux::is_available()
    }

    fn spawn(&self, handle: &str, command: &str) -> Result<()> {
        let session = tmux::TmuxSession::new(handle.to_string())?;
        session.send_command(&format!("{command}; exit"))
    }

    fn is_alive(&self, handle: &str) -> bool {
        tmux::is_session_exist(handle)
    }

    fn terminate(&self, handle: &str) -> Result<()> {
        tmux::kill_session(handle)
    }
}

/// Fallback cancellation when no supervisor handle is usable: finds local
/// processes holding any `*.log` file in `logs_dir` open and sends them
/// SIGTERM. Returns the number of processes signalled.
pub fn signal_log_holders(logs_dir: &Path) -> Result<usize> {
    let entries = std::fs::read_dir(logs_dir)
        .with_context(|| format!("Failed to read log directory {:?}", logs_dir))?;
    let own_pid = std::process::id();

    let mut pids = BTreeSet::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let output = match std::process::Command::new("lsof").arg("-t").arg(&path).output() {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("Failed to run lsof on {:?}: {}", path, e);
                continue;
            }
        };
        // lsof exits non-zero when nobody holds the file
        pids.extend(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(|line| line.trim().parse::<u32>().ok())
                .filter(|pid| *pid != own_pid),
        );
    }

    let mut signalled = 0;
    for pid in pids {
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            tracing::info!("Sent SIGTERM to process {}", pid);
            signalled += 1;
        } else {
            tracing::warn!(
                "Failed to signal process {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
    Ok(signalled)
}
