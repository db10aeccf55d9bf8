//! Process termination primitives

use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL
pub const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Positive pid as nix expects it; anything else would address a group
#[cfg(unix)]
fn unix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(nix::unistd::Pid::from_raw(raw)),
        _ => {
            warn!("Refusing to signal out-of-range pid {}", pid);
            None
        }
    }
}

/// Send SIGTERM to a pid. Returns false if the signal could not be delivered
/// (usually because the process is already gone).
#[cfg(unix)]
pub fn signal_terminate(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};

    let Some(pid) = unix_pid(pid) else {
        return false;
    };
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!("SIGTERM to {} failed (may have already exited): {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
pub fn signal_terminate(_pid: u32) -> bool {
    false
}

/// Send SIGKILL to a pid
#[cfg(unix)]
pub fn signal_kill(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};

    let Some(pid) = unix_pid(pid) else {
        return false;
    };
    match kill(pid, Signal::SIGKILL) {
        Ok(()) => true,
        Err(e) => {
            debug!("SIGKILL to {} failed (may have already exited): {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
pub fn signal_kill(pid: u32) -> bool {
    std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Whether a pid still exists (signal 0 probe)
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;

    unix_pid(pid).is_some_and(|pid| kill(pid, None).is_ok())
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Terminate an owned child: SIGTERM, wait up to `grace`, then SIGKILL
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };

    if signal_terminate(pid) {
        if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
            return;
        }
        debug!("Process {} ignored SIGTERM for {:?}, killing", pid, grace);
    }

    if let Err(e) = child.kill().await {
        warn!("Failed to kill process {}: {}", pid, e);
    }
}

/// Terminate a pid we do not own: SIGTERM, poll for `grace`, then SIGKILL
pub async fn terminate_pid(pid: u32, grace: Duration) -> bool {
    if !signal_terminate(pid) {
        return signal_kill(pid);
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    signal_kill(pid);
    true
}
