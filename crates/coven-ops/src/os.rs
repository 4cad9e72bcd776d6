// ABOUTME: Thin wrappers over Unix signals for liveness probes and termination.
// ABOUTME: The OS pid is the only link to a process that survives a supervisor restart.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;

/// Pids that cannot name a single process (0 and negatives address groups).
fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

/// Check whether a pid exists using signal 0.
/// EPERM means the process exists but belongs to someone else.
pub fn pid_alive(pid: u32) -> bool {
    let Some(pid) = to_pid(pid) else {
        return false;
    };
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub fn send_signal(pid: u32, signal: Signal) -> Result<(), Errno> {
    let target = to_pid(pid).ok_or(Errno::ESRCH)?;
    kill(target, signal)
}

/// SIGTERM, wait out the grace period, then SIGKILL if the pid is still
/// alive. Returns whether SIGKILL was needed.
///
/// Only for processes this supervisor did not spawn; managed children go
/// through `Supervisor::kill` so their exit is reaped and reported.
pub async fn terminate(pid: u32, grace: Duration) -> Result<bool, Errno> {
    send_signal(pid, Signal::SIGTERM)?;
    tokio::time::sleep(grace).await;

    if !pid_alive(pid) {
        return Ok(false);
    }
    match send_signal(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(true),
        Err(e) => Err(e),
    }
}
