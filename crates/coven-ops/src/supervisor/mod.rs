// ABOUTME: Spawns, tracks, and terminates service child processes.
// ABOUTME: Owns the active-process table and per-process log buffers.

pub mod logs;
mod spawn;

use crate::error::SupervisorError;
use crate::events::{SupervisorEvent, EVENT_CHANNEL_CAPACITY};
use crate::os;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use logs::{LogBuffer, DEFAULT_LOG_CAPACITY};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Default wait between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);

/// How long `kill` waits for the exit watcher after the last signal
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock a table, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Errored,
}

/// Everything needed to launch one process
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub id: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub ports: Vec<u16>,
}

impl SpawnRequest {
    pub fn new(id: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: PathBuf::from("."),
            env: HashMap::new(),
            ports: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Public view of a managed process. The child handle itself never leaves
/// the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: String,
    pub pid: u32,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub ports: Vec<u16>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProcessInfo {
    /// Program and arguments joined for display
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a successful kill
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillReport {
    pub id: String,
    pub pid: u32,
    /// SIGKILL was needed after the grace period
    pub forced: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub kill_grace: Duration,
    pub log_capacity: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

struct ManagedProcess {
    info: ProcessInfo,
    /// Distinguishes this launch from a later one reusing the id
    generation: u64,
    /// Flips to true once the exit watcher has reaped the child
    exited: watch::Receiver<bool>,
}

struct Inner {
    processes: Mutex<HashMap<String, ManagedProcess>>,
    logs: Mutex<HashMap<String, Arc<Mutex<LogBuffer>>>>,
    events: broadcast::Sender<SupervisorEvent>,
    options: SupervisorOptions,
    next_generation: AtomicU64,
}

impl Inner {
    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Process supervisor. Cheap to clone; clones share the same table.
///
/// Must be used from within a tokio runtime: every spawned child gets a
/// watcher task and two output-capture tasks.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorOptions::default())
    }
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                processes: Mutex::new(HashMap::new()),
                logs: Mutex::new(HashMap::new()),
                events,
                options,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn kill_grace(&self) -> Duration {
        self.inner.options.kill_grace
    }

    /// Launch a process under `request.id`.
    pub fn spawn(&self, request: SpawnRequest) -> Result<ProcessInfo, SupervisorError> {
        let mut processes = lock(&self.inner.processes);
        if processes.contains_key(&request.id) {
            return Err(SupervisorError::DuplicateIdentifier(request.id));
        }

        let launch_failed = |source| SupervisorError::LaunchFailed {
            id: request.id.clone(),
            program: request.program.clone(),
            source,
        };
        let mut child = spawn::launch(&request).map_err(launch_failed)?;
        let pid = child.id().ok_or_else(|| {
            launch_failed(std::io::Error::other("process exited before reporting a pid"))
        })?;

        // A new launch replaces whatever output the previous one left behind
        let log = Arc::new(Mutex::new(LogBuffer::new(self.inner.options.log_capacity)));
        lock(&self.inner.logs).insert(request.id.clone(), log.clone());
        spawn::capture_output(&mut child, &request.id, log);

        let info = ProcessInfo {
            id: request.id.clone(),
            pid,
            program: request.program,
            args: request.args,
            cwd: request.cwd,
            ports: request.ports,
            status: ProcessStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
        };
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (exited_tx, exited_rx) = watch::channel(false);
        processes.insert(
            info.id.clone(),
            ManagedProcess {
                info: info.clone(),
                generation,
                exited: exited_rx,
            },
        );
        info!(id = %info.id, pid, command = %info.command_line(), "Spawned process");
        self.inner.emit(SupervisorEvent::ProcessStarted {
            id: info.id.clone(),
            pid,
        });
        drop(processes);

        tokio::spawn(watch_exit(
            self.inner.clone(),
            info.id.clone(),
            generation,
            child,
            exited_tx,
        ));

        Ok(info)
    }

    /// SIGTERM, wait the grace period, SIGKILL if the child has not exited.
    /// Resolves once the process has left the active set.
    pub async fn kill(&self, id: &str) -> Result<KillReport, SupervisorError> {
        let (pid, generation, mut exited) = {
            let processes = lock(&self.inner.processes);
            let process = processes
                .get(id)
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
            (process.info.pid, process.generation, process.exited.clone())
        };
        let grace = self.inner.options.kill_grace;

        info!(id, pid, "Stopping process");
        signal_child(id, pid, Signal::SIGTERM);

        // Always the full grace period, even if the child is already gone
        tokio::time::sleep(grace).await;

        let forced = !*exited.borrow();
        if forced {
            warn!(id, pid, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, sending SIGKILL");
            signal_child(id, pid, Signal::SIGKILL);
        }

        let reaped = matches!(
            tokio::time::timeout(REAP_TIMEOUT, exited.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        if !reaped {
            warn!(id, pid, "Exit watcher did not report, evicting process");
            self.evict(id, generation);
        }

        let message = if forced {
            format!(
                "Process {} (pid {}) killed after {}ms grace period",
                id,
                pid,
                grace.as_millis()
            )
        } else {
            format!("Process {} (pid {}) stopped", id, pid)
        };
        Ok(KillReport {
            id: id.to_string(),
            pid,
            forced,
            message,
        })
    }

    /// Kill every active process concurrently; individual failures are
    /// reported per id.
    pub async fn kill_all(&self) -> Vec<(String, Result<KillReport, SupervisorError>)> {
        let ids: Vec<String> = lock(&self.inner.processes).keys().cloned().collect();
        join_all(ids.into_iter().map(|id| async move {
            let result = self.kill(&id).await;
            if let Err(e) = &result {
                debug!(id = %id, error = %e, "Kill during kill_all failed");
            }
            (id, result)
        }))
        .await
    }

    /// OS-level liveness of the last known pid for `id`
    pub fn is_running(&self, id: &str) -> bool {
        let pid = lock(&self.inner.processes).get(id).map(|p| p.info.pid);
        pid.is_some_and(os::pid_alive)
    }

    /// Captured output for `id`, kept after the process exits
    pub fn get_logs(&self, id: &str) -> Vec<String> {
        let log = lock(&self.inner.logs).get(id).cloned();
        log.map(|log| lock(&log).lines()).unwrap_or_default()
    }

    pub fn get_process(&self, id: &str) -> Option<ProcessInfo> {
        lock(&self.inner.processes).get(id).map(|p| p.info.clone())
    }

    /// Active processes, sorted by id
    pub fn get_all_processes(&self) -> Vec<ProcessInfo> {
        let mut all: Vec<ProcessInfo> = lock(&self.inner.processes)
            .values()
            .map(|p| p.info.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Whether any active process was launched with this pid
    pub fn owner_of_pid(&self, pid: u32) -> Option<String> {
        lock(&self.inner.processes)
            .values()
            .find(|p| p.info.pid == pid)
            .map(|p| p.info.id.clone())
    }

    fn evict(&self, id: &str, generation: u64) {
        let mut processes = lock(&self.inner.processes);
        if processes.get(id).is_some_and(|p| p.generation == generation) {
            self.inner.emit(SupervisorEvent::ProcessExit {
                id: id.to_string(),
                exit_code: None,
                signal: None,
            });
            processes.remove(id);
        }
    }
}

fn signal_child(id: &str, pid: u32, signal: Signal) {
    match os::send_signal(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(id, pid, signal = ?signal, error = %e, "Failed to signal process"),
    }
}

/// Wait for the child, then report and deregister it in one critical section
/// so subscribers hear about the exit no later than queries stop showing it.
async fn watch_exit(
    inner: Arc<Inner>,
    id: String,
    generation: u64,
    mut child: Child,
    exited: watch::Sender<bool>,
) {
    let outcome = child.wait().await;

    {
        let mut processes = lock(&inner.processes);
        let owned = processes
            .get(&id)
            .is_some_and(|p| p.generation == generation);
        if owned {
            let (status, exit_code, signal) = match &outcome {
                Ok(exit) => (ProcessStatus::Stopped, exit.code(), exit.signal()),
                Err(e) => {
                    inner.emit(SupervisorEvent::ProcessError {
                        id: id.clone(),
                        error: e.to_string(),
                    });
                    (ProcessStatus::Errored, None, None)
                }
            };
            if let Some(process) = processes.get_mut(&id) {
                process.info.status = status;
                process.info.ended_at = Some(Utc::now());
                info!(
                    id = %id,
                    pid = process.info.pid,
                    status = ?status,
                    exit_code = ?exit_code,
                    signal = ?signal,
                    "Process exited"
                );
            }
            inner.emit(SupervisorEvent::ProcessExit {
                id: id.clone(),
                exit_code,
                signal,
            });
            processes.remove(&id);
        } else {
            debug!(id = %id, "Exit for an evicted process, ignoring");
        }
    }

    let _ = exited.send(true);
}
