// ABOUTME: Root component tying the supervisor, health monitor, and state store together.
// ABOUTME: Exposes start/stop/status/orphan commands and a single forwarded event stream.

use crate::error::{OpsError, Result, SupervisorError};
use crate::events::{HealthEvent, OpsEvent, SupervisorEvent, EVENT_CHANNEL_CAPACITY};
use crate::health::HealthMonitor;
use crate::os;
use crate::state::{PersistedProcess, StateStore};
use crate::supervisor::{
    lock, KillReport, ProcessStatus, SpawnRequest, Supervisor, SupervisorOptions,
    DEFAULT_KILL_GRACE,
};
use chrono::{DateTime, Utc};
use coven_ops_core::{parse_command, OpsConfig, ServiceConfig, ServiceKind};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Live "port -> pid listening on it" table supplied by the caller
pub type PortOwners = HashMap<u16, u32>;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub state_dir: PathBuf,
    pub health_interval: Duration,
    pub kill_grace: Duration,
}

impl OrchestratorOptions {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            health_interval: Duration::from_secs(5),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn from_config(config: &OpsConfig) -> Self {
        Self {
            state_dir: config.state_dir_expanded(),
            health_interval: config.health_interval(),
            kill_grace: config.kill_grace(),
        }
    }
}

/// Dashboard view of one registered service, recomputed on every query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// A declared port is bound by a pid this supervisor does not manage,
    /// and this service is not running. A port held by another managed
    /// service's process does not count; stop that service instead.
    pub orphaned: bool,
    pub orphan_pid: Option<u32>,
    pub pid: Option<u32>,
    pub color: String,
    /// Last check passed and the service is still managed; a stopped
    /// service is never healthy, even before the next check runs
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub kind: ServiceKind,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStarted {
    pub id: String,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStopped {
    pub id: String,
    pub pid: Option<u32>,
    pub message: String,
}

/// Success flag plus a human-readable message, for callers that only relay
/// results (HTTP handlers, the daemon's logs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl ActionOutcome {
    fn failed(err: &OpsError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            pid: None,
        }
    }
}

impl From<Result<ServerStarted>> for ActionOutcome {
    fn from(result: Result<ServerStarted>) -> Self {
        match result {
            Ok(started) => Self {
                success: true,
                message: format!("Started {} (pid {})", started.id, started.pid),
                pid: Some(started.pid),
            },
            Err(e) => Self::failed(&e),
        }
    }
}

impl From<Result<ServerStopped>> for ActionOutcome {
    fn from(result: Result<ServerStopped>) -> Self {
        match result {
            Ok(stopped) => Self {
                success: true,
                message: stopped.message,
                pid: stopped.pid,
            },
            Err(e) => Self::failed(&e),
        }
    }
}

impl From<Result<KillReport>> for ActionOutcome {
    fn from(result: Result<KillReport>) -> Self {
        match result {
            Ok(report) => Self {
                success: true,
                message: report.message,
                pid: Some(report.pid),
            },
            Err(e) => Self::failed(&e),
        }
    }
}

pub struct Orchestrator {
    services: RwLock<BTreeMap<String, ServiceConfig>>,
    supervisor: Supervisor,
    health: HealthMonitor,
    state: Arc<Mutex<StateStore>>,
    events: broadcast::Sender<OpsEvent>,
    options: OrchestratorOptions,
    forwarder: JoinHandle<()>,
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl Orchestrator {
    /// Build the component tree and start forwarding events. Must be called
    /// inside a tokio runtime. Nothing is loaded or checked until `initialize`.
    pub fn new(options: OrchestratorOptions) -> Self {
        let supervisor = Supervisor::new(SupervisorOptions {
            kill_grace: options.kill_grace,
            ..SupervisorOptions::default()
        });
        let health = HealthMonitor::new(Arc::new(supervisor.clone()));
        let state = Arc::new(Mutex::new(StateStore::new(&options.state_dir)));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let forwarder = tokio::spawn(forward_events(
            supervisor.subscribe(),
            health.subscribe(),
            events.clone(),
            supervisor.clone(),
            state.clone(),
        ));

        Self {
            services: RwLock::new(BTreeMap::new()),
            supervisor,
            health,
            state,
            events,
            options,
            forwarder,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OpsEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: OpsEvent) {
        let _ = self.events.send(event);
    }

    pub fn register_service(&self, id: impl Into<String>, config: ServiceConfig) {
        let id = id.into();
        info!(id = %id, name = %config.name, "Registered service");
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, config);
    }

    pub fn register_services<I>(&self, services: I)
    where
        I: IntoIterator<Item = (String, ServiceConfig)>,
    {
        for (id, config) in services {
            self.register_service(id, config);
        }
    }

    fn service(&self, id: &str) -> Result<ServiceConfig> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| OpsError::UnknownService(id.to_string()))
    }

    /// Load persisted state, drop records whose pid is gone, and start the
    /// health monitor. Dead services are not restarted. Returns how many
    /// records were found before pruning.
    pub async fn initialize(&self) -> usize {
        let (recovered, pruned) = {
            let mut state = lock(&self.state);
            state.load();
            let records = state.get_all_processes();
            let mut pruned = 0;
            for record in &records {
                if os::pid_alive(record.pid) {
                    info!(id = %record.id, pid = record.pid, "Process from previous run is still alive");
                    continue;
                }
                match state.remove_process(&record.id) {
                    Ok(_) => pruned += 1,
                    Err(e) => {
                        warn!(id = %record.id, error = %e, "Failed to prune stale process record")
                    }
                }
            }
            (records.len(), pruned)
        };

        info!(recovered, pruned, "Orchestrator initialized");
        self.emit(OpsEvent::Initialized {
            recovered_count: recovered,
        });
        self.health.start(self.options.health_interval).await;
        recovered
    }

    /// Launch a registered service and record it for crash recovery.
    pub fn start_server(&self, id: &str) -> Result<ServerStarted> {
        let config = self.service(id)?;
        if self.supervisor.get_process(id).is_some() {
            return Err(OpsError::AlreadyRunning(id.to_string()));
        }

        let command = parse_command(&config.command).map_err(|source| OpsError::Parse {
            id: id.to_string(),
            source,
        })?;
        let request = SpawnRequest {
            id: id.to_string(),
            program: command.program,
            args: command.args,
            cwd: config.cwd_expanded(),
            env: config.env.clone(),
            ports: config.ports.clone(),
        };
        let process = self.supervisor.spawn(request).map_err(|e| match e {
            SupervisorError::DuplicateIdentifier(id) => OpsError::AlreadyRunning(id),
            other => other.into(),
        })?;

        let record = PersistedProcess {
            id: id.to_string(),
            pid: process.pid,
            command: config.command.clone(),
            cwd: process.cwd.clone(),
            start_time: process.started_at,
            status: ProcessStatus::Running,
            ports: config.ports.clone(),
        };
        {
            let mut state = lock(&self.state);
            // The server is up either way; a lost record only weakens crash recovery
            if let Err(e) = state.save_process(record) {
                error!(id, error = %e, "Failed to persist started process");
            }
            // A short-lived command may have exited before the record was written
            let still_ours = self
                .supervisor
                .get_process(id)
                .is_some_and(|p| p.pid == process.pid);
            if !still_ours {
                if let Err(e) = state.remove_process(id) {
                    warn!(id, error = %e, "Failed to remove record of exited process");
                }
            }
        }

        info!(id, pid = process.pid, "Server started");
        self.emit(OpsEvent::ServerStarted {
            id: id.to_string(),
            pid: process.pid,
        });
        Ok(ServerStarted {
            id: id.to_string(),
            pid: process.pid,
        })
    }

    /// Stop a registered service. Stopping one that is not running succeeds.
    pub async fn stop_server(&self, id: &str) -> Result<ServerStopped> {
        self.service(id)?;

        let (pid, message) = match self.supervisor.kill(id).await {
            Ok(report) => (Some(report.pid), report.message),
            Err(SupervisorError::NotFound(_)) => (None, format!("Service {} is already stopped", id)),
            Err(e) => return Err(e.into()),
        };
        remove_record(&self.state, id);

        info!(id, "Server stopped");
        self.emit(OpsEvent::ServerStopped { id: id.to_string() });
        Ok(ServerStopped {
            id: id.to_string(),
            pid,
            message,
        })
    }

    /// Status of every registered service, sorted by id.
    pub fn get_server_status(&self, port_owners: &PortOwners) -> Vec<ServiceStatus> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        services
            .iter()
            .map(|(id, config)| {
                let process = self.supervisor.get_process(id);
                let health = self.health.get_status(id);

                let orphan_pid = match &process {
                    Some(_) => None,
                    None => config
                        .ports
                        .iter()
                        .filter_map(|port| port_owners.get(port).copied())
                        .find(|pid| self.supervisor.owner_of_pid(*pid).is_none()),
                };

                let running = process
                    .as_ref()
                    .is_some_and(|p| p.status == ProcessStatus::Running);

                ServiceStatus {
                    id: id.clone(),
                    name: config.name.clone(),
                    running,
                    orphaned: orphan_pid.is_some(),
                    orphan_pid,
                    pid: process.as_ref().map(|p| p.pid),
                    color: config.color.clone(),
                    healthy: running && health.as_ref().is_some_and(|h| h.healthy),
                    last_check: health.map(|h| h.last_check),
                    kind: config.kind,
                    ports: config.ports.clone(),
                }
            })
            .collect()
    }

    /// Terminate a process this supervisor does not manage, typically one
    /// left over from a previous run that still holds a service's port.
    pub async fn kill_orphaned_process(&self, id: &str, pid: u32) -> Result<KillReport> {
        if let Some(owner) = self.supervisor.owner_of_pid(pid) {
            return Err(OpsError::ManagedPid { id: owner, pid });
        }

        let grace = self.supervisor.kill_grace();
        let forced = os::terminate(pid, grace)
            .await
            .map_err(|source| OpsError::Signal { pid, source })?;

        // Drop a persisted record that still points at this pid
        let stale = lock(&self.state).get_process(id).is_some_and(|r| r.pid == pid);
        if stale {
            remove_record(&self.state, id);
        }

        info!(id, pid, forced, "Killed orphaned process");
        self.emit(OpsEvent::OrphanKilled {
            id: id.to_string(),
            pid,
        });
        let message = if forced {
            format!("Orphaned process {} for {} killed", pid, id)
        } else {
            format!("Orphaned process {} for {} terminated", pid, id)
        };
        Ok(KillReport {
            id: id.to_string(),
            pid,
            forced,
            message,
        })
    }

    pub fn get_logs(&self, id: &str) -> Vec<String> {
        self.supervisor.get_logs(id)
    }

    /// Records currently held by the state store
    pub fn persisted_processes(&self) -> Vec<PersistedProcess> {
        lock(&self.state).get_all_processes()
    }

    /// Stop health checks and kill every managed process.
    pub async fn shutdown(&self) {
        self.health.stop().await;
        for (id, result) in self.supervisor.kill_all().await {
            match result {
                Ok(report) => {
                    remove_record(&self.state, &id);
                    info!(id = %id, pid = report.pid, "Stopped during shutdown");
                }
                Err(e) => warn!(id = %id, error = %e, "Failed to stop during shutdown"),
            }
        }
        info!("Orchestrator shut down");
    }
}

/// Best-effort removal; persistence failures are logged, never propagated.
fn remove_record(state: &Mutex<StateStore>, id: &str) {
    if let Err(e) = lock(state).remove_process(id) {
        warn!(id, error = %e, "Failed to remove process record");
    }
}

/// Re-emit component events on the orchestrator channel and clear state
/// records for processes that are gone.
async fn forward_events(
    mut supervisor_rx: broadcast::Receiver<SupervisorEvent>,
    mut health_rx: broadcast::Receiver<HealthEvent>,
    events: broadcast::Sender<OpsEvent>,
    supervisor: Supervisor,
    state: Arc<Mutex<StateStore>>,
) {
    loop {
        let event = tokio::select! {
            received = supervisor_rx.recv() => match received {
                Ok(event) => OpsEvent::Supervisor { event },
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "Event forwarder lagged behind supervisor");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            received = health_rx.recv() => match received {
                Ok(event) => OpsEvent::Health { event },
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "Event forwarder lagged behind health monitor");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let departed = match &event {
            OpsEvent::Supervisor {
                event: SupervisorEvent::ProcessExit { id, .. },
            }
            | OpsEvent::Health {
                event: HealthEvent::ProcessDied { id, .. },
            } => Some(id.as_str()),
            _ => None,
        };
        // A restart under the same id may already own the record
        if let Some(id) = departed {
            if supervisor.get_process(id).is_none() {
                remove_record(&state, id);
            }
        }

        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator(dir: &tempfile::TempDir) -> Orchestrator {
        let mut options = OrchestratorOptions::new(dir.path());
        options.kill_grace = Duration::from_millis(200);
        Orchestrator::new(options)
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let dir = tempfile::tempdir().unwrap();
        let ops = orchestrator(&dir);

        assert!(matches!(
            ops.start_server("nope"),
            Err(OpsError::UnknownService(id)) if id == "nope"
        ));
        assert!(matches!(
            ops.stop_server("nope").await,
            Err(OpsError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let ops = orchestrator(&dir);
        ops.register_service("sleepy", ServiceConfig::new("Sleepy", "sleep 30"));

        let started = ops.start_server("sleepy").unwrap();
        assert!(matches!(
            ops.start_server("sleepy"),
            Err(OpsError::AlreadyRunning(_))
        ));

        let persisted = ops.persisted_processes();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].pid, started.pid);
        assert_eq!(persisted[0].command, "sleep 30");

        ops.stop_server("sleepy").await.unwrap();
        assert!(ops.persisted_processes().is_empty());
    }

    #[tokio::test]
    async fn test_bad_command_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let ops = orchestrator(&dir);
        ops.register_service("broken", ServiceConfig::new("Broken", "run 'oops"));

        let outcome = ActionOutcome::from(ops.start_server("broken"));
        assert!(!outcome.success);
        assert!(outcome.message.contains("broken"));
    }

    #[tokio::test]
    async fn test_launch_failure_is_structured() {
        let dir = tempfile::tempdir().unwrap();
        let ops = orchestrator(&dir);
        ops.register_service(
            "ghost",
            ServiceConfig::new("Ghost", "/no/such/program --flag"),
        );

        let err = ops.start_server("ghost").unwrap_err();
        assert!(matches!(
            err,
            OpsError::Supervisor(SupervisorError::LaunchFailed { .. })
        ));
        assert!(ops.persisted_processes().is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_running_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let ops = orchestrator(&dir);
        ops.register_service(
            "managed",
            ServiceConfig::new("Managed", "sleep 30").with_ports([7001]),
        );
        ops.register_service(
            "x",
            ServiceConfig::new("X", "true")
                .with_ports([9000])
                .with_color("purple"),
        );
        let started = ops.start_server("managed").unwrap();

        // 7001 is bound by our own child, 9000 by something we never started
        let owners: PortOwners = [(7001, started.pid), (9000, 31337)].into_iter().collect();
        let statuses = ops.get_server_status(&owners);

        let managed = statuses.iter().find(|s| s.id == "managed").unwrap();
        assert!(managed.running);
        assert!(!managed.orphaned);
        assert_eq!(managed.pid, Some(started.pid));

        let x = statuses.iter().find(|s| s.id == "x").unwrap();
        assert!(!x.running);
        assert!(x.orphaned);
        assert_eq!(x.orphan_pid, Some(31337));
        assert_eq!(x.color, "purple");
        assert!(!x.healthy);
        assert!(x.last_check.is_none());

        ops.shutdown().await;
    }

    #[tokio::test]
    async fn test_kill_orphan_refuses_managed_pid() {
        let dir = tempfile::tempdir().unwrap();
        let ops = orchestrator(&dir);
        ops.register_service("sleepy", ServiceConfig::new("Sleepy", "sleep 30"));
        let started = ops.start_server("sleepy").unwrap();

        let err = ops
            .kill_orphaned_process("sleepy", started.pid)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::ManagedPid { .. }));

        ops.shutdown().await;
    }

    #[tokio::test]
    async fn test_exit_clears_persisted_record() {
        let dir = tempfile::tempdir().unwrap();
        let ops = orchestrator(&dir);
        let mut rx = ops.subscribe();
        ops.register_service("brief", ServiceConfig::new("Brief", "sleep 0.2"));
        ops.start_server("brief").unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let OpsEvent::Supervisor {
                    event: SupervisorEvent::ProcessExit { id, .. },
                } = rx.recv().await.unwrap()
                {
                    if id == "brief" {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();

        assert!(ops.persisted_processes().is_empty());
    }

    #[tokio::test]
    async fn test_stopped_service_is_not_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let ops = orchestrator(&dir);
        ops.register_service("sleepy", ServiceConfig::new("Sleepy", "sleep 30"));
        ops.start_server("sleepy").unwrap();
        // Runs the immediate check; the next one is a minute away
        ops.health.start(Duration::from_secs(60)).await;

        let healthy = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if ops.health.get_status("sleepy").is_some_and(|h| h.healthy) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(healthy.is_ok());
        assert!(ops.get_server_status(&PortOwners::new())[0].healthy);

        ops.stop_server("sleepy").await.unwrap();
        let status = &ops.get_server_status(&PortOwners::new())[0];
        assert!(!status.running);
        assert!(!status.healthy);

        ops.shutdown().await;
    }

    #[tokio::test]
    async fn test_port_held_by_other_managed_service_is_not_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let ops = orchestrator(&dir);
        ops.register_service("proxy", ServiceConfig::new("Proxy", "sleep 30"));
        ops.register_service(
            "web",
            ServiceConfig::new("Web", "true").with_ports([8080]),
        );
        let proxy = ops.start_server("proxy").unwrap();

        let owners: PortOwners = [(8080, proxy.pid)].into_iter().collect();
        let statuses = ops.get_server_status(&owners);
        let web = statuses.iter().find(|s| s.id == "web").unwrap();
        assert!(!web.running);
        assert!(!web.orphaned);
        assert_eq!(web.orphan_pid, None);

        ops.shutdown().await;
    }
}
