// ABOUTME: Periodic liveness and TCP reachability checks for supervised processes.
// ABOUTME: Diffs each tick against the last one and emits change events.

use crate::events::{HealthEvent, SupervisorEvent, EVENT_CHANNEL_CAPACITY};
use crate::supervisor::{lock, ProcessInfo, Supervisor};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-port connect timeout
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// What the monitor needs to know about running processes.
///
/// `Supervisor` is the production implementation.
pub trait ProcessSource: Send + Sync + 'static {
    fn active_processes(&self) -> Vec<ProcessInfo>;
    /// OS-level liveness for `id`
    fn is_running(&self, id: &str) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent>;
}

impl ProcessSource for Supervisor {
    fn active_processes(&self) -> Vec<ProcessInfo> {
        self.get_all_processes()
    }

    fn is_running(&self, id: &str) -> bool {
        Supervisor::is_running(self, id)
    }

    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        Supervisor::subscribe(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub running: bool,
    /// Running and every declared port accepted a connection
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub ports: BTreeMap<u16, bool>,
}

struct Shared {
    source: Arc<dyn ProcessSource>,
    statuses: Mutex<HashMap<String, HealthStatus>>,
    events: broadcast::Sender<HealthEvent>,
    probe_timeout: Duration,
}

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic checker plus a standing listener that turns supervisor exits
/// into `ProcessDied`. The listener runs for the monitor's whole lifetime,
/// independent of `start`/`stop`; only the periodic checks are toggled.
pub struct HealthMonitor {
    shared: Arc<Shared>,
    ticker: tokio::sync::Mutex<Option<Ticker>>,
    exit_listener: JoinHandle<()>,
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.exit_listener.abort();
    }
}

impl HealthMonitor {
    pub fn new(source: Arc<dyn ProcessSource>) -> Self {
        Self::with_probe_timeout(source, PORT_PROBE_TIMEOUT)
    }

    /// Must be called inside a tokio runtime.
    pub fn with_probe_timeout(source: Arc<dyn ProcessSource>, probe_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let exit_listener = tokio::spawn(forward_exits(source.subscribe(), events.clone()));
        Self {
            shared: Arc::new(Shared {
                source,
                statuses: Mutex::new(HashMap::new()),
                events,
                probe_timeout,
            }),
            ticker: tokio::sync::Mutex::new(None),
            exit_listener,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.shared.events.subscribe()
    }

    /// Check now, then every `interval`. Replaces a loop that is already
    /// running rather than adding a second one.
    pub async fn start(&self, interval: Duration) {
        let mut ticker = self.ticker.lock().await;
        if let Some(previous) = ticker.take() {
            previous.stop().await;
        }
        lock(&self.shared.statuses).clear();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(self.shared.clone(), interval, cancel.clone()));
        *ticker = Some(Ticker { cancel, handle });
        info!(interval_ms = interval.as_millis() as u64, "Health monitor started");
    }

    /// Stop ticking. No check runs after this returns.
    pub async fn stop(&self) {
        if let Some(ticker) = self.ticker.lock().await.take() {
            ticker.stop().await;
            info!("Health monitor stopped");
        }
    }

    pub async fn is_active(&self) -> bool {
        self.ticker.lock().await.is_some()
    }

    /// Run a single check outside the periodic loop
    pub async fn check_now(&self) -> HashMap<String, HealthStatus> {
        self.shared.tick().await
    }

    pub fn get_status(&self, id: &str) -> Option<HealthStatus> {
        lock(&self.shared.statuses).get(id).cloned()
    }

    pub fn get_all_statuses(&self) -> HashMap<String, HealthStatus> {
        lock(&self.shared.statuses).clone()
    }
}

impl Ticker {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!(error = %e, "Health monitor task panicked");
            }
        }
    }
}

async fn run_loop(shared: Arc<Shared>, period: Duration, cancel: CancellationToken) {
    // First tick of a tokio interval completes immediately
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shared.tick() => {}
                }
            }
        }
    }
}

async fn forward_exits(
    mut exits: broadcast::Receiver<SupervisorEvent>,
    events: broadcast::Sender<HealthEvent>,
) {
    loop {
        match exits.recv().await {
            Ok(SupervisorEvent::ProcessExit { id, .. }) => {
                debug!(id = %id, "Process exit reported by supervisor");
                let _ = events.send(HealthEvent::ProcessDied {
                    id,
                    last_check: Utc::now(),
                });
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                warn!(missed = n, "Health monitor lagged behind supervisor events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

impl Shared {
    fn emit(&self, event: HealthEvent) {
        let _ = self.events.send(event);
    }

    async fn tick(&self) -> HashMap<String, HealthStatus> {
        let processes = self.source.active_processes();

        // One hung port must not hold up any other process's check
        let current: HashMap<String, HealthStatus> =
            join_all(processes.into_iter().map(|process| async move {
                let running = self.source.is_running(&process.id);
                let ports = probe_ports(&process.ports, self.probe_timeout).await;
                let healthy = running && ports.values().all(|open| *open);
                let status = HealthStatus {
                    running,
                    healthy,
                    last_check: Utc::now(),
                    ports,
                };
                (process.id, status)
            }))
            .await
            .into_iter()
            .collect();

        let previous = std::mem::replace(&mut *lock(&self.statuses), current.clone());

        for (id, now) in &current {
            let Some(before) = previous.get(id) else {
                continue;
            };
            if before.running == now.running && before.healthy == now.healthy {
                continue;
            }
            debug!(
                id = %id,
                running = now.running,
                healthy = now.healthy,
                "Health status changed"
            );
            self.emit(HealthEvent::StatusChange {
                id: id.clone(),
                previous: before.clone(),
                current: now.clone(),
            });
            if before.running && !now.running {
                warn!(id = %id, "Process died");
                self.emit(HealthEvent::ProcessDied {
                    id: id.clone(),
                    last_check: now.last_check,
                });
            }
        }

        self.emit(HealthEvent::HealthCheck {
            statuses: current.clone(),
        });
        current
    }
}

/// Probe every port concurrently; each gets its own timeout.
async fn probe_ports(ports: &[u16], timeout: Duration) -> BTreeMap<u16, bool> {
    let results = join_all(ports.iter().map(|&port| async move {
        (port, port_open(port, timeout).await)
    }))
    .await;
    results.into_iter().collect()
}

async fn port_open(port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(port, error = %e, "Port probe failed");
            false
        }
        Err(_) => {
            debug!(port, "Port probe timed out");
            false
        }
    }
}
