// ABOUTME: Integration tests for coven-ops.
// ABOUTME: Drives the orchestrator end to end against real child processes.

use chrono::Utc;
use coven_ops::{
    ActionOutcome, OpsEvent, Orchestrator, OrchestratorOptions, PersistedProcess, PortOwners,
    ProcessStatus, ServiceConfig, StateStore,
};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn orchestrator(dir: &TempDir) -> Orchestrator {
    let mut options = OrchestratorOptions::new(dir.path());
    options.kill_grace = Duration::from_millis(200);
    options.health_interval = Duration::from_millis(100);
    Orchestrator::new(options)
}

fn record(id: &str, pid: u32) -> PersistedProcess {
    PersistedProcess {
        id: id.to_string(),
        pid,
        command: "sleep 30".to_string(),
        cwd: PathBuf::from("/tmp"),
        start_time: Utc::now(),
        status: ProcessStatus::Running,
        ports: vec![],
    }
}

#[tokio::test]
async fn test_echo_service_start_stop_status() {
    let dir = tempfile::tempdir().unwrap();
    let ops = orchestrator(&dir);
    ops.register_service("api", ServiceConfig::new("API", "echo hello"));

    let started = ActionOutcome::from(ops.start_server("api"));
    assert!(started.success, "{}", started.message);
    assert!(started.pid.is_some());

    let stopped = ActionOutcome::from(ops.stop_server("api").await);
    assert!(stopped.success, "{}", stopped.message);

    let statuses = ops.get_server_status(&PortOwners::new());
    let api = statuses.iter().find(|s| s.id == "api").unwrap();
    assert!(!api.running);
    assert!(!api.orphaned);
    assert!(!api.healthy);
    assert!(ops.persisted_processes().is_empty());

    // Output outlives the process
    let mut logs = Vec::new();
    for _ in 0..20 {
        logs = ops.get_logs("api");
        if !logs.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(logs, vec!["hello".to_string()]);
}

#[tokio::test]
async fn test_orphan_detected_from_port_table() {
    let dir = tempfile::tempdir().unwrap();
    let ops = orchestrator(&dir);
    ops.register_service("x", ServiceConfig::new("X", "true").with_ports([9000]));
    ops.register_service("y", ServiceConfig::new("Y", "true").with_ports([9001]));

    let owners: PortOwners = [(9000, 4321)].into_iter().collect();
    let statuses = ops.get_server_status(&owners);

    let x = statuses.iter().find(|s| s.id == "x").unwrap();
    assert!(x.orphaned);
    assert_eq!(x.orphan_pid, Some(4321));

    let y = statuses.iter().find(|s| s.id == "y").unwrap();
    assert!(!y.orphaned);
    assert_eq!(y.orphan_pid, None);
}

#[tokio::test]
async fn test_initialize_prunes_dead_records() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = StateStore::new(dir.path());
        store
            .save_process(record("alive", std::process::id()))
            .unwrap();
        // Above any pid_max, so never a live process
        store.save_process(record("dead", i32::MAX as u32)).unwrap();
    }

    let ops = orchestrator(&dir);
    let mut rx = ops.subscribe();
    let recovered = ops.initialize().await;
    assert_eq!(recovered, 2);

    let remaining: Vec<String> = ops
        .persisted_processes()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(remaining, vec!["alive".to_string()]);

    let initialized = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let OpsEvent::Initialized { recovered_count } = rx.recv().await.unwrap() {
                return recovered_count;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(initialized, 2);

    // Survives a restart: the pruned record is gone from disk too
    let mut reloaded = StateStore::new(dir.path());
    reloaded.load();
    assert!(reloaded.has_process("alive"));
    assert!(!reloaded.has_process("dead"));

    ops.shutdown().await;
}

#[tokio::test]
async fn test_initialize_with_corrupt_state() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("processes.json"), "[[[").unwrap();

    let ops = orchestrator(&dir);
    assert_eq!(ops.initialize().await, 0);
    ops.shutdown().await;
}

#[tokio::test]
async fn test_health_events_are_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let ops = orchestrator(&dir);
    let mut rx = ops.subscribe();
    ops.register_service("sleepy", ServiceConfig::new("Sleepy", "sleep 30"));
    ops.initialize().await;
    ops.start_server("sleepy").unwrap();

    let healthy = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.name() != "healthCheck" {
                continue;
            }
            if let OpsEvent::Health {
                event: coven_ops::HealthEvent::HealthCheck { statuses },
            } = event
            {
                if let Some(status) = statuses.get("sleepy") {
                    return status.healthy;
                }
            }
        }
    })
    .await
    .unwrap();
    assert!(healthy);

    let statuses = ops.get_server_status(&PortOwners::new());
    let sleepy = statuses.iter().find(|s| s.id == "sleepy").unwrap();
    assert!(sleepy.running);
    assert!(sleepy.last_check.is_some());

    ops.shutdown().await;
    assert!(ops.persisted_processes().is_empty());
}

#[tokio::test]
async fn test_kill_orphaned_process() {
    let dir = tempfile::tempdir().unwrap();
    let ops = orchestrator(&dir);
    let mut rx = ops.subscribe();

    // Started outside the supervisor, like a leftover from a previous run
    let mut stray = tokio::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let pid = stray.id().unwrap();

    let outcome = ActionOutcome::from(ops.kill_orphaned_process("web", pid).await);
    assert!(outcome.success, "{}", outcome.message);

    let status = tokio::time::timeout(Duration::from_secs(2), stray.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(!status.success());

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        OpsEvent::OrphanKilled {
            id: "web".to_string(),
            pid
        }
    );
}
