// ABOUTME: Typed lifecycle events emitted by the supervisor, health monitor, and orchestrator.
// ABOUTME: Delivered over tokio broadcast channels so every subscriber sees every event.

use crate::health::HealthStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Capacity of each component's broadcast channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Process lifecycle events from the supervisor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SupervisorEvent {
    #[serde(rename_all = "camelCase")]
    ProcessStarted { id: String, pid: u32 },
    /// Emitted before the id leaves the supervisor's active set
    #[serde(rename_all = "camelCase")]
    ProcessExit {
        id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    ProcessError { id: String, error: String },
}

/// Events from the periodic health checks
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HealthEvent {
    /// Full status table after every tick
    HealthCheck {
        statuses: HashMap<String, HealthStatus>,
    },
    StatusChange {
        id: String,
        previous: HealthStatus,
        current: HealthStatus,
    },
    #[serde(rename_all = "camelCase")]
    ProcessDied {
        id: String,
        last_check: DateTime<Utc>,
    },
}

/// Everything an orchestrator subscriber can observe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OpsEvent {
    #[serde(rename_all = "camelCase")]
    Initialized { recovered_count: usize },
    ServerStarted { id: String, pid: u32 },
    ServerStopped { id: String },
    OrphanKilled { id: String, pid: u32 },
    Supervisor { event: SupervisorEvent },
    Health { event: HealthEvent },
}

impl OpsEvent {
    /// Event name as exposed to dashboard clients
    pub fn name(&self) -> &'static str {
        match self {
            OpsEvent::Initialized { .. } => "initialized",
            OpsEvent::ServerStarted { .. } => "serverStarted",
            OpsEvent::ServerStopped { .. } => "serverStopped",
            OpsEvent::OrphanKilled { .. } => "orphanKilled",
            OpsEvent::Supervisor { event } => match event {
                SupervisorEvent::ProcessStarted { .. } => "processStarted",
                SupervisorEvent::ProcessExit { .. } => "processExit",
                SupervisorEvent::ProcessError { .. } => "processError",
            },
            OpsEvent::Health { event } => match event {
                HealthEvent::HealthCheck { .. } => "healthCheck",
                HealthEvent::StatusChange { .. } => "statusChange",
                HealthEvent::ProcessDied { .. } => "processDied",
            },
        }
    }
}
