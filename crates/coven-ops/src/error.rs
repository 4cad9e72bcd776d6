// ABOUTME: Error types for the supervisor, state store, and orchestrator.
// ABOUTME: Each component returns its own thiserror enum; OpsError wraps them.

use coven_ops_core::CommandParseError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the process supervisor.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// A process with this identifier is already active.
    #[error("process '{0}' is already running")]
    DuplicateIdentifier(String),

    /// The OS refused to start the command.
    #[error("failed to launch '{id}' ({program}): {source}")]
    LaunchFailed {
        id: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// No active process has this identifier.
    #[error("no running process '{0}'")]
    NotFound(String),
}

/// Errors writing the persisted process snapshot.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize process state: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to write process state to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the orchestrator's command surface.
#[derive(Error, Debug)]
pub enum OpsError {
    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("service '{0}' is already running")]
    AlreadyRunning(String),

    #[error("invalid command for service '{id}': {source}")]
    Parse {
        id: String,
        #[source]
        source: CommandParseError,
    },

    /// The pid belongs to a process this supervisor manages; use stop instead.
    #[error("pid {pid} is managed as '{id}'")]
    ManagedPid { id: String, pid: u32 },

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Persistence(#[from] StateError),
}

/// Result type alias using OpsError.
pub type Result<T> = std::result::Result<T, OpsError>;
