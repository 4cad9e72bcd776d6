// ABOUTME: Durable JSON snapshot of the processes the orchestrator last started.
// ABOUTME: Write-through on every change; missing or corrupt files load as empty.

use crate::error::StateError;
use crate::supervisor::ProcessStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const STATE_FILE: &str = "processes.json";

/// One entry of the persisted snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedProcess {
    pub id: String,
    pub pid: u32,
    pub command: String,
    pub cwd: PathBuf,
    pub start_time: DateTime<Utc>,
    pub status: ProcessStatus,
    #[serde(default)]
    pub ports: Vec<u16>,
}

pub struct StateStore {
    path: PathBuf,
    processes: BTreeMap<String, PersistedProcess>,
}

impl StateStore {
    /// A store persisting to `<dir>/processes.json`. Nothing is read until `load`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(STATE_FILE),
            processes: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory table with the file contents. Never fails: a
    /// missing file is a fresh start and a corrupt one is logged and ignored.
    pub fn load(&mut self) {
        self.processes = match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(processes) => processes,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Process state is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No process state yet");
                BTreeMap::new()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read process state, starting empty");
                BTreeMap::new()
            }
        };
    }

    /// Insert or overwrite a record and persist. On error the in-memory
    /// table still holds the new record.
    pub fn save_process(&mut self, record: PersistedProcess) -> Result<(), StateError> {
        self.processes.insert(record.id.clone(), record);
        self.persist()
    }

    /// Remove a record and persist. Returns whether a record existed.
    pub fn remove_process(&mut self, id: &str) -> Result<bool, StateError> {
        if self.processes.remove(id).is_none() {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    pub fn get_all_processes(&self) -> Vec<PersistedProcess> {
        self.processes.values().cloned().collect()
    }

    pub fn get_process(&self, id: &str) -> Option<&PersistedProcess> {
        self.processes.get(id)
    }

    pub fn has_process(&self, id: &str) -> bool {
        self.processes.contains_key(id)
    }

    pub fn clear(&mut self) -> Result<(), StateError> {
        self.processes.clear();
        self.persist()
    }

    fn persist(&self) -> Result<(), StateError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StateError::CreateDirectory {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let content =
            serde_json::to_string_pretty(&self.processes).map_err(StateError::Serialize)?;
        std::fs::write(&self.path, content).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
