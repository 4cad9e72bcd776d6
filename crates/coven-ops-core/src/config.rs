// ABOUTME: Configuration for the coven-ops supervisor and its services.
// ABOUTME: Loaded from TOML file with sensible defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    #[default]
    Server,
    Agent,
}

/// A startable service as registered with the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Display name shown on the dashboard
    pub name: String,

    /// Command line, split with quote-aware rules before launch
    pub command: String,

    /// Working directory for the child process
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,

    /// Environment overrides layered over the supervisor's environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Ports the service is expected to listen on
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Display color for the dashboard
    #[serde(default = "default_color")]
    pub color: String,

    #[serde(default)]
    pub kind: ServiceKind,
}

fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

fn default_color() -> String {
    "white".to_string()
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cwd: default_cwd(),
            env: HashMap::new(),
            ports: Vec::new(),
            color: default_color(),
            kind: ServiceKind::default(),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn with_kind(mut self, kind: ServiceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Expand ~ in the working directory
    pub fn cwd_expanded(&self) -> PathBuf {
        expand(&self.cwd.to_string_lossy())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsConfig {
    /// Directory holding the persisted process snapshot.
    /// Defaults to ~/.config/coven/ops
    #[serde(default)]
    pub state_dir: Option<String>,

    /// Interval between health checks
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Service ids started by `coven-ops run` after initialization
    #[serde(default)]
    pub autostart: Vec<String>,

    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

fn default_health_interval_ms() -> u64 {
    5000
}

fn default_kill_grace_ms() -> u64 {
    1000
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            health_interval_ms: default_health_interval_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            autostart: Vec::new(),
            services: BTreeMap::new(),
        }
    }
}

impl OpsConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: OpsConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Get the default config file path (~/.config/coven/ops.toml)
    pub fn default_path() -> PathBuf {
        config_dir().join("ops.toml")
    }

    /// Resolved state directory, with ~ expanded
    pub fn state_dir_expanded(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => expand(dir),
            None => config_dir().join("ops"),
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Reject configurations that cannot be acted on. Registration-time
    /// errors are the only ones allowed to stop the supervisor.
    pub fn validate(&self) -> Result<()> {
        if self.health_interval_ms == 0 {
            anyhow::bail!("health_interval_ms must be greater than zero");
        }
        for id in &self.autostart {
            if !self.services.contains_key(id) {
                anyhow::bail!("autostart references unknown service '{}'", id);
            }
        }
        for (id, service) in &self.services {
            crate::command::parse_command(&service.command)
                .with_context(|| format!("Invalid command for service '{}'", id))?;
        }
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".config"))
                .unwrap_or_else(|| PathBuf::from("."))
        })
        .join("coven")
}

fn expand(path: &str) -> PathBuf {
    shellexpand::tilde(path).into_owned().into()
}
