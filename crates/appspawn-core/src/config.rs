//! Daemon configuration and config-fragment lookup

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpawnError};
use crate::privilege::SandboxMode;

pub const DEFAULT_SOCKET_PATH: &str = "/run/appspawn/appspawn.sock";
pub const DEFAULT_CONFIG_DIR: &str = "/etc/appspawn";
pub const DEFAULT_SANDBOX_FRAGMENT: &str = "appdata-sandbox.json";

/// Top-level daemon settings, read from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// Listening socket path
    pub socket_path: PathBuf,
    /// Directories searched, in order, for config fragments
    pub config_dirs: Vec<PathBuf>,
    /// Fragment holding sandbox mounts and permission names
    pub sandbox_fragment: String,
    pub child_ready_timeout_ms: u64,
    pub socket_timeout_ms: u64,
    pub terminate_timeout_ms: u64,
    /// Argv the child runs when the request carries none; empty means the
    /// child waits for signals
    pub default_entry: Vec<String>,
    /// Root of the per-app cgroup tree; placement is off when unset
    pub cgroup_root: Option<PathBuf>,
    pub sandbox: SandboxMode,
    /// Exit statuses kept for later status queries
    pub died_queue_len: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            config_dirs: vec![PathBuf::from(DEFAULT_CONFIG_DIR)],
            sandbox_fragment: DEFAULT_SANDBOX_FRAGMENT.to_string(),
            child_ready_timeout_ms: 5000,
            socket_timeout_ms: 2000,
            terminate_timeout_ms: 3000,
            default_entry: Vec::new(),
            cgroup_root: None,
            sandbox: SandboxMode::Auto,
            died_queue_len: 64,
        }
    }
}

impl DaemonConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SpawnError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
            .map_err(|e| SpawnError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load `path` when given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(SpawnError::Config("socket-path is empty".into()));
        }
        if self.child_ready_timeout_ms == 0 {
            return Err(SpawnError::Config(
                "child-ready-timeout-ms must be positive".into(),
            ));
        }
        if self.sandbox_fragment.is_empty() {
            return Err(SpawnError::Config("sandbox-fragment is empty".into()));
        }
        Ok(())
    }

    pub fn child_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.child_ready_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub fn locator(&self) -> ConfigLocator {
        ConfigLocator::new(self.config_dirs.clone())
    }
}

/// Resolves named config fragments against ordered search directories
#[derive(Debug, Clone, Default)]
pub struct ConfigLocator {
    dirs: Vec<PathBuf>,
}

impl ConfigLocator {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Every existing file named `name`, in search order
    pub fn find_all(&self, name: &str) -> Vec<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .filter(|path| path.is_file())
            .collect()
    }

    /// Parse every fragment named `name`; unreadable ones are logged and skipped
    pub fn load_json(&self, name: &str) -> Vec<(PathBuf, serde_json::Value)> {
        let mut out = Vec::new();
        for path in self.find_all(name) {
            match read_json(&path) {
                Ok(value) => out.push((path, value)),
                Err(err) => log::warn!("skipping config fragment: {}", err),
            }
        }
        if out.is_empty() {
            log::debug!("no usable fragment {} in {:?}", name, self.dirs);
        }
        out
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| SpawnError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| SpawnError::Config(format!("cannot parse {}: {}", path.display(), e)))
}
