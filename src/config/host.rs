/// Host configuration file
use crate::config::types::{Result, VmError};
use crate::services::cvar::{CvarStore, Writer};
use crate::vm::sandbox::SandboxPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory holding module executables and libraries
    pub lib_path: PathBuf,
    /// Writable per-user directory; crash dumps go to `<home_path>/crashdump`
    pub home_path: PathBuf,
    /// Directory for syscall logs
    pub log_dir: PathBuf,
    pub startup_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub sandbox: SandboxPolicy,
    /// Initial cvar values, applied before any instance registers its cvars
    pub cvars: BTreeMap<String, String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            lib_path: PathBuf::from("."),
            home_path: PathBuf::from("."),
            log_dir: PathBuf::from("."),
            startup_timeout_ms: 10_000,
            shutdown_timeout_ms: 2_000,
            sandbox: SandboxPolicy::default(),
            cvars: BTreeMap::new(),
        }
    }
}

impl HostConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VmError::Config(format!("Failed to read config file: {}", e)))?;

        let config: HostConfig = serde_json::from_str(&content)
            .map_err(|e| VmError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `./vmhost.json`
    pub fn load_default() -> Result<Self> {
        let path = std::env::current_dir()
            .map_err(|e| VmError::Config(format!("Failed to get current directory: {}", e)))?
            .join("vmhost.json");

        if !path.exists() {
            return Err(VmError::Config(
                "vmhost.json not found in current directory".to_string(),
            ));
        }

        Self::load_from_file(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.startup_timeout_ms == 0 {
            return Err(VmError::Config("startup_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn crash_dir(&self) -> PathBuf {
        self.home_path.join("crashdump")
    }

    /// Seed `store` with the configured initial values.
    pub fn apply_cvars(&self, store: &CvarStore) {
        for (name, value) in &self.cvars {
            if let Err(e) = store.set_as(name, value, Writer::Host) {
                log::warn!("Ignoring configured cvar {}: {}", name, e);
            }
        }
    }
}
