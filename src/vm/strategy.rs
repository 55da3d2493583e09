//! Execution strategies.
//!
//! A strategy only starts the module's entry point, hands back the host end of
//! its root channel, and stops it again. Everything above the channel (state,
//! readiness, syscalls) belongs to the VM instance.
use crate::config::host::HostConfig;
use crate::config::types::{Result, VmError, VmType};
use crate::ipc::Channel;
use crate::vm::child::ChildProcess;
use crate::vm::in_process::{InProcessThread, ModuleEntry, ModuleImage};
use crate::vm::sandbox::SandboxPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What happened while stopping a strategy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StopReport {
    /// Module exited on its own within the grace period
    pub exited_cleanly: bool,
    pub term_sent: bool,
    pub kill_sent: bool,
    /// Worker thread left running and its image leaked
    pub detached: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

pub trait ExecutionStrategy: Send {
    fn vm_type(&self) -> VmType;

    /// Start the module and return the host end of its root channel.
    fn start(&mut self) -> Result<Channel>;

    /// Whether the child process or worker thread is still held.
    fn is_live(&mut self) -> bool;

    /// Wait up to `grace` for the module to exit, then force it.
    /// Always releases the strategy's resources.
    fn stop(&mut self, grace: Duration) -> StopReport;
}

/// Where and how modules are started
#[derive(Clone)]
pub struct VmOptions {
    /// Directory holding module executables and libraries
    pub lib_path: PathBuf,
    /// Explicit executable for process modes instead of `<lib_path>/<name>`
    pub executable: Option<PathBuf>,
    /// Arguments placed before the root socket argument
    pub executable_args: Vec<String>,
    /// Entry point linked into the host, preferred by in-process mode
    pub linked_entry: Option<ModuleEntry>,
    pub sandbox: SandboxPolicy,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Directory for `<name>-syscallLog` files
    pub log_dir: PathBuf,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self::from_host_config(&HostConfig::default())
    }
}

impl VmOptions {
    pub fn from_host_config(config: &HostConfig) -> Self {
        Self {
            lib_path: config.lib_path.clone(),
            executable: None,
            executable_args: Vec::new(),
            linked_entry: None,
            sandbox: config.sandbox.clone(),
            startup_timeout: config.startup_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            log_dir: config.log_dir.clone(),
        }
    }

    pub fn with_executable(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.executable = Some(program.into());
        self.executable_args = args;
        self
    }

    pub fn with_linked_entry(mut self, entry: ModuleEntry) -> Self {
        self.linked_entry = Some(entry);
        self
    }
}

/// Build the strategy for `vm_type`, resolving the module image location.
pub fn create_strategy(
    vm_type: VmType,
    name: &str,
    options: &VmOptions,
) -> Result<Box<dyn ExecutionStrategy>> {
    log::info!("VM {}: selecting {} execution strategy", name, vm_type);

    match vm_type {
        VmType::NativeDll => {
            let image = match &options.linked_entry {
                Some(entry) => ModuleImage::Linked(entry.clone()),
                None => ModuleImage::SharedLibrary(options.lib_path.join(format!("lib{}.so", name))),
            };
            Ok(Box::new(InProcessThread::new(name, image)))
        }
        VmType::NativeExe | VmType::Sandboxed => {
            let program = match &options.executable {
                Some(program) => program.clone(),
                None => {
                    let program = options.lib_path.join(name);
                    if !program.is_file() {
                        return Err(VmError::Startup(format!(
                            "module executable {} not found",
                            program.display()
                        )));
                    }
                    program
                }
            };
            let sandbox = (vm_type == VmType::Sandboxed).then(|| options.sandbox.clone());
            Ok(Box::new(ChildProcess::new(
                name,
                program,
                options.executable_args.clone(),
                sandbox,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_strategy_matches_type() {
        let entry: ModuleEntry = Arc::new(|_channel| Ok(()));
        let options = VmOptions::default()
            .with_linked_entry(entry)
            .with_executable("/bin/true", Vec::new());
        for vm_type in VmType::ALL {
            let strategy = create_strategy(vm_type, "game", &options).unwrap();
            assert_eq!(strategy.vm_type(), vm_type);
        }
    }

    #[test]
    fn test_missing_executable_is_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let options = VmOptions {
            lib_path: dir.path().to_path_buf(),
            ..VmOptions::default()
        };
        let err = create_strategy(VmType::NativeExe, "nothing", &options).err().unwrap();
        assert!(matches!(err, VmError::Startup(_)));
    }
}
