//! Host-side stand-ins for module-owned commands and cvars.
use crate::config::types::{Result, VmError};
use crate::services::command::{Command, CommandEnvironment};
use crate::services::cvar::CvarHook;
use crate::services::syscalls::{CvarValueChangedMsg, ExecuteCommandMsg};
use crate::vm::instance::WeakVmLink;
use std::sync::{Arc, Mutex};

/// Command environments of the proxy invocations in flight for one VM.
///
/// Print and execute-after syscalls made while a proxy command runs go to the
/// environment of the innermost invocation; otherwise to the default one.
pub struct EnvStack {
    default: Arc<dyn CommandEnvironment>,
    stack: Mutex<Vec<Arc<dyn CommandEnvironment>>>,
}

pub struct EnvScope<'a>(&'a EnvStack);

impl Drop for EnvScope<'_> {
    fn drop(&mut self) {
        self.0.stack.lock().unwrap_or_else(|e| e.into_inner()).pop();
    }
}

impl EnvStack {
    pub fn new(default: Arc<dyn CommandEnvironment>) -> Self {
        Self {
            default,
            stack: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, env: Arc<dyn CommandEnvironment>) -> EnvScope<'_> {
        self.stack.lock().unwrap_or_else(|e| e.into_inner()).push(env);
        EnvScope(self)
    }

    pub fn current(&self) -> Arc<dyn CommandEnvironment> {
        let stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
        stack.last().cloned().unwrap_or_else(|| self.default.clone())
    }

    pub fn depth(&self) -> usize {
        self.stack.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Command implemented by a module. Running it makes one call into the module.
pub struct ProxyCommand {
    vm: WeakVmLink,
    envs: Arc<EnvStack>,
}

impl ProxyCommand {
    pub fn new(vm: WeakVmLink, envs: Arc<EnvStack>) -> Self {
        Self { vm, envs }
    }
}

impl Command for ProxyCommand {
    fn run(&self, args: &[String], env: &Arc<dyn CommandEnvironment>) -> Result<()> {
        let vm = self
            .vm
            .upgrade()
            .ok_or_else(|| VmError::NotActive(self.vm.name().to_string()))?;
        // The env stack belongs to whichever thread holds the gate.
        let _gate = vm.hold();
        let _scope = self.envs.push(env.clone());
        vm.send_msg::<ExecuteCommandMsg>(&args.to_vec())
    }
}

/// Forwards value changes of a module-owned cvar to the module, which may
/// reject them.
pub struct ProxyCvar {
    vm: WeakVmLink,
}

impl ProxyCvar {
    pub fn new(vm: WeakVmLink) -> Self {
        Self { vm }
    }
}

impl CvarHook for ProxyCvar {
    fn on_value_changed(&self, name: &str, value: &str) -> std::result::Result<(), String> {
        let Some(vm) = self.vm.upgrade() else {
            return Err(format!("{} is not loaded", self.vm.name()));
        };
        match vm.send_msg::<CvarValueChangedMsg>(&(name.to_string(), value.to_string())) {
            Ok((true, _)) => Ok(()),
            Ok((false, description)) => Err(description),
            Err(e) => Err(e.to_string()),
        }
    }
}
