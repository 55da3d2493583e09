/// Per-instance settings stored as host cvars
use crate::config::types::{Result, VmType};
use crate::services::cvar::{BoolHook, CvarFlags, CvarHook, CvarSpec, CvarStore, RangeHook};
use std::sync::Arc;
use std::time::Duration;

const MAX_STARTUP_TIMEOUT_MS: i64 = 10 * 60 * 1000;

/// Names of the cvars controlling one VM instance.
///
/// The values are read when the instance is created, so changing them only
/// affects the next `create()`.
#[derive(Clone, Debug)]
pub struct VmParams {
    pub type_key: String,
    pub log_syscalls_key: String,
    pub startup_timeout_key: String,
}

impl VmParams {
    pub fn new(vm_name: &str) -> Self {
        Self {
            type_key: format!("vm.{}.type", vm_name),
            log_syscalls_key: format!("vm.{}.logSyscalls", vm_name),
            startup_timeout_key: format!("vm.{}.startupTimeout", vm_name),
        }
    }

    /// Register the cvars unless an earlier instance of the same name did.
    pub fn register(cvars: &CvarStore, vm_name: &str, default_startup: Duration) -> Result<Self> {
        let params = Self::new(vm_name);
        let types = VmType::ALL.map(|t| format!("{}={}", t.ordinal(), t));
        let entries: [(&str, String, String, Arc<dyn CvarHook>); 3] = [
            (
                params.type_key.as_str(),
                format!("how to load the {} module: {}", vm_name, types.join(", ")),
                VmType::Sandboxed.ordinal().to_string(),
                Arc::new(RangeHook {
                    min: 0,
                    max: VmType::ALL.len() as i64 - 1,
                }),
            ),
            (
                params.log_syscalls_key.as_str(),
                format!("log every {} syscall to {}-syscallLog", vm_name, vm_name),
                "0".to_string(),
                Arc::new(BoolHook),
            ),
            (
                params.startup_timeout_key.as_str(),
                format!("milliseconds to wait for the {} module to become ready", vm_name),
                default_startup.as_millis().to_string(),
                Arc::new(RangeHook {
                    min: 1,
                    max: MAX_STARTUP_TIMEOUT_MS,
                }),
            ),
        ];

        for (key, description, default, hook) in entries {
            if cvars.is_registered(key) {
                continue;
            }
            cvars.register(
                key,
                CvarSpec::new(&description, CvarFlags::ARCHIVE, &default),
                None,
                Some(hook),
            )?;
        }
        Ok(params)
    }

    pub fn vm_type(&self, cvars: &CvarStore) -> VmType {
        cvars
            .get_int(&self.type_key)
            .and_then(VmType::from_ordinal)
            .unwrap_or(VmType::Sandboxed)
    }

    pub fn log_syscalls(&self, cvars: &CvarStore) -> bool {
        cvars.get_bool(&self.log_syscalls_key).unwrap_or(false)
    }

    pub fn startup_timeout(&self, cvars: &CvarStore, fallback: Duration) -> Duration {
        cvars
            .get_int(&self.startup_timeout_key)
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(fallback)
    }
}
