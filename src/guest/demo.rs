//! Small module used by the `vmhost` binary and the integration tests.
use crate::config::types::Result;
use crate::guest::{self, CvarValidator, GameModule, Guest};
use crate::services::cvar::{CvarFlags, CvarHook, RangeHook};
use crate::services::log::{Level, LOG_FACADE};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEMO_CVAR: &str = "g_demo";

/// Registers `g_demo` (integer 0..=100) and a handful of commands:
/// `echo`, `demo.counter`, `demo.set`, `demo.log`, `demo.later`, `demo.time`
/// and `demo.panic`.
#[derive(Default)]
pub struct DemoModule {
    counter: Arc<AtomicU64>,
}

impl DemoModule {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GameModule for DemoModule {
    fn name(&self) -> &str {
        "demo"
    }

    fn init(&self, guest: &Guest) -> Result<()> {
        let range = RangeHook { min: 0, max: 100 };
        let validator: CvarValidator =
            Arc::new(move |value: &str| range.on_value_changed(DEMO_CVAR, value));
        guest.register_cvar_with(
            DEMO_CVAR,
            "demo value, 0..=100",
            CvarFlags::ARCHIVE.bits(),
            "0",
            Some(validator),
        )?;

        guest.add_command("echo", "print the arguments", |guest, args| {
            guest.print(&args[1..].join(" "))
        })?;

        let counter = self.counter.clone();
        guest.add_command("demo.counter", "count invocations", move |guest, _args| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            guest.print(&format!("counter = {}", n))
        })?;

        guest.add_command("demo.set", "set a host cvar from the module", |guest, args| {
            let [_, name, value] = args else {
                return guest.print("usage: demo.set <name> <value>");
            };
            let accepted = guest.set_cvar(name, value)?;
            guest.print(&format!("{} {}", name, if accepted { "set" } else { "refused" }))
        })?;

        guest.add_command("demo.log", "log the arguments to the log facade", |guest, args| {
            guest.log(Level::Notice, &args[1..].join(" "), 1 << LOG_FACADE)
        })?;

        guest.add_command("demo.later", "run a command on the next host pass", |guest, args| {
            guest.execute_after(&args[1..].join(" "), true)
        })?;

        guest.add_command("demo.time", "print host milliseconds", |guest, _args| {
            let ms = guest.milliseconds()?;
            guest.print(&format!("{} ms", ms))
        })?;

        guest.add_command("demo.panic", "crash the module", |_guest, _args| -> Result<()> {
            panic!("demo.panic invoked");
        })?;

        log::debug!("Demo module initialised");
        Ok(())
    }

    fn shutdown(&self, guest: &Guest) {
        if let Err(e) = guest.print("demo module shutting down") {
            log::debug!("Shutdown print failed: {}", e);
        }
    }
}


/// `vm_main` export of the demo module, for loading `libvmhost.so` as an
/// in-process module library.
///
/// # Safety
/// `root_fd` must be the root socket handed over by the host and owned by
/// nobody else.
#[no_mangle]
pub unsafe extern "C" fn vm_main(root_fd: c_int) -> c_int {
    let result = std::panic::catch_unwind(|| unsafe {
        guest::run_from_fd(root_fd, Arc::new(DemoModule::new()))
    });
    match result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            log::warn!("Demo module stopped: {}", e);
            1
        }
        Err(_) => 2,
    }
}
