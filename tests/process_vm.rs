//! End-to-end tests with the demo module running in a child process.
//!
//! The `vmhost` binary doubles as the module executable.

use std::sync::Arc;
use std::time::Duration;
use vmhost::cli::DEMO_MODULE_ROLE;
use vmhost::config::params::VmParams;
use vmhost::services::command::{BufferedEnvironment, CommandEnvironment};
use vmhost::services::crash::FileCrashSink;
use vmhost::{HostServices, VmError, VmInstance, VmOptions, VmState, VmType};

fn instance(host: &HostServices, vm_type: VmType) -> VmInstance {
    host.cvars
        .set(&VmParams::new("demo").type_key, &vm_type.ordinal().to_string())
        .unwrap();
    let options = VmOptions {
        startup_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(2),
        ..VmOptions::default()
    }
    .with_executable(env!("CARGO_BIN_EXE_vmhost"), vec![DEMO_MODULE_ROLE.to_string()]);
    VmInstance::with_common_services("demo", host.clone(), options).unwrap()
}

fn buffered(host: &HostServices) -> (Arc<BufferedEnvironment>, Arc<dyn CommandEnvironment>) {
    let output = Arc::new(BufferedEnvironment::new(host.commands.clone()));
    (output.clone(), output)
}

fn exercise(vm_type: VmType) {
    let host = HostServices::new();
    let (output, env) = buffered(&host);
    let mut vm = instance(&host, vm_type);

    vm.create().unwrap();
    assert!(vm.is_active());

    host.commands.execute("echo from a child", &env).unwrap();
    host.commands.execute("demo.counter", &env).unwrap();
    assert_eq!(output.take_lines(), vec!["from a child", "counter = 1"]);

    host.cvars.set("g_demo", "12").unwrap();
    assert!(host.cvars.set("g_demo", "-1").is_err());
    assert_eq!(host.cvars.get("g_demo").as_deref(), Some("12"));

    let report = vm.free().unwrap();
    assert!(report.exited_cleanly, "{:?}", report);
    assert_eq!(report.exit_code, Some(0));
    assert!(!vm.is_active());
    assert_eq!(vm.state(), VmState::Unloaded);
    assert!(!host.commands.contains("demo.counter"));
}

#[test]
fn test_native_exe_module() {
    exercise(VmType::NativeExe);
}

#[test]
fn test_sandboxed_module() {
    exercise(VmType::Sandboxed);
}

#[test]
fn test_module_panic_writes_crash_dump() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(FileCrashSink::new(dir.path()));
    let mut host = HostServices::new();
    host.crash = sink.clone();
    let (_output, env) = buffered(&host);
    let mut vm = instance(&host, VmType::NativeExe);
    vm.create().unwrap();

    let err = host.commands.execute("demo.panic", &env).unwrap_err();
    assert!(matches!(err, VmError::ChannelBroken(_)), "{}", err);
    assert_eq!(vm.state(), VmState::Faulted);
    assert!(!vm.is_active());

    let dumps = sink.written();
    assert_eq!(dumps.len(), 1);
    let dump = std::fs::read_to_string(&dumps[0]).unwrap();
    assert!(dump.contains("demo.panic invoked"));
}

#[test]
fn test_missing_executable_fails_startup() {
    let host = HostServices::new();
    host.cvars
        .set(&VmParams::new("ghost").type_key, &VmType::NativeExe.ordinal().to_string())
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let options = VmOptions {
        lib_path: dir.path().to_path_buf(),
        ..VmOptions::default()
    };
    let mut vm = VmInstance::with_common_services("ghost", host, options).unwrap();

    assert!(matches!(vm.create(), Err(VmError::Startup(_))));
    assert_eq!(vm.state(), VmState::Faulted);
}
