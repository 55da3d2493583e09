//! End-to-end tests with modules running on a host thread.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vmhost::config::params::VmParams;
use vmhost::guest::demo::{DemoModule, DEMO_CVAR};
use vmhost::guest::{self, GameModule, Guest};
use vmhost::ipc::{encode_payload, syscall_id, Channel, Frame};
use vmhost::services::command::{BufferedEnvironment, CommandEnvironment};
use vmhost::services::log::{target_mask, Event, Level, LogTarget, HUD};
use vmhost::vm::ModuleEntry;
use vmhost::{HostServices, Result, VmError, VmInstance, VmOptions, VmState, VmType};

/// Registers `g_test` and a few commands exercising the host services.
struct ProbeModule;

impl GameModule for ProbeModule {
    fn name(&self) -> &str {
        "probe"
    }

    fn init(&self, guest: &Guest) -> Result<()> {
        guest.register_cvar("g_test", "probe value", 0, "0")?;
        guest.add_command("show", "print g_test as the host sees it", |guest, _args| {
            let value = guest.get_cvar("g_test")?.unwrap_or_default();
            guest.print(&value)
        })?;
        guest.add_command("hud", "log the arguments to the HUD", |guest, args| {
            guest.log(Level::Notice, &args[1..].join(" "), target_mask(&[HUD]))
        })?;
        guest.add_command("slow", "print the arguments after a pause", |guest, args| {
            std::thread::sleep(Duration::from_millis(150));
            guest.print(&args[1..].join(" "))
        })?;
        guest.add_command("bogus", "send an unroutable syscall", |guest, _args| {
            guest
                .channel()
                .send(Frame::one_way(syscall_id(0x7f, 1), encode_payload(&())?))
        })?;
        Ok(())
    }
}

struct Fixture {
    host: HostServices,
    output: Arc<BufferedEnvironment>,
    env: Arc<dyn CommandEnvironment>,
    vm: VmInstance,
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new(name: &str, entry: ModuleEntry) -> Self {
        Self::with_timeout(name, entry, Duration::from_secs(5))
    }

    fn with_timeout(name: &str, entry: ModuleEntry, startup_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let host = HostServices::new();
        host.cvars
            .set(&VmParams::new(name).type_key, &VmType::NativeDll.ordinal().to_string())
            .unwrap();
        let options = VmOptions {
            startup_timeout,
            shutdown_timeout: Duration::from_secs(1),
            log_dir: dir.path().to_path_buf(),
            ..VmOptions::default()
        }
        .with_linked_entry(entry);
        let vm = VmInstance::with_common_services(name, host.clone(), options).unwrap();
        let output = Arc::new(BufferedEnvironment::new(host.commands.clone()));
        Self {
            env: output.clone(),
            output,
            host,
            vm,
            dir,
        }
    }

    fn run(&self, text: &str) -> Result<()> {
        self.host.commands.execute(text, &self.env)
    }
}

fn probe() -> ModuleEntry {
    guest::linked_entry(|| -> Arc<dyn GameModule> { Arc::new(ProbeModule) })
}

fn demo() -> ModuleEntry {
    guest::linked_entry(|| -> Arc<dyn GameModule> { Arc::new(DemoModule::new()) })
}

#[test]
fn test_create_free_sequence() {
    let mut f = Fixture::new("probe", probe());
    assert!(!f.vm.is_active());
    assert!(f.vm.free().is_none());

    f.vm.create().unwrap();
    assert!(f.vm.is_active());
    f.vm.free();
    assert!(!f.vm.is_active());
    assert_eq!(f.vm.state(), VmState::Unloaded);

    f.vm.create().unwrap();
    f.vm.create().unwrap();
    assert!(f.vm.is_active());
    f.vm.free();
    f.vm.free();
    assert_eq!(f.vm.state(), VmState::Unloaded);
}

#[test]
fn test_module_cvar_round_trip() {
    let mut f = Fixture::new("probe", probe());
    f.vm.create().unwrap();
    assert_eq!(f.host.cvars.get("g_test").as_deref(), Some("0"));
    assert_eq!(f.host.cvars.owner("g_test").as_deref(), Some("probe"));

    f.host.cvars.set("g_test", "42").unwrap();
    f.run("show").unwrap();
    assert_eq!(f.output.take_lines(), vec!["42"]);

    f.vm.free();
    assert_eq!(f.host.cvars.get("g_test"), None);
}

#[test]
fn test_proxy_command_prints_once_and_is_released() {
    let mut f = Fixture::new("demo", demo());
    f.vm.create().unwrap();
    assert!(f.host.commands.contains("echo"));

    f.run("echo hello world").unwrap();
    assert_eq!(f.output.take_lines(), vec!["hello world"]);

    f.run("demo.counter; demo.counter").unwrap();
    assert_eq!(f.output.take_lines(), vec!["counter = 1", "counter = 2"]);

    f.vm.free();
    assert!(!f.host.commands.contains("echo"));
    assert!(matches!(f.run("echo again"), Err(VmError::UnknownCommand(name)) if name == "echo"));
    assert!(f.output.lines().is_empty());
}

#[test]
fn test_module_rejects_cvar_value() {
    let mut f = Fixture::new("demo", demo());
    f.vm.create().unwrap();

    f.host.cvars.set(DEMO_CVAR, "55").unwrap();
    assert_eq!(f.host.cvars.get(DEMO_CVAR).as_deref(), Some("55"));

    let err = f.host.cvars.set(DEMO_CVAR, "500").unwrap_err();
    assert!(matches!(err, VmError::Cvar(_)));
    assert_eq!(f.host.cvars.get(DEMO_CVAR).as_deref(), Some("55"));
    assert!(f.vm.is_active());
}

#[test]
fn test_module_sets_host_cvar() {
    let mut f = Fixture::new("demo", demo());
    f.vm.create().unwrap();

    f.run("demo.set sv_hostname arena").unwrap();
    assert_eq!(f.output.take_lines(), vec!["sv_hostname set"]);
    assert_eq!(f.host.cvars.get("sv_hostname").as_deref(), Some("arena"));
}

#[test]
fn test_execute_after_is_deferred() {
    let mut f = Fixture::new("demo", demo());
    f.vm.create().unwrap();
    f.host.cvars.set(DEMO_CVAR, "7").unwrap();

    f.run("demo.later echo value $g_demo$").unwrap();
    assert!(f.output.lines().is_empty());
    assert_eq!(f.host.commands.pending_deferred(), 1);

    assert_eq!(f.host.commands.run_deferred(&f.env, &f.host.cvars), 1);
    assert_eq!(f.output.take_lines(), vec!["value 7"]);
}

#[test]
fn test_log_buffered_until_target_available() {
    struct Capture(Mutex<Vec<Event>>);

    impl LogTarget for Capture {
        fn process(&self, events: &[Event]) -> bool {
            self.0.lock().unwrap().extend_from_slice(events);
            true
        }
    }

    let mut f = Fixture::new("probe", probe());
    f.vm.create().unwrap();

    f.run("hud hello").unwrap();
    assert_eq!(f.host.log.pending(HUD), 1);

    let capture = Arc::new(Capture(Mutex::new(Vec::new())));
    f.host.log.register_target(HUD, capture.clone());
    f.run("hud again").unwrap();
    assert_eq!(f.host.log.pending(HUD), 0);

    let texts: Vec<String> = capture.0.lock().unwrap().iter().map(|e| e.text.clone()).collect();
    assert_eq!(texts, vec!["hello", "again"]);
}

#[test]
fn test_unroutable_syscall_faults_instance() {
    let mut f = Fixture::new("probe", probe());
    f.vm.create().unwrap();

    let err = f.run("bogus").unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(f.vm.state(), VmState::Faulted);
    assert!(!f.vm.is_active());
    assert!(!f.host.commands.contains("show"));
    assert_eq!(f.host.cvars.get("g_test"), None);

    // The slot can be created again after a fault.
    f.vm.create().unwrap();
    assert_eq!(f.vm.state(), VmState::Active);
    f.vm.free();
}

#[test]
fn test_startup_timeout() {
    let silent: ModuleEntry = Arc::new(|channel: Channel| {
        let _ = channel.recv();
        Ok(())
    });
    let mut f = Fixture::with_timeout("silent", silent, Duration::from_millis(200));

    let err = f.vm.create().unwrap_err();
    assert!(matches!(err, VmError::StartupTimeout(t) if t == Duration::from_millis(200)));
    assert_eq!(f.vm.state(), VmState::Faulted);
    assert!(!f.vm.is_active());
}

#[test]
fn test_module_exits_before_ready() {
    let quitter: ModuleEntry = Arc::new(|_channel: Channel| Ok(()));
    let mut f = Fixture::new("quitter", quitter);

    assert!(matches!(f.vm.create(), Err(VmError::Startup(_))));
    assert_eq!(f.vm.state(), VmState::Faulted);
}

#[test]
fn test_syscall_log_written() {
    let mut f = Fixture::new("demo", demo());
    let log_dir = f.dir.path().to_path_buf();
    f.host.cvars.set(&f.vm.params().log_syscalls_key, "1").unwrap();

    f.vm.create().unwrap();
    f.run("echo traced").unwrap();
    f.vm.free();

    let content = std::fs::read_to_string(log_dir.join("demo-syscallLog")).unwrap();
    assert!(content.contains("engine->vm start"));
    assert!(content.contains("vm->engine start"));
    // The ready signal is major 1, minor 0.
    assert!(content.lines().any(|l| l.contains("vm->engine start 1:0 ")));
    assert!(content.lines().any(|l| l.contains("vm->engine end 1:0 ")));
}

#[test]
fn test_preset_value_adopted_only_if_module_accepts() {
    let mut f = Fixture::new("demo", demo());
    f.host.cvars.set(DEMO_CVAR, "30").unwrap();
    f.vm.create().unwrap();
    assert_eq!(f.host.cvars.get(DEMO_CVAR).as_deref(), Some("30"));
    f.vm.free();

    f.host.cvars.set(DEMO_CVAR, "500").unwrap();
    f.vm.create().unwrap();
    assert_eq!(f.host.cvars.get(DEMO_CVAR).as_deref(), Some("0"));
}

#[test]
fn test_concurrent_commands_keep_their_own_output() {
    let mut f = Fixture::new("probe", probe());
    f.vm.create().unwrap();

    let first = Arc::new(BufferedEnvironment::new(f.host.commands.clone()));
    let second = Arc::new(BufferedEnvironment::new(f.host.commands.clone()));
    let spawn = |output: &Arc<BufferedEnvironment>, text: &'static str| {
        let commands = f.host.commands.clone();
        let env: Arc<dyn CommandEnvironment> = output.clone();
        std::thread::spawn(move || commands.execute(text, &env))
    };

    let a = spawn(&first, "slow first");
    std::thread::sleep(Duration::from_millis(50));
    let b = spawn(&second, "slow second");
    a.join().unwrap().unwrap();
    b.join().unwrap().unwrap();

    assert_eq!(first.lines(), vec!["first"]);
    assert_eq!(second.lines(), vec!["second"]);
    assert!(f.output.lines().is_empty());
    assert!(f.vm.is_active());
}

/// Directory holding `libvmhost.so`, next to or above this test's `deps/`.
fn module_library_dir() -> Option<PathBuf> {
    let deps = std::env::current_exe().ok()?.parent()?.to_path_buf();
    let profile = deps.parent()?.to_path_buf();
    [profile, deps]
        .into_iter()
        .find(|dir| dir.join("libvmhost.so").is_file())
}

#[test]
fn test_shared_library_module() {
    let Some(lib_path) = module_library_dir() else {
        eprintln!("libvmhost.so not found, skipping");
        return;
    };
    let host = HostServices::new();
    host.cvars
        .set(&VmParams::new("vmhost").type_key, &VmType::NativeDll.ordinal().to_string())
        .unwrap();
    let options = VmOptions {
        lib_path,
        startup_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(2),
        ..VmOptions::default()
    };
    let mut vm = VmInstance::with_common_services("vmhost", host.clone(), options).unwrap();
    vm.create().unwrap();
    assert!(vm.is_active());

    let output = Arc::new(BufferedEnvironment::new(host.commands.clone()));
    let env: Arc<dyn CommandEnvironment> = output.clone();
    host.commands.execute("echo from a library", &env).unwrap();
    assert_eq!(output.take_lines(), vec!["from a library"]);

    host.cvars.set(DEMO_CVAR, "9").unwrap();
    assert!(host.cvars.set(DEMO_CVAR, "101").is_err());
    assert_eq!(host.cvars.get(DEMO_CVAR).as_deref(), Some("9"));

    let report = vm.free().unwrap();
    assert!(report.exited_cleanly, "{:?}", report);
    assert!(!host.commands.contains("echo"));
}
