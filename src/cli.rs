use crate::config::host::HostConfig;
use crate::config::params::VmParams;
use crate::config::types::{Result as VmResult, VmType};
use crate::guest::demo::DemoModule;
use crate::guest::{self, GameModule};
use crate::services::command::{CommandEnvironment, CommandRegistry};
use crate::services::crash::FileCrashSink;
use crate::services::cvar::{CvarStore, Writer};
use crate::services::router::HostServices;
use crate::vm::{VmInstance, VmOptions};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Role argument that turns the binary into the demo module process.
pub const DEMO_MODULE_ROLE: &str = "--internal-role=demo-module";

#[derive(Parser)]
#[command(author, version, about = "Host and drive game-logic modules", long_about = None)]
struct Cli {
    /// Host configuration file (defaults to ./vmhost.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a module, run console commands against it, then free it
    Run {
        /// Instance name; also selects `<lib-path>/<name>` and `lib<name>.so`
        #[arg(long, default_value = "demo")]
        name: String,
        /// sandboxed, native-exe or native-dll (ordinals 0..=2 accepted)
        #[arg(long = "type")]
        vm_type: Option<VmType>,
        /// Directory holding module executables and libraries
        #[arg(long)]
        lib_path: Option<PathBuf>,
        /// Module executable for process modes
        #[arg(long)]
        executable: Option<PathBuf>,
        /// Load the module from the library directory instead of the built-in demo
        #[arg(long)]
        from_lib_path: bool,
        /// Write `<name>-syscallLog` for this run
        #[arg(long)]
        log_syscalls: bool,
        /// Console command to run once the module is active (repeatable)
        #[arg(short = 'c', long = "command")]
        commands: Vec<String>,
        /// Read further console commands from stdin until EOF or `quit`
        #[arg(long)]
        interactive: bool,
    },
    /// Print the effective host configuration
    ShowConfig,
}

pub fn run() -> Result<()> {
    env_logger::init();

    // Module processes get the root socket number as their last argument,
    // which the host-side parser below would reject.
    if std::env::args().nth(1).as_deref() == Some(DEMO_MODULE_ROLE) {
        return guest::main_from_env(demo_module()).map_err(Into::into);
    }

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run {
            name,
            vm_type,
            lib_path,
            executable,
            from_lib_path,
            log_syscalls,
            commands,
            interactive,
        } => {
            let mut config = config;
            if let Some(lib_path) = lib_path {
                config.lib_path = lib_path;
            }
            let session = Session {
                name,
                vm_type,
                executable,
                from_lib_path,
                log_syscalls,
            };
            session.run(&config, &commands, interactive)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<HostConfig> {
    match path {
        Some(path) => HostConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => match HostConfig::load_default() {
            Ok(config) => Ok(config),
            Err(e) => {
                log::debug!("Using built-in host configuration: {}", e);
                Ok(HostConfig::default())
            }
        },
    }
}

struct Session {
    name: String,
    vm_type: Option<VmType>,
    executable: Option<PathBuf>,
    from_lib_path: bool,
    log_syscalls: bool,
}

impl Session {
    fn run(self, config: &HostConfig, commands: &[String], interactive: bool) -> Result<()> {
        let mut host = HostServices::new();
        host.crash = Arc::new(FileCrashSink::new(config.crash_dir()));
        config.apply_cvars(&host.cvars);
        register_host_commands(&host.commands, &host.cvars)?;

        let params = VmParams::new(&self.name);
        if let Some(vm_type) = self.vm_type {
            host.cvars
                .set_as(&params.type_key, &vm_type.ordinal().to_string(), Writer::Host)?;
        }
        if self.log_syscalls {
            host.cvars.set_as(&params.log_syscalls_key, "1", Writer::Host)?;
        }

        let mut vm = VmInstance::with_common_services(&self.name, host.clone(), self.options(config)?)?;
        vm.create()
            .with_context(|| format!("creating VM {}", self.name))?;

        for command in commands {
            execute(&host, command);
        }
        if interactive {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = line?;
                let line = line.trim();
                if line == "quit" || line == "exit" {
                    break;
                }
                if !line.is_empty() {
                    execute(&host, line);
                }
                if let Err(e) = vm.link().pump(Duration::ZERO) {
                    log::warn!("VM {}: {}", self.name, e);
                }
                if !vm.is_active() {
                    eprintln!("VM {} is no longer active ({})", self.name, vm.state());
                    break;
                }
            }
        }

        let report = vm.free();
        log::info!("VM {} finished in state {}: {:?}", self.name, vm.state(), report);
        Ok(())
    }

    fn options(&self, config: &HostConfig) -> Result<VmOptions> {
        let mut options = VmOptions::from_host_config(config);
        if let Some(executable) = &self.executable {
            return Ok(options.with_executable(executable, Vec::new()));
        }
        if self.from_lib_path {
            return Ok(options);
        }
        let exe = std::env::current_exe().context("locating the vmhost executable")?;
        options = options.with_executable(exe, vec![DEMO_MODULE_ROLE.to_string()]);
        Ok(options.with_linked_entry(guest::linked_entry(demo_module)))
    }
}

fn demo_module() -> Arc<dyn GameModule> {
    Arc::new(DemoModule::new())
}

fn execute(host: &HostServices, text: &str) {
    if let Err(e) = host.commands.execute(text, &host.console) {
        host.console.print(&e.to_string());
    }
    let ran = host.commands.run_deferred(&host.console, &host.cvars);
    if ran > 0 {
        log::debug!("Ran {} deferred commands", ran);
    }
}

/// Console commands owned by the host itself.
fn register_host_commands(registry: &Arc<CommandRegistry>, cvars: &Arc<CvarStore>) -> Result<()> {
    let store = cvars.clone();
    registry.add(
        "set",
        "set <name> <value>: change a cvar",
        None,
        Arc::new(move |args: &[String], env: &Arc<dyn CommandEnvironment>| -> VmResult<()> {
            let [_, name, value] = args else {
                env.print("usage: set <name> <value>");
                return Ok(());
            };
            store.set(name, value)
        }),
    )?;

    let store = cvars.clone();
    registry.add(
        "cvarlist",
        "list cvars and their values",
        None,
        Arc::new(move |_args: &[String], env: &Arc<dyn CommandEnvironment>| -> VmResult<()> {
            for (name, value) in store.list() {
                env.print(&format!("{} \"{}\"", name, value));
            }
            Ok(())
        }),
    )?;

    let commands = Arc::downgrade(registry);
    registry.add(
        "cmdlist",
        "list console commands",
        None,
        Arc::new(move |_args: &[String], env: &Arc<dyn CommandEnvironment>| -> VmResult<()> {
            if let Some(commands) = commands.upgrade() {
                for (name, description) in commands.list() {
                    env.print(&format!("{:<16} {}", name, description));
                }
            }
            Ok(())
        }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::command::BufferedEnvironment;

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "vmhost", "run", "--name", "game", "--type", "dll", "-c", "echo hi", "-c", "demo.counter",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                name,
                vm_type,
                commands,
                interactive,
                ..
            } => {
                assert_eq!(name, "game");
                assert_eq!(vm_type, Some(VmType::NativeDll));
                assert_eq!(commands, vec!["echo hi", "demo.counter"]);
                assert!(!interactive);
            }
            Commands::ShowConfig => panic!("expected run"),
        }
    }

    #[test]
    fn test_host_commands() {
        let registry = Arc::new(CommandRegistry::new());
        let cvars = Arc::new(CvarStore::new());
        register_host_commands(&registry, &cvars).unwrap();

        let buffered = Arc::new(BufferedEnvironment::new(registry.clone()));
        let env: Arc<dyn CommandEnvironment> = buffered.clone();
        registry.execute("set sv_fps 20; cvarlist", &env).unwrap();
        assert_eq!(cvars.get("sv_fps").as_deref(), Some("20"));
        assert!(buffered.take_lines().contains(&"sv_fps \"20\"".to_string()));

        registry.execute("cmdlist", &env).unwrap();
        assert_eq!(buffered.take_lines().len(), 3);
    }
}
