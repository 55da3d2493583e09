//! Syscall router for the host services every module gets.
//!
//! Syscalls are routed by major number to a handler group. Majors below
//! [`COMMON_MAJOR_BASE`] belong to the game and go to an optional
//! game-specific handler. Anything the router does not recognise is a
//! protocol violation.
use crate::config::types::{Result, VmError};
use crate::ipc::{handle_msg, split_id, Channel, Reader};
use crate::services::command::{CommandEnvironment, CommandRegistry, ConsoleEnvironment};
use crate::services::crash::{CrashSink, LoggingCrashSink};
use crate::services::cvar::{CvarFlags, CvarHook, CvarSpec, CvarStore, Writer};
use crate::services::log::LogDispatcher;
use crate::services::proxy::{EnvStack, ProxyCommand, ProxyCvar};
use crate::services::syscalls::{
    self, major, AddCommandMsg, AddCvarFlagsMsg, CrashDumpMsg, DispatchLogMsg, EnvExecuteAfterMsg,
    EnvPrintMsg, GetCvarMsg, MillisecondsMsg, RegisterCvarMsg, RemoveCommandMsg, SetCvarMsg,
    COMMON_MAJOR_BASE,
};
use crate::vm::instance::{SyscallHandler, VmLink};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Shared host stores handed to every VM's service layer.
#[derive(Clone)]
pub struct HostServices {
    pub commands: Arc<CommandRegistry>,
    pub cvars: Arc<CvarStore>,
    pub log: Arc<LogDispatcher>,
    pub crash: Arc<dyn CrashSink>,
    /// Receives module output produced outside any proxied command
    pub console: Arc<dyn CommandEnvironment>,
}

impl HostServices {
    /// Fresh stores, stderr logging, crash dumps logged only.
    pub fn new() -> Self {
        let commands = Arc::new(CommandRegistry::new());
        Self {
            console: Arc::new(ConsoleEnvironment::new(commands.clone())),
            commands,
            cvars: Arc::new(CvarStore::new()),
            log: Arc::new(LogDispatcher::with_default_targets()),
            crash: Arc::new(LoggingCrashSink),
        }
    }
}

impl Default for HostServices {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CommonVmServices {
    vm_name: String,
    host: HostServices,
    envs: Arc<EnvStack>,
    game: Option<Arc<dyn SyscallHandler>>,
    started: Mutex<Instant>,
}

impl CommonVmServices {
    pub fn new(vm_name: &str, host: HostServices) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            envs: Arc::new(EnvStack::new(host.console.clone())),
            host,
            game: None,
            started: Mutex::new(Instant::now()),
        }
    }

    /// Route game-range majors to `handler`.
    pub fn with_game_syscalls(mut self, handler: Arc<dyn SyscallHandler>) -> Self {
        self.game = Some(handler);
        self
    }

    fn misc(&self, minor: u16, reader: Reader, channel: &Channel) -> Result<()> {
        match minor {
            syscalls::misc::CRASH_DUMP => handle_msg::<CrashDumpMsg, _>(channel, reader, |dump| {
                self.host.crash.crash_dump(&dump, &self.vm_name);
                Ok(())
            }),
            syscalls::misc::MILLISECONDS => handle_msg::<MillisecondsMsg, _>(channel, reader, |()| {
                let started = *self.started.lock().unwrap_or_else(|e| e.into_inner());
                Ok(started.elapsed().as_millis() as u64)
            }),
            _ => Err(unknown(reader.id())),
        }
    }

    fn command(&self, vm: &VmLink, minor: u16, reader: Reader, channel: &Channel) -> Result<()> {
        match minor {
            syscalls::command::ADD_COMMAND => {
                handle_msg::<AddCommandMsg, _>(channel, reader, |(name, description)| {
                    let proxy = Arc::new(ProxyCommand::new(vm.downgrade(), self.envs.clone()));
                    if let Err(e) =
                        self.host
                            .commands
                            .add(&name, &description, Some(&self.vm_name), proxy)
                    {
                        log::warn!("VM {} could not add command {}: {}", self.vm_name, name, e);
                    }
                    Ok(())
                })
            }
            syscalls::command::REMOVE_COMMAND => {
                handle_msg::<RemoveCommandMsg, _>(channel, reader, |name| {
                    if !self.host.commands.remove_if_owned(&name, &self.vm_name) {
                        log::warn!("VM {} tried to remove command {} it does not own", self.vm_name, name);
                    }
                    Ok(())
                })
            }
            syscalls::command::ENV_PRINT => handle_msg::<EnvPrintMsg, _>(channel, reader, |text| {
                self.envs.current().print(&text);
                Ok(())
            }),
            syscalls::command::ENV_EXECUTE_AFTER => {
                handle_msg::<EnvExecuteAfterMsg, _>(channel, reader, |(text, parse_cvars)| {
                    self.envs.current().execute_after(&text, parse_cvars);
                    Ok(())
                })
            }
            _ => Err(unknown(reader.id())),
        }
    }

    fn cvar(&self, vm: &VmLink, minor: u16, reader: Reader, channel: &Channel) -> Result<()> {
        let cvars = &self.host.cvars;
        match minor {
            syscalls::cvar::REGISTER_CVAR => handle_msg::<RegisterCvarMsg, _>(
                channel,
                reader,
                |(name, description, flags, default)| {
                    let hook: Arc<dyn CvarHook> = Arc::new(ProxyCvar::new(vm.downgrade()));
                    let spec = CvarSpec::new(&description, CvarFlags::from_bits_retain(flags), &default);
                    match cvars.register(&name, spec, Some(&self.vm_name), Some(hook)) {
                        Ok(value) => Ok(Some(value)),
                        Err(e) => {
                            log::warn!("VM {} could not register cvar {}: {}", self.vm_name, name, e);
                            Ok(None)
                        }
                    }
                },
            ),
            syscalls::cvar::GET_CVAR => {
                handle_msg::<GetCvarMsg, _>(channel, reader, |name| Ok(cvars.get(&name)))
            }
            syscalls::cvar::SET_CVAR => handle_msg::<SetCvarMsg, _>(channel, reader, |(name, value)| {
                match cvars.set_as(&name, &value, Writer::Module(&self.vm_name)) {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        log::debug!("VM {} could not set {}: {}", self.vm_name, name, e);
                        Ok(false)
                    }
                }
            }),
            syscalls::cvar::ADD_FLAGS => handle_msg::<AddCvarFlagsMsg, _>(channel, reader, |(name, flags)| {
                Ok(cvars.add_flags(&name, CvarFlags::from_bits_retain(flags)))
            }),
            _ => Err(unknown(reader.id())),
        }
    }

    fn log(&self, minor: u16, reader: Reader, channel: &Channel) -> Result<()> {
        match minor {
            syscalls::log::DISPATCH_EVENT => {
                handle_msg::<DispatchLogMsg, _>(channel, reader, |(event, target_mask)| {
                    self.host.log.dispatch(event, target_mask);
                    Ok(())
                })
            }
            _ => Err(unknown(reader.id())),
        }
    }
}

fn unknown(id: u32) -> VmError {
    let (major, minor) = split_id(id);
    VmError::Protocol(format!("unhandled syscall {}:{}", major, minor))
}

impl SyscallHandler for CommonVmServices {
    fn syscall(&self, vm: &VmLink, reader: Reader, channel: &Channel) -> Result<()> {
        let (group, minor) = split_id(reader.id());
        if group < COMMON_MAJOR_BASE {
            return match &self.game {
                Some(game) => game.syscall(vm, reader, channel),
                None => Err(unknown(reader.id())),
            };
        }
        match group {
            major::MISC => self.misc(minor, reader, channel),
            major::COMMAND => self.command(vm, minor, reader, channel),
            major::CVAR => self.cvar(vm, minor, reader, channel),
            major::LOG => self.log(minor, reader, channel),
            _ => Err(unknown(reader.id())),
        }
    }

    fn loading(&self, vm: &VmLink) {
        *self.started.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        if let Some(game) = &self.game {
            game.loading(vm);
        }
    }

    fn released(&self, vm_name: &str) {
        let commands = self.host.commands.remove_owned(&self.vm_name);
        let cvars = self.host.cvars.unregister_owned(&self.vm_name);
        if commands + cvars > 0 {
            log::info!(
                "VM {} released {} commands and {} cvars",
                self.vm_name,
                commands,
                cvars
            );
        }
        if let Some(game) = &self.game {
            game.released(vm_name);
        }
    }
}
