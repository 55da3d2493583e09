//! Module-side runtime.
//!
//! A module obtains its root channel (linked entry, library `vm_main`, or the
//! inherited fd 3 of a module process), runs its own initialization, signals
//! readiness, then serves host calls until told to shut down. [`Guest`] is the
//! module's view of the host services.
pub mod demo;

use crate::config::types::{Result, VmError};
use crate::ipc::{self, handle_msg, Channel, Frame, Message, Reader, ROOT_SOCKET_ENV};
use crate::services::log::{Event, Level};
use crate::services::syscalls::{
    AddCommandMsg, AddCvarFlagsMsg, CrashDumpMsg, CvarValueChangedMsg, DispatchLogMsg,
    EnvExecuteAfterMsg, EnvPrintMsg, ExecuteCommandMsg, GetCvarMsg, MillisecondsMsg, ModuleHello,
    ReadyMsg, RegisterCvarMsg, RemoveCommandMsg, SetCvarMsg, ShutdownMsg, ABI_VERSION,
};
use crate::vm::in_process::ModuleEntry;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

pub type GuestCommand = Arc<dyn Fn(&Guest, &[String]) -> Result<()> + Send + Sync>;

/// Returns `Err(description)` to reject a proposed cvar value.
pub type CvarValidator = Arc<dyn Fn(&str) -> std::result::Result<(), String> + Send + Sync>;

pub trait GameModule: Send + Sync {
    fn name(&self) -> &str;

    /// Runs before readiness is signalled. Register commands and cvars here.
    fn init(&self, guest: &Guest) -> Result<()>;

    /// Host calls in the game's own message range.
    fn handle_call(&self, _guest: &Guest, reader: Reader) -> Result<()> {
        Err(VmError::Protocol(format!(
            "module does not handle message {:#010x}",
            reader.id()
        )))
    }

    fn shutdown(&self, _guest: &Guest) {}
}

struct CachedCvar {
    value: String,
    validator: Option<CvarValidator>,
}

pub struct Guest {
    channel: Arc<Channel>,
    module: Arc<dyn GameModule>,
    commands: RefCell<HashMap<String, GuestCommand>>,
    cvars: RefCell<HashMap<String, CachedCvar>>,
    running: Cell<bool>,
}

impl Guest {
    pub fn new(channel: Arc<Channel>, module: Arc<dyn GameModule>) -> Self {
        Self {
            channel,
            module,
            commands: RefCell::new(HashMap::new()),
            cvars: RefCell::new(HashMap::new()),
            running: Cell::new(true),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Call the host and wait, serving host calls that arrive meanwhile.
    pub fn call<M: Message>(&self, args: &M::Args) -> Result<M::Reply> {
        ipc::call::<M, _>(&self.channel, args, |frame| self.dispatch(frame))
    }

    pub fn notify<M: Message>(&self, args: &M::Args) -> Result<()> {
        ipc::notify::<M>(&self.channel, args)
    }

    pub fn add_command<F>(&self, name: &str, description: &str, command: F) -> Result<()>
    where
        F: Fn(&Guest, &[String]) -> Result<()> + Send + Sync + 'static,
    {
        self.commands
            .borrow_mut()
            .insert(name.to_ascii_lowercase(), Arc::new(command));
        self.notify::<AddCommandMsg>(&(name.to_string(), description.to_string()))
    }

    pub fn remove_command(&self, name: &str) -> Result<()> {
        self.commands.borrow_mut().remove(&name.to_ascii_lowercase());
        self.notify::<RemoveCommandMsg>(&name.to_string())
    }

    /// Register a cvar with the host. Returns its effective value, or `None`
    /// when the host refused the registration.
    pub fn register_cvar(
        &self,
        name: &str,
        description: &str,
        flags: u32,
        default: &str,
    ) -> Result<Option<String>> {
        self.register_cvar_with(name, description, flags, default, None)
    }

    pub fn register_cvar_with(
        &self,
        name: &str,
        description: &str,
        flags: u32,
        default: &str,
        validator: Option<CvarValidator>,
    ) -> Result<Option<String>> {
        let args = (
            name.to_string(),
            description.to_string(),
            flags,
            default.to_string(),
        );
        let key = name.to_ascii_lowercase();
        // Cached up front: the host may validate a preset value with us
        // before it answers.
        let previous = self.cvars.borrow_mut().insert(
            key.clone(),
            CachedCvar {
                value: default.to_string(),
                validator,
            },
        );
        let value = self.call::<RegisterCvarMsg>(&args)?;
        let mut cvars = self.cvars.borrow_mut();
        match &value {
            Some(value) => {
                if let Some(cached) = cvars.get_mut(&key) {
                    cached.value = value.clone();
                }
            }
            None => match previous {
                Some(previous) => {
                    cvars.insert(key, previous);
                }
                None => {
                    cvars.remove(&key);
                }
            },
        }
        Ok(value)
    }

    /// Current value of a cvar this module registered
    pub fn cvar(&self, name: &str) -> Option<String> {
        self.cvars
            .borrow()
            .get(&name.to_ascii_lowercase())
            .map(|c| c.value.clone())
    }

    pub fn get_cvar(&self, name: &str) -> Result<Option<String>> {
        self.call::<GetCvarMsg>(&name.to_string())
    }

    pub fn set_cvar(&self, name: &str, value: &str) -> Result<bool> {
        let accepted = self.call::<SetCvarMsg>(&(name.to_string(), value.to_string()))?;
        if accepted {
            if let Some(cached) = self.cvars.borrow_mut().get_mut(&name.to_ascii_lowercase()) {
                cached.value = value.to_string();
            }
        }
        Ok(accepted)
    }

    pub fn add_cvar_flags(&self, name: &str, flags: u32) -> Result<bool> {
        self.call::<AddCvarFlagsMsg>(&(name.to_string(), flags))
    }

    pub fn print(&self, text: &str) -> Result<()> {
        self.notify::<EnvPrintMsg>(&text.to_string())
    }

    pub fn execute_after(&self, command: &str, parse_cvars: bool) -> Result<()> {
        self.notify::<EnvExecuteAfterMsg>(&(command.to_string(), parse_cvars))
    }

    pub fn log(&self, level: Level, text: &str, target_mask: u32) -> Result<()> {
        self.notify::<DispatchLogMsg>(&(Event::new(level, text), target_mask))
    }

    pub fn crash_dump(&self, dump: &[u8]) -> Result<()> {
        self.notify::<CrashDumpMsg>(&dump.to_vec())
    }

    pub fn milliseconds(&self) -> Result<u64> {
        self.call::<MillisecondsMsg>(&())
    }

    /// Handle one host-initiated message.
    pub fn dispatch(&self, frame: Frame) -> Result<()> {
        let reader = Reader::from(frame);
        match reader.id() {
            ShutdownMsg::ID => handle_msg::<ShutdownMsg, _>(&self.channel, reader, |()| {
                self.module.shutdown(self);
                self.running.set(false);
                Ok(())
            }),
            ExecuteCommandMsg::ID => handle_msg::<ExecuteCommandMsg, _>(&self.channel, reader, |args| {
                self.run_command(&args)
            }),
            CvarValueChangedMsg::ID => {
                handle_msg::<CvarValueChangedMsg, _>(&self.channel, reader, |(name, value)| {
                    Ok(self.cvar_changed(&name, &value))
                })
            }
            _ => self.module.handle_call(self, reader),
        }
    }

    fn run_command(&self, args: &[String]) -> Result<()> {
        let Some(name) = args.first() else {
            return Ok(());
        };
        let command = self.commands.borrow().get(&name.to_ascii_lowercase()).cloned();
        let result = match command {
            Some(command) => command(self, args),
            None => Err(VmError::UnknownCommand(name.clone())),
        };
        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => self.print(&e.to_string()),
            Ok(()) => Ok(()),
        }
    }

    fn cvar_changed(&self, name: &str, value: &str) -> (bool, String) {
        let key = name.to_ascii_lowercase();
        let validator = match self.cvars.borrow().get(&key) {
            Some(cached) => cached.validator.clone(),
            None => return (false, format!("{} is not registered by this module", name)),
        };
        if let Some(validator) = validator {
            if let Err(description) = validator(value) {
                return (false, description);
            }
        }
        if let Some(cached) = self.cvars.borrow_mut().get_mut(&key) {
            cached.value = value.to_string();
        }
        (true, String::new())
    }

    /// Serve host calls until shutdown.
    pub fn serve(&self) -> Result<()> {
        while self.running.get() {
            let frame = self.channel.recv()?;
            if frame.is_reply() {
                return Err(VmError::Protocol(format!(
                    "unsolicited reply for message {:#010x}",
                    frame.id
                )));
            }
            self.dispatch(frame)?;
        }
        Ok(())
    }
}

/// Run `module` on `channel`: init, signal readiness, serve until shutdown.
pub fn run(channel: Channel, module: Arc<dyn GameModule>) -> Result<()> {
    run_shared(Arc::new(channel), module)
}

fn run_shared(channel: Arc<Channel>, module: Arc<dyn GameModule>) -> Result<()> {
    let guest = Guest::new(channel, module.clone());
    module.init(&guest)?;
    guest.notify::<ReadyMsg>(&ModuleHello {
        name: module.name().to_string(),
        abi_version: ABI_VERSION,
    })?;
    log::debug!("Module {} ready", module.name());
    guest.serve()
}

/// Entry point suitable for [`crate::vm::VmOptions::linked_entry`].
pub fn linked_entry<F>(factory: F) -> ModuleEntry
where
    F: Fn() -> Arc<dyn GameModule> + Send + Sync + 'static,
{
    Arc::new(move |channel| run(channel, factory()))
}

/// Body of a library's `vm_main(fd)` export.
///
/// # Safety
/// `fd` must be the root socket handed over by the host and owned by nobody else.
pub unsafe fn run_from_fd(fd: RawFd, module: Arc<dyn GameModule>) -> Result<()> {
    run(Channel::from_raw_fd("module", fd)?, module)
}

/// Root socket descriptor of a module process: the environment variable
/// first, then the last command-line argument.
pub fn root_socket_fd() -> Result<RawFd> {
    if let Ok(value) = std::env::var(ROOT_SOCKET_ENV) {
        return value
            .trim()
            .parse()
            .map_err(|_| VmError::Startup(format!("invalid {}: {:?}", ROOT_SOCKET_ENV, value)));
    }
    std::env::args()
        .last()
        .and_then(|arg| arg.parse().ok())
        .ok_or_else(|| VmError::Startup("no root socket descriptor given".to_string()))
}

/// Main of a module process. Panics are reported to the host as crash dumps.
pub fn main_from_env(module: Arc<dyn GameModule>) -> Result<()> {
    let fd = root_socket_fd()?;
    let channel = Arc::new(unsafe { Channel::from_raw_fd(module.name(), fd)? });

    let crash_channel = channel.clone();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = ipc::notify::<CrashDumpMsg>(&crash_channel, &info.to_string().into_bytes());
        previous(info);
    }));

    run_shared(channel, module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::syscalls::ExecuteCommandMsg;
    use std::thread;

    struct Tiny;

    impl GameModule for Tiny {
        fn name(&self) -> &str {
            "tiny"
        }

        fn init(&self, guest: &Guest) -> Result<()> {
            guest.add_command("hi", "say hi", |guest, _args| guest.print("hi"))
        }
    }

    #[test]
    fn test_guest_lifecycle_over_raw_channel() {
        let (host, module) = Channel::pair("host", "module");
        let worker = thread::spawn(move || run(module, Arc::new(Tiny)));

        let add = host.recv().unwrap();
        assert_eq!(add.id, AddCommandMsg::ID);
        let ready = Reader::from(host.recv().unwrap());
        assert_eq!(ready.id(), ReadyMsg::ID);
        assert_eq!(ready.read::<ModuleHello>().unwrap().name, "tiny");

        let mut printed = Vec::new();
        ipc::call::<ExecuteCommandMsg, _>(&host, &vec!["hi".to_string()], |frame| {
            printed.push(Reader::from(frame).read::<String>()?);
            Ok(())
        })
        .unwrap();
        assert_eq!(printed, vec!["hi"]);

        ipc::call::<ShutdownMsg, _>(&host, &(), |_| Ok(())).unwrap();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_unknown_command_prints_error() {
        let (host, module) = Channel::pair("host", "module");
        let worker = thread::spawn(move || run(module, Arc::new(Tiny)));
        host.recv().unwrap();
        host.recv().unwrap();

        let mut printed = Vec::new();
        ipc::call::<ExecuteCommandMsg, _>(&host, &vec!["nope".to_string()], |frame| {
            printed.push(Reader::from(frame).read::<String>()?);
            Ok(())
        })
        .unwrap();
        assert_eq!(printed, vec!["Unknown command: nope"]);

        drop(host);
        assert!(worker.join().unwrap().is_err());
    }
}
