//! Message numbering shared by host and module.
//!
//! Majors below [`COMMON_MAJOR_BASE`] are free for game-specific messages.
//! The host-provided services use the majors defined here.
use crate::ipc::message::{syscall_id, Message};
use crate::services::log::Event;
use serde::{Deserialize, Serialize};

pub const COMMON_MAJOR_BASE: u16 = 0x10;

pub mod major {
    /// Lifecycle and host->module service calls
    pub const VM: u16 = 0x01;
    pub const MISC: u16 = 0x10;
    pub const COMMAND: u16 = 0x11;
    pub const CVAR: u16 = 0x12;
    pub const LOG: u16 = 0x13;
}

pub mod vm {
    pub const READY: u16 = 0;
    pub const SHUTDOWN: u16 = 1;
    pub const EXECUTE_COMMAND: u16 = 2;
    pub const CVAR_VALUE_CHANGED: u16 = 3;
}

pub mod misc {
    pub const CRASH_DUMP: u16 = 0;
    pub const MILLISECONDS: u16 = 1;
}

pub mod command {
    pub const ADD_COMMAND: u16 = 0;
    pub const REMOVE_COMMAND: u16 = 1;
    pub const ENV_PRINT: u16 = 2;
    pub const ENV_EXECUTE_AFTER: u16 = 3;
}

pub mod cvar {
    pub const REGISTER_CVAR: u16 = 0;
    pub const GET_CVAR: u16 = 1;
    pub const SET_CVAR: u16 = 2;
    pub const ADD_FLAGS: u16 = 3;
}

pub mod log {
    pub const DISPATCH_EVENT: u16 = 0;
}

/// Sent once by the module after its own initialization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleHello {
    pub name: String,
    pub abi_version: u32,
}

pub const ABI_VERSION: u32 = 1;

macro_rules! message {
    ($(#[$doc:meta])* $name:ident, $major:expr, $minor:expr, $args:ty => $reply:ty) => {
        $(#[$doc])*
        pub struct $name;

        impl Message for $name {
            const ID: u32 = syscall_id($major, $minor);
            type Args = $args;
            type Reply = $reply;
        }
    };
}

// module -> host, one-way
message!(
    /// Readiness signal, one-way
    ReadyMsg, major::VM, vm::READY, ModuleHello => ()
);
// host -> module
message!(ShutdownMsg, major::VM, vm::SHUTDOWN, () => ());
message!(
    /// argv of a proxied command
    ExecuteCommandMsg, major::VM, vm::EXECUTE_COMMAND, Vec<String> => ()
);
message!(
    /// (name, new value) -> (accepted, description)
    CvarValueChangedMsg, major::VM, vm::CVAR_VALUE_CHANGED, (String, String) => (bool, String)
);

message!(
    /// Raw diagnostic buffer, one-way
    CrashDumpMsg, major::MISC, misc::CRASH_DUMP, Vec<u8> => ()
);
message!(MillisecondsMsg, major::MISC, misc::MILLISECONDS, () => u64);

message!(
    /// (name, description), one-way
    AddCommandMsg, major::COMMAND, command::ADD_COMMAND, (String, String) => ()
);
message!(RemoveCommandMsg, major::COMMAND, command::REMOVE_COMMAND, String => ());
message!(EnvPrintMsg, major::COMMAND, command::ENV_PRINT, String => ());
message!(
    /// (command text, expand $cvar$ references), one-way
    EnvExecuteAfterMsg, major::COMMAND, command::ENV_EXECUTE_AFTER, (String, bool) => ()
);

message!(
    /// (name, description, flags, default) -> effective value, None if refused
    RegisterCvarMsg, major::CVAR, cvar::REGISTER_CVAR, (String, String, u32, String) => Option<String>
);
message!(GetCvarMsg, major::CVAR, cvar::GET_CVAR, String => Option<String>);
message!(SetCvarMsg, major::CVAR, cvar::SET_CVAR, (String, String) => bool);
message!(AddCvarFlagsMsg, major::CVAR, cvar::ADD_FLAGS, (String, u32) => bool);

message!(
    /// (event, target mask), one-way
    DispatchLogMsg, major::LOG, log::DISPATCH_EVENT, (Event, u32) => ()
);
