//! Host services exposed to modules
//!
//! Commands, cvars, log dispatch, crash capture, and the router that maps
//! syscall numbers onto them.

pub mod command;
pub mod crash;
pub mod cvar;
pub mod log;
pub mod proxy;
pub mod router;
pub mod syscalls;

pub use command::{Command, CommandEnvironment, CommandRegistry};
pub use crash::{CrashSink, FileCrashSink};
pub use cvar::{CvarFlags, CvarStore};
pub use router::{CommonVmServices, HostServices};
