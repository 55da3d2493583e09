//! VM instances and the strategies that run their modules

pub mod child;
pub mod in_process;
pub mod instance;
pub mod library;
pub mod sandbox;
pub mod state;
pub mod strategy;

pub use in_process::{InProcessThread, ModuleEntry, ModuleImage};
pub use instance::{CallGuard, SyscallHandler, VmInstance, VmLink, WeakVmLink};
pub use sandbox::SandboxPolicy;
pub use strategy::{create_strategy, ExecutionStrategy, StopReport, VmOptions};
