//! vmhost: lifecycle manager and syscall channel for game-logic modules
//!
//! A host creates named VM instances, each running one module under an
//! execution strategy, and serves the module's syscalls from shared host
//! services until the instance is freed.
//!
//! # Architecture
//!
//! ## IPC ([`ipc`])
//! - [`ipc::message`]: Frames, message ids `(major << 16) | minor`, payload encoding
//! - [`ipc::channel`]: Root channel over a socket pair or an in-process queue
//! - [`ipc::call`]: Blocking calls that serve inbound traffic while waiting
//!
//! ## VM Lifecycle ([`vm`])
//! - [`vm::instance`]: `VmInstance` create/free, fault handling, call gate
//! - [`vm::strategy`]: Execution strategy selection and options
//! - [`vm::in_process`]: Module on a dedicated host thread
//! - [`vm::child`]: Module in a child process, with or without [`vm::sandbox`]
//! - [`vm::library`]: Shared-library loading for in-process modules
//! - [`vm::state`]: Lifecycle transitions and thread phases
//!
//! ## Host Services ([`services`])
//! - [`services::router`]: Syscall router for misc, command, cvar and log groups
//! - [`services::command`]: Console command namespace and deferred execution
//! - [`services::cvar`]: Configuration variables with flags and change hooks
//! - [`services::proxy`]: Host-side proxies for module commands and cvars
//! - [`services::log`]: Log dispatch with per-target buffering
//! - [`services::crash`]: Crash dump sinks
//! - [`services::syscalls`]: Message catalogue shared by host and module
//!
//! ## Module Runtime ([`guest`])
//! - [`guest::Guest`]: Module-side view of the host services
//! - [`guest::demo`]: Demo module used by the binary and tests
//!
//! ## Observability ([`observability`])
//! - [`observability::syscall_log`]: Per-instance syscall trace file
//!
//! ## Configuration ([`config`])
//! - [`config::host`]: Host configuration file
//! - [`config::params`]: Per-instance cvars (`vm.<name>.type`, ...)
//! - [`config::types`]: Shared enums and the error type

// IPC
pub mod ipc;

// VM Lifecycle
pub mod vm;

// Host Services
pub mod services;

// Module Runtime
pub mod guest;

// Observability
pub mod observability;

// Configuration
pub mod config;

// CLI entrypoint wiring for the vmhost binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use services::router::HostServices;
pub use vm::{VmInstance, VmOptions};
