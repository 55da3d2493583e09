//! Observability
//!
//! Per-instance syscall tracing. Host diagnostics go through the `log` facade.

pub mod syscall_log;
