/// Core types shared across the vmhost crate
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// How a module is executed.
///
/// The ordinal values are what `vm.<name>.type` stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmType {
    /// Child process with sandbox hardening. Production default.
    Sandboxed,
    /// Child process without access restrictions
    NativeExe,
    /// Shared library or linked entry point on a dedicated host thread
    NativeDll,
}

impl VmType {
    pub const ALL: [VmType; 3] = [VmType::Sandboxed, VmType::NativeExe, VmType::NativeDll];

    pub fn ordinal(self) -> i64 {
        match self {
            VmType::Sandboxed => 0,
            VmType::NativeExe => 1,
            VmType::NativeDll => 2,
        }
    }

    pub fn from_ordinal(value: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.ordinal() == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmType::Sandboxed => "sandboxed",
            VmType::NativeExe => "native-exe",
            VmType::NativeDll => "native-dll",
        }
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmType {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandboxed" | "sandbox" | "nacl" => Ok(VmType::Sandboxed),
            "native-exe" | "exe" => Ok(VmType::NativeExe),
            "native-dll" | "dll" | "in-process" => Ok(VmType::NativeDll),
            other => other
                .parse::<i64>()
                .ok()
                .and_then(VmType::from_ordinal)
                .ok_or_else(|| VmError::Config(format!("unknown vm type: {}", s))),
        }
    }
}

/// Lifecycle state of a VM instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Unloaded,
    Loading,
    Active,
    ShuttingDown,
    /// Reached on protocol violation or peer death. Only `Create()` leaves it.
    Faulted,
}

impl VmState {
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Active)
                | (Loading, Faulted)
                | (Active, ShuttingDown)
                | (Active, Faulted)
                | (ShuttingDown, Unloaded)
                | (ShuttingDown, Faulted)
                | (Faulted, Loading)
        )
    }

    /// Whether the channel may carry traffic in this state
    pub fn accepts_traffic(self) -> bool {
        matches!(self, VmState::Loading | VmState::Active | VmState::ShuttingDown)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Unloaded => "unloaded",
            VmState::Loading => "loading",
            VmState::Active => "active",
            VmState::ShuttingDown => "shutting_down",
            VmState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Direction of a message relative to the host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    ToModule,
    FromModule,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ToModule => "engine->vm",
            Direction::FromModule => "vm->engine",
        }
    }
}

/// Error taxonomy for the vmhost crate
#[derive(Error, Debug)]
pub enum VmError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Channel broken: {0}")]
    ChannelBroken(String),

    #[error("Startup failure: {0}")]
    Startup(String),

    #[error("Module did not signal readiness within {0:?}")]
    StartupTimeout(Duration),

    #[error("VM {0} is not active")]
    NotActive(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Cvar error: {0}")]
    Cvar(String),

    #[error("Module error: {0}")]
    Module(String),

    #[error("Payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),
}

impl VmError {
    /// Fatal errors leave the channel unusable and fault the owning instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::Protocol(_) | VmError::ChannelBroken(_))
    }
}

pub type Result<T> = std::result::Result<T, VmError>;
