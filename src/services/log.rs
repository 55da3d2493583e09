//! Multi-target log dispatch.
//!
//! Events are fanned out to a bitmask of registered targets. Each target keeps
//! its own pending buffer behind its own lock: a target either consumes the
//! whole batch or declines it, and a declined batch stays buffered until the
//! target accepts it or the buffer grows past [`MAX_PENDING_EVENTS`], at which
//! point it is dropped.
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

pub type TargetId = usize;

pub const TTY_CONSOLE: TargetId = 0;
pub const GRAPHICAL_CONSOLE: TargetId = 1;
pub const LOGFILE: TargetId = 2;
pub const HUD: TargetId = 3;
pub const LOG_FACADE: TargetId = 4;
pub const MAX_TARGET_ID: usize = 8;

pub const MAX_PENDING_EVENTS: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Error,
    Warn,
    Notice,
    Verbose,
    Debug,
}

impl Level {
    fn as_log_level(self) -> log::Level {
        match self {
            Level::Error => log::Level::Error,
            Level::Warn => log::Level::Warn,
            Level::Notice => log::Level::Info,
            Level::Verbose => log::Level::Debug,
            Level::Debug => log::Level::Trace,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub level: Level,
    pub text: String,
}

impl Event {
    pub fn new(level: Level, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}

/// Bitmask selecting the given targets
pub fn target_mask(targets: &[TargetId]) -> u32 {
    targets
        .iter()
        .filter(|&&id| id < MAX_TARGET_ID)
        .fold(0, |mask, &id| mask | (1 << id))
}

pub trait LogTarget: Send + Sync {
    /// Consume every event of the batch and return true, or none and return false.
    ///
    /// Called with the target's buffer locked; must not dispatch back into itself.
    fn process(&self, events: &[Event]) -> bool;
}

pub struct LogDispatcher {
    targets: RwLock<Vec<Option<Arc<dyn LogTarget>>>>,
    buffers: Vec<Mutex<Vec<Event>>>,
}

impl Default for LogDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LogDispatcher {
    pub fn new() -> Self {
        Self {
            targets: RwLock::new(vec![None; MAX_TARGET_ID]),
            buffers: (0..MAX_TARGET_ID).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Dispatcher with stderr and `log` facade targets installed.
    pub fn with_default_targets() -> Self {
        let dispatcher = Self::new();
        dispatcher.register_target(TTY_CONSOLE, Arc::new(StderrTarget));
        dispatcher.register_target(LOG_FACADE, Arc::new(LogFacadeTarget));
        dispatcher
    }

    pub fn register_target(&self, id: TargetId, target: Arc<dyn LogTarget>) {
        if id >= MAX_TARGET_ID {
            log::warn!("Ignoring log target with out-of-range id {}", id);
            return;
        }
        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());
        targets[id] = Some(target);
    }

    /// Fan `event` out to every target selected by `target_mask`.
    /// Safe to call from any thread.
    pub fn dispatch(&self, event: Event, target_mask: u32) {
        for id in 0..MAX_TARGET_ID {
            if (target_mask >> id) & 1 == 0 {
                continue;
            }
            let target = {
                let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
                targets[id].clone()
            };

            let mut buffer = self.buffers[id].lock().unwrap_or_else(|e| e.into_inner());
            buffer.push(event.clone());

            let processed = target.map(|t| t.process(&buffer)).unwrap_or(false);
            if processed || buffer.len() > MAX_PENDING_EVENTS {
                if !processed {
                    log::debug!("Dropping {} pending log events for target {}", buffer.len(), id);
                }
                buffer.clear();
            }
        }
    }

    /// Number of events waiting for `id`
    pub fn pending(&self, id: TargetId) -> usize {
        self.buffers
            .get(id)
            .map(|b| b.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }
}

/// Plain text to stderr
pub struct StderrTarget;

impl LogTarget for StderrTarget {
    fn process(&self, events: &[Event]) -> bool {
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        for event in events {
            if writeln!(out, "{}", event.text).is_err() {
                return false;
            }
        }
        true
    }
}

/// Forwards events into the `log` facade
pub struct LogFacadeTarget;

impl LogTarget for LogFacadeTarget {
    fn process(&self, events: &[Event]) -> bool {
        for event in events {
            log::log!(target: "vm", event.level.as_log_level(), "{}", event.text);
        }
        true
    }
}

/// Appends `<timestamp> <level> <text>` lines to a file. Declines batches
/// while no file is open.
pub struct LogFileTarget {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl LogFileTarget {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    pub fn open(&self, overwrite: bool) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(!overwrite)
            .truncate(overwrite)
            .open(&self.path)?;
        *self.file.lock().unwrap_or_else(|e| e.into_inner()) = Some(file);
        Ok(())
    }

    pub fn close(&self) {
        self.file.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogTarget for LogFileTarget {
    fn process(&self, events: &[Event]) -> bool {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let Some(file) = guard.as_mut() else {
            return false;
        };
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut batch = String::new();
        for event in events {
            batch.push_str(&format!("{} {:?} {}\n", stamp, event.level, event.text));
        }
        match file.write_all(batch.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Log file {} not writable: {}", self.path.display(), e);
                false
            }
        }
    }
}
