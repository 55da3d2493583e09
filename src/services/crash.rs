//! Crash dump sinks
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Receives raw diagnostic buffers reported by faulting modules.
pub trait CrashSink: Send + Sync {
    fn crash_dump(&self, dump: &[u8], vm_name: &str);
}

/// Logs the dump size and a printable prefix
pub struct LoggingCrashSink;

impl CrashSink for LoggingCrashSink {
    fn crash_dump(&self, dump: &[u8], vm_name: &str) {
        let preview: String = String::from_utf8_lossy(&dump[..dump.len().min(256)]).into_owned();
        log::error!("VM {} reported a crash ({} bytes): {}", vm_name, dump.len(), preview);
    }
}

/// Writes each dump to `<dir>/crash-<vm>-<uuid>.dmp`.
pub struct FileCrashSink {
    dir: PathBuf,
    written: Mutex<Vec<PathBuf>>,
}

impl FileCrashSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Paths of dumps written so far
    pub fn written(&self) -> Vec<PathBuf> {
        self.written.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write(&self, dump: &[u8], vm_name: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let safe_name: String = vm_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = self
            .dir
            .join(format!("crash-{}-{}.dmp", safe_name, uuid::Uuid::new_v4()));
        fs::write(&path, dump)?;
        Ok(path)
    }
}

impl CrashSink for FileCrashSink {
    fn crash_dump(&self, dump: &[u8], vm_name: &str) {
        match self.write(dump, vm_name) {
            Ok(path) => {
                log::error!("VM {} crashed, dump written to {}", vm_name, path.display());
                self.written
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(path);
            }
            Err(e) => {
                log::error!("VM {} crashed, failed to write dump: {}", vm_name, e);
                LoggingCrashSink.crash_dump(dump, vm_name);
            }
        }
    }
}
