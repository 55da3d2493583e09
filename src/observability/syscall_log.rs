/// Per-instance syscall log
///
/// One line per message boundary on the root channel:
/// `<timestamp> <direction> <start|end> <major>:<minor> (<id>)`
use crate::config::types::Direction;
use crate::ipc::message::split_id;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    Start,
    End,
}

impl Marker {
    fn as_str(self) -> &'static str {
        match self {
            Marker::Start => "start",
            Marker::End => "end",
        }
    }
}

pub struct SyscallLog {
    path: PathBuf,
    out: Mutex<LineWriter<File>>,
}

impl SyscallLog {
    /// Open (truncate) `<dir>/<vm_name>-syscallLog`.
    pub fn open(dir: &Path, vm_name: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}-syscallLog", vm_name));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            out: Mutex::new(LineWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, direction: Direction, marker: Marker, id: u32) {
        let (major, minor) = split_id(id);
        let line = format!(
            "{} {} {} {}:{} ({:#010x})",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            direction.as_str(),
            marker.as_str(),
            major,
            minor,
            id
        );
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(out, "{}", line) {
            log::debug!("Syscall log {} not writable: {}", self.path.display(), e);
        }
    }
}
