//! In-process execution: the module runs on one dedicated host thread.
//!
//! There is no isolation. A thread cannot be killed, so a forced stop closes
//! the channel and waits; a thread that still does not finish is detached and
//! its library stays mapped.
use crate::config::types::{Result, VmError, VmType};
use crate::ipc::Channel;
use crate::vm::library::SharedLibrary;
use crate::vm::state::{ThreadLifecycle, ThreadPhase};
use crate::vm::strategy::{ExecutionStrategy, StopReport};
use std::os::unix::io::IntoRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Module entry point linked into the host binary. Receives the module end
/// of the root channel and returns when the module is done.
pub type ModuleEntry = Arc<dyn Fn(Channel) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub enum ModuleImage {
    Linked(ModuleEntry),
    /// Library exporting `vm_main`
    SharedLibrary(PathBuf),
}

pub struct InProcessThread {
    name: String,
    image: ModuleImage,
    lifecycle: Arc<ThreadLifecycle>,
    worker: Option<JoinHandle<()>>,
    library: Option<Arc<SharedLibrary>>,
}

/// Marks the worker stopped even when the module panics.
struct StoppedOnExit(Arc<ThreadLifecycle>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0.advance(ThreadPhase::Stopped);
    }
}

impl InProcessThread {
    pub fn new(name: &str, image: ModuleImage) -> Self {
        Self {
            name: name.to_string(),
            image,
            lifecycle: Arc::new(ThreadLifecycle::new()),
            worker: None,
            library: None,
        }
    }

    pub fn phase(&self) -> ThreadPhase {
        self.lifecycle.phase()
    }

    fn spawn<F>(&self, body: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let lifecycle = self.lifecycle.clone();
        let handle = thread::Builder::new()
            .name(format!("vm-{}", self.name))
            .spawn(move || {
                let _stopped = StoppedOnExit(lifecycle.clone());
                lifecycle.advance(ThreadPhase::Running);
                body();
            })
            .map_err(|e| VmError::Startup(format!("failed to spawn module thread: {}", e)))?;
        Ok(handle)
    }
}

impl ExecutionStrategy for InProcessThread {
    fn vm_type(&self) -> VmType {
        VmType::NativeDll
    }

    fn start(&mut self) -> Result<Channel> {
        if self.worker.is_some() {
            return Err(VmError::Startup(format!("VM {} thread already started", self.name)));
        }
        self.lifecycle = Arc::new(ThreadLifecycle::new());
        let name = self.name.clone();

        match self.image.clone() {
            ModuleImage::Linked(entry) => {
                let (host, module) =
                    Channel::pair(&format!("{}/host", name), &format!("{}/module", name));
                self.worker = Some(self.spawn(move || {
                    match entry(module) {
                        Ok(()) => log::info!("VM {} module thread finished", name),
                        Err(e) => log::warn!("VM {} module thread failed: {}", name, e),
                    }
                })?);
                Ok(host)
            }
            ModuleImage::SharedLibrary(path) => {
                let library = Arc::new(SharedLibrary::open(&path)?);
                let vm_main = library.entry_point()?;
                let (host, peer) = Channel::socket_pair(&format!("{}/host", name))?;
                let fd = peer.into_raw_fd();
                self.library = Some(library);
                self.worker = Some(self.spawn(move || {
                    let rc = unsafe { vm_main(fd) };
                    log::info!("VM {} vm_main returned {}", name, rc);
                })?);
                Ok(host)
            }
        }
    }

    fn is_live(&mut self) -> bool {
        self.worker.is_some()
    }

    fn stop(&mut self, grace: Duration) -> StopReport {
        let mut report = StopReport::default();
        let Some(worker) = self.worker.take() else {
            return report;
        };
        let start = Instant::now();

        self.lifecycle.advance(ThreadPhase::Stopping);
        let phase = self.lifecycle.wait_until(ThreadPhase::Stopped, Some(grace));
        report.waited_ms = start.elapsed().as_millis() as u64;

        if phase == ThreadPhase::Stopped {
            if worker.join().is_err() {
                report.notes.push("module thread panicked".to_string());
            } else {
                report.exited_cleanly = true;
            }
            self.library.take();
        } else {
            log::warn!(
                "VM {} module thread did not stop within {:?}, detaching it",
                self.name,
                grace
            );
            report.detached = true;
            report.notes.push("module thread detached".to_string());
            drop(worker);
            if let Some(library) = self.library.take() {
                match Arc::try_unwrap(library) {
                    Ok(library) => library.leak(),
                    Err(shared) => std::mem::forget(shared),
                }
            }
        }
        report
    }
}

impl Drop for InProcessThread {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop(Duration::ZERO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Frame;
    use std::sync::mpsc;

    fn echo_entry() -> ModuleEntry {
        Arc::new(|channel: Channel| {
            loop {
                let frame = channel.recv()?;
                channel.send(Frame::one_way(frame.id + 1, frame.payload))?;
            }
        })
    }

    #[test]
    fn test_linked_entry_round_trip_and_stop() {
        let mut strategy = InProcessThread::new("echo", ModuleImage::Linked(echo_entry()));
        let host = strategy.start().unwrap();
        assert!(strategy.is_live());

        host.send(Frame::one_way(1, b"x".to_vec())).unwrap();
        assert_eq!(host.recv().unwrap().id, 2);

        host.close();
        let report = strategy.stop(Duration::from_secs(5));
        assert!(report.exited_cleanly);
        assert!(!report.detached);
        assert!(!strategy.is_live());
        assert_eq!(strategy.phase(), ThreadPhase::Stopped);
    }

    #[test]
    fn test_stuck_thread_is_detached() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));
        let entry: ModuleEntry = Arc::new(move |_channel: Channel| {
            let _ = release_rx.lock().unwrap().recv();
            Ok(())
        });
        let mut strategy = InProcessThread::new("stuck", ModuleImage::Linked(entry));
        let host = strategy.start().unwrap();
        host.close();

        let report = strategy.stop(Duration::from_millis(20));
        assert!(report.detached);
        assert!(!strategy.is_live());
        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_panicking_module_still_reaches_stopped() {
        let entry: ModuleEntry = Arc::new(|_channel: Channel| panic!("module bug"));
        let mut strategy = InProcessThread::new("boom", ModuleImage::Linked(entry));
        let host = strategy.start().unwrap();
        assert!(host.recv().is_err());
        let report = strategy.stop(Duration::from_secs(5));
        assert!(!report.detached);
        assert!(!report.exited_cleanly);
    }

    #[test]
    fn test_missing_library_fails_start() {
        let mut strategy = InProcessThread::new(
            "nolib",
            ModuleImage::SharedLibrary(PathBuf::from("/nonexistent/libnolib.so")),
        );
        assert!(matches!(strategy.start(), Err(VmError::Startup(_))));
        assert!(!strategy.is_live());
    }
}
