//! Child-process execution, with or without sandbox hardening.
use crate::config::types::{Result, VmError, VmType};
use crate::ipc::{Channel, ROOT_SOCKET_ENV, ROOT_SOCKET_FD};
use crate::vm::sandbox::{self, SandboxPolicy};
use crate::vm::strategy::{ExecutionStrategy, StopReport};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const TERM_GRACE: Duration = Duration::from_millis(200);

pub struct ChildProcess {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    sandbox: Option<SandboxPolicy>,
    child: Option<Child>,
}

impl ChildProcess {
    /// `sandbox: None` runs the module as a plain native executable.
    pub fn new(name: &str, program: PathBuf, args: Vec<String>, sandbox: Option<SandboxPolicy>) -> Self {
        Self {
            name: name.to_string(),
            program,
            args,
            sandbox,
            child: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }
}

impl ExecutionStrategy for ChildProcess {
    fn vm_type(&self) -> VmType {
        if self.sandbox.is_some() {
            VmType::Sandboxed
        } else {
            VmType::NativeExe
        }
    }

    fn start(&mut self) -> Result<Channel> {
        if self.child.is_some() {
            return Err(VmError::Startup(format!("VM {} process already started", self.name)));
        }
        let (host, peer) = Channel::socket_pair(&format!("{}/host", self.name))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(ROOT_SOCKET_FD.to_string())
            .stdin(Stdio::null());
        match &self.sandbox {
            Some(policy) => sandbox::harden(&mut cmd, policy, peer.as_raw_fd()),
            None => sandbox::attach_root_socket(&mut cmd, peer.as_raw_fd()),
        }
        cmd.env(ROOT_SOCKET_ENV, ROOT_SOCKET_FD.to_string());

        let child = cmd.spawn().map_err(|e| {
            VmError::Startup(format!("failed to spawn {}: {}", self.program.display(), e))
        })?;
        // The child holds its own copy now.
        drop(peer);

        log::info!(
            "VM {} started {} as pid {} ({})",
            self.name,
            self.program.display(),
            child.id(),
            self.vm_type()
        );
        self.child = Some(child);
        Ok(host)
    }

    fn is_live(&mut self) -> bool {
        self.child.is_some()
    }

    fn stop(&mut self, grace: Duration) -> StopReport {
        let mut report = StopReport::default();
        let Some(mut child) = self.child.take() else {
            return report;
        };
        let start = Instant::now();

        let status = match wait_with_deadline(&mut child, start + grace) {
            Some(status) => {
                report.exited_cleanly = true;
                Some(status)
            }
            None => {
                log::warn!(
                    "VM {} pid {} did not exit within {:?}, terminating",
                    self.name,
                    child.id(),
                    grace
                );
                terminate_group(&mut child, &mut report)
            }
        };

        if let Some(status) = status {
            report.exit_code = status.code();
            report.signal = status.signal();
        }
        report.waited_ms = start.elapsed().as_millis() as u64;
        log::info!("VM {} process stopped: {:?}", self.name, report);
        report
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.stop(Duration::ZERO);
        }
    }
}

fn wait_with_deadline(child: &mut Child, deadline: Instant) -> Option<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                log::warn!("try_wait failed for pid {}: {}", child.id(), e);
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM the child's process group, then SIGKILL it, then reap.
fn terminate_group(child: &mut Child, report: &mut StopReport) -> Option<ExitStatus> {
    let pid = Pid::from_raw(child.id() as libc::pid_t);

    send_to_group(pid, Signal::SIGTERM, report);
    report.term_sent = true;

    if let Some(status) = wait_with_deadline(child, Instant::now() + TERM_GRACE) {
        return Some(status);
    }

    send_to_group(pid, Signal::SIGKILL, report);
    report.kill_sent = true;

    match child.wait() {
        Ok(status) => Some(status),
        Err(e) => {
            report.notes.push(format!("wait failed: {}", e));
            None
        }
    }
}

/// Signal the group led by `pid`, or just `pid` if it never got its own group.
fn send_to_group(pid: Pid, sig: Signal, report: &mut StopReport) {
    if let Err(errno) = killpg(pid, sig) {
        report
            .notes
            .push(format!("group {} fallback used: {}", sig, errno));
        if let Err(errno) = kill(pid, sig) {
            log::debug!("{} to pid {} failed: {}", sig, pid, errno);
        }
    }
}
