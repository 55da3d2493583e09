//! Pre-exec hardening for sandboxed module processes.
//!
//! Everything that runs between fork and exec is prepared in the parent: the
//! closure installed with `pre_exec` only issues raw syscalls and never
//! allocates. The fixed child-side sequence is:
//! 1. root socket onto fd 3 without close-on-exec
//! 2. own process group, SIGKILL on parent death
//! 3. close-on-exec for every other descriptor above 3
//! 4. rlimits
//! 5. optional network namespace
//! 6. `PR_SET_NO_NEW_PRIVS`, umask
//!
//! The environment is rebuilt from an allow-list before spawning.
use crate::ipc::ROOT_SOCKET_FD;
use nix::sched::{unshare, CloneFlags};
use serde::{Deserialize, Serialize};
use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Fail the spawn when any hardening step fails instead of skipping it
    pub strict: bool,
    /// Move the module into an empty network namespace when permitted
    pub isolate_network: bool,
    pub max_address_space_mb: Option<u64>,
    pub max_open_files: Option<u64>,
    pub max_file_size_mb: Option<u64>,
    pub max_cpu_seconds: Option<u64>,
    pub core_dumps: bool,
    /// Variables copied from the host environment
    pub env_passthrough: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            strict: false,
            isolate_network: true,
            max_address_space_mb: Some(4096),
            max_open_files: Some(256),
            max_file_size_mb: Some(64),
            max_cpu_seconds: None,
            core_dumps: false,
            env_passthrough: ["PATH", "LANG", "RUST_LOG", "RUST_BACKTRACE"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            working_dir: None,
        }
    }
}

/// A resource limit resolved before fork
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreparedLimit {
    pub name: &'static str,
    pub resource: libc::__rlimit_resource_t,
    pub value: u64,
}

impl SandboxPolicy {
    pub fn rlimits(&self) -> Vec<PreparedLimit> {
        const MB: u64 = 1024 * 1024;
        let mut limits = Vec::new();
        let mut push = |name, resource, value: Option<u64>| {
            if let Some(value) = value {
                limits.push(PreparedLimit {
                    name,
                    resource,
                    value,
                });
            }
        };
        push("RLIMIT_AS", libc::RLIMIT_AS, self.max_address_space_mb.map(|v| v * MB));
        push("RLIMIT_NOFILE", libc::RLIMIT_NOFILE, self.max_open_files);
        push("RLIMIT_FSIZE", libc::RLIMIT_FSIZE, self.max_file_size_mb.map(|v| v * MB));
        push("RLIMIT_CPU", libc::RLIMIT_CPU, self.max_cpu_seconds);
        push("RLIMIT_CORE", libc::RLIMIT_CORE, (!self.core_dumps).then_some(0));
        limits
    }

    /// Environment handed to the module: allow-listed host variables only.
    pub fn sanitized_env(&self) -> Vec<(String, String)> {
        self.env_passthrough
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.clone(), v)))
            .collect()
    }
}

/// Wire the root socket and lifecycle ownership for an unsandboxed child.
pub fn attach_root_socket(cmd: &mut Command, root_fd: RawFd) {
    unsafe {
        cmd.pre_exec(move || {
            install_root_socket(root_fd)?;
            own_process_group()?;
            Ok(())
        });
    }
}

/// Configure `cmd` to run under `policy` with `root_fd` as its root socket.
pub fn harden(cmd: &mut Command, policy: &SandboxPolicy, root_fd: RawFd) {
    cmd.env_clear();
    cmd.envs(policy.sanitized_env());
    if let Some(dir) = &policy.working_dir {
        cmd.current_dir(dir);
    }

    let limits = policy.rlimits();
    let strict = policy.strict;
    let isolate_network = policy.isolate_network;
    log::info!(
        "Sandbox policy: strict={}, isolate_network={}, limits={:?}",
        strict,
        isolate_network,
        limits.iter().map(|l| (l.name, l.value)).collect::<Vec<_>>()
    );

    unsafe {
        cmd.pre_exec(move || {
            install_root_socket(root_fd)?;
            own_process_group()?;
            // Before RLIMIT_NOFILE shrinks the fallback scan range.
            mark_descriptors_cloexec(ROOT_SOCKET_FD + 1);

            for limit in &limits {
                let value = libc::rlimit {
                    rlim_cur: limit.value as libc::rlim_t,
                    rlim_max: limit.value as libc::rlim_t,
                };
                if libc::setrlimit(limit.resource, &value) != 0 && strict {
                    return Err(io::Error::last_os_error());
                }
            }

            if isolate_network {
                if let Err(errno) = unshare(CloneFlags::CLONE_NEWNET) {
                    if strict {
                        return Err(io::Error::from(errno));
                    }
                }
            }

            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 && strict {
                return Err(io::Error::last_os_error());
            }
            libc::umask(0o077);
            Ok(())
        });
    }
}

/// Child side: put the root socket on fd 3 and keep it across exec.
fn install_root_socket(root_fd: RawFd) -> io::Result<()> {
    unsafe {
        if root_fd == ROOT_SOCKET_FD {
            if libc::fcntl(root_fd, libc::F_SETFD, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
        } else if libc::dup2(root_fd, ROOT_SOCKET_FD) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Child side: new process group so the whole tree can be signalled, and
/// SIGKILL when the host goes away.
fn own_process_group() -> io::Result<()> {
    unsafe {
        if libc::setpgid(0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Child side: close-on-exec for every descriptor from `first` up.
///
/// Descriptors are not closed here since the spawn error pipe is among them.
fn mark_descriptors_cloexec(first: RawFd) {
    const SYS_CLOSE_RANGE: libc::c_long = 436;
    const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

    let rc = unsafe {
        libc::syscall(
            SYS_CLOSE_RANGE,
            first as libc::c_uint,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        )
    };
    if rc == 0 {
        return;
    }

    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let max_fd = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        (limit.rlim_cur as RawFd).clamp(first, 65536)
    } else {
        1024
    };
    for fd in first..max_fd {
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
}
