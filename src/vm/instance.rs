//! VM instance lifecycle.
//!
//! A [`VmInstance`] owns at most one running module: its execution strategy
//! and the host end of the root channel. [`VmLink`] is the shared handle the
//! syscall layer and proxies use to call into the module; proxies keep only a
//! [`WeakVmLink`] so they never keep a freed instance alive.
use crate::config::params::VmParams;
use crate::config::types::{Direction, Result, VmError, VmState, VmType};
use crate::ipc::{call_until, split_id, wait_for, Channel, Frame, Message, Reader};
use crate::observability::syscall_log::{Marker, SyscallLog};
use crate::services::cvar::CvarStore;
use crate::services::router::{CommonVmServices, HostServices};
use crate::services::syscalls::{ReadyMsg, ShutdownMsg, ABI_VERSION};
use crate::vm::state::transition;
use crate::vm::strategy::{create_strategy, ExecutionStrategy, StopReport, VmOptions};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// How long a faulted module gets to exit before it is forced.
const FAULT_GRACE: Duration = Duration::from_millis(100);

/// Module-facing entry point: handles one inbound syscall.
///
/// Must answer on `channel` whenever `reader.expects_reply()`. Any error is
/// treated as a protocol violation and faults the instance.
pub trait SyscallHandler: Send + Sync {
    fn syscall(&self, vm: &VmLink, reader: Reader, channel: &Channel) -> Result<()>;

    /// Called when a new module run starts loading.
    fn loading(&self, _vm: &VmLink) {}

    /// Called once the module run is torn down.
    fn released(&self, _vm_name: &str) {}
}

/// Live resources of one module run
struct Session {
    channel: Arc<Channel>,
    strategy: Box<dyn ExecutionStrategy>,
}

#[derive(Default)]
struct GateState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Serializes use of the root channel across threads. The owning thread may
/// re-enter, which happens whenever a syscall handler calls back into the
/// module while an outer call is still waiting.
#[derive(Default)]
struct CallGate {
    state: Mutex<GateState>,
    free: Condvar,
}

/// Holds the call gate of one instance until dropped.
pub struct CallGuard<'a>(&'a CallGate);

impl CallGate {
    fn enter(&self) -> CallGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.owner.is_some_and(|owner| owner != me) {
            state = self.free.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.owner = Some(me);
        state.depth += 1;
        CallGuard(self)
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock().unwrap_or_else(|e| e.into_inner());
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.0.free.notify_all();
        }
    }
}

struct VmShared {
    name: String,
    handler: Arc<dyn SyscallHandler>,
    state: Mutex<VmState>,
    session: Mutex<Option<Session>>,
    gate: CallGate,
    syscall_log: Mutex<Option<Arc<SyscallLog>>>,
}

#[derive(Clone)]
pub struct VmLink(Arc<VmShared>);

#[derive(Clone)]
pub struct WeakVmLink {
    name: String,
    inner: Weak<VmShared>,
}

impl WeakVmLink {
    pub fn upgrade(&self) -> Option<VmLink> {
        self.inner.upgrade().map(VmLink)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl VmLink {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn state(&self) -> VmState {
        *self.0.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True iff a child process or worker thread is currently held.
    pub fn is_active(&self) -> bool {
        let mut session = self.0.session.lock().unwrap_or_else(|e| e.into_inner());
        session.as_mut().is_some_and(|s| s.strategy.is_live())
    }

    pub fn downgrade(&self) -> WeakVmLink {
        WeakVmLink {
            name: self.0.name.clone(),
            inner: Arc::downgrade(&self.0),
        }
    }

    /// Keep other threads from calling into the module until the guard is
    /// dropped. Calls from this thread pass through.
    pub fn hold(&self) -> CallGuard<'_> {
        self.0.gate.enter()
    }

    fn channel(&self) -> Result<Arc<Channel>> {
        if !self.state().accepts_traffic() {
            return Err(VmError::NotActive(self.0.name.clone()));
        }
        let session = self.0.session.lock().unwrap_or_else(|e| e.into_inner());
        session
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or_else(|| VmError::NotActive(self.0.name.clone()))
    }

    /// Call `M` in the module and block until it answers.
    ///
    /// Syscalls the module makes meanwhile are handled on this thread. A
    /// protocol violation or broken channel faults the instance.
    pub fn send_msg<M: Message>(&self, args: &M::Args) -> Result<M::Reply> {
        self.send_msg_until::<M>(args, None)?
            .ok_or_else(|| VmError::ChannelBroken(format!("{}: call ended without reply", self.name())))
    }

    /// `send_msg` with a deadline. `Ok(None)` when the deadline passed first.
    pub fn send_msg_until<M: Message>(
        &self,
        args: &M::Args,
        deadline: Option<Instant>,
    ) -> Result<Option<M::Reply>> {
        let _gate = self.0.gate.enter();
        let channel = self.channel()?;

        self.trace(Direction::ToModule, Marker::Start, M::ID);
        let result = call_until::<M, _>(&channel, args, deadline, |frame| self.dispatch(frame, &channel));
        self.trace(Direction::ToModule, Marker::End, M::ID);

        result.map_err(|e| self.check_fatal(e))
    }

    /// Service inbound syscalls until `timeout` passes without traffic.
    /// Returns how many were handled.
    pub fn pump(&self, timeout: Duration) -> Result<usize> {
        let _gate = self.0.gate.enter();
        let channel = self.channel()?;
        let mut handled = 0;
        loop {
            let frame = match channel.recv_deadline(Some(Instant::now() + timeout)) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(handled),
                Err(e) => return Err(self.check_fatal(e)),
            };
            let result = if frame.is_reply() {
                Err(VmError::Protocol(format!("unsolicited reply for message {:#010x}", frame.id)))
            } else {
                self.dispatch(frame, &channel)
            };
            if let Err(e) = result {
                return Err(self.check_fatal(e));
            }
            handled += 1;
        }
    }

    fn dispatch(&self, frame: Frame, channel: &Channel) -> Result<()> {
        let id = frame.id;
        self.trace(Direction::FromModule, Marker::Start, id);
        let result = self.0.handler.syscall(self, Reader::from(frame), channel);
        self.trace(Direction::FromModule, Marker::End, id);

        result.map_err(|e| {
            if e.is_fatal() {
                e
            } else {
                let (major, minor) = split_id(id);
                VmError::Protocol(format!("syscall {}:{} failed: {}", major, minor, e))
            }
        })
    }

    fn trace(&self, direction: Direction, marker: Marker, id: u32) {
        let log = self.0.syscall_log.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(log) = log {
            log.record(direction, marker, id);
        }
    }

    fn check_fatal(&self, err: VmError) -> VmError {
        // The module closing its end while shutting down is an orderly exit.
        let orderly_exit =
            matches!(err, VmError::ChannelBroken(_)) && self.state() == VmState::ShuttingDown;
        if err.is_fatal() && !orderly_exit {
            self.fault(&err);
        }
        err
    }

    /// Enter `Faulted` and release everything. No-op when already faulted.
    fn fault(&self, err: &VmError) {
        if transition(&self.0.state, &self.0.name, VmState::Faulted).is_some() {
            log::error!("VM {} faulted: {}", self.0.name, err);
            self.teardown(FAULT_GRACE);
        }
    }

    /// Close the channel, stop the strategy and drop every proxy of this run.
    fn teardown(&self, grace: Duration) -> Option<StopReport> {
        let session = self.0.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        let report = session.map(|mut session| {
            session.channel.close();
            session.strategy.stop(grace)
        });
        self.0.handler.released(&self.0.name);
        self.0.syscall_log.lock().unwrap_or_else(|e| e.into_inner()).take();
        report
    }
}

/// A named module slot that can be created and freed repeatedly.
pub struct VmInstance {
    link: VmLink,
    cvars: Arc<CvarStore>,
    params: VmParams,
    options: VmOptions,
}

impl VmInstance {
    pub fn new(
        name: &str,
        cvars: Arc<CvarStore>,
        handler: Arc<dyn SyscallHandler>,
        options: VmOptions,
    ) -> Result<Self> {
        let params = VmParams::register(&cvars, name, options.startup_timeout)?;
        Ok(Self {
            link: VmLink(Arc::new(VmShared {
                name: name.to_string(),
                handler,
                state: Mutex::new(VmState::Unloaded),
                session: Mutex::new(None),
                gate: CallGate::default(),
                syscall_log: Mutex::new(None),
            })),
            cvars,
            params,
            options,
        })
    }

    /// Instance whose syscalls are served by [`CommonVmServices`].
    pub fn with_common_services(name: &str, host: HostServices, options: VmOptions) -> Result<Self> {
        let cvars = host.cvars.clone();
        let handler = Arc::new(CommonVmServices::new(name, host));
        Self::new(name, cvars, handler, options)
    }

    pub fn link(&self) -> &VmLink {
        &self.link
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn state(&self) -> VmState {
        self.link.state()
    }

    pub fn is_active(&self) -> bool {
        self.link.is_active()
    }

    pub fn params(&self) -> &VmParams {
        &self.params
    }

    pub fn send_msg<M: Message>(&self, args: &M::Args) -> Result<M::Reply> {
        self.link.send_msg::<M>(args)
    }

    /// Start the module and wait for its readiness signal.
    ///
    /// Any module already running in this slot is freed first. On failure the
    /// instance is left `Faulted` with nothing running.
    pub fn create(&mut self) -> Result<()> {
        if self.state() != VmState::Unloaded {
            self.free();
        }

        let name = self.name().to_string();
        let vm_type = self.params.vm_type(&self.cvars);
        let timeout = self.params.startup_timeout(&self.cvars, self.options.startup_timeout);
        transition(&self.link.0.state, &name, VmState::Loading);
        log::info!("Creating VM {} ({}, startup timeout {:?})", name, vm_type, timeout);

        if self.params.log_syscalls(&self.cvars) {
            match SyscallLog::open(&self.options.log_dir, &name) {
                Ok(log) => {
                    log::info!("VM {} syscall log: {}", name, log.path().display());
                    *self.link.0.syscall_log.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(Arc::new(log));
                }
                Err(e) => log::warn!("VM {}: failed to open syscall log: {}", name, e),
            }
        }
        self.link.0.handler.loading(&self.link);

        match self.start(vm_type, timeout) {
            Ok(()) => {
                transition(&self.link.0.state, &name, VmState::Active);
                log::info!("VM {} is active", name);
                Ok(())
            }
            Err(e) => {
                log::error!("VM {} failed to start: {}", name, e);
                transition(&self.link.0.state, &name, VmState::Faulted);
                self.link.teardown(FAULT_GRACE);
                Err(e)
            }
        }
    }

    fn start(&mut self, vm_type: VmType, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut strategy = create_strategy(vm_type, self.name(), &self.options)?;
        let channel = Arc::new(strategy.start()?);
        *self.link.0.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(Session {
            channel: channel.clone(),
            strategy,
        });

        let link = &self.link;
        let _gate = link.0.gate.enter();
        let ready = wait_for(
            &channel,
            deadline,
            |frame| frame.id == ReadyMsg::ID && !frame.is_reply(),
            |frame| link.dispatch(frame, &channel),
        )
        .map_err(|e| match e {
            VmError::ChannelBroken(reason) => {
                VmError::Startup(format!("module exited before signalling readiness: {}", reason))
            }
            other => other,
        })?
        .ok_or(VmError::StartupTimeout(timeout))?;

        link.trace(Direction::FromModule, Marker::Start, ready.id);
        let hello = Reader::from(ready).read::<<ReadyMsg as Message>::Args>();
        link.trace(Direction::FromModule, Marker::End, ReadyMsg::ID);
        let hello = hello?;
        if hello.abi_version != ABI_VERSION {
            return Err(VmError::Startup(format!(
                "module {} speaks ABI {}, host speaks {}",
                hello.name, hello.abi_version, ABI_VERSION
            )));
        }
        log::info!("VM {} module {:?} signalled readiness", self.name(), hello.name);
        Ok(())
    }

    /// Shut the module down and release everything. Safe in any state.
    ///
    /// The module gets a shutdown call bounded by the shutdown timeout, then
    /// the same time again to exit before it is forced.
    pub fn free(&mut self) -> Option<StopReport> {
        let name = self.name().to_string();
        let grace = self.options.shutdown_timeout;

        if transition(&self.link.0.state, &name, VmState::ShuttingDown).is_some() {
            let deadline = Instant::now() + grace;
            match self.link.send_msg_until::<ShutdownMsg>(&(), Some(deadline)) {
                Ok(Some(())) => log::debug!("VM {} acknowledged shutdown", name),
                Ok(None) => log::warn!("VM {} did not acknowledge shutdown within {:?}", name, grace),
                Err(e) => log::warn!("VM {} shutdown call failed: {}", name, e),
            }
        }

        let report = self.link.teardown(grace);
        // Loading only survives here when a previous create() was interrupted.
        let mut state = self.link.0.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != VmState::Faulted {
            *state = VmState::Unloaded;
        }
        drop(state);

        if let Some(report) = &report {
            log::info!("VM {} freed: {:?}", name, report);
        }
        report
    }
}

impl Drop for VmInstance {
    fn drop(&mut self) {
        if self.link.0.session.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
            self.free();
        }
    }
}
