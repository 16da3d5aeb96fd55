use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;

use super::{
    AttachMechanism, AttachState, BREAK_SIGNAL, EXIT_SIGNAL, SignalChannel, SignalConfig,
};
use crate::diagnostics::signal_name;
use crate::error::{SystemError, SystemResult};
use crate::platform::Platform;
use crate::thread::{PriorityMap, ThreadKind, ThreadPriority, ThreadRef, set_priority};

/// Outcome of one diagnostic step
pub type HookResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The break-signal diagnostic sequence
///
/// Each step is independent: a failing or panicking step is logged and the
/// next one still runs.
pub trait DiagnosticHooks: Send + Sync {
    /// Dump every thread's stack
    fn print_threads(&self, print_concurrent_locks: bool) -> HookResult;

    /// Look for and report deadlocks
    fn find_deadlocks(&self) -> HookResult;

    /// Print a heap summary
    fn print_heap(&self) -> HookResult;

    /// Print a per-class histogram of the heap
    fn print_class_histogram(&self) -> HookResult {
        Ok(())
    }

    /// Whether an external tool asked for a data dump
    fn should_post_data_dump(&self) -> bool {
        false
    }

    /// Deliver the data dump event
    fn post_data_dump(&self) -> HookResult {
        Ok(())
    }
}

/// Handler for every signal other than the break signal
pub trait SignalUpcall: Send + Sync {
    /// Run the registered handler for `sig`
    fn dispatch(&self, sig: i32) -> HookResult;
}

/// Where the dispatcher thread is in its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispatcherState {
    /// Blocked on the channel
    Waiting = 0,
    /// Running a handler
    Dispatching = 1,
    /// Loop ended
    Terminated = 2,
}

impl DispatcherState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Waiting,
            1 => Self::Dispatching,
            _ => Self::Terminated,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> DispatcherState {
        DispatcherState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: DispatcherState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Builder for the dispatcher thread
pub struct SignalDispatcher {
    channel: Arc<dyn SignalChannel>,
    hooks: Arc<dyn DiagnosticHooks>,
    upcall: Arc<dyn SignalUpcall>,
    attach: Option<Arc<dyn AttachMechanism>>,
    priority: Option<(Arc<dyn Platform>, PriorityMap)>,
    config: SignalConfig,
}

impl std::fmt::Debug for SignalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalDispatcher")
            .field("config", &self.config)
            .field("attach", &self.attach.is_some())
            .finish_non_exhaustive()
    }
}

impl SignalDispatcher {
    /// Dispatcher over `channel` with the given handlers
    pub fn new(
        channel: Arc<dyn SignalChannel>,
        hooks: Arc<dyn DiagnosticHooks>,
        upcall: Arc<dyn SignalUpcall>,
    ) -> Self {
        Self {
            channel,
            hooks,
            upcall,
            attach: None,
            priority: None,
            config: SignalConfig::default(),
        }
    }

    /// Use `config`
    #[must_use]
    pub fn with_config(mut self, config: SignalConfig) -> Self {
        self.config = config;
        self
    }

    /// Negotiate with `attach` on the break signal
    #[must_use]
    pub fn with_attach(mut self, attach: Arc<dyn AttachMechanism>) -> Self {
        self.attach = Some(attach);
        self
    }

    /// Raise the thread to [`ThreadPriority::NEAR_MAX`] on start, if the host allows
    #[must_use]
    pub fn with_priority(mut self, platform: Arc<dyn Platform>, map: PriorityMap) -> Self {
        self.priority = Some((platform, map));
        self
    }

    /// Spawn the "Signal Dispatcher" thread
    ///
    /// Returns `Ok(None)` without spawning when `reduce_signal_usage` is set.
    pub fn start(self) -> SystemResult<Option<SignalThread>> {
        if self.config.reduce_signal_usage {
            tracing::debug!(target: "os::signal", "reduced signal usage, no dispatcher thread");
            return Ok(None);
        }

        let state = Arc::new(StateCell(AtomicU8::new(DispatcherState::Waiting as u8)));
        let channel = Arc::clone(&self.channel);
        let worker = Worker {
            dispatcher: self,
            state: Arc::clone(&state),
        };
        let handle = std::thread::Builder::new()
            .name("Signal Dispatcher".into())
            .spawn(move || worker.run())
            .map_err(|e| SystemError::SignalThread {
                reason: format!("cannot spawn dispatcher thread: {e}"),
            })?;

        Ok(Some(SignalThread {
            handle: Some(handle),
            channel,
            state,
        }))
    }
}

struct Worker {
    dispatcher: SignalDispatcher,
    state: Arc<StateCell>,
}

impl Worker {
    fn run(self) {
        if let Some((platform, map)) = &self.dispatcher.priority {
            let me = ThreadRef::current(platform.as_ref(), ThreadKind::VmInternal);
            if let Err(e) = set_priority(platform.as_ref(), map, me, ThreadPriority::NEAR_MAX) {
                tracing::debug!(target: "os::signal", error = %e, "dispatcher keeps default priority");
            }
        }
        tracing::debug!(target: "os::signal", "signal dispatcher started");

        loop {
            self.state.set(DispatcherState::Waiting);
            let sig = self.dispatcher.channel.wait();
            if sig == EXIT_SIGNAL {
                break;
            }
            self.state.set(DispatcherState::Dispatching);
            self.dispatch(sig);
        }

        self.state.set(DispatcherState::Terminated);
        tracing::debug!(target: "os::signal", "signal dispatcher terminated");
    }

    fn dispatch(&self, sig: i32) {
        if sig == BREAK_SIGNAL {
            if !self.dispatcher.config.disable_attach_mechanism
                && let Some(attach) = &self.dispatcher.attach
                && consumed_by_attach(attach.as_ref())
            {
                return;
            }
            self.print_diagnostics();
        } else if let Err(e) = guarded(|| self.dispatcher.upcall.dispatch(sig)) {
            tracing::warn!(
                target: "os::signal",
                sig,
                "Exception {e} occurred dispatching signal {} to handler; the VM may need to be forcibly terminated",
                signal_name(sig)
            );
        }
    }

    fn print_diagnostics(&self) {
        let hooks = self.dispatcher.hooks.as_ref();
        let config = &self.dispatcher.config;

        step("print_threads", || hooks.print_threads(config.print_concurrent_locks));
        step("find_deadlocks", || hooks.find_deadlocks());
        step("print_heap", || hooks.print_heap());
        if config.print_class_histogram {
            step("print_class_histogram", || hooks.print_class_histogram());
        }
        step("post_data_dump", || {
            if hooks.should_post_data_dump() {
                hooks.post_data_dump()
            } else {
                Ok(())
            }
        });
    }
}

/// Attach negotiation; `true` when the break signal was an attach request
fn consumed_by_attach(attach: &dyn AttachMechanism) -> bool {
    let cell = attach.state();
    match cell.transit(AttachState::Initializing, AttachState::NotInitialized) {
        // Someone else is starting the listener.
        AttachState::Initializing => true,
        AttachState::NotInitialized => {
            if attach.is_init_trigger() {
                true
            } else {
                cell.set(AttachState::NotInitialized);
                false
            }
        }
        AttachState::Initialized => attach.check_socket_file(),
    }
}

fn step(name: &'static str, f: impl FnOnce() -> HookResult) {
    if let Err(e) = guarded(f) {
        tracing::warn!(target: "os::signal", step = name, error = %e, "diagnostic step failed");
    }
}

/// Run a handler, turning a panic into an error
fn guarded(f: impl FnOnce() -> HookResult) -> HookResult {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(format!("panicked: {}", panic_message(payload.as_ref())).into()))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Handle to a running dispatcher thread
///
/// Dropping the handle terminates the thread as [`terminate`](Self::terminate) does.
pub struct SignalThread {
    handle: Option<JoinHandle<()>>,
    channel: Arc<dyn SignalChannel>,
    state: Arc<StateCell>,
}

impl std::fmt::Debug for SignalThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalThread")
            .field("state", &self.state())
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl SignalThread {
    /// Current loop state
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.state.get()
    }

    /// Send the exit sentinel and wait for the thread to finish
    pub fn terminate(mut self) -> SystemResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> SystemResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.channel.notify(EXIT_SIGNAL);
        handle.join().map_err(|_| SystemError::SignalThread {
            reason: "dispatcher thread panicked".into(),
        })
    }
}

impl Drop for SignalThread {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(target: "os::signal", error = %e, "signal dispatcher shutdown failed");
        }
    }
}
