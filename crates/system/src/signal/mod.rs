//! Signal dispatch and the diagnostic thread
//!
//! OS signals that the runtime handles in managed code are not acted on in
//! the handler. The handler only records them in a [`SignalChannel`]; a
//! dedicated "Signal Dispatcher" thread waits on the channel and runs the
//! real work on an ordinary thread:
//!
//! ```text
//!            ┌──────────┐  wait() returns sig   ┌─────────────┐
//!   start ──▶│ Waiting  │──────────────────────▶│ Dispatching │
//!            └──────────┘◀──────────────────────└─────────────┘
//!                 │              handler done
//!                 │ EXIT_SIGNAL
//!                 ▼
//!            ┌────────────┐
//!            │ Terminated │
//!            └────────────┘
//! ```
//!
//! [`BREAK_SIGNAL`] runs the diagnostic sequence (attach negotiation, thread
//! dump, deadlock scan, heap summary, optional histogram and data dump).
//! Every other signal is handed to a [`SignalUpcall`].

mod attach;
mod channel;
mod dispatcher;

pub use attach::{AttachMechanism, AttachState, AttachStateCell};
pub use channel::{PendingSignals, SignalChannel, global_signals, install_forwarding};
pub use dispatcher::{
    DiagnosticHooks, DispatcherState, HookResult, SignalDispatcher, SignalThread, SignalUpcall,
};

/// Sentinel that ends the dispatcher loop; never a real signal number
pub const EXIT_SIGNAL: i32 = 65;

/// Signal that requests the diagnostic dump
pub const BREAK_SIGNAL: i32 = libc::SIGQUIT;

/// Number of slots a channel tracks (`0..=EXIT_SIGNAL`)
pub const SIGNAL_SLOTS: usize = EXIT_SIGNAL as usize + 1;

/// Flags that shape the dispatcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SignalConfig {
    /// Do not start a dispatcher thread at all
    pub reduce_signal_usage: bool,
    /// Skip attach negotiation on the break signal
    pub disable_attach_mechanism: bool,
    /// Include a class histogram in the break dump
    pub print_class_histogram: bool,
    /// Include lock ownership in the thread dump
    pub print_concurrent_locks: bool,
}
