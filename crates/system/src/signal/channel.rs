use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::SIGNAL_SLOTS;

/// Blocking signal queue between OS handlers and the dispatcher
pub trait SignalChannel: Send + Sync {
    /// Block until a signal is pending and take it
    fn wait(&self) -> i32;

    /// Mark `sig` pending and wake a waiter
    fn notify(&self, sig: i32);
}

/// Per-signal pending counters
///
/// A signal delivered `n` times is returned by `n` waits. Lower signal
/// numbers are taken first, so [`EXIT_SIGNAL`](super::EXIT_SIGNAL) is only
/// seen once everything else has drained.
///
/// [`notify_from_handler`](Self::notify_from_handler) touches nothing but
/// an atomic counter and is async-signal-safe. Waiters therefore also poll
/// on a short timeout instead of relying solely on the condition variable.
#[derive(Debug)]
pub struct PendingSignals {
    pending: [AtomicU32; SIGNAL_SLOTS],
    lock: Mutex<()>,
    cond: Condvar,
}

const POLL: Duration = Duration::from_millis(50);

impl Default for PendingSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingSignals {
    /// Empty queue
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: [const { AtomicU32::new(0) }; SIGNAL_SLOTS],
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn slot(sig: i32) -> Option<usize> {
        usize::try_from(sig).ok().filter(|&s| s < SIGNAL_SLOTS)
    }

    /// Record `sig` without waking anybody
    pub fn notify_from_handler(&self, sig: i32) {
        if let Some(slot) = Self::slot(sig) {
            self.pending[slot].fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Take the lowest pending signal, if any
    pub fn try_take(&self) -> Option<i32> {
        for (sig, counter) in self.pending.iter().enumerate() {
            let mut n = counter.load(Ordering::Acquire);
            while n > 0 {
                match counter.compare_exchange_weak(n, n - 1, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => return Some(sig as i32),
                    Err(current) => n = current,
                }
            }
        }
        None
    }

    /// Pending count for `sig`
    #[must_use]
    pub fn pending(&self, sig: i32) -> u32 {
        Self::slot(sig).map_or(0, |slot| self.pending[slot].load(Ordering::Acquire))
    }
}

impl SignalChannel for PendingSignals {
    fn wait(&self) -> i32 {
        let mut guard = self.lock.lock();
        loop {
            if let Some(sig) = self.try_take() {
                return sig;
            }
            self.cond.wait_for(&mut guard, POLL);
        }
    }

    fn notify(&self, sig: i32) {
        if Self::slot(sig).is_none() {
            tracing::warn!(target: "os::signal", sig, "signal number out of range, dropped");
            return;
        }
        self.notify_from_handler(sig);
        // Taking the lock orders this wakeup after a waiter's last check.
        drop(self.lock.lock());
        self.cond.notify_one();
    }
}

static SIGNALS: PendingSignals = PendingSignals::new();

/// Process-wide channel fed by [`install_forwarding`]
pub fn global_signals() -> &'static PendingSignals {
    &SIGNALS
}

extern "C" fn forward(sig: libc::c_int) {
    SIGNALS.notify_from_handler(sig);
}

/// Route OS deliveries of `sig` into [`global_signals`]
pub fn install_forwarding(sig: i32) -> io::Result<()> {
    // SAFETY: the sigaction struct is fully initialised before use and the
    // installed handler only performs an atomic increment.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = forward as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&raw mut action.sa_mask);
        if libc::sigaction(sig, &raw const action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    tracing::debug!(target: "os::signal", sig, "signal forwarding installed");
    Ok(())
}
