use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of the attach listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttachState {
    /// No listener running
    NotInitialized = 0,
    /// A listener is being started
    Initializing = 1,
    /// A listener is accepting requests
    Initialized = 2,
}

impl AttachState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Initializing,
            2 => Self::Initialized,
            _ => Self::NotInitialized,
        }
    }
}

/// Atomic holder for [`AttachState`]
#[derive(Debug)]
pub struct AttachStateCell(AtomicU8);

impl Default for AttachStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachStateCell {
    /// Starts as [`AttachState::NotInitialized`]
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(AttachState::NotInitialized as u8))
    }

    /// Current state
    #[must_use]
    pub fn get(&self) -> AttachState {
        AttachState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Unconditionally store `state`
    pub fn set(&self, state: AttachState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move to `new` if the state is `expected`
    ///
    /// Returns the state found, so the caller that sees `expected` back is
    /// the one that won the transition.
    pub fn transit(&self, new: AttachState, expected: AttachState) -> AttachState {
        match self
            .0
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(previous) | Err(previous) => AttachState::from_u8(previous),
        }
    }
}

/// The attach listener as seen by the dispatcher
pub trait AttachMechanism: Send + Sync {
    /// Shared listener state
    fn state(&self) -> &AttachStateCell;

    /// Check for an attach request and start the listener if there is one
    ///
    /// Called after this thread moved the state to `Initializing`. Returns
    /// `true` when the break signal was consumed as an attach request.
    fn is_init_trigger(&self) -> bool;

    /// With the listener running, restart it if its endpoint vanished
    ///
    /// Returns `true` when the break signal was consumed by the restart.
    fn check_socket_file(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn only_one_initializer_wins() {
        let cell = Arc::new(AttachStateCell::new());
        let winners: usize = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    cell.transit(AttachState::Initializing, AttachState::NotInitialized)
                        == AttachState::NotInitialized
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
        assert_eq!(cell.get(), AttachState::Initializing);
    }

    #[test]
    fn failed_transit_reports_current_state() {
        let cell = AttachStateCell::new();
        cell.set(AttachState::Initialized);
        assert_eq!(
            cell.transit(AttachState::Initializing, AttachState::NotInitialized),
            AttachState::Initialized
        );
        assert_eq!(cell.get(), AttachState::Initialized);
    }
}
