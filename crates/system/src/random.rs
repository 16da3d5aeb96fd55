//! Park–Miller minimal standard generator
//!
//! `next = 16807 * seed mod (2^31 - 1)`, computed with Carta's
//! factorisation so every intermediate fits in 32 bits. The process-wide
//! seed is a single atomic advanced by a relaxed compare-and-swap loop:
//! concurrent callers each receive a distinct position of the sequence.

use std::sync::atomic::{AtomicU32, Ordering};

const MULTIPLIER: u32 = 16_807;
const MODULUS: u32 = 0x7fff_ffff;

/// Seed used until [`init_random`] is called
pub const DEFAULT_SEED: u32 = 1_234_567;

/// Advance `seed` by one step
#[must_use]
pub const fn next_random(seed: u32) -> u32 {
    // Split the product into 16-bit halves: lo holds the low 31 bits, hi
    // the carry above bit 31, and each overflow folds back in with +1.
    let mut lo = MULTIPLIER * (seed & 0xffff);
    let hi = MULTIPLIER * (seed >> 16);

    lo += (hi & 0x7fff) << 16;
    if lo > MODULUS {
        lo &= MODULUS;
        lo += 1;
    }
    lo += hi >> 15;
    if lo > MODULUS {
        lo &= MODULUS;
        lo += 1;
    }
    lo
}

/// A lock-free shared generator
#[derive(Debug)]
pub struct Random {
    seed: AtomicU32,
}

impl Default for Random {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl Random {
    /// Generator starting at `seed`
    #[must_use]
    pub const fn new(seed: u32) -> Self {
        Self {
            seed: AtomicU32::new(seed),
        }
    }

    /// Reset the seed
    pub fn init(&self, seed: u32) {
        self.seed.store(seed, Ordering::Relaxed);
    }

    /// Current seed without advancing
    #[must_use]
    pub fn seed(&self) -> u32 {
        self.seed.load(Ordering::Relaxed)
    }

    /// Advance the shared seed and return the new value
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> u32 {
        let mut seed = self.seed.load(Ordering::Relaxed);
        loop {
            let next = next_random(seed);
            match self
                .seed
                .compare_exchange_weak(seed, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => seed = current,
            }
        }
    }
}

static GLOBAL: Random = Random::new(DEFAULT_SEED);

/// Next value from the process-wide generator
pub fn random() -> u32 {
    GLOBAL.next()
}

/// Reseed the process-wide generator
pub fn init_random(seed: u32) {
    GLOBAL.init(seed);
}
