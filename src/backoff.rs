//! Bounded wait used while another worker publishes a bucket.
//!
//! A prober that finds a bucket in the `CLAIMED` state has to wait for the
//! owner's `READY` store. The owner only performs a handful of plain stores
//! between the two, so the wait is short, but a general-purpose scheduler
//! may preempt the owner in between. We spin briefly, then yield, and give
//! up after `limit` rounds so the caller can report a contention timeout
//! instead of hanging.

/// Rounds spent in `spin_loop` before falling back to `yield_now`.
const SPIN_ROUNDS: u32 = 64;

/// Wait budget used when the caller does not supply one.
pub const DEFAULT_SPIN_LIMIT: u32 = 1 << 20;

pub struct Backoff {
    rounds: u32,
    limit: u32,
}

impl Backoff {
    pub fn new(limit: u32) -> Self {
        Self { rounds: 0, limit }
    }

    /// Waits one round. Returns `false` once the budget is exhausted.
    #[inline]
    pub fn snooze(&mut self) -> bool {
        if self.rounds >= self.limit {
            return false;
        }
        if self.rounds < SPIN_ROUNDS {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
        self.rounds += 1;
        true
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }
}
