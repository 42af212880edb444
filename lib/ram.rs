//! Process-wide RAM admission broker.
//!
//! Every block resident in any file's block map holds exactly one grant;
//! releasing the block returns the grant. Admission is a single CAS loop so
//! grants are handed out in arrival order across files with no queueing.

use std::sync::atomic::{AtomicU32, Ordering};

/// Accountant for the global in-RAM block budget.
#[derive(Debug)]
pub struct RamBroker {
    budget: u32,
    outstanding: AtomicU32,
}

impl RamBroker {
    /// Create a broker allowing at most `budget` concurrent grants.
    #[must_use]
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            outstanding: AtomicU32::new(0),
        }
    }

    /// Try to obtain one grant. Returns `false` when the budget is spent;
    /// the caller must then serve the read without caching.
    #[must_use]
    pub fn try_grant(&self) -> bool {
        let mut cur = self.outstanding.load(Ordering::Relaxed);
        loop {
            if cur >= self.budget {
                return false;
            }
            match self.outstanding.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Return one grant.
    pub fn release(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "RAM grant released that was never taken");
    }

    /// Number of grants currently outstanding.
    #[must_use]
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Relaxed)
    }
}
