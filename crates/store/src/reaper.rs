//! Staleness reaper scheduling.
//!
//! The discovery loop owns a [`CycleClock`]: `advance` before each scan,
//! `sweep_due` after it, `after_sweep` once the index was swept. The counter
//! wraps back to zero only after two sweep intervals, so any mark left over
//! from the previous lap has been judged by at least one sweep before its
//! cycle id can come round again.

use cfgwatch_core::{Dependent, Generation, ResourceRef};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct CycleClock {
    current: Generation,
    clean_every: Generation,
}

impl CycleClock {
    pub fn new(clean_every: u64) -> Self {
        Self { current: 0, clean_every: clean_every.max(1) }
    }

    pub fn current(&self) -> Generation { self.current }

    pub fn clean_every(&self) -> Generation { self.clean_every }

    /// Start the next discovery cycle and return its id.
    pub fn advance(&mut self) -> Generation {
        self.current = self.current.saturating_add(1);
        self.current
    }

    /// True when the cycle that just finished scanning should be swept.
    pub fn sweep_due(&self) -> bool {
        self.current != 0 && self.current % self.clean_every == 0
    }

    /// Reset the counter once two sweep intervals have elapsed. Returns true on reset.
    pub fn after_sweep(&mut self) -> bool {
        if self.current >= self.clean_every.saturating_mul(2) {
            self.current = 0;
            true
        } else {
            false
        }
    }
}

/// What a sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub cycle: Generation,
    pub removed_configs: Vec<ResourceRef>,
    pub removed_dependents: Vec<(ResourceRef, Dependent)>,
    /// Subscriptions cancelled by this sweep.
    pub released: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool { self.removed_configs.is_empty() && self.removed_dependents.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweeps_at_n_and_2n_then_resets() {
        let mut c = CycleClock::new(3);
        let mut due = Vec::new();
        let mut resets = Vec::new();
        for _ in 0..8 {
            let cycle = c.advance();
            if c.sweep_due() {
                due.push(cycle);
                if c.after_sweep() { resets.push(cycle); }
            }
        }
        // lap 1: 1..6 sweeps at 3 and 6, reset at 6; lap 2 starts at 1 again
        assert_eq!(due, vec![3, 6]);
        assert_eq!(resets, vec![6]);
        assert_eq!(c.current(), 2);
    }

    #[test]
    fn clean_every_one_sweeps_each_cycle() {
        let mut c = CycleClock::new(1);
        assert_eq!(c.advance(), 1);
        assert!(c.sweep_due());
        assert!(!c.after_sweep());
        assert_eq!(c.advance(), 2);
        assert!(c.sweep_due());
        assert!(c.after_sweep());
        assert_eq!(c.advance(), 1);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let mut c = CycleClock::new(0);
        assert_eq!(c.clean_every(), 1);
        assert!(!c.sweep_due());
        c.advance();
        assert!(c.sweep_due());
    }
}
