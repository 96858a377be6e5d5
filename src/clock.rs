//! Deterministic time for replicated services.
//!
//! Service code must never read host time: the clock advances with the
//! wall-time stamp the leader assigned to each replicated command, so every
//! replica observes the same readings at the same log positions. The
//! scheduler runs service timers against that clock, on the apply thread,
//! strictly between command applications.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Clock driven by leader-stamped command timestamps, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedClock {
    now: u64,
}

impl ReplicatedClock {
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Advances to `timestamp` if it is ahead; the reading never moves
    /// backwards.
    pub fn advance(&mut self, timestamp: u64) {
        if timestamp > self.now {
            self.now = timestamp;
        }
    }
}

/// Timer scheduler for replicated services.
///
/// Timers are identified by `(service, id)`; scheduling an existing id
/// replaces the old deadline, and cancelling an absent timer is a no-op.
/// `due` drains fired timers in deadline order, ties broken by service name
/// and id, so every replica fires them identically.
#[derive(Debug, Default)]
pub struct Scheduler {
    ordered: BTreeSet<(u64, String, u64)>,
    deadlines: HashMap<(String, u64), u64>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    /// Schedules a timer at an absolute replicated timestamp.
    pub fn schedule_at(&mut self, service: &str, id: u64, fire_at: u64) {
        self.cancel(service, id);
        self.ordered.insert((fire_at, service.to_string(), id));
        self.deadlines.insert((service.to_string(), id), fire_at);
    }

    /// Schedules a timer `delay` milliseconds past `now`.
    pub fn schedule_after(&mut self, service: &str, id: u64, delay: u64, now: u64) {
        self.schedule_at(service, id, now + delay);
    }

    /// Cancels a timer; a cancelled timer never fires.
    pub fn cancel(&mut self, service: &str, id: u64) {
        if let Some(fire_at) = self.deadlines.remove(&(service.to_string(), id)) {
            self.ordered.remove(&(fire_at, service.to_string(), id));
        }
    }

    /// Removes and returns every timer due at `now`, in fire order.
    pub fn due(&mut self, now: u64) -> Vec<(String, u64)> {
        let mut fired = Vec::new();
        while let Some(first) = self.ordered.iter().next().cloned() {
            if first.0 > now {
                break;
            }
            self.ordered.remove(&first);
            let (_, service, id) = first;
            self.deadlines.remove(&(service.clone(), id));
            fired.push((service, id));
        }
        fired
    }

    /// Drops every outstanding timer. Used before rebuilding the timer set
    /// from restored state.
    pub fn clear(&mut self) {
        self.ordered.clear();
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
