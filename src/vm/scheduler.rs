use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Simulated-time event queue. Devices schedule work for a unit after a
/// delay instead of running it in the background; the host loop advances
/// time and gets back the units that became due, in due order.
pub struct EventQueue {
    now: u64,
    seq: u64,
    pending: BinaryHeap<Reverse<(u64, u64, usize)>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            now: 0,
            seq: 0,
            pending: BinaryHeap::new(),
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Schedule `unit` to fire `delay` ticks from now. A unit is scheduled
    /// at most once; re-activating an active unit is ignored.
    pub fn activate(&mut self, unit: usize, delay: u64) {
        if self.is_active(unit) {
            return;
        }
        self.seq += 1;
        self.pending.push(Reverse((self.now + delay, self.seq, unit)));
    }

    pub fn cancel(&mut self, unit: usize) {
        self.pending.retain(|Reverse((_, _, u))| *u != unit);
    }

    pub fn is_active(&self, unit: usize) -> bool {
        self.pending.iter().any(|Reverse((_, _, u))| *u == unit)
    }

    /// Ticks left before `unit` fires.
    pub fn remaining(&self, unit: usize) -> Option<u64> {
        self.pending
            .iter()
            .filter(|Reverse((_, _, u))| *u == unit)
            .map(|Reverse((at, _, _))| at.saturating_sub(self.now))
            .min()
    }

    /// Advance simulated time by `ticks`.
    pub fn advance(&mut self, ticks: u64) {
        self.now += ticks;
    }

    /// Pop the next unit whose time has come.
    pub fn next_due(&mut self) -> Option<usize> {
        match self.pending.peek() {
            Some(Reverse((at, _, _))) if *at <= self.now => {
                self.pending.pop().map(|Reverse((_, _, unit))| unit)
            }
            _ => None,
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fire_in_due_order() {
        let mut q = EventQueue::new();
        q.activate(3, 10);
        q.activate(1, 5);
        q.activate(2, 5);
        q.advance(4);
        assert_eq!(q.next_due(), None);
        q.advance(6);
        assert_eq!(q.next_due(), Some(1));
        assert_eq!(q.next_due(), Some(2));
        assert_eq!(q.next_due(), Some(3));
        assert_eq!(q.next_due(), None);
    }

    #[test]
    fn cancel_and_reactivate() {
        let mut q = EventQueue::new();
        q.activate(0, 10);
        q.activate(0, 1);
        assert_eq!(q.remaining(0), Some(10));
        q.cancel(0);
        assert!(!q.is_active(0));
        q.activate(0, 2);
        q.advance(2);
        assert_eq!(q.next_due(), Some(0));
    }
}
