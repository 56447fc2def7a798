//! Per-thread countdown timers driven by the tick interrupt.

use alloc::vec::Vec;

use crate::state::KernelState;
use crate::suspend::WakeReason;
use crate::trace::{records::isr, Payload};

#[derive(Debug, Clone, Copy)]
struct Armed {
    thread: u32,
    remaining: u32,
}

/// Armed countdowns, in arming order.
///
/// Each tick decrements every armed countdown; expired entries are returned
/// in the order they were armed so simultaneous timeouts resolve FIFO.
#[derive(Debug, Default)]
pub(crate) struct TimerWheel {
    armed: Vec<Armed>,
}

impl TimerWheel {
    pub fn arm(&mut self, thread: u32, ticks: u32) {
        self.disarm(thread);
        self.armed.push(Armed {
            thread,
            remaining: ticks.max(1),
        });
    }

    pub fn disarm(&mut self, thread: u32) -> bool {
        let before = self.armed.len();
        self.armed.retain(|armed| armed.thread != thread);
        before != self.armed.len()
    }

    #[cfg(test)]
    pub fn remaining(&self, thread: u32) -> Option<u32> {
        self.armed
            .iter()
            .find(|armed| armed.thread == thread)
            .map(|armed| armed.remaining)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Advances one tick and returns the threads whose countdown expired.
    pub fn poll(&mut self) -> Vec<u32> {
        let mut expired = Vec::new();
        self.armed.retain_mut(|armed| {
            armed.remaining -= 1;
            if armed.remaining == 0 {
                expired.push(armed.thread);
                false
            } else {
                true
            }
        });
        expired
    }
}

impl KernelState {
    /// Tick processing: timeouts first, then the time slice of every running
    /// thread.
    pub(crate) fn process_tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let tick = self.tick;
        self.trace(isr::TICK, Payload::new().u64(tick));

        for thread in self.timers.poll() {
            if self.threads.is_live(thread) {
                self.wait_cleanup(thread, WakeReason::Timeout);
            }
        }

        self.time_slice();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_follows_arming_order() {
        let mut wheel = TimerWheel::default();
        wheel.arm(4, 2);
        wheel.arm(1, 1);
        wheel.arm(9, 2);

        assert_eq!(wheel.poll(), vec![1]);
        assert_eq!(wheel.poll(), vec![4, 9]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn rearming_replaces_countdown() {
        let mut wheel = TimerWheel::default();
        wheel.arm(2, 5);
        wheel.arm(2, 1);
        assert_eq!(wheel.remaining(2), Some(1));
        assert!(wheel.disarm(2));
        assert!(!wheel.disarm(2));
        assert!(wheel.poll().is_empty());
    }
}
