use std::time::Duration;

use crossbeam_utils::Backoff;

const YIELD_MAX: u32 = 5;

/// Spin-yield-then-sleep wait used whenever a thread has to wait for another party to finish a page.
///
/// The first rounds snooze through [`Backoff`], after that the thread sleeps for a linearly
/// growing amount of time.
pub struct PageBackoff {
    spin: Backoff,
    count: u32,
}

impl PageBackoff {
    pub fn new() -> Self {
        Self {
            spin: Backoff::new(),
            count: 0,
        }
    }

    pub fn wait(&mut self) {
        if self.count <= YIELD_MAX {
            self.spin.snooze();
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(10 * (self.count - YIELD_MAX) as u64));
        }
        self.count += 1;
    }

    pub fn rounds(&self) -> u32 {
        self.count
    }
}

impl Default for PageBackoff {
    fn default() -> Self {
        Self::new()
    }
}
