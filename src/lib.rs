//! A concurrent mark-compact collector that compacts with help from userfaultfd.
//!
//! Marking happens in a pause. Compaction runs concurrently with mutators: the moving space is
//! moved out of the way in a second pause and registered for page faults, so that every page a
//! mutator touches is produced on demand, either by fault worker threads or directly in the
//! faulting thread's SIGBUS handler. Kernels without userfaultfd fall back to compacting inside
//! the pause.
//!
//! ```no_run
//! use cmc::{Config, Heap};
//!
//! let heap = Heap::new(Config::default()).unwrap();
//! let mutator = heap.attach_mutator();
//! {
//!     let scope = mutator.enter();
//!     let class = scope.alloc_class(0, 32, 0b1).unwrap();
//!     let obj = scope.alloc_instance(class).unwrap();
//!     scope.new_root(obj);
//! }
//! let stats = heap.collect().unwrap();
//! println!("{}", stats);
//! ```

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

pub mod accounting;
pub mod collector;
pub mod compact;
pub mod cycle;
pub mod error;
pub mod globals;
pub mod heap;
pub mod kernel;
pub mod linear_alloc;
pub mod marking;
pub mod object;
pub mod page_status;
pub mod reclaim;
pub mod scheduler;
pub mod space;
pub mod statistics;
pub mod translate;
pub mod util;

#[cfg(test)]
mod tests;

pub use collector::{GcPhase, MarkCompact, MutatorRoots};
pub use cycle::CompactionMode;
pub use error::{Error, Result};
pub use heap::{Heap, Mutator, MutatorScope, Root};
pub use kernel::{Capabilities, Kernel};
pub use statistics::CompactionStatistics;

/// How faults on the moving space are resolved during the compaction phase.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultStrategy {
    /// SIGBUS when the kernel supports it, fault workers otherwise.
    Auto,
    /// The given number of fault worker threads.
    Workers(usize),
    Sigbus,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UffdPolicy {
    /// Concurrent compaction whenever the kernel supports it.
    Auto,
    /// Always compact inside the pause.
    Disabled,
}

/// Configuration for heap constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the moving space. Rounded up to the page size.
    pub moving_space_capacity: usize,
    pub non_moving_space_capacity: usize,
    /// Capacity of the pool linear-alloc arenas come from.
    pub linear_alloc_capacity: usize,
    /// Preferred size of a thread local allocation buffer
    pub tlab_size: usize,
    pub fault_strategy: FaultStrategy,
    pub uffd: UffdPolicy,
    /// Smallest from-space range released before the compaction phase ends.
    pub min_from_space_release_size: usize,
    /// Enables verbose logging of every cycle
    pub verbose: bool,
    /// Check heap consistency after every cycle
    pub verify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            moving_space_capacity: 64 * 1024 * 1024,
            non_moving_space_capacity: 16 * 1024 * 1024,
            linear_alloc_capacity: 16 * 1024 * 1024,
            tlab_size: 32 * 1024,
            fault_strategy: FaultStrategy::Auto,
            uffd: UffdPolicy::Auto,
            min_from_space_release_size: globals::MIN_FROM_SPACE_MADVISE_SIZE,
            verbose: false,
            verify: false,
        }
    }
}
