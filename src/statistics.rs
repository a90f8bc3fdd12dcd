use std::time::Duration;

use crate::{cycle::CompactionMode, util::formatted_size};

/// What one collection did. Returned by [`Heap::collect`](crate::heap::Heap::collect).
#[derive(Clone, Debug)]
pub struct CompactionStatistics {
    pub cycle: usize,
    pub mode: CompactionMode,
    pub use_sigbus: bool,
    pub fault_workers: usize,
    pub objects_marked: usize,
    pub bytes_marked: usize,
    pub moving_space_before: usize,
    pub moving_space_after: usize,
    /// Bytes allocated between the marking pause and the compaction pause.
    pub black_allocated: usize,
    pub pages_compacted: usize,
    pub pages_compacted_by_gc: usize,
    pub pages_compacted_by_mutators: usize,
    pub zero_pages: usize,
    pub linear_alloc_pages: usize,
    pub from_space_released: usize,
    pub deferred_classes: usize,
    pub marking_pause: Duration,
    pub compaction_pause: Duration,
    pub total: Duration,
}

impl Default for CompactionStatistics {
    fn default() -> Self {
        Self {
            cycle: 0,
            mode: CompactionMode::Fallback,
            use_sigbus: false,
            fault_workers: 0,
            objects_marked: 0,
            bytes_marked: 0,
            moving_space_before: 0,
            moving_space_after: 0,
            black_allocated: 0,
            pages_compacted: 0,
            pages_compacted_by_gc: 0,
            pages_compacted_by_mutators: 0,
            zero_pages: 0,
            linear_alloc_pages: 0,
            from_space_released: 0,
            deferred_classes: 0,
            marking_pause: Duration::default(),
            compaction_pause: Duration::default(),
            total: Duration::default(),
        }
    }
}

impl CompactionStatistics {
    pub fn bytes_freed(&self) -> usize {
        (self.moving_space_before + self.black_allocated).saturating_sub(self.moving_space_after)
    }
}

impl std::fmt::Display for CompactionStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let faults = if !self.mode.is_concurrent() {
            "none".to_string()
        } else if self.use_sigbus {
            "SIGBUS".to_string()
        } else {
            format!("{} workers", self.fault_workers)
        };
        writeln!(f, "Compaction cycle #{} ({:?} mode, faults: {}):", self.cycle, self.mode, faults)?;
        writeln!(
            f,
            "  Marked: {} objects, {}",
            self.objects_marked,
            formatted_size(self.bytes_marked)
        )?;
        writeln!(
            f,
            "  Moving space: {} -> {} ({} allocated black)",
            formatted_size(self.moving_space_before),
            formatted_size(self.moving_space_after),
            formatted_size(self.black_allocated)
        )?;
        writeln!(
            f,
            "  Pages: {} total, {} by collector, {} by mutators, {} zero",
            self.pages_compacted,
            self.pages_compacted_by_gc,
            self.pages_compacted_by_mutators,
            self.zero_pages
        )?;
        writeln!(f, "  Linear-alloc pages updated: {}", self.linear_alloc_pages)?;
        writeln!(
            f,
            "  From-space released early: {} ({} classes deferred)",
            formatted_size(self.from_space_released),
            self.deferred_classes
        )?;
        write!(
            f,
            "  Pauses: marking {:.3}ms, compaction {:.3}ms, total {:.3}ms",
            self.marking_pause.as_secs_f64() * 1000.0,
            self.compaction_pause.as_secs_f64() * 1000.0,
            self.total.as_secs_f64() * 1000.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_mode_and_sizes() {
        let stats = CompactionStatistics {
            cycle: 3,
            mode: CompactionMode::Copy,
            fault_workers: 2,
            bytes_marked: 3 * 1024 * 1024,
            moving_space_before: 8 * 1024 * 1024,
            moving_space_after: 3 * 1024 * 1024,
            ..Default::default()
        };
        let text = stats.to_string();
        assert!(text.starts_with("Compaction cycle #3 (Copy mode, faults: 2 workers):"));
        assert!(text.contains("Moving space: 8.0M -> 3.0M"));
        assert_eq!(stats.bytes_freed(), 5 * 1024 * 1024);
    }
}
