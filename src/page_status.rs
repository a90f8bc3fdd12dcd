//! Per-page state shared by the collector thread, fault workers and mutators.
use std::sync::atomic::{AtomicU32, Ordering};

use modular_bitfield::prelude::*;

/// Page states in the only order a page may move through them within a cycle.
#[derive(BitfieldSpecifier, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[bits = 8]
pub enum PageState {
    /// Nobody has started producing the page.
    Unprocessed = 0,
    /// The collector thread (or a worker) is producing the page.
    Processing = 1,
    /// A faulting mutator is producing the page.
    MutatorProcessing = 2,
    /// The page is being produced and whoever finishes it also installs it.
    ProcessingAndMapping = 3,
    /// Contents are ready in a buffer but not installed.
    Processed = 4,
    ProcessedAndMapping = 5,
    /// Installed; any thread may read the page.
    ProcessedAndMapped = 6,
}

impl PageState {
    #[inline]
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            PageState::Processing
                | PageState::MutatorProcessing
                | PageState::ProcessingAndMapping
                | PageState::ProcessedAndMapping
        )
    }
}

/// A page state plus, in copy mode, the from-space page holding the finished contents.
#[bitfield]
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub struct PageStatusWord {
    pub state: PageState,
    pub from_space_page: B24,
}

impl PageStatusWord {
    #[inline]
    pub fn of(state: PageState) -> Self {
        PageStatusWord::new().with_state(state)
    }

    #[inline]
    pub fn staged(state: PageState, from_space_page: usize) -> Self {
        PageStatusWord::new()
            .with_state(state)
            .with_from_space_page(from_space_page as u32)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        u32::from(self)
    }
}

#[inline]
fn decode(raw: u32) -> PageStatusWord {
    PageStatusWord::from(raw)
}

/// State of every page of a registered range.
pub struct PageStatusArray {
    words: Box<[AtomicU32]>,
}

impl PageStatusArray {
    pub fn new(len: usize) -> Self {
        Self {
            words: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[inline]
    pub fn load(&self, idx: usize, order: Ordering) -> PageStatusWord {
        decode(self.words[idx].load(order))
    }

    #[inline]
    pub fn state(&self, idx: usize, order: Ordering) -> PageState {
        self.load(idx, order).state()
    }

    #[inline]
    pub fn store(&self, idx: usize, word: PageStatusWord, order: Ordering) {
        self.words[idx].store(word.raw(), order);
    }

    #[inline]
    pub fn store_state(&self, idx: usize, state: PageState, order: Ordering) {
        self.store(idx, PageStatusWord::of(state), order);
    }

    /// Strong compare-and-swap on the whole word. On failure the observed word is returned.
    #[inline]
    pub fn compare_exchange(
        &self,
        idx: usize,
        current: PageStatusWord,
        new: PageStatusWord,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), PageStatusWord> {
        self.words[idx]
            .compare_exchange(current.raw(), new.raw(), success, failure)
            .map(|_| ())
            .map_err(decode)
    }

    /// Same as [`PageStatusArray::compare_exchange`] with plain states.
    #[inline]
    pub fn transition(
        &self,
        idx: usize,
        from: PageState,
        to: PageState,
        success: Ordering,
    ) -> Result<(), PageStatusWord> {
        self.compare_exchange(
            idx,
            PageStatusWord::of(from),
            PageStatusWord::of(to),
            success,
            Ordering::Acquire,
        )
    }

    /// Resets every page to `Unprocessed`. Only valid while nobody else looks at the array.
    pub fn reset(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(PageState::Unprocessed < PageState::MutatorProcessing);
        assert!(PageState::Processed < PageState::ProcessedAndMapped);
        assert!(PageState::ProcessingAndMapping.is_in_progress());
        assert!(!PageState::Processed.is_in_progress());
    }

    #[test]
    fn staged_words_keep_source_page() {
        let array = PageStatusArray::new(4);
        array.store(2, PageStatusWord::staged(PageState::Processed, 77), Ordering::Release);
        let word = array.load(2, Ordering::Acquire);
        assert_eq!(word.state(), PageState::Processed);
        assert_eq!(word.from_space_page(), 77);
        // A plain state CAS fails against a staged word.
        let observed = array
            .transition(2, PageState::Processed, PageState::ProcessedAndMapping, Ordering::AcqRel)
            .unwrap_err();
        assert_eq!(observed.from_space_page(), 77);
        array
            .compare_exchange(
                2,
                word,
                PageStatusWord::of(PageState::ProcessedAndMapping),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap();
        assert_eq!(array.state(2, Ordering::Relaxed), PageState::ProcessedAndMapping);
        assert_eq!(array.state(0, Ordering::Relaxed), PageState::Unprocessed);
    }
}
