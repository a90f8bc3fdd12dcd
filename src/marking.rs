//! Stop-the-world marking. Besides the mark bits, marking of a moving-space object records its
//! live words and live bytes per chunk, which is everything compaction needs to compute new
//! addresses.
use crate::{
    accounting::{chunk_info::ChunkInfoVec, live_words::LiveWordsBitmap},
    globals::OBJECT_ALIGNMENT,
    object::{self, read_word},
    reclaim::ClassAfterObjectMap,
    space::{BumpPointerSpace, NonMovingSpace},
    util::align_up,
};

pub struct MarkingVisitor<'a> {
    worklist: Vec<usize>,
    moving: &'a BumpPointerSpace,
    non_moving: &'a NonMovingSpace,
    live_words: &'a LiveWordsBitmap,
    chunk_info: &'a mut ChunkInfoVec,
    class_after_obj: &'a mut ClassAfterObjectMap,
    bytes_visited: usize,
    objects_marked: usize,
}

impl<'a> MarkingVisitor<'a> {
    /// Marks `obj` and queues it for scanning if it was not marked yet.
    pub fn visit(&mut self, obj: usize) {
        if obj == 0 {
            return;
        }
        let newly_marked = if self.moving.has_address(obj) {
            !self.moving.mark_bitmap().atomic_test_and_set(obj)
        } else if self.non_moving.has_address(obj) {
            !self.non_moving.mark_bitmap().atomic_test_and_set(obj)
        } else {
            crate::gc_fatal!("reference {:#x} points outside the heap", obj)
        };
        if newly_marked {
            self.worklist.push(obj);
        }
    }

    /// Marks the referent of the root stored at `slot`.
    pub fn visit_root_slot(&mut self, slot: usize) {
        let obj = unsafe { read_word(slot) };
        self.visit(obj);
    }

    fn scan(&mut self, obj: usize) {
        let mut refs = Vec::new();
        let size = unsafe {
            object::visit_reference_offsets(obj, object::in_place, 0, usize::MAX, |offset| {
                refs.push(read_word(obj + offset))
            })
        };
        let size = align_up(size, OBJECT_ALIGNMENT);
        if self.moving.has_address(obj) {
            let bit = self.live_words.set_live_words(obj, size);
            self.chunk_info.record_live_object(bit, size);
            self.class_after_obj
                .record(self.moving.region(), obj, unsafe { object::class_of(obj) });
        }
        self.bytes_visited += size;
        self.objects_marked += 1;
        for r in refs {
            self.visit(r);
        }
    }
}

/// Outcome of one marking pause.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct MarkingResult {
    pub bytes_visited: usize,
    pub objects_marked: usize,
}

pub struct SynchronousMarking<'a> {
    visitor: MarkingVisitor<'a>,
}

impl<'a> SynchronousMarking<'a> {
    pub fn new(
        moving: &'a BumpPointerSpace,
        non_moving: &'a NonMovingSpace,
        live_words: &'a LiveWordsBitmap,
        chunk_info: &'a mut ChunkInfoVec,
        class_after_obj: &'a mut ClassAfterObjectMap,
    ) -> Self {
        Self {
            visitor: MarkingVisitor {
                worklist: Vec::new(),
                moving,
                non_moving,
                live_words,
                chunk_info,
                class_after_obj,
                bytes_visited: 0,
                objects_marked: 0,
            },
        }
    }

    /// Lets `roots` feed the visitor, then marks everything transitively reachable.
    pub fn run(mut self, roots: impl FnOnce(&mut MarkingVisitor<'a>)) -> MarkingResult {
        roots(&mut self.visitor);
        while let Some(obj) = self.visitor.worklist.pop() {
            self.visitor.scan(obj);
        }
        MarkingResult {
            bytes_visited: self.visitor.bytes_visited,
            objects_marked: self.visitor.objects_marked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        globals::page_size,
        object::{init_class, init_header, write_word, ObjectKind, HEADER_SIZE},
    };

    #[test]
    fn marks_transitively_and_records_live_words() {
        let moving = BumpPointerSpace::create("marking moving", 16 * page_size()).unwrap();
        let non_moving = NonMovingSpace::create("marking non-moving", 4 * page_size()).unwrap();
        let live_words = LiveWordsBitmap::create(moving.begin(), 16 * page_size()).unwrap();
        let mut chunks = ChunkInfoVec::new(16 * page_size());
        let mut classes = ClassAfterObjectMap::default();

        let arr = moving.alloc(crate::object::ref_array_size(2)).unwrap();
        let dead = moving.alloc(32).unwrap();
        let class = moving.alloc(crate::object::CLASS_OBJECT_SIZE).unwrap();
        let inst = non_moving.alloc(HEADER_SIZE + 8).unwrap();
        unsafe {
            init_header(arr, 0, ObjectKind::RefArray, 2);
            init_header(dead, 0, ObjectKind::PrimArray, 16);
            init_class(class, 0, 0, HEADER_SIZE + 8, 0b1);
            init_header(inst, class, ObjectKind::Instance, 0);
            write_word(arr + HEADER_SIZE, inst);
            write_word(inst + HEADER_SIZE, arr);
        }
        let root = arr;
        let result = SynchronousMarking::new(&moving, &non_moving, &live_words, &mut chunks, &mut classes)
            .run(|visitor| visitor.visit(root));

        assert_eq!(result.objects_marked, 3);
        assert_eq!(result.bytes_visited, 32 + 48 + 24);
        assert!(moving.mark_bitmap().test(arr));
        assert!(moving.mark_bitmap().test(class));
        assert!(!moving.mark_bitmap().test(dead));
        assert!(non_moving.mark_bitmap().test(inst));
        assert!(live_words.test_addr(arr + 24));
        assert!(!live_words.test_addr(dead));
        assert_eq!(chunks.get(0) as usize, 32 + 48);
    }
}
