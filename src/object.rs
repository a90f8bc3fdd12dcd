//! Object layout understood by the compactor.
//!
//! Every object starts with a two word header:
//!
//! +--------+---------------------------------------------------------------+
//! | offset | contents                                                      |
//! +--------+---------------------------------------------------------------+
//! | 0      | class reference (0 only allowed for class objects)            |
//! | 8      | [`ObjectBits`]: kind (3 bits), unused (29 bits), length (32)  |
//! +--------+---------------------------------------------------------------+
//!
//! A zero second word never describes a valid object. Walks over allocated blocks stop there.
//!
//! Class objects have a fixed layout:
//!
//! +--------+---------------------------------------------------------------+
//! | 16     | super class reference                                         |
//! | 24     | [`ClassInfo`]: instance size, reference bitmap                |
//! | 32     | static reference                                              |
//! | 40     | reserved                                                      |
//! +--------+---------------------------------------------------------------+
//!
//! Bit `i` of the reference bitmap says that instance word `2 + i` holds a reference.
use modular_bitfield::prelude::*;

use crate::util::align_up;

pub const HEADER_SIZE: usize = 16;
pub const CLASS_OBJECT_SIZE: usize = 48;
pub const CLASS_SUPER_OFFSET: usize = 16;
pub const CLASS_INFO_OFFSET: usize = 24;
pub const CLASS_STATIC_OFFSET: usize = 32;
pub const MAX_INSTANCE_REF_FIELDS: usize = 32;

#[derive(BitfieldSpecifier, Clone, Copy, PartialEq, Eq, Debug)]
#[bits = 3]
pub enum ObjectKind {
    Invalid = 0,
    Instance = 1,
    RefArray = 2,
    PrimArray = 3,
    Class = 4,
}

#[bitfield]
#[repr(u64)]
#[derive(Clone, Copy, Debug)]
pub struct ObjectBits {
    pub kind: ObjectKind,
    #[skip]
    __: B29,
    pub length: B32,
}

#[bitfield]
#[repr(u64)]
#[derive(Clone, Copy, Debug)]
pub struct ClassInfo {
    pub instance_size: B32,
    pub ref_bitmap: B32,
}

#[inline(always)]
pub unsafe fn read_word(addr: usize) -> usize {
    (addr as *const usize).read()
}

#[inline(always)]
pub unsafe fn write_word(addr: usize, value: usize) {
    (addr as *mut usize).write(value)
}

#[inline(always)]
pub unsafe fn class_of(obj: usize) -> usize {
    read_word(obj)
}

#[inline(always)]
pub unsafe fn object_bits(obj: usize) -> ObjectBits {
    ObjectBits::from(read_word(obj + 8) as u64)
}

#[inline]
pub unsafe fn kind_of(obj: usize) -> ObjectKind {
    object_bits(obj)
        .kind_or_err()
        .unwrap_or(ObjectKind::Invalid)
}

/// Returns true if `obj` carries a header that describes an object.
#[inline]
pub unsafe fn is_object_start(obj: usize) -> bool {
    read_word(obj + 8) != 0 && kind_of(obj) != ObjectKind::Invalid
}

#[inline]
pub unsafe fn class_info(class: usize) -> ClassInfo {
    ClassInfo::from(read_word(class + CLASS_INFO_OFFSET) as u64)
}

pub unsafe fn init_header(obj: usize, class: usize, kind: ObjectKind, length: u32) {
    let bits = ObjectBits::new().with_kind(kind).with_length(length);
    write_word(obj, class);
    write_word(obj + 8, u64::from(bits) as usize);
}

/// Writes a class object header and layout. All reference slots start out null.
pub unsafe fn init_class(
    obj: usize,
    metaclass: usize,
    super_class: usize,
    instance_size: usize,
    ref_bitmap: u32,
) {
    init_header(obj, metaclass, ObjectKind::Class, 0);
    write_word(obj + CLASS_SUPER_OFFSET, super_class);
    let info = ClassInfo::new()
        .with_instance_size(instance_size as u32)
        .with_ref_bitmap(ref_bitmap);
    write_word(obj + CLASS_INFO_OFFSET, u64::from(info) as usize);
    write_word(obj + CLASS_STATIC_OFFSET, 0);
    write_word(obj + 40, 0);
}

#[inline]
pub const fn ref_array_size(length: usize) -> usize {
    HEADER_SIZE + length * 8
}

#[inline]
pub const fn prim_array_size(length: usize) -> usize {
    HEADER_SIZE + align_up(length, 8)
}

/// Size of the object whose header lives at `obj`. `class_source` maps a class reference to
/// the address its layout should be read from.
#[inline]
pub unsafe fn size_of_object(obj: usize, class_source: impl Fn(usize) -> usize) -> usize {
    let bits = object_bits(obj);
    match bits.kind_or_err().unwrap_or(ObjectKind::Invalid) {
        ObjectKind::Instance => {
            class_info(class_source(class_of(obj))).instance_size() as usize
        }
        ObjectKind::RefArray => ref_array_size(bits.length() as usize),
        ObjectKind::PrimArray => prim_array_size(bits.length() as usize),
        ObjectKind::Class => CLASS_OBJECT_SIZE,
        ObjectKind::Invalid => 0,
    }
}

/// Computes the size of the object described at `layout` and then calls `visitor` with the
/// offset of every reference slot that lies within `[begin, end)`. `end == usize::MAX` means the
/// whole object.
///
/// The header at `layout` must stay readable for the whole call, the slots themselves are never
/// touched here. The returned size is computed before any slot is visited, so the visitor may
/// rewrite the slots of the object at `layout` including its class word.
pub unsafe fn visit_reference_offsets(
    layout: usize,
    class_source: impl Fn(usize) -> usize,
    begin: usize,
    end: usize,
    mut visitor: impl FnMut(usize),
) -> usize {
    let bits = object_bits(layout);
    let kind = bits.kind_or_err().unwrap_or(ObjectKind::Invalid);
    let class = class_of(layout);
    let size = match kind {
        ObjectKind::Instance => class_info(class_source(class)).instance_size() as usize,
        ObjectKind::RefArray => ref_array_size(bits.length() as usize),
        ObjectKind::PrimArray => prim_array_size(bits.length() as usize),
        ObjectKind::Class => CLASS_OBJECT_SIZE,
        ObjectKind::Invalid => return 0,
    };
    let end = end.min(size);
    let mut visit = |offset: usize| {
        if offset >= begin && offset < end {
            visitor(offset);
        }
    };
    visit(0);
    match kind {
        ObjectKind::Instance => {
            let mut bitmap = class_info(class_source(class)).ref_bitmap();
            while bitmap != 0 {
                let field = bitmap.trailing_zeros() as usize;
                let offset = HEADER_SIZE + field * 8;
                if offset + 8 <= size {
                    visit(offset);
                }
                bitmap ^= 1 << field;
            }
        }
        ObjectKind::RefArray => {
            let mut offset = align_up(begin.max(HEADER_SIZE), 8);
            while offset < end {
                visit(offset);
                offset += 8;
            }
        }
        ObjectKind::Class => {
            visit(CLASS_SUPER_OFFSET);
            visit(CLASS_STATIC_OFFSET);
        }
        ObjectKind::PrimArray | ObjectKind::Invalid => {}
    }
    size
}

/// Identity mapping for callers that read classes where they currently live.
#[inline(always)]
pub fn in_place(class: usize) -> usize {
    class
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> Vec<usize> {
        vec![0usize; n]
    }

    #[test]
    fn instance_layout_comes_from_class() {
        let mut mem = words(16);
        let base = mem.as_mut_ptr() as usize;
        let class = base;
        let obj = base + CLASS_OBJECT_SIZE;
        unsafe {
            // Two fields, the second one a reference.
            init_class(class, 0, 0, HEADER_SIZE + 16, 0b10);
            init_header(obj, class, ObjectKind::Instance, 0);
            assert_eq!(size_of_object(obj, in_place), 32);
            let mut offsets = vec![];
            let size = visit_reference_offsets(obj, in_place, 0, usize::MAX, |o| offsets.push(o));
            assert_eq!(size, 32);
            assert_eq!(offsets, vec![0, 24]);
        }
    }

    #[test]
    fn array_slots_are_clipped_to_window() {
        let mut mem = words(32);
        let obj = mem.as_mut_ptr() as usize;
        unsafe {
            init_header(obj, 0, ObjectKind::RefArray, 10);
            assert_eq!(size_of_object(obj, in_place), 16 + 80);
            let mut offsets = vec![];
            visit_reference_offsets(obj, in_place, 40, 64, |o| offsets.push(o));
            assert_eq!(offsets, vec![40, 48, 56]);

            init_header(obj, 0, ObjectKind::PrimArray, 13);
            assert_eq!(size_of_object(obj, in_place), 32);
        }
    }

    #[test]
    fn class_objects_expose_super_and_static() {
        let mut mem = words(6);
        let obj = mem.as_mut_ptr() as usize;
        unsafe {
            init_class(obj, 0, 0, HEADER_SIZE, 0);
            let mut offsets = vec![];
            visit_reference_offsets(obj, in_place, 0, usize::MAX, |o| offsets.push(o));
            assert_eq!(offsets, vec![0, CLASS_SUPER_OFFSET, CLASS_STATIC_OFFSET]);
            assert!(is_object_start(obj));
        }
        assert!(unsafe { !is_object_start(words(2).as_ptr() as usize) });
    }
}
