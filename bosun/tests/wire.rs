// Copyright (c) 2013-2016 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

use bosun::message::{AllocationStrategy, Builder, BuilderOptions, ReaderOptions, SegmentArray};
use bosun::ptr::{ElementSize, WirePointer};
use bosun::{message, serialize, traverse, ErrorKind};

fn small_segments() -> BuilderOptions {
    BuilderOptions::new()
        .first_segment_words(3)
        .allocation_strategy(AllocationStrategy::FixedSize)
}

#[test]
fn text_round_trip() {
    let mut builder = Builder::new_default();
    let mut root = builder.init_root(0, 1);
    root.set_text(0, "hello").unwrap();

    let bytes = builder.to_bytes();
    // Header (2 words) + root pointer + list pointer + "hello\0" padded.
    // The list payload must contain the NUL terminator on the wire.
    assert!(bytes.windows(6).any(|w| w == b"hello\0"));

    let message = serialize::read_message(&bytes[..], ReaderOptions::new()).unwrap();
    let root = message.get_root_struct().unwrap();
    let text = root.get_text(0).unwrap();
    assert_eq!(text.len(), 5);
    assert_eq!(text.to_str().unwrap(), "hello");
}

#[test]
fn empty_text_and_null_defaults() {
    let mut builder = Builder::new_default();
    let mut root = builder.init_root(0, 2);
    root.set_text(0, "").unwrap();
    let reader = builder.into_reader();
    let root = reader.get_root_struct().unwrap();
    // Explicit empty text.
    assert_eq!(root.get_text(0).unwrap().len(), 0);
    // Null pointer reads as empty text / empty data.
    assert_eq!(root.get_text(1).unwrap().len(), 0);
    assert_eq!(root.get_data(1).unwrap(), &[] as &[u8]);
    // But reading a null pointer as a struct is an error.
    assert_eq!(
        root.get_struct(1).unwrap_err().kind,
        ErrorKind::InvalidPointer
    );
}

#[test]
fn cross_segment_struct_via_far_pointer() {
    let mut builder = Builder::new(small_segments());
    let mut root = builder.init_root(1, 1);
    root.set_u32(0, 7);
    let mut child = root.init_struct(0, 1, 0).unwrap();
    child.set_u32(0, 0xDEAD_BEEF);

    assert!(builder.get_segments_for_output().len() >= 2);

    let bytes = builder.to_bytes();
    let message = serialize::read_message(&bytes[..], ReaderOptions::new()).unwrap();
    let root = message.get_root_struct().unwrap();
    assert_eq!(root.get_u32(0), 7);
    let child = root.get_struct(0).unwrap();
    assert_eq!(child.get_u32(0), 0xDEAD_BEEF);
}

#[test]
fn cross_segment_struct_list_uses_double_far() {
    let mut builder = Builder::new(small_segments());
    let mut root = builder.init_root(1, 1);
    {
        let mut list = root.init_struct_list(0, 2, 1, 0).unwrap();
        list.get_struct_element(0).unwrap().set_u32(0, 100);
        list.get_struct_element(1).unwrap().set_u32(0, 200);
    }

    // The list pointer lives in segment 0 but its content spilled over,
    // so the slot must hold a double-far pointer.
    {
        let segments = builder.get_segments_for_output();
        assert!(segments.len() >= 2);
        let slot = u64::from_le_bytes(segments[0][16..24].try_into().unwrap());
        let ptr = WirePointer(slot);
        assert!(ptr.far_is_double());
    }

    let bytes = builder.to_bytes();
    let message = serialize::read_message(&bytes[..], ReaderOptions::new()).unwrap();
    let root = message.get_root_struct().unwrap();
    let list = root
        .get_list(0, Some(ElementSize::InlineComposite))
        .unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list.get_struct_element(0).unwrap().get_u32(0), 100);
    assert_eq!(list.get_struct_element(1).unwrap().get_u32(0), 200);
}

#[test]
fn root_in_non_zero_segment() {
    let mut builder = Builder::new(small_segments());
    {
        let mut root = builder.init_root_in_segment(2, 1, 0).unwrap();
        root.set_u64(0, 42);
    }
    // Re-rooting into a non-zero segment is rejected.
    assert!(builder.init_root_in_segment(1, 1, 0).is_err());

    let bytes = builder.to_bytes();
    let message = serialize::read_message(&bytes[..], ReaderOptions::new()).unwrap();
    let root = message.get_root_struct().unwrap();
    assert_eq!(root.get_u64(0), 42);
}

#[test]
fn schema_evolution_defaults_and_strict_variants() {
    let mut builder = Builder::new_default();
    let mut root = builder.init_root(1, 1);
    root.set_u32(0, 0xABCD);
    // Writes past the data section are silent no-ops...
    root.set_u64(64, 99);
    // ...unless the strict variant is used.
    assert_eq!(
        root.set_u64_strict(64, 99).unwrap_err().kind,
        ErrorKind::OutOfBounds
    );

    let reader = builder.into_reader();
    let root = reader.get_root_struct().unwrap();
    assert_eq!(root.get_u32(0), 0xABCD);
    // Reads past the data section return the zero default...
    assert_eq!(root.get_u64(64), 0);
    assert_eq!(root.get_u16(100), 0);
    assert!(!root.get_bool(4096));
    // ...and the strict variants signal instead.
    assert_eq!(
        root.get_u64_strict(64).unwrap_err().kind,
        ErrorKind::OutOfBounds
    );
    assert_eq!(
        root.get_bool_strict(4096).unwrap_err().kind,
        ErrorKind::OutOfBounds
    );
    // Pointer indices past the section read as null.
    assert_eq!(root.get_text(30).unwrap().len(), 0);
}

#[test]
fn primitive_lists_round_trip() {
    let mut builder = Builder::new_default();
    {
        let mut root = builder.init_root(0, 3);
        let mut list = root.init_primitive_list::<u32>(0, 3).unwrap();
        list.set(0, 10);
        list.set(1, 20);
        list.set(2, 30);
        let mut shorts = root.init_primitive_list::<u16>(1, 2).unwrap();
        shorts.set_all(&[7, 9]);
    }
    let reader = builder.into_reader();
    let root = reader.get_root_struct().unwrap();
    let list = root.get_primitive_list::<u32>(0).unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list.get(1), 20);
    assert_eq!(list.iter().collect::<Vec<_>>(), vec![10, 20, 30]);
    let shorts = root.get_primitive_list::<u16>(1).unwrap();
    assert_eq!(shorts.try_get(1), Some(9));
    assert_eq!(shorts.try_get(2), None);
}

#[test]
fn bool_list_round_trip() {
    let mut builder = Builder::new_default();
    {
        let root = builder.get_root();
        let mut list = root.init_primitive_list::<bool>(10).unwrap();
        for i in 0..10 {
            list.set(i, i % 3 == 0);
        }
    }
    let reader = builder.into_reader();
    let list = reader.get_root().unwrap().get_primitive_list::<bool>().unwrap();
    for i in 0..10 {
        assert_eq!(list.get(i), i % 3 == 0, "index {i}");
    }
}

#[test]
fn element_size_compatibility_is_checked() {
    let mut builder = Builder::new_default();
    {
        let root = builder.get_root();
        root.init_primitive_list::<u32>(4).unwrap();
    }
    let reader = builder.into_reader();
    let err = reader
        .get_root()
        .unwrap()
        .get_primitive_list::<u64>()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidPointer);
}

#[test]
fn deep_clone_preserves_structure() {
    let mut builder = Builder::new(small_segments());
    {
        let mut root = builder.init_root(1, 3);
        root.set_u64(0, 0x0123_4567_89AB_CDEF);
        root.set_text(0, "cloned").unwrap();
        root.set_data(1, &[1, 2, 3, 4, 5]).unwrap();
        let mut list = root.init_struct_list(2, 2, 1, 1).unwrap();
        for i in 0..2 {
            let mut element = list.get_struct_element(i).unwrap();
            element.set_u32(0, i * 11);
            element.set_text(0, if i == 0 { "zero" } else { "one" }).unwrap();
        }
    }
    let source = builder.into_reader();

    let mut target = Builder::new_default();
    bosun::copy::clone_any_pointer(&source.get_root().unwrap(), target.get_root()).unwrap();

    let reader = target.into_reader();
    let root = reader.get_root_struct().unwrap();
    assert_eq!(root.get_u64(0), 0x0123_4567_89AB_CDEF);
    assert_eq!(root.get_text(0).unwrap(), "cloned");
    assert_eq!(root.get_data(1).unwrap(), &[1, 2, 3, 4, 5]);
    let list = root
        .get_list(2, Some(ElementSize::InlineComposite))
        .unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list.get_struct_element(1).unwrap().get_u32(0), 11);
    assert_eq!(
        list.get_struct_element(1).unwrap().get_text(0).unwrap(),
        "one"
    );
}

#[test]
fn capability_pointer_round_trip() {
    let mut builder = Builder::new_default();
    {
        let mut root = builder.init_root(0, 1);
        root.set_capability(0, 5).unwrap();
    }
    let reader = builder.into_reader();
    let root = reader.get_root_struct().unwrap();
    assert_eq!(root.get_capability(0).unwrap(), 5);
}

#[test]
fn union_discriminant_is_a_u16() {
    let mut builder = Builder::new_default();
    let mut root = builder.init_root(1, 0);
    root.set_union_discriminant(6, 3);
    let reader = builder.into_reader();
    let root = reader.get_root_struct().unwrap();
    assert_eq!(root.get_union_discriminant(6), 3);
    assert_eq!(root.get_u16(6), 3);
}

#[test]
fn traversal_limit_counts_aliased_regions_twice() {
    // A root struct whose two pointer slots target the same 100-word
    // list: 103 words on the wire, 202 words of traversal.
    let mut seg0 = Vec::new();
    seg0.extend_from_slice(&WirePointer::new_struct(0, 0, 2).0.to_le_bytes());
    seg0.extend_from_slice(&WirePointer::new_list(1, ElementSize::EightBytes, 100).0.to_le_bytes());
    seg0.extend_from_slice(&WirePointer::new_list(0, ElementSize::EightBytes, 100).0.to_le_bytes());
    seg0.extend_from_slice(&vec![0u8; 100 * 8]);

    let segments: &[&[u8]] = &[&seg0];
    let mut options = ReaderOptions::new();
    options.traversal_limit_in_words(Some(150));
    let message = message::Reader::new(SegmentArray::new(segments), options);
    let err = traverse::validate(&message).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TraversalLimitExceeded);

    let mut options = ReaderOptions::new();
    options.traversal_limit_in_words(Some(250));
    let message = message::Reader::new(SegmentArray::new(segments), options);
    traverse::validate(&message).unwrap();
}

fn nest(mut parent: bosun::layout::StructBuilder<'_>, depth: u32) {
    if depth > 0 {
        let child = parent.init_struct(0, 0, 1).unwrap();
        nest(child, depth - 1);
    }
}

#[test]
fn nesting_limit_is_enforced() {
    let mut builder = Builder::new_default();
    nest(builder.init_root(0, 1), 6);
    let bytes = builder.to_bytes();

    let mut options = ReaderOptions::new();
    options.nesting_limit(4);
    let message = serialize::read_message(&bytes[..], options).unwrap();
    let err = traverse::validate(&message).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NestingLimitExceeded);

    let message = serialize::read_message(&bytes[..], ReaderOptions::new()).unwrap();
    traverse::validate(&message).unwrap();
}

#[test]
fn far_pointer_cycle_hits_depth_limit() {
    // Segment 0's root is a far pointer whose landing pad is itself.
    let seg0 = WirePointer::new_far(false, 0, 0).0.to_le_bytes();
    let segments: &[&[u8]] = &[&seg0[..]];
    let message = message::Reader::new(SegmentArray::new(segments), ReaderOptions::new());
    let err = message.get_root_struct().unwrap_err();
    assert_eq!(err.kind, ErrorKind::PointerDepthLimit);
}

#[test]
fn malformed_inline_composite_is_rejected() {
    // List pointer claims 1 word of content but the tag claims 4 elements
    // of 1 word each.
    let mut seg0 = Vec::new();
    seg0.extend_from_slice(&WirePointer::new_list(0, ElementSize::InlineComposite, 1).0.to_le_bytes());
    seg0.extend_from_slice(&WirePointer::new_composite_tag(4, 1, 0).0.to_le_bytes());
    seg0.extend_from_slice(&[0; 8]);
    let segments: &[&[u8]] = &[&seg0];
    let message = message::Reader::new(SegmentArray::new(segments), ReaderOptions::new());
    let err = message
        .get_root()
        .unwrap()
        .get_list(None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidInlineCompositePointer);
}

#[test]
fn out_of_bounds_offset_is_rejected() {
    // Struct pointer pointing far outside the one-word segment.
    let seg0 = WirePointer::new_struct(100, 1, 0).0.to_le_bytes();
    let segments: &[&[u8]] = &[&seg0];
    let message = message::Reader::new(SegmentArray::new(segments), ReaderOptions::new());
    let err = message.get_root_struct().unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidPointer);
}

#[test]
fn packed_message_round_trip() {
    let mut builder = Builder::new_default();
    let mut root = builder.init_root(16, 0);
    root.set_u8(0, 0);
    let packed = builder.to_packed_bytes();
    // The 16 zero data words compress into a single zero-run: one zero
    // word plus fifteen more.
    assert!(packed
        .windows(2)
        .any(|w| w == [0x00, 0x0F]));

    let unpacked = bosun::serialize_packed::unpack(&packed).unwrap();
    assert_eq!(unpacked, builder.to_bytes());

    let message = bosun::serialize_packed::read_packed_message(&packed[..], ReaderOptions::new()).unwrap();
    let root = message.get_root_struct().unwrap();
    assert_eq!(root.get_u64(0), 0);
    assert_eq!(root.data_words(), 16);
}
