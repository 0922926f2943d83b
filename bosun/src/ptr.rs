// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
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

//! The pointer word codec.
//!
//! A pointer word is 64 bits, little-endian. The low two bits select the
//! kind; the remaining fields are packed per the Cap'n Proto encoding
//! specification. Signed offsets occupy a 30-bit two's-complement field
//! and must be sign-extended explicitly on decode.

/// The two-bit pointer kind selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerKind {
    Struct,
    List,
    Far,
    Capability,
}

/// Element size codes for list pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementSize {
    Void = 0,
    Bit = 1,
    Byte = 2,
    TwoBytes = 3,
    FourBytes = 4,
    EightBytes = 5,
    Pointer = 6,
    InlineComposite = 7,
}

impl ElementSize {
    pub fn from_raw(raw: u8) -> Self {
        match raw & 7 {
            0 => Self::Void,
            1 => Self::Bit,
            2 => Self::Byte,
            3 => Self::TwoBytes,
            4 => Self::FourBytes,
            5 => Self::EightBytes,
            6 => Self::Pointer,
            _ => Self::InlineComposite,
        }
    }

    /// Distance between consecutive elements, in bits. Inline-composite
    /// lists have a per-message step and must not be asked here.
    pub fn step_bits(self) -> u32 {
        match self {
            Self::Void => 0,
            Self::Bit => 1,
            Self::Byte => 8,
            Self::TwoBytes => 16,
            Self::FourBytes => 32,
            Self::EightBytes | Self::Pointer => 64,
            Self::InlineComposite => panic!("inline composite has no fixed step"),
        }
    }
}

/// Maximum legal element count / word count in a list pointer (29 bits).
pub const MAX_LIST_ELEMENTS: u32 = (1 << 29) - 1;

/// One raw pointer word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WirePointer(pub u64);

const KIND_MASK: u64 = 0b11;
const OFFSET_MASK: u32 = 0x3FFF_FFFF;

impl WirePointer {
    pub const NULL: WirePointer = WirePointer(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn kind(self) -> PointerKind {
        match self.0 & KIND_MASK {
            0 => PointerKind::Struct,
            1 => PointerKind::List,
            2 => PointerKind::Far,
            _ => PointerKind::Capability,
        }
    }

    /// The signed 30-bit offset field of struct and list pointers, in
    /// words, counted from the word immediately following the pointer.
    pub fn offset_words(self) -> i32 {
        let raw = ((self.0 >> 2) as u32) & OFFSET_MASK;
        // Sign-extend from bit 29.
        ((raw << 2) as i32) >> 2
    }

    pub fn struct_data_words(self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub fn struct_ptr_words(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn list_element_size(self) -> ElementSize {
        ElementSize::from_raw((self.0 >> 32) as u8)
    }

    /// For non-composite lists this is the element count; for inline
    /// composite lists it is the word count of the elements, excluding
    /// the tag word.
    pub fn list_element_count(self) -> u32 {
        (self.0 >> 35) as u32 & MAX_LIST_ELEMENTS
    }

    pub fn far_is_double(self) -> bool {
        self.0 & 0b100 != 0
    }

    /// Word offset of the landing pad within the target segment
    /// (unsigned, 29 bits).
    pub fn far_pad_word(self) -> u32 {
        ((self.0 >> 3) as u32) & MAX_LIST_ELEMENTS
    }

    pub fn far_segment(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn cap_index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Element count carried in the offset field of an inline-composite
    /// tag word (unsigned).
    pub fn tag_element_count(self) -> u32 {
        ((self.0 >> 2) as u32) & OFFSET_MASK
    }

    pub fn new_struct(offset: i32, data_words: u16, ptr_words: u16) -> Self {
        Self(
            ((offset as u32 & OFFSET_MASK) as u64) << 2
                | (data_words as u64) << 32
                | (ptr_words as u64) << 48,
        )
    }

    pub fn new_list(offset: i32, element_size: ElementSize, count_or_words: u32) -> Self {
        Self(
            1 | ((offset as u32 & OFFSET_MASK) as u64) << 2
                | (element_size as u64) << 32
                | (count_or_words as u64 & MAX_LIST_ELEMENTS as u64) << 35,
        )
    }

    pub fn new_far(double: bool, pad_word: u32, segment: u32) -> Self {
        Self(
            2 | (double as u64) << 2
                | (pad_word as u64 & MAX_LIST_ELEMENTS as u64) << 3
                | (segment as u64) << 32,
        )
    }

    pub fn new_capability(index: u32) -> Self {
        Self(3 | (index as u64) << 32)
    }

    /// The tag word heading an inline-composite list: struct-shaped, with
    /// the element count in the offset field.
    pub fn new_composite_tag(element_count: u32, data_words: u16, ptr_words: u16) -> Self {
        Self(
            ((element_count & OFFSET_MASK) as u64) << 2
                | (data_words as u64) << 32
                | (ptr_words as u64) << 48,
        )
    }
}
