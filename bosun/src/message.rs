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

//! Untyped root containers for Cap'n Proto messages.

use crate::any_pointer;
use crate::arena::{BuildArena, ReadCtx, ReadLimiter};
use crate::layout::{PointerBuilder, PointerReader, StructBuilder, StructReader};
use crate::ptr::WirePointer;
use crate::{Error, OutputSegments, Result, BYTES_PER_WORD};

/// Options controlling how data is read.
#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    /// Limits how many total (8-byte) words of data are allowed to be
    /// traversed. Traversal is counted every time a pointer is followed,
    /// so aliased regions are counted once per alias. This limit exists
    /// for security reasons: a small message whose pointers all target
    /// the same region would otherwise amplify into an arbitrarily large
    /// traversal.
    ///
    /// `None` means no limit is enforced.
    pub traversal_limit_in_words: Option<u64>,

    /// Limits how deeply nested a message structure can be. Prevents
    /// deeply nested inputs from overflowing the stack of recursive
    /// readers.
    pub nesting_limit: i32,

    /// Maximum number of segments accepted in one message.
    pub segment_limit: u32,
}

pub const DEFAULT_READER_OPTIONS: ReaderOptions = ReaderOptions {
    traversal_limit_in_words: Some(8 * 1024 * 1024),
    nesting_limit: 64,
    segment_limit: 512,
};

impl Default for ReaderOptions {
    fn default() -> Self {
        DEFAULT_READER_OPTIONS
    }
}

impl ReaderOptions {
    pub fn new() -> Self {
        DEFAULT_READER_OPTIONS
    }

    pub fn nesting_limit(&mut self, value: i32) -> &mut Self {
        self.nesting_limit = value;
        self
    }

    pub fn traversal_limit_in_words(&mut self, value: Option<u64>) -> &mut Self {
        self.traversal_limit_in_words = value;
        self
    }

    pub fn segment_limit(&mut self, value: u32) -> &mut Self {
        self.segment_limit = value;
        self
    }
}

/// An object that manages the buffers underlying a message reader.
pub trait ReaderSegments {
    /// Gets the segment with index `idx`, or `None` if `idx` is out of
    /// range. Segment lengths are always a multiple of 8 bytes.
    fn get_segment(&self, idx: u32) -> Option<&[u8]>;

    /// Gets the number of segments.
    fn len(&self) -> usize {
        for i in 0.. {
            if self.get_segment(i as u32).is_none() {
                return i;
            }
        }
        unreachable!()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> ReaderSegments for &S
where
    S: ReaderSegments,
{
    fn get_segment(&self, idx: u32) -> Option<&[u8]> {
        (**self).get_segment(idx)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// An array of borrowed segments.
pub struct SegmentArray<'a> {
    segments: &'a [&'a [u8]],
}

impl<'a> SegmentArray<'a> {
    pub fn new(segments: &'a [&'a [u8]]) -> SegmentArray<'a> {
        SegmentArray { segments }
    }
}

impl<'b> ReaderSegments for SegmentArray<'b> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segments.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

impl<'b> ReaderSegments for [&'b [u8]] {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.len()
    }
}

/// A container used to read a message.
#[derive(Debug)]
pub struct Reader<S>
where
    S: ReaderSegments,
{
    segments: S,
    options: ReaderOptions,
    limiter: ReadLimiter,
}

impl<S> Reader<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        let limiter = ReadLimiter::new(options.traversal_limit_in_words);
        Self {
            segments,
            options,
            limiter,
        }
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    fn check_segment_count(&self) -> Result<()> {
        let count = self.segments.len();
        if count > self.options.segment_limit as usize {
            return Err(Error::segment_limit_exceeded(format!(
                "message has {count} segments; see ReaderOptions::segment_limit"
            )));
        }
        Ok(())
    }

    /// Gets the root pointer of the message. An empty message reads as a
    /// null root.
    pub fn get_root(&self) -> Result<any_pointer::Reader<'_>> {
        self.check_segment_count()?;
        let ctx = ReadCtx::new(&self.segments, &self.limiter);
        let pointer = match self.segments.get_segment(0) {
            Some(seg) if seg.len() >= BYTES_PER_WORD => {
                PointerReader::new(ctx, 0, 0, self.options.nesting_limit)
            }
            _ => PointerReader::absent(ctx, self.options.nesting_limit),
        };
        Ok(any_pointer::Reader::new(pointer))
    }

    /// Gets the root, interpreting it as a struct.
    pub fn get_root_struct(&self) -> Result<StructReader<'_>> {
        self.get_root()?.get_struct()
    }

    pub fn into_segments(self) -> S {
        self.segments
    }
}

/// Options controlling segment allocation for a message under
/// construction.
#[derive(Clone, Copy, Debug)]
pub struct BuilderOptions {
    /// Size of the first segment, in words.
    pub first_segment_words: u32,

    /// How to size segments after the first one.
    pub allocation_strategy: AllocationStrategy,

    /// Maximum number of words in a single segment.
    pub max_segment_words: u32,
}

#[derive(Clone, Copy, Debug)]
pub enum AllocationStrategy {
    /// Allocates the same number of words for each segment, to the extent
    /// possible. This strategy is primarily useful for testing
    /// cross-segment pointers.
    FixedSize,

    /// Increases segment size by a multiplicative factor for each
    /// subsequent segment.
    GrowHeuristically,
}

pub const SUGGESTED_FIRST_SEGMENT_WORDS: u32 = 1024;
pub const SUGGESTED_ALLOCATION_STRATEGY: AllocationStrategy = AllocationStrategy::GrowHeuristically;

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            first_segment_words: SUGGESTED_FIRST_SEGMENT_WORDS,
            allocation_strategy: SUGGESTED_ALLOCATION_STRATEGY,
            max_segment_words: 1 << 29,
        }
    }
}

impl BuilderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size of the initial segment in words, where 1 word = 8 bytes.
    pub fn first_segment_words(mut self, value: u32) -> Self {
        self.first_segment_words = value;
        self
    }

    /// Sets the allocation strategy for segments after the first one.
    pub fn allocation_strategy(mut self, value: AllocationStrategy) -> Self {
        self.allocation_strategy = value;
        self
    }

    pub fn max_segment_words(mut self, value: u32) -> Self {
        self.max_segment_words = value;
        self
    }
}

/// A container used to build a message.
///
/// The first word of segment 0 always holds the root pointer.
pub struct Builder {
    arena: BuildArena,
    root_in_far_segment: bool,
}

impl Builder {
    pub fn new(options: BuilderOptions) -> Self {
        Self {
            arena: BuildArena::new(&options),
            root_in_far_segment: false,
        }
    }

    /// Constructs a builder whose first segment has length
    /// `SUGGESTED_FIRST_SEGMENT_WORDS`.
    pub fn new_default() -> Self {
        Self::new(BuilderOptions::default())
    }

    fn ensure_root(&mut self) {
        self.arena.ensure_segment(0);
        if self.arena.segment_bytes(0).is_empty() {
            self.arena.force_allocate_in(0, 1);
        }
    }

    /// Initializes the root as a struct with the given section sizes.
    pub fn init_root(&mut self, data_words: u16, ptr_words: u16) -> StructBuilder<'_> {
        self.ensure_root();
        PointerBuilder::new(&mut self.arena, 0, 0).init_struct(data_words, ptr_words)
    }

    /// Gets the root as an untyped pointer builder.
    pub fn get_root(&mut self) -> any_pointer::Builder<'_> {
        self.ensure_root();
        any_pointer::Builder::new(PointerBuilder::new(&mut self.arena, 0, 0))
    }

    /// Places the root struct in the given segment, reaching it through a
    /// single-far pointer from segment 0. Placing the root in a non-zero
    /// segment twice is rejected.
    pub fn init_root_in_segment(
        &mut self,
        segment: u32,
        data_words: u16,
        ptr_words: u16,
    ) -> Result<StructBuilder<'_>> {
        if segment == 0 {
            return Ok(self.init_root(data_words, ptr_words));
        }
        if self.root_in_far_segment {
            return Err(Error::failed(
                "the root was already placed in a non-zero segment",
            ));
        }
        self.ensure_root();
        let total = 1 + data_words as u32 + ptr_words as u32;
        let pad = self.arena.force_allocate_in(segment, total);
        let content = pad + 1;
        self.arena.write_word(
            segment,
            pad,
            WirePointer::new_struct(0, data_words, ptr_words).0,
        );
        self.arena
            .write_word(0, 0, WirePointer::new_far(false, pad, segment).0);
        self.root_in_far_segment = true;
        Ok(StructBuilder::from_parts(
            &mut self.arena,
            segment,
            content,
            data_words,
            ptr_words,
        ))
    }

    pub fn get_segments_for_output(&self) -> OutputSegments<'_> {
        let count = self.arena.segment_count();
        if count == 0 {
            let mut out = OutputSegments::new();
            out.push(&[][..]);
            return out;
        }
        (0..count).map(|id| self.arena.segment_bytes(id)).collect()
    }

    /// Consumes the builder, producing a reader over its segments with no
    /// read limits (the data is locally produced and trusted).
    pub fn into_reader(self) -> Reader<Self> {
        Reader::new(
            self,
            ReaderOptions {
                traversal_limit_in_words: None,
                nesting_limit: i32::MAX,
                segment_limit: u32::MAX,
            },
        )
    }

    /// Serializes the message using the standard stream framing.
    pub fn to_bytes(&self) -> Vec<u8> {
        crate::serialize::write_message_to_vec(&self.get_segments_for_output())
    }

    /// Serializes the message using stream framing plus packed encoding.
    pub fn to_packed_bytes(&self) -> Vec<u8> {
        crate::serialize_packed::pack(&self.to_bytes())
    }
}

impl ReaderSegments for Builder {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        if id < self.arena.segment_count() {
            Some(self.arena.segment_bytes(id))
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.arena.segment_count() as usize
    }
}
