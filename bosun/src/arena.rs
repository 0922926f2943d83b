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

//! Segment arenas: word-addressed read access over a message's segments,
//! and the append-mostly allocator backing messages under construction.

use core::cell::Cell;

use crate::message::{AllocationStrategy, BuilderOptions, ReaderSegments};
use crate::{Error, Result, BYTES_PER_WORD};

/// Tracks the traversal budget for one message. Every word of content
/// reached through a pointer is counted once per time it is reached, so a
/// message that aliases the same region through many pointers cannot be
/// amplified past the budget.
#[derive(Debug)]
pub struct ReadLimiter {
    remaining: Cell<Option<u64>>,
}

impl ReadLimiter {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            remaining: Cell::new(limit),
        }
    }

    pub fn can_read(&self, words: u64) -> Result<()> {
        match self.remaining.get() {
            None => Ok(()),
            Some(budget) if budget >= words => {
                self.remaining.set(Some(budget - words));
                Ok(())
            }
            Some(_) => Err(Error::traversal_limit_exceeded(
                "read limit exceeded; see ReaderOptions::traversal_limit_in_words",
            )),
        }
    }
}

/// Shared context threaded through every reader: the message's segments
/// plus its traversal budget.
pub struct ReadCtx<'a> {
    pub(crate) segments: &'a dyn ReaderSegments,
    pub(crate) limiter: &'a ReadLimiter,
}

impl<'a> Clone for ReadCtx<'a> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a> Copy for ReadCtx<'a> {}

impl<'a> core::fmt::Debug for ReadCtx<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReadCtx").finish_non_exhaustive()
    }
}

impl<'a> ReadCtx<'a> {
    pub(crate) fn new(segments: &'a dyn ReaderSegments, limiter: &'a ReadLimiter) -> Self {
        Self { segments, limiter }
    }

    /// The raw bytes of segment `id`, or an error if the message has no
    /// such segment.
    pub(crate) fn segment(&self, id: u32) -> Result<&'a [u8]> {
        self.segments
            .get_segment(id)
            .ok_or_else(|| Error::out_of_bounds(format!("message has no segment {id}")))
    }

    /// Like `segment`, but blames a far pointer for the missing segment.
    pub(crate) fn far_segment(&self, id: u32) -> Result<&'a [u8]> {
        self.segments
            .get_segment(id)
            .ok_or_else(|| Error::invalid_far_pointer(format!("far pointer to segment {id}")))
    }

    pub(crate) fn segment_words(&self, id: u32) -> Result<u32> {
        Ok((self.segment(id)?.len() / BYTES_PER_WORD) as u32)
    }
}

/// Reads the word at word-index `idx` of a segment. Callers must have
/// bounds-checked `idx`.
pub(crate) fn word_at(segment: &[u8], idx: u32) -> u64 {
    let off = idx as usize * BYTES_PER_WORD;
    u64::from_le_bytes(segment[off..off + BYTES_PER_WORD].try_into().unwrap())
}

struct BuildSegment {
    /// `data.len()` is always `words_used * 8`; the vector only grows on
    /// allocation, and allocated words start zeroed.
    data: Vec<u8>,
    capacity_words: u32,
}

impl BuildSegment {
    fn new(capacity_words: u32) -> Self {
        Self {
            data: Vec::with_capacity(capacity_words as usize * BYTES_PER_WORD),
            capacity_words,
        }
    }

    fn words_used(&self) -> u32 {
        (self.data.len() / BYTES_PER_WORD) as u32
    }
}

/// The allocator behind a message under construction: an ordered sequence
/// of owned segments, each a multiple of 8 bytes, each append-only.
pub struct BuildArena {
    segments: Vec<BuildSegment>,
    next_size: u32,
    strategy: AllocationStrategy,
    max_segment_words: u32,
}

impl BuildArena {
    pub fn new(options: &BuilderOptions) -> Self {
        Self {
            segments: Vec::new(),
            next_size: options.first_segment_words,
            strategy: options.allocation_strategy,
            max_segment_words: options.max_segment_words,
        }
    }

    pub fn segment_count(&self) -> u32 {
        self.segments.len() as u32
    }

    pub fn segment_bytes(&self, id: u32) -> &[u8] {
        &self.segments[id as usize].data
    }

    fn push_segment(&mut self, minimum_words: u32) -> u32 {
        let size = self
            .next_size
            .min(self.max_segment_words)
            .max(minimum_words);
        if let AllocationStrategy::GrowHeuristically = self.strategy {
            self.next_size = self
                .next_size
                .saturating_add(size)
                .min(self.max_segment_words);
        }
        self.segments.push(BuildSegment::new(size));
        self.segments.len() as u32 - 1
    }

    /// Makes sure segments `0..=id` all exist, creating empty ones as
    /// needed.
    pub fn ensure_segment(&mut self, id: u32) {
        while self.segment_count() <= id {
            self.push_segment(0);
        }
    }

    /// Allocates `words` zeroed words inside segment `id` if it has room.
    pub fn allocate_in(&mut self, id: u32, words: u32) -> Option<u32> {
        let seg = &mut self.segments[id as usize];
        if seg.words_used() + words <= seg.capacity_words {
            let at = seg.words_used();
            seg.data
                .resize(seg.data.len() + words as usize * BYTES_PER_WORD, 0);
            Some(at)
        } else {
            None
        }
    }

    /// Allocates `words` zeroed words somewhere: the most recent segment if
    /// it has room, a fresh segment otherwise. Returns `(segment, word)`.
    pub fn allocate(&mut self, words: u32) -> (u32, u32) {
        if let Some(last) = self.segments.len().checked_sub(1) {
            if let Some(at) = self.allocate_in(last as u32, words) {
                return (last as u32, at);
            }
        }
        let id = self.push_segment(words);
        let at = self
            .allocate_in(id, words)
            .expect("fresh segment must hold its minimum allocation");
        (id, at)
    }

    /// Allocates `words` in segment `id`, growing its capacity if it is
    /// full. Used only for explicit root placement.
    pub fn force_allocate_in(&mut self, id: u32, words: u32) -> u32 {
        self.ensure_segment(id);
        if let Some(at) = self.allocate_in(id, words) {
            return at;
        }
        let seg = &mut self.segments[id as usize];
        seg.capacity_words = seg.words_used() + words;
        let at = seg.words_used();
        seg.data
            .resize(seg.data.len() + words as usize * BYTES_PER_WORD, 0);
        at
    }

    pub fn read_word(&self, seg: u32, word: u32) -> u64 {
        word_at(&self.segments[seg as usize].data, word)
    }

    pub fn write_word(&mut self, seg: u32, word: u32, value: u64) {
        let off = word as usize * BYTES_PER_WORD;
        self.segments[seg as usize].data[off..off + BYTES_PER_WORD]
            .copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_bytes(&self, seg: u32, byte_offset: usize, len: usize) -> &[u8] {
        &self.segments[seg as usize].data[byte_offset..byte_offset + len]
    }

    pub fn write_bytes(&mut self, seg: u32, byte_offset: usize, bytes: &[u8]) {
        self.segments[seg as usize].data[byte_offset..byte_offset + bytes.len()]
            .copy_from_slice(bytes);
    }
}
