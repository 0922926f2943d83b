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

//! Reading and writing of messages using the
//! [standard stream framing](https://capnproto.org/encoding.html#serialization-over-a-stream):
//! a segment count, per-segment word lengths, padding to word alignment,
//! then the segment payloads.

use std::io::{Read, Write};

use crate::message::{self, ReaderOptions, ReaderSegments};
use crate::{Error, Result, BYTES_PER_WORD};

/// Segments read into one owned buffer.
#[derive(Debug)]
pub struct OwnedSegments {
    /// Byte ranges of each segment within `space`.
    segment_slices: Vec<(usize, usize)>,
    owned_space: Vec<u8>,
}

impl ReaderSegments for OwnedSegments {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        if id < self.segment_slices.len() as u32 {
            let (a, b) = self.segment_slices[id as usize];
            Some(&self.owned_space[a..b])
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.segment_slices.len()
    }
}

/// The parsed segment table of one message: total payload bytes and the
/// byte range of each segment.
#[derive(Debug, PartialEq, Eq)]
struct SegmentTable {
    total_bytes: usize,
    segment_slices: Vec<(usize, usize)>,
}

/// Number of bytes occupied by a segment table for `count` segments,
/// including alignment padding.
fn segment_table_bytes(count: usize) -> usize {
    (4 * (count + 1) + 7) & !7
}

fn parse_segment_count(first_word: &[u8]) -> Result<(usize, u32)> {
    let segment_count =
        u32::from_le_bytes(first_word[0..4].try_into().unwrap()).wrapping_add(1) as usize;
    if segment_count == 0 {
        return Err(Error::truncated_message("message claims zero segments"));
    }
    let first_len = u32::from_le_bytes(first_word[4..8].try_into().unwrap());
    Ok((segment_count, first_len))
}

fn parse_segment_table(header: &[u8], options: &ReaderOptions) -> Result<SegmentTable> {
    let (segment_count, first_len) = parse_segment_count(&header[0..8])?;
    if segment_count > options.segment_limit as usize {
        return Err(Error::segment_limit_exceeded(format!(
            "message has {segment_count} segments; see ReaderOptions::segment_limit"
        )));
    }
    let mut segment_slices = Vec::with_capacity(segment_count);
    let mut total_words: u64 = first_len as u64;
    segment_slices.push((0, first_len as usize * BYTES_PER_WORD));
    for idx in 0..segment_count - 1 {
        let at = 8 + idx * 4;
        let len = u32::from_le_bytes(header[at..at + 4].try_into().unwrap()) as u64;
        let start = total_words as usize * BYTES_PER_WORD;
        total_words = total_words
            .checked_add(len)
            .filter(|&t| t < (1 << 32))
            .ok_or_else(|| Error::truncated_message("segment sizes overflow"))?;
        segment_slices.push((start, total_words as usize * BYTES_PER_WORD));
    }

    // Don't accept a message which the receiver couldn't possibly traverse
    // without hitting the traversal limit. Without this check, a malicious
    // client could transmit a very large segment size to make the receiver
    // allocate excessive space.
    if let Some(limit) = options.traversal_limit_in_words {
        if total_words > limit {
            return Err(Error::traversal_limit_exceeded(format!(
                "message has {total_words} words, more than the traversal limit allows"
            )));
        }
    }

    Ok(SegmentTable {
        total_bytes: total_words as usize * BYTES_PER_WORD,
        segment_slices,
    })
}

/// Reads one framed message. Returns `Ok(None)` on a clean EOF before the
/// first byte.
pub fn try_read_message<R>(
    mut reader: R,
    options: ReaderOptions,
) -> Result<Option<message::Reader<OwnedSegments>>>
where
    R: Read,
{
    let mut first = [0u8; 8];
    {
        let n = reader.read(&mut first)?;
        if n == 0 {
            return Ok(None);
        } else if n < 8 {
            reader.read_exact(&mut first[n..])?;
        }
    }
    let (segment_count, _) = parse_segment_count(&first)?;
    let mut header = vec![0u8; segment_table_bytes(segment_count)];
    header[0..8].copy_from_slice(&first);
    reader.read_exact(&mut header[8..])?;
    let table = parse_segment_table(&header, &options)?;

    let mut owned_space = vec![0u8; table.total_bytes];
    reader.read_exact(&mut owned_space)?;
    let segments = OwnedSegments {
        segment_slices: table.segment_slices,
        owned_space,
    };
    Ok(Some(message::Reader::new(segments, options)))
}

/// Reads one framed message; EOF at a frame boundary is an error.
pub fn read_message<R>(reader: R, options: ReaderOptions) -> Result<message::Reader<OwnedSegments>>
where
    R: Read,
{
    match try_read_message(reader, options)? {
        Some(m) => Ok(m),
        None => Err(Error::truncated_message("premature EOF")),
    }
}

fn write_segment_table<W>(writer: &mut W, segments: &[&[u8]]) -> Result<()>
where
    W: Write,
{
    let segment_count = segments.len();
    let mut header = vec![0u8; segment_table_bytes(segment_count)];
    header[0..4].copy_from_slice(&(segment_count as u32 - 1).to_le_bytes());
    for (idx, segment) in segments.iter().enumerate() {
        let words = (segment.len() / BYTES_PER_WORD) as u32;
        header[4 + idx * 4..8 + idx * 4].copy_from_slice(&words.to_le_bytes());
    }
    writer.write_all(&header)?;
    Ok(())
}

/// Writes the framed message to `writer`. Does not call `flush()`.
pub fn write_message<W>(writer: &mut W, segments: &[&[u8]]) -> Result<()>
where
    W: Write,
{
    write_segment_table(writer, segments)?;
    for segment in segments {
        writer.write_all(segment)?;
    }
    Ok(())
}

/// Total serialized size of a message, header included, in bytes.
pub fn serialized_size(segments: &[&[u8]]) -> usize {
    segment_table_bytes(segments.len()) + segments.iter().map(|s| s.len()).sum::<usize>()
}

/// Serializes to a freshly reserved byte vector.
pub fn write_message_to_vec(segments: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(serialized_size(segments));
    write_message(&mut out, segments).expect("writing to a Vec cannot fail");
    out
}

enum FramerState {
    /// Waiting for the first header word: segment count + first length.
    NeedCount,
    /// Waiting for the remaining header bytes (sizes + padding).
    NeedSizes { header_bytes: usize },
    /// Waiting for the payload.
    NeedPayload { table: SegmentTable },
}

/// Incremental reassembly of framed messages from an arbitrary stream of
/// byte chunks. Partial input is buffered; completed frames come out as
/// owning readers. An EOF in the middle of a frame is fatal.
pub struct Framer {
    options: ReaderOptions,
    unpacker: Option<crate::serialize_packed::PackedDecoder>,
    buf: Vec<u8>,
    state: FramerState,
}

impl Framer {
    /// A framer over the plain stream framing.
    pub fn new(options: ReaderOptions) -> Self {
        Self {
            options,
            unpacker: None,
            buf: Vec::new(),
            state: FramerState::NeedCount,
        }
    }

    /// A framer whose input is packed; bytes are unpacked before framing.
    pub fn new_packed(options: ReaderOptions) -> Self {
        Self {
            unpacker: Some(crate::serialize_packed::PackedDecoder::new()),
            ..Self::new(options)
        }
    }

    /// Feeds a chunk of stream bytes, returning every message completed by
    /// it, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<message::Reader<OwnedSegments>>> {
        match &mut self.unpacker {
            Some(decoder) => decoder.push(bytes, &mut self.buf)?,
            None => self.buf.extend_from_slice(bytes),
        }

        let mut out = Vec::new();
        let mut pos = 0;
        loop {
            let available = self.buf.len() - pos;
            match &mut self.state {
                FramerState::NeedCount => {
                    if available < 8 {
                        break;
                    }
                    let (segment_count, _) = parse_segment_count(&self.buf[pos..pos + 8])?;
                    if segment_count > self.options.segment_limit as usize {
                        return Err(Error::segment_limit_exceeded(format!(
                            "message has {segment_count} segments; see ReaderOptions::segment_limit"
                        )));
                    }
                    self.state = FramerState::NeedSizes {
                        header_bytes: segment_table_bytes(segment_count),
                    };
                }
                FramerState::NeedSizes { header_bytes } => {
                    if available < *header_bytes {
                        break;
                    }
                    let table =
                        parse_segment_table(&self.buf[pos..pos + *header_bytes], &self.options)?;
                    pos += *header_bytes;
                    self.state = FramerState::NeedPayload { table };
                }
                FramerState::NeedPayload { table } => {
                    if available < table.total_bytes {
                        break;
                    }
                    let owned_space = self.buf[pos..pos + table.total_bytes].to_vec();
                    pos += table.total_bytes;
                    let segments = OwnedSegments {
                        segment_slices: std::mem::take(&mut table.segment_slices),
                        owned_space,
                    };
                    out.push(message::Reader::new(segments, self.options));
                    self.state = FramerState::NeedCount;
                }
            }
        }
        self.buf.drain(..pos);
        Ok(out)
    }

    /// Signals end of stream. Fails if the stream ended inside a frame.
    pub fn finish(&self) -> Result<()> {
        let mid_word = match &self.unpacker {
            Some(decoder) => !decoder.at_word_boundary(),
            None => false,
        };
        if mid_word || !self.buf.is_empty() || !matches!(self.state, FramerState::NeedCount) {
            return Err(Error::truncated_message("stream ended mid-frame"));
        }
        Ok(())
    }
}
