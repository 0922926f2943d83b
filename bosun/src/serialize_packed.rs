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

//! The [packed encoding](https://capnproto.org/encoding.html#packing):
//! a byte-oriented compression of word-aligned data that elides zero
//! bytes.
//!
//! Each 8-byte word is preceded by a tag byte with one bit set per
//! nonzero byte, followed by the nonzero bytes in order. A `0x00` tag is
//! followed by a count `N` of additional all-zero words; a `0xFF` tag is
//! followed by the word's eight literal bytes and a count `N` of
//! additional words copied verbatim.
//!
//! The packer only accepts whole words; streaming producers must flush on
//! word boundaries.

use std::io::{Read, Write};

use crate::message::{self, ReaderOptions};
use crate::serialize::{self, OwnedSegments};
use crate::{Error, Result, BYTES_PER_WORD};

fn zero_byte_count(word: &[u8]) -> usize {
    word.iter().filter(|b| **b == 0).count()
}

/// Scans a run of words following a `0xFF` tag word that should be copied
/// verbatim: the run ends at the first word containing more than one zero
/// byte, or after 255 words.
fn literal_run_words(bytes: &[u8], mut word: usize) -> usize {
    let total = bytes.len() / BYTES_PER_WORD;
    let start = word;
    while word < total && word - start < 255 {
        if zero_byte_count(&bytes[word * BYTES_PER_WORD..(word + 1) * BYTES_PER_WORD]) > 1 {
            break;
        }
        word += 1;
    }
    word - start
}

fn zero_run_words(bytes: &[u8], mut word: usize) -> usize {
    let total = bytes.len() / BYTES_PER_WORD;
    let start = word;
    while word < total && word - start < 255 {
        if zero_byte_count(&bytes[word * BYTES_PER_WORD..(word + 1) * BYTES_PER_WORD])
            != BYTES_PER_WORD
        {
            break;
        }
        word += 1;
    }
    word - start
}

/// Exact size of `pack(bytes)`, computed in one pass without allocating.
pub fn packed_size(bytes: &[u8]) -> usize {
    debug_assert!(bytes.len() % BYTES_PER_WORD == 0);
    let total = bytes.len() / BYTES_PER_WORD;
    let mut size = 0;
    let mut word = 0;
    while word < total {
        let w = &bytes[word * BYTES_PER_WORD..(word + 1) * BYTES_PER_WORD];
        let zeros = zero_byte_count(w);
        word += 1;
        size += 1 + (BYTES_PER_WORD - zeros);
        if zeros == BYTES_PER_WORD {
            size += 1;
            word += zero_run_words(bytes, word);
        } else if zeros == 0 {
            size += 1;
            let run = literal_run_words(bytes, word);
            size += run * BYTES_PER_WORD;
            word += run;
        }
    }
    size
}

/// Packs word-aligned bytes. The output buffer is sized exactly by a
/// preliminary `packed_size` pass.
pub fn pack(bytes: &[u8]) -> Vec<u8> {
    debug_assert!(bytes.len() % BYTES_PER_WORD == 0);
    let estimated = packed_size(bytes);
    let mut out = Vec::with_capacity(estimated);
    let total = bytes.len() / BYTES_PER_WORD;
    let mut word = 0;
    while word < total {
        let w = &bytes[word * BYTES_PER_WORD..(word + 1) * BYTES_PER_WORD];
        let mut tag = 0u8;
        for (bit, byte) in w.iter().enumerate() {
            if *byte != 0 {
                tag |= 1 << bit;
            }
        }
        out.push(tag);
        for byte in w {
            if *byte != 0 {
                out.push(*byte);
            }
        }
        word += 1;
        if tag == 0x00 {
            let run = zero_run_words(bytes, word);
            out.push(run as u8);
            word += run;
        } else if tag == 0xFF {
            let run = literal_run_words(bytes, word);
            out.push(run as u8);
            out.extend_from_slice(&bytes[word * BYTES_PER_WORD..(word + run) * BYTES_PER_WORD]);
            word += run;
        }
    }
    debug_assert_eq!(out.len(), estimated);
    out
}

/// Unpacks a complete packed buffer. Fails if the input ends in the
/// middle of a word.
pub fn unpack(packed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = PackedDecoder::new();
    decoder.push(packed, &mut out)?;
    if !decoder.at_word_boundary() {
        return Err(Error::truncated_message("packed data ends mid-word"));
    }
    Ok(out)
}

enum DecodeState {
    /// Expecting a tag byte.
    Tag,
    /// Collecting the nonzero bytes of the current word.
    Word { tag: u8, bit: u8, word: [u8; 8] },
    /// Expecting the count byte of a zero run.
    ZeroRunCount,
    /// Expecting the count byte of a literal run.
    LiteralRunCount,
    /// Copying literal bytes through.
    Literal { remaining: usize },
}

/// Incremental unpacker. Feed arbitrary chunks; unpacked words are
/// appended to the output as they complete.
pub struct PackedDecoder {
    state: DecodeState,
}

impl Default for PackedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PackedDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Tag,
        }
    }

    /// True when the decoder sits between words, i.e. a stream may
    /// legally end here.
    pub fn at_word_boundary(&self) -> bool {
        matches!(self.state, DecodeState::Tag)
    }

    pub fn push(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        while !input.is_empty() {
            match &mut self.state {
                DecodeState::Tag => {
                    let tag = input[0];
                    input = &input[1..];
                    if tag == 0x00 {
                        out.extend_from_slice(&[0u8; 8]);
                        self.state = DecodeState::ZeroRunCount;
                    } else {
                        self.state = DecodeState::Word {
                            tag,
                            bit: 0,
                            word: [0u8; 8],
                        };
                    }
                }
                DecodeState::Word { tag, bit, word } => {
                    while *bit < 8 {
                        if *tag & (1 << *bit) != 0 {
                            match input.split_first() {
                                Some((byte, rest)) => {
                                    word[*bit as usize] = *byte;
                                    input = rest;
                                }
                                None => return Ok(()),
                            }
                        }
                        *bit += 1;
                    }
                    out.extend_from_slice(word);
                    let next = if *tag == 0xFF {
                        DecodeState::LiteralRunCount
                    } else {
                        DecodeState::Tag
                    };
                    self.state = next;
                }
                DecodeState::ZeroRunCount => {
                    let run = input[0] as usize;
                    input = &input[1..];
                    out.resize(out.len() + run * BYTES_PER_WORD, 0);
                    self.state = DecodeState::Tag;
                }
                DecodeState::LiteralRunCount => {
                    let run = input[0] as usize;
                    input = &input[1..];
                    self.state = if run > 0 {
                        DecodeState::Literal {
                            remaining: run * BYTES_PER_WORD,
                        }
                    } else {
                        DecodeState::Tag
                    };
                }
                DecodeState::Literal { remaining } => {
                    let take = (*remaining).min(input.len());
                    out.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    *remaining -= take;
                    if *remaining == 0 {
                        self.state = DecodeState::Tag;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Writes the framed message through the packer.
pub fn write_packed_message<W>(writer: &mut W, segments: &[&[u8]]) -> Result<()>
where
    W: Write,
{
    let framed = serialize::write_message_to_vec(segments);
    writer.write_all(&pack(&framed))?;
    Ok(())
}

/// Reads the remainder of `reader` as one packed message. Intended for
/// sources carrying a single message; for multiplexed streams use
/// `serialize::Framer::new_packed`.
pub fn read_packed_message<R>(mut reader: R, options: ReaderOptions) -> Result<message::Reader<OwnedSegments>>
where
    R: Read,
{
    let mut packed = Vec::new();
    reader.read_to_end(&mut packed)?;
    let framed = unpack(&packed)?;
    serialize::read_message(&framed[..], options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    fn assert_pack(unpacked: &[u8], packed: &[u8]) {
        assert_eq!(&pack(unpacked)[..], packed);
        assert_eq!(packed_size(unpacked), packed.len());
        assert_eq!(&unpack(packed).unwrap()[..], unpacked);
    }

    #[test]
    fn packs_mixed_word() {
        assert_pack(
            &[
                0x08, 0, 0, 0, 0x03, 0, 0x02, 0, //
                0x19, 0, 0, 0, 0xaa, 0x01, 0, 0,
            ],
            &[0x51, 0x08, 0x03, 0x02, 0x31, 0x19, 0xaa, 0x01],
        );
    }

    #[test]
    fn packs_zero_runs() {
        assert_pack(&[0; 8], &[0x00, 0x00]);
        assert_pack(&[0; 32], &[0x00, 0x03]);
        // 16 all-zero words compress to a single run: one zero word plus
        // fifteen more.
        assert_pack(&[0; 128], &[0x00, 0x0F]);
    }

    #[test]
    fn packs_literal_runs() {
        let mut unpacked = vec![];
        for i in 0..16u8 {
            unpacked.extend_from_slice(&[i + 1, 2, 3, 4, 5, 6, 7, 8]);
        }
        let packed = pack(&unpacked);
        // One 0xFF tag word, then the other 15 words verbatim.
        assert_eq!(packed.len(), 1 + 8 + 1 + 15 * 8);
        assert_eq!(packed[0], 0xFF);
        assert_eq!(packed[9], 15);
        assert_eq!(&unpack(&packed).unwrap()[..], &unpacked[..]);
    }

    #[test]
    fn long_zero_run_splits_at_255() {
        let unpacked = vec![0u8; 8 * 300];
        let packed = pack(&unpacked);
        assert_eq!(&packed[..], &[0x00, 0xFF, 0x00, 0x2B]);
        assert_eq!(&unpack(&packed).unwrap()[..], &unpacked[..]);
    }

    #[test]
    fn truncated_input_is_detected() {
        let err = unpack(&[0x51, 0x08]).unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::TruncatedMessage);
    }

    #[test]
    fn decoder_handles_byte_at_a_time_input() {
        let mut unpacked = vec![];
        unpacked.extend_from_slice(&[1, 0, 2, 0, 3, 0, 4, 0]);
        unpacked.extend_from_slice(&[0; 16]);
        unpacked.extend_from_slice(&[9; 8]);
        let packed = pack(&unpacked);

        let mut decoder = PackedDecoder::new();
        let mut out = Vec::new();
        for byte in &packed {
            decoder.push(core::slice::from_ref(byte), &mut out).unwrap();
        }
        assert!(decoder.at_word_boundary());
        assert_eq!(out, unpacked);
    }

    quickcheck! {
        fn check_pack_round_trip(data: Vec<u8>) -> bool {
            let mut words = data;
            words.resize(words.len().div_ceil(8) * 8, 0);
            unpack(&pack(&words)).unwrap() == words
        }
    }
}
