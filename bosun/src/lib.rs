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

//! # Bosun
//!
//! An implementation of the [Cap'n Proto](https://capnproto.org) data
//! encoding: segmented messages, pointer-threaded zero-copy readers,
//! arena-allocating builders, stream framing, and the packed compression
//! scheme.
//!
//! The companion crate `bosun-rpc` builds the Cap'n Proto RPC protocol on
//! top of this one.
//!
//! Because this crate contains no schema compiler, all access goes through
//! the dynamic API: struct readers and builders are addressed by byte
//! offsets into the data section and by index into the pointer section.

pub mod any_pointer;
pub mod arena;
pub mod copy;
pub mod data;
pub mod layout;
pub mod message;
pub mod pointer_list;
pub mod primitive_list;
pub mod ptr;
pub mod serialize;
pub mod serialize_packed;
pub mod struct_list;
pub mod text;
pub mod traverse;

/// Eight bytes. All offsets and lengths in the wire format are expressed
/// in words.
pub const BYTES_PER_WORD: usize = 8;

/// Because messages are lazily validated, the return type of any method
/// that reads a pointer field must be wrapped in a `Result`.
pub type Result<T> = core::result::Result<T, Error>;

/// Describes an arbitrary error that prevented an operation from completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    /// The type of the error. The purpose of this enum is not to describe
    /// the error itself, but rather to describe how the client might want
    /// to respond to it.
    pub kind: ErrorKind,

    /// Human-readable failure description.
    pub extra: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A generic problem occurred, and it is believed that if the operation
    /// were repeated without any change in the state of the world, the
    /// problem would occur again.
    Failed,

    /// The request was rejected due to a temporary lack of resources.
    Overloaded,

    /// The method failed because a connection to some necessary capability
    /// was lost.
    Disconnected,

    /// The peer does not implement the requested operation.
    Unimplemented,

    /// A pointer word was malformed for its context.
    InvalidPointer,

    /// A read or write fell outside the bounds of its section and the
    /// strict accessor variant was used.
    OutOfBounds,

    /// The message ended before the data it claims to contain.
    TruncatedMessage,

    /// A far pointer referenced a nonexistent segment or landing pad.
    InvalidFarPointer,

    /// An inline-composite list's tag word was inconsistent with the list
    /// pointer that described it.
    InvalidInlineCompositePointer,

    /// Following a chain of far pointers exceeded the hard depth cap.
    PointerDepthLimit,

    /// A list's claimed element count does not fit in its message.
    ListTooLarge,

    /// The cumulative number of words traversed exceeded the configured
    /// budget.
    TraversalLimitExceeded,

    /// Pointer nesting exceeded the configured limit.
    NestingLimitExceeded,

    /// Text was not well-formed UTF-8 and the strict accessor was used.
    InvalidUtf8,

    /// The message declared more segments than the configured limit.
    SegmentLimitExceeded,

    /// The outbound queue's count or byte limit was exceeded.
    QueueFull,
}

macro_rules! error_constructor {
    ($name:ident, $kind:ident) => {
        pub fn $name<T: Into<String>>(extra: T) -> Self {
            Self {
                kind: ErrorKind::$kind,
                extra: extra.into(),
            }
        }
    };
}

impl Error {
    error_constructor!(failed, Failed);
    error_constructor!(overloaded, Overloaded);
    error_constructor!(disconnected, Disconnected);
    error_constructor!(unimplemented, Unimplemented);
    error_constructor!(invalid_pointer, InvalidPointer);
    error_constructor!(out_of_bounds, OutOfBounds);
    error_constructor!(truncated_message, TruncatedMessage);
    error_constructor!(invalid_far_pointer, InvalidFarPointer);
    error_constructor!(invalid_inline_composite, InvalidInlineCompositePointer);
    error_constructor!(pointer_depth_limit, PointerDepthLimit);
    error_constructor!(list_too_large, ListTooLarge);
    error_constructor!(traversal_limit_exceeded, TraversalLimitExceeded);
    error_constructor!(nesting_limit_exceeded, NestingLimitExceeded);
    error_constructor!(invalid_utf8, InvalidUtf8);
    error_constructor!(segment_limit_exceeded, SegmentLimitExceeded);
    error_constructor!(queue_full, QueueFull);

    /// True for the error classes that must tear down a connection when
    /// they arise from wire input.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::InvalidPointer
                | ErrorKind::OutOfBounds
                | ErrorKind::TruncatedMessage
                | ErrorKind::InvalidFarPointer
                | ErrorKind::InvalidInlineCompositePointer
                | ErrorKind::PointerDepthLimit
                | ErrorKind::ListTooLarge
                | ErrorKind::TraversalLimitExceeded
                | ErrorKind::NestingLimitExceeded
                | ErrorKind::SegmentLimitExceeded
        )
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(fmt, "{:?}: {}", self.kind, self.extra)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ErrorKind::TruncatedMessage,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ErrorKind::Disconnected,
            _ => ErrorKind::Failed,
        };
        Self {
            kind,
            extra: format!("{err}"),
        }
    }
}

impl From<core::str::Utf8Error> for Error {
    fn from(err: core::str::Utf8Error) -> Self {
        Self::invalid_utf8(format!("{err}"))
    }
}

/// The segments of a built message, ready to be written out. Almost all
/// messages fit in a single segment, so the inline capacity avoids a heap
/// allocation on the hot path.
pub type OutputSegments<'a> = smallvec::SmallVec<[&'a [u8]; 2]>;
