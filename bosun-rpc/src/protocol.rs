// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
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

//! The RPC wire schema.
//!
//! There is no schema compiler in this implementation, so the structs of
//! the Cap'n Proto RPC protocol are spelled out here as layout constants
//! (data-section byte offsets and pointer-slot indices) plus a few
//! helpers, playing the role that generated accessors normally would.
//! Field positions follow the standard layout algorithm over `rpc.capnp`
//! and are compatibility-critical.
//!
//! Two fields (`Return.releaseParamCaps`, `Finish.releaseResultCaps`)
//! default to `true` in the schema; since the wire stores values XORed
//! with their defaults, those bits are stored inverted and the helpers
//! here hide that.

use bosun::layout::{StructBuilder, StructReader};
use bosun::message;
use bosun::{Error, ErrorKind, Result};

/// Top-level message union discriminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageTag {
    Unimplemented = 0,
    Abort = 1,
    Call = 2,
    Return = 3,
    Finish = 4,
    Resolve = 5,
    Release = 6,
    ObsoleteSave = 7,
    Bootstrap = 8,
    ObsoleteDelete = 9,
    Provide = 10,
    Accept = 11,
    Join = 12,
    Disembargo = 13,
    ThirdPartyAnswer = 14,
}

impl MessageTag {
    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => Self::Unimplemented,
            1 => Self::Abort,
            2 => Self::Call,
            3 => Self::Return,
            4 => Self::Finish,
            5 => Self::Resolve,
            6 => Self::Release,
            7 => Self::ObsoleteSave,
            8 => Self::Bootstrap,
            9 => Self::ObsoleteDelete,
            10 => Self::Provide,
            11 => Self::Accept,
            12 => Self::Join,
            13 => Self::Disembargo,
            14 => Self::ThirdPartyAnswer,
            _ => return None,
        })
    }
}

/// `struct Message { union { ... } }` — one data word holding the
/// discriminant, one pointer slot shared by every struct-typed variant.
pub mod envelope {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 1;
    pub const WHICH: u32 = 0; // u16
    pub const BODY: u16 = 0;
}

pub mod bootstrap {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 1;
    pub const QUESTION_ID: u32 = 0; // u32
}

pub mod call {
    pub const DATA_WORDS: u16 = 3;
    pub const PTR_WORDS: u16 = 3;
    pub const QUESTION_ID: u32 = 0; // u32
    pub const METHOD_ID: u32 = 4; // u16
    pub const SEND_RESULTS_TO: u32 = 6; // u16 discriminant
    pub const INTERFACE_ID: u32 = 8; // u64
    pub const ALLOW_THIRD_PARTY_TAIL_CALL: u32 = 128; // bit
    pub const TARGET: u16 = 0;
    pub const PARAMS: u16 = 1;
    pub const SEND_RESULTS_TO_THIRD_PARTY: u16 = 2;

    pub const TO_CALLER: u16 = 0;
    pub const TO_YOURSELF: u16 = 1;
    pub const TO_THIRD_PARTY: u16 = 2;
}

pub mod ret {
    pub const DATA_WORDS: u16 = 2;
    pub const PTR_WORDS: u16 = 1;
    pub const ANSWER_ID: u32 = 0; // u32
    pub const RELEASE_PARAM_CAPS: u32 = 32; // bit, stored inverted (default true)
    pub const WHICH: u32 = 6; // u16
    pub const TAKE_FROM_OTHER_QUESTION: u32 = 8; // u32
    pub const BODY: u16 = 0;

    pub const RESULTS: u16 = 0;
    pub const EXCEPTION: u16 = 1;
    pub const CANCELED: u16 = 2;
    pub const RESULTS_SENT_ELSEWHERE: u16 = 3;
    pub const TAKE_FROM_OTHER_QUESTION_TAG: u16 = 4;
    pub const ACCEPT_FROM_THIRD_PARTY: u16 = 5;
    pub const AWAIT_FROM_THIRD_PARTY: u16 = 6;
}

pub mod finish {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 0;
    pub const QUESTION_ID: u32 = 0; // u32
    pub const RELEASE_RESULT_CAPS: u32 = 32; // bit, stored inverted (default true)
}

pub mod resolve {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 1;
    pub const PROMISE_ID: u32 = 0; // u32
    pub const WHICH: u32 = 4; // u16
    pub const BODY: u16 = 0;

    pub const CAP: u16 = 0;
    pub const EXCEPTION: u16 = 1;
}

pub mod release {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 0;
    pub const ID: u32 = 0; // u32
    pub const REFERENCE_COUNT: u32 = 4; // u32
}

pub mod disembargo {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 1;
    pub const EMBARGO_ID: u32 = 0; // u32 (senderLoopback / receiverLoopback / provide)
    pub const WHICH: u32 = 4; // u16
    pub const TARGET: u16 = 0;

    pub const SENDER_LOOPBACK: u16 = 0;
    pub const RECEIVER_LOOPBACK: u16 = 1;
    pub const ACCEPT: u16 = 2;
    pub const PROVIDE: u16 = 3;
}

pub mod provide {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 2;
    pub const QUESTION_ID: u32 = 0; // u32
    pub const TARGET: u16 = 0;
    pub const RECIPIENT: u16 = 1;
}

pub mod accept {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 1;
    pub const QUESTION_ID: u32 = 0; // u32
    pub const EMBARGO: u32 = 32; // bit
    pub const PROVISION: u16 = 0;
}

pub mod join {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 2;
    pub const QUESTION_ID: u32 = 0; // u32
    pub const TARGET: u16 = 0;
    pub const KEY_PART: u16 = 1;
}

/// Join key parts are structs `{ join_id :UInt32; part_count :UInt16;
/// part_num :UInt16 }`.
pub mod join_key_part {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 0;
    pub const JOIN_ID: u32 = 0; // u32
    pub const PART_COUNT: u32 = 4; // u16
    pub const PART_NUM: u32 = 6; // u16
}

pub mod third_party_answer {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 1;
    pub const ANSWER_ID: u32 = 0; // u32
    pub const COMPLETION: u16 = 0;
}

pub mod message_target {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 1;
    pub const IMPORTED_CAP: u32 = 0; // u32
    pub const WHICH: u32 = 4; // u16
    pub const PROMISED_ANSWER: u16 = 0;

    pub const TAG_IMPORTED_CAP: u16 = 0;
    pub const TAG_PROMISED_ANSWER: u16 = 1;
}

pub mod payload {
    pub const DATA_WORDS: u16 = 0;
    pub const PTR_WORDS: u16 = 2;
    pub const CONTENT: u16 = 0;
    pub const CAP_TABLE: u16 = 1;
}

pub mod cap_descriptor {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 1;
    pub const WHICH: u32 = 0; // u16
    pub const ID: u32 = 4; // u32 (senderHosted / senderPromise / receiverHosted)
    pub const BODY: u16 = 0;

    pub const NONE: u16 = 0;
    pub const SENDER_HOSTED: u16 = 1;
    pub const SENDER_PROMISE: u16 = 2;
    pub const RECEIVER_HOSTED: u16 = 3;
    pub const RECEIVER_ANSWER: u16 = 4;
    pub const THIRD_PARTY_HOSTED: u16 = 5;
}

pub mod promised_answer {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 1;
    pub const QUESTION_ID: u32 = 0; // u32
    pub const TRANSFORM: u16 = 0;
}

pub mod pipeline_op {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 0;
    pub const WHICH: u32 = 0; // u16
    pub const GET_POINTER_FIELD: u32 = 2; // u16
    pub const GET_LIST_ELEMENT: u32 = 4; // u32

    pub const NOOP: u16 = 0;
    pub const TAG_GET_POINTER_FIELD: u16 = 1;
    pub const TAG_GET_LIST_ELEMENT: u16 = 2;
}

pub mod third_party_cap_descriptor {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 1;
    pub const VINE_ID: u32 = 0; // u32
    pub const ID: u16 = 0;
}

pub mod exception {
    pub const DATA_WORDS: u16 = 1;
    pub const PTR_WORDS: u16 = 2;
    pub const TYPE: u32 = 4; // u16
    pub const REASON: u16 = 0;
    pub const TRACE: u16 = 1;

    pub const TYPE_FAILED: u16 = 0;
    pub const TYPE_OVERLOADED: u16 = 1;
    pub const TYPE_DISCONNECTED: u16 = 2;
    pub const TYPE_UNIMPLEMENTED: u16 = 3;
}

/// Starts an outgoing RPC message, returning the builder for the union
/// body struct.
pub fn init_message(
    builder: &mut message::Builder,
    tag: MessageTag,
    body_data_words: u16,
    body_ptr_words: u16,
) -> Result<StructBuilder<'_>> {
    let mut root = builder.init_root(envelope::DATA_WORDS, envelope::PTR_WORDS);
    root.set_u16(envelope::WHICH, tag as u16);
    Ok(root
        .into_pointer(envelope::BODY)?
        .init_struct(body_data_words, body_ptr_words))
}

/// Reads the tag and body of an incoming RPC message. `Err(raw)` carries
/// the unrecognized discriminant.
pub fn read_envelope<'a>(
    root: &StructReader<'a>,
) -> Result<core::result::Result<(MessageTag, StructReader<'a>), u16>> {
    let raw = root.get_u16(envelope::WHICH);
    match MessageTag::from_raw(raw) {
        Some(tag) => {
            let body = root.get_struct(envelope::BODY)?;
            Ok(Ok((tag, body)))
        }
        None => Ok(Err(raw)),
    }
}

/// Writes an `Exception` struct into `target`.
pub fn write_exception(target: &mut StructBuilder<'_>, error: &Error) -> Result<()> {
    let type_code = match error.kind {
        ErrorKind::Overloaded => exception::TYPE_OVERLOADED,
        ErrorKind::Disconnected => exception::TYPE_DISCONNECTED,
        ErrorKind::Unimplemented => exception::TYPE_UNIMPLEMENTED,
        _ => exception::TYPE_FAILED,
    };
    target.set_u16(exception::TYPE, type_code);
    target.set_text(exception::REASON, &error.extra)
}

/// Reads an `Exception` struct back into an `Error`.
pub fn read_exception(reader: &StructReader<'_>) -> Error {
    let kind = match reader.get_u16(exception::TYPE) {
        exception::TYPE_OVERLOADED => ErrorKind::Overloaded,
        exception::TYPE_DISCONNECTED => ErrorKind::Disconnected,
        exception::TYPE_UNIMPLEMENTED => ErrorKind::Unimplemented,
        _ => ErrorKind::Failed,
    };
    let reason = match reader.get_text(exception::REASON) {
        Ok(text) => String::from_utf8_lossy(text.as_bytes()).into_owned(),
        Err(_) => "remote exception with unreadable reason".into(),
    };
    Error { kind, extra: reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let mut builder = message::Builder::new_default();
        {
            let mut body =
                init_message(&mut builder, MessageTag::Finish, finish::DATA_WORDS, 0).unwrap();
            body.set_u32(finish::QUESTION_ID, 7);
        }
        let reader = builder.into_reader();
        let root = reader.get_root_struct().unwrap();
        let (tag, body) = read_envelope(&root).unwrap().unwrap();
        assert_eq!(tag, MessageTag::Finish);
        assert_eq!(body.get_u32(finish::QUESTION_ID), 7);
    }

    #[test]
    fn unknown_tag_is_reported_raw() {
        let mut builder = message::Builder::new_default();
        {
            let mut root = builder.init_root(envelope::DATA_WORDS, envelope::PTR_WORDS);
            root.set_u16(envelope::WHICH, 200);
        }
        let reader = builder.into_reader();
        let root = reader.get_root_struct().unwrap();
        match read_envelope(&root).unwrap() {
            Err(raw) => assert_eq!(raw, 200),
            Ok(_) => panic!("tag 200 should not parse"),
        }
    }

    #[test]
    fn exception_round_trip() {
        let mut builder = message::Builder::new_default();
        {
            let mut ex = builder.init_root(exception::DATA_WORDS, exception::PTR_WORDS);
            write_exception(&mut ex, &Error::overloaded("too busy")).unwrap();
        }
        let reader = builder.into_reader();
        let err = read_exception(&reader.get_root_struct().unwrap());
        assert_eq!(err.kind, ErrorKind::Overloaded);
        assert_eq!(err.extra, "too busy");
    }
}
