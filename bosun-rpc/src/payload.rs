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

//! Payload capability tables: encoding and decoding `CapDescriptor`
//! lists, the transform-op codec shared with promise pipelining, and the
//! remap policy applied when a payload is forwarded to another peer.

use bosun::any_pointer::PipelineOp;
use bosun::layout::{StructBuilder, StructReader};
use bosun::{Error, Result};

use crate::protocol::{cap_descriptor, payload, pipeline_op, promised_answer, third_party_cap_descriptor};

/// Sanity cap on descriptors per payload; a message larger than this is
/// not something this implementation ever produces.
pub const MAX_CAPS_PER_PAYLOAD: u32 = 1 << 16;

/// One capability descriptor, in either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    None,
    SenderHosted(u32),
    SenderPromise(u32),
    ReceiverHosted(u32),
    ReceiverAnswer { question: u32, ops: Vec<PipelineOp> },
    ThirdPartyHosted { vine_id: u32 },
}

/// Decodes the transform list of a `PromisedAnswer`.
pub fn read_transform(promised: &StructReader<'_>) -> Result<Vec<PipelineOp>> {
    let mut ops = Vec::new();
    if promised.get_pointer(promised_answer::TRANSFORM).is_null() {
        return Ok(ops);
    }
    let list = promised.get_struct_list(promised_answer::TRANSFORM)?;
    for i in 0..list.len() {
        let op = list.get(i)?;
        ops.push(match op.get_u16(pipeline_op::WHICH) {
            pipeline_op::NOOP => PipelineOp::Noop,
            pipeline_op::TAG_GET_POINTER_FIELD => {
                PipelineOp::GetPointerField(op.get_u16(pipeline_op::GET_POINTER_FIELD))
            }
            pipeline_op::TAG_GET_LIST_ELEMENT => {
                PipelineOp::GetListElement(op.get_u32(pipeline_op::GET_LIST_ELEMENT))
            }
            other => {
                return Err(Error::failed(format!(
                    "unknown promised-answer transform op {other}"
                )))
            }
        });
    }
    Ok(ops)
}

/// Encodes a `PromisedAnswer` struct: the question id and a deep copy of
/// the transform ops.
pub fn write_promised_answer(
    target: &mut StructBuilder<'_>,
    question: u32,
    ops: &[PipelineOp],
) -> Result<()> {
    target.set_u32(promised_answer::QUESTION_ID, question);
    if ops.is_empty() {
        return Ok(());
    }
    let mut list = target.init_struct_list(
        promised_answer::TRANSFORM,
        ops.len() as u32,
        pipeline_op::DATA_WORDS,
        pipeline_op::PTR_WORDS,
    )?;
    for (i, op) in ops.iter().enumerate() {
        let mut entry = list.get_struct_element(i as u32)?;
        match *op {
            PipelineOp::Noop => entry.set_u16(pipeline_op::WHICH, pipeline_op::NOOP),
            PipelineOp::GetPointerField(index) => {
                entry.set_u16(pipeline_op::WHICH, pipeline_op::TAG_GET_POINTER_FIELD);
                entry.set_u16(pipeline_op::GET_POINTER_FIELD, index);
            }
            PipelineOp::GetListElement(index) => {
                entry.set_u16(pipeline_op::WHICH, pipeline_op::TAG_GET_LIST_ELEMENT);
                entry.set_u32(pipeline_op::GET_LIST_ELEMENT, index);
            }
        }
    }
    Ok(())
}

/// Decodes one `CapDescriptor` struct.
pub fn read_cap_table_entry(desc: &StructReader<'_>) -> Result<Descriptor> {
    Ok(match desc.get_u16(cap_descriptor::WHICH) {
        cap_descriptor::NONE => Descriptor::None,
        cap_descriptor::SENDER_HOSTED => Descriptor::SenderHosted(desc.get_u32(cap_descriptor::ID)),
        cap_descriptor::SENDER_PROMISE => {
            Descriptor::SenderPromise(desc.get_u32(cap_descriptor::ID))
        }
        cap_descriptor::RECEIVER_HOSTED => {
            Descriptor::ReceiverHosted(desc.get_u32(cap_descriptor::ID))
        }
        cap_descriptor::RECEIVER_ANSWER => {
            let promised = desc.get_struct(cap_descriptor::BODY)?;
            Descriptor::ReceiverAnswer {
                question: promised.get_u32(promised_answer::QUESTION_ID),
                ops: read_transform(&promised)?,
            }
        }
        cap_descriptor::THIRD_PARTY_HOSTED => {
            let third = desc.get_struct(cap_descriptor::BODY)?;
            Descriptor::ThirdPartyHosted {
                vine_id: third.get_u32(third_party_cap_descriptor::VINE_ID),
            }
        }
        other => {
            return Err(Error::failed(format!(
                "unknown capability descriptor variant {other}"
            )))
        }
    })
}

/// Reads a payload's capability table. A missing table reads as empty.
pub fn read_cap_table(payload_reader: &StructReader<'_>) -> Result<Vec<Descriptor>> {
    if payload_reader.get_pointer(payload::CAP_TABLE).is_null() {
        return Ok(Vec::new());
    }
    let list = payload_reader.get_struct_list(payload::CAP_TABLE)?;
    if list.len() > MAX_CAPS_PER_PAYLOAD {
        return Err(Error::list_too_large("payload capability table too large"));
    }
    let mut caps = Vec::with_capacity(list.len() as usize);
    for i in 0..list.len() {
        caps.push(read_cap_table_entry(&list.get(i)?)?);
    }
    Ok(caps)
}

/// Writes a payload's capability table.
pub fn write_cap_table(
    payload_builder: &mut StructBuilder<'_>,
    caps: &[Descriptor],
) -> Result<()> {
    if caps.is_empty() {
        return Ok(());
    }
    let mut list = payload_builder.init_struct_list(
        payload::CAP_TABLE,
        caps.len() as u32,
        cap_descriptor::DATA_WORDS,
        cap_descriptor::PTR_WORDS,
    )?;
    for (i, cap) in caps.iter().enumerate() {
        let mut desc = list.get_struct_element(i as u32)?;
        match cap {
            Descriptor::None => desc.set_u16(cap_descriptor::WHICH, cap_descriptor::NONE),
            Descriptor::SenderHosted(id) => {
                desc.set_u16(cap_descriptor::WHICH, cap_descriptor::SENDER_HOSTED);
                desc.set_u32(cap_descriptor::ID, *id);
            }
            Descriptor::SenderPromise(id) => {
                desc.set_u16(cap_descriptor::WHICH, cap_descriptor::SENDER_PROMISE);
                desc.set_u32(cap_descriptor::ID, *id);
            }
            Descriptor::ReceiverHosted(id) => {
                desc.set_u16(cap_descriptor::WHICH, cap_descriptor::RECEIVER_HOSTED);
                desc.set_u32(cap_descriptor::ID, *id);
            }
            Descriptor::ReceiverAnswer { question, ops } => {
                desc.set_u16(cap_descriptor::WHICH, cap_descriptor::RECEIVER_ANSWER);
                let mut promised = desc.init_struct(
                    cap_descriptor::BODY,
                    promised_answer::DATA_WORDS,
                    promised_answer::PTR_WORDS,
                )?;
                write_promised_answer(&mut promised, *question, ops)?;
            }
            Descriptor::ThirdPartyHosted { vine_id } => {
                desc.set_u16(cap_descriptor::WHICH, cap_descriptor::THIRD_PARTY_HOSTED);
                let mut third = desc.init_struct(
                    cap_descriptor::BODY,
                    third_party_cap_descriptor::DATA_WORDS,
                    third_party_cap_descriptor::PTR_WORDS,
                )?;
                third.set_u32(third_party_cap_descriptor::VINE_ID, *vine_id);
            }
        }
    }
    Ok(())
}

/// How a forwarding peer re-expresses descriptors it received on one
/// connection when sending the payload out over another. Each method
/// returns the descriptor to emit on the outgoing connection. The peer
/// supplies the implementation and drives this when tail-forwarding.
pub trait Remapper {
    /// The source remote hosts this cap (we imported it); the outgoing
    /// connection gets a proxy export, unless it is the host itself.
    fn remap_hosted(&mut self, import_id: u32, promise: bool) -> Result<Descriptor>;

    /// We host this cap (the source connection named our export);
    /// re-export the same server on the outgoing connection.
    fn remap_own_export(&mut self, export_id: u32) -> Result<Descriptor>;

    /// The descriptor named one of our answers; resolve the transform
    /// ops through its results. An answer that has not completed
    /// forwards as null, failing only dependent calls.
    fn remap_answer(&mut self, question: u32, ops: &[PipelineOp]) -> Result<Descriptor>;

    /// A third-party descriptor with no direct path: fall back to
    /// routing through the vine.
    fn remap_vine(&mut self, vine_id: u32) -> Result<Descriptor>;
}

/// Applies the forwarding policy to one descriptor.
pub fn forward_descriptor(
    inbound: &Descriptor,
    remapper: &mut dyn Remapper,
) -> Result<Descriptor> {
    match inbound {
        Descriptor::None => Ok(Descriptor::None),
        Descriptor::SenderHosted(id) => remapper.remap_hosted(*id, false),
        Descriptor::SenderPromise(id) => remapper.remap_hosted(*id, true),
        Descriptor::ReceiverHosted(id) => remapper.remap_own_export(*id),
        Descriptor::ReceiverAnswer { question, ops } => remapper.remap_answer(*question, ops),
        Descriptor::ThirdPartyHosted { vine_id } => remapper.remap_vine(*vine_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload as payload_schema;
    use bosun::message;

    #[test]
    fn cap_table_round_trip() {
        let caps = vec![
            Descriptor::None,
            Descriptor::SenderHosted(3),
            Descriptor::SenderPromise(4),
            Descriptor::ReceiverHosted(9),
            Descriptor::ReceiverAnswer {
                question: 17,
                ops: vec![
                    PipelineOp::Noop,
                    PipelineOp::GetPointerField(2),
                    PipelineOp::GetListElement(5),
                ],
            },
            Descriptor::ThirdPartyHosted { vine_id: 12 },
        ];
        let mut builder = message::Builder::new_default();
        {
            let mut payload = builder.init_root(payload_schema::DATA_WORDS, payload_schema::PTR_WORDS);
            write_cap_table(&mut payload, &caps).unwrap();
        }
        let reader = builder.into_reader();
        let read_back = read_cap_table(&reader.get_root_struct().unwrap()).unwrap();
        assert_eq!(read_back, caps);
    }

    #[test]
    fn missing_cap_table_reads_empty() {
        let mut builder = message::Builder::new_default();
        builder.init_root(payload_schema::DATA_WORDS, payload_schema::PTR_WORDS);
        let reader = builder.into_reader();
        assert!(read_cap_table(&reader.get_root_struct().unwrap())
            .unwrap()
            .is_empty());
    }
}
