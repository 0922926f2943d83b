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

//! An implementation of the Cap'n Proto remote procedure call protocol.
//!
//! The central type is [`peer::Peer`]: one endpoint of one connection,
//! owning that connection's question/answer and export/import tables and
//! driving promise pipelining, embargo ordering, and three-party handoff.
//! A peer is single-owner: all of its operations, including application
//! callbacks, run on one executor. Independent peers may run on
//! independent executors.
//!
//! Transport is pluggable: anything that can accept whole outbound byte
//! buffers and deliver inbound bytes works. [`twoparty`] provides the
//! tokio adapter for byte streams.

pub mod cap_table;
pub mod payload;
pub mod peer;
pub mod protocol;
pub mod queues;
pub mod server;
pub mod twoparty;

pub use peer::{
    AnswerId, CallTarget, CapRef, EmbargoId, ExportId, ImportId, Peer, PeerOptions, QuestionId,
    Response, ReturnHandler, ReturnResult, TableCounts, VatShared,
};
pub use server::{CallContext, Dispatcher, Params, ResultsBuilder, Ticket};

pub use bosun::any_pointer::PipelineOp;

/// One complete inbound message, owned by the framer for as long as any
/// handler needs it.
pub type Frame = bosun::message::Reader<bosun::serialize::OwnedSegments>;

/// The byte-stream interface a peer writes to. Frame boundaries are the
/// peer's concern, not the transport's. `write` must either accept the
/// whole buffer or fail; ordering of accepted buffers must be preserved.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> bosun::Result<()>;
    fn close(&mut self);
}
