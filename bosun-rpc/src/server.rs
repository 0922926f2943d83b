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

//! Application-side call handling: the `(interface_id, method_id)`
//! handler vtable, the per-call context handed to handlers, and the
//! single-use ticket for deferred returns.

use std::collections::HashMap;
use std::rc::Rc;

use bosun::{any_pointer, Error, Result};

use crate::peer::{CapRef, Peer};
use crate::protocol::{call, envelope, payload as payload_schema};
use crate::Frame;

/// One method implementation. Handlers run synchronously on the peer's
/// owning executor; they may issue further peer operations, and they may
/// take the context's ticket to answer later.
pub type HandlerFn = Rc<dyn Fn(&Peer, &mut CallContext) -> Result<()>>;

/// A vtable of method handlers keyed by `(interface_id, method_id)`,
/// registered up front.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<(u64, u16), HandlerFn>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, builder-style.
    pub fn on<F>(mut self, interface_id: u64, method_id: u16, f: F) -> Self
    where
        F: Fn(&Peer, &mut CallContext) -> Result<()> + 'static,
    {
        self.handlers.insert((interface_id, method_id), Rc::new(f));
        self
    }

    pub fn lookup(&self, interface_id: u64, method_id: u16) -> Option<HandlerFn> {
        self.handlers.get(&(interface_id, method_id)).cloned()
    }
}

/// The parameters of an inbound call: a zero-copy view into the call
/// frame plus the resolved capability table.
pub struct Params {
    frame: Rc<Frame>,
    caps: Vec<CapRef>,
}

impl Params {
    pub(crate) fn new(frame: Rc<Frame>, caps: Vec<CapRef>) -> Self {
        Self { frame, caps }
    }

    /// The payload content root.
    pub fn content(&self) -> Result<any_pointer::Reader<'_>> {
        let body = self.frame.get_root_struct()?.get_struct(envelope::BODY)?;
        let payload = body.get_struct(call::PARAMS)?;
        Ok(payload.get_any(payload_schema::CONTENT))
    }

    /// The capability at `index` of the payload's capability table.
    pub fn cap(&self, index: u32) -> Option<CapRef> {
        self.caps.get(index as usize).cloned()
    }

    pub fn cap_count(&self) -> u32 {
        self.caps.len() as u32
    }
}

/// The results of a call under construction. Content is built into a
/// standalone message and deep-copied into the outgoing `Return` when the
/// ticket fires; capabilities are registered here and become the
/// payload's capability table.
pub struct ResultsBuilder {
    pub(crate) message: bosun::message::Builder,
    pub(crate) caps: Vec<CapRef>,
}

impl Default for ResultsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultsBuilder {
    pub fn new() -> Self {
        Self {
            message: bosun::message::Builder::new_default(),
            caps: Vec::new(),
        }
    }

    /// The content root to build into.
    pub fn content(&mut self) -> any_pointer::Builder<'_> {
        self.message.get_root()
    }

    /// Registers a capability for the results and returns its index in
    /// the payload's capability table; write the index with
    /// `set_capability`.
    pub fn add_cap(&mut self, cap: CapRef) -> u32 {
        self.caps.push(cap);
        self.caps.len() as u32 - 1
    }

    /// Shorthand: set the content root itself to a capability.
    pub fn set_root_cap(&mut self, cap: CapRef) {
        let index = self.add_cap(cap);
        self.message.get_root().set_capability(index);
    }
}

/// A single-use handle for answering one inbound call. Handlers that
/// finish synchronously never see it directly; handlers that defer take
/// it out of the context and fire it later.
pub struct Ticket {
    pub(crate) peer: Peer,
    pub(crate) answer_id: u32,
    pub(crate) results: ResultsBuilder,
}

impl Ticket {
    /// Sends `Return.results` built by `build`.
    pub fn send_results<F>(self, build: F) -> Result<()>
    where
        F: FnOnce(&mut ResultsBuilder) -> Result<()>,
    {
        let Self {
            peer,
            answer_id,
            mut results,
        } = self;
        build(&mut results)?;
        peer.complete_answer(answer_id, Ok(results))
    }

    /// Sends `Return.exception`.
    pub fn send_exception(self, error: Error) -> Result<()> {
        self.peer.complete_answer(self.answer_id, Err(error))
    }
}

/// Everything a handler gets: the parameters and, until taken, the
/// ticket whose results it may fill in synchronously.
pub struct CallContext {
    pub params: Params,
    pub(crate) ticket: Option<Ticket>,
}

impl CallContext {
    pub(crate) fn new(params: Params, ticket: Ticket) -> Self {
        Self {
            params,
            ticket: Some(ticket),
        }
    }

    /// The results builder, for handlers that answer synchronously.
    /// Panics if the ticket was already taken.
    pub fn results(&mut self) -> &mut ResultsBuilder {
        &mut self
            .ticket
            .as_mut()
            .expect("ticket was already taken")
            .results
    }

    /// Detaches the ticket for a deferred return. After this, the peer
    /// sends no `Return` until the ticket fires.
    pub fn take_ticket(&mut self) -> Option<Ticket> {
        self.ticket.take()
    }
}
