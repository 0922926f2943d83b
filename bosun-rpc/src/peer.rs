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

//! The per-connection RPC state machine.
//!
//! A `Peer` owns one connection's four tables (questions, answers,
//! exports, imports) plus the embargo, provision, and join state, and
//! turns inbound frames into outbound frames and application callbacks.
//! All mutation happens on the owning executor; handlers invoked by the
//! peer may re-enter it, so the peer never holds its own state borrowed
//! across a callback.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bosun::any_pointer::PipelineOp;
use bosun::layout::StructReader;
use bosun::message;
use bosun::serialize::Framer;
use bosun::{copy, Error, Result};

use crate::cap_table::{PeerKeyedTable, SlotTable};
use crate::payload::{self, Descriptor};
use crate::protocol::{
    self, accept, bootstrap, call, disembargo, envelope, finish, join, join_key_part,
    message_target, payload as payload_schema, provide, release, resolve, ret,
    third_party_answer, MessageTag,
};
use crate::queues::ReplayQueue;
use crate::server::{CallContext, Dispatcher, Params, ResultsBuilder, Ticket};
use crate::{Frame, Transport};

pub type QuestionId = u32;
pub type AnswerId = u32;
pub type ExportId = u32;
pub type ImportId = u32;
pub type EmbargoId = u32;

/// A capability as seen by code running on this peer.
#[derive(Clone)]
pub enum CapRef {
    /// The null capability.
    None,
    /// Hosted by the remote peer; named by our import id.
    Import(ImportId),
    /// Hosted by us and already exported on this connection.
    Export(ExportId),
    /// The eventual result of one of our outstanding questions.
    Answer {
        question: QuestionId,
        ops: Vec<PipelineOp>,
    },
    /// The eventual result of one of the answers we owe the remote.
    OwnAnswer { answer: AnswerId, ops: Vec<PipelineOp> },
    /// A third-party capability reachable through its vine import.
    ThirdPartyVine(ImportId),
    /// A local server that has not been exported yet.
    Local(Rc<Dispatcher>),
    /// A capability whose resolution failed; calls on it fail with this
    /// error.
    Broken(Error),
}

impl std::fmt::Debug for CapRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Import(id) => write!(f, "Import({id})"),
            Self::Export(id) => write!(f, "Export({id})"),
            Self::Answer { question, ops } => write!(f, "Answer({question}, {ops:?})"),
            Self::OwnAnswer { answer, ops } => write!(f, "OwnAnswer({answer}, {ops:?})"),
            Self::ThirdPartyVine(id) => write!(f, "ThirdPartyVine({id})"),
            Self::Local(_) => write!(f, "Local(..)"),
            Self::Broken(e) => write!(f, "Broken({e})"),
        }
    }
}

/// The target of an outbound call.
#[derive(Clone, Debug)]
pub enum CallTarget {
    Import(ImportId),
    PromisedAnswer {
        question: QuestionId,
        ops: Vec<PipelineOp>,
    },
}

/// What a question's return callback receives.
pub enum ReturnResult {
    Results(Response),
    Exception(Error),
    Canceled,
    ResultsSentElsewhere,
}

/// A received return payload: the whole frame is kept alive, and the
/// capability table has been resolved into local handles.
#[derive(Clone)]
pub struct Response {
    frame: Rc<Frame>,
    caps: Vec<CapRef>,
}

impl Response {
    /// The payload content root.
    pub fn content(&self) -> Result<bosun::any_pointer::Reader<'_>> {
        let body = self.frame.get_root_struct()?.get_struct(envelope::BODY)?;
        let payload_reader = body.get_struct(ret::BODY)?;
        Ok(payload_reader.get_any(payload_schema::CONTENT))
    }

    pub fn cap(&self, index: u32) -> Option<CapRef> {
        self.caps.get(index as usize).cloned()
    }

    pub fn cap_count(&self) -> u32 {
        self.caps.len() as u32
    }
}

/// Return callback. The returned flag requests that the peer retain the
/// question (skipping the automatic `Finish`) so that its results remain
/// addressable; release it later with `Peer::finish`.
pub type ReturnHandler = Box<dyn FnOnce(&Peer, ReturnResult) -> bool>;

/// Options fixed at peer construction. There is no global state; every
/// limit travels with its peer.
#[derive(Clone, Copy, Debug)]
pub struct PeerOptions {
    pub reader_options: message::ReaderOptions,
    /// Maximum queued outbound messages (0 = unlimited).
    pub outbound_queue_messages: usize,
    /// Maximum queued outbound bytes (0 = unlimited).
    pub outbound_queue_bytes: usize,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            reader_options: message::ReaderOptions::default(),
            outbound_queue_messages: 0,
            outbound_queue_bytes: 0,
        }
    }
}

enum QuestionState {
    Waiting,
    /// Locally canceled; the slot lives until the remote's `Return`.
    CanceledAwaitingReturn,
    /// Returned, results retained by the application.
    Retained(Response),
    /// The callee redirected the results to a third party.
    AwaitingThirdParty { completion_key: Vec<u8> },
}

struct Question {
    state: QuestionState,
    on_return: Option<ReturnHandler>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SendResultsTo {
    Caller,
    Yourself,
    ThirdParty,
}

/// The results we produced for an answer, kept for pipelined-promise
/// resolution and `takeFromOtherQuestion`.
struct SentResults {
    message: Rc<message::Builder>,
    caps: Vec<CapRef>,
}

struct Answer {
    returned: bool,
    results: Option<Rc<SentResults>>,
    result_exports: Vec<ExportId>,
    /// Calls pipelined on this answer before it completed.
    replay: ReplayQueue<Rc<Frame>>,
    /// For accept answers created under embargo: calls held until the
    /// matching `Disembargo.context.accept`.
    embargo_queue: Option<ReplayQueue<Rc<Frame>>>,
    send_results_to: SendResultsTo,
    third_party_key: Option<Vec<u8>>,
}

impl Answer {
    fn new(send_results_to: SendResultsTo) -> Self {
        Self {
            returned: false,
            results: None,
            result_exports: Vec::new(),
            replay: ReplayQueue::new(),
            embargo_queue: None,
            send_results_to,
            third_party_key: None,
        }
    }
}

/// A capability target reachable from any connection of this vat.
#[derive(Clone)]
enum VatCap {
    Server(Rc<Dispatcher>),
    Remote {
        via: Weak<RefCell<PeerState>>,
        target: CallTarget,
        is_promise: bool,
    },
}

enum ExportKind {
    Server(Rc<Dispatcher>),
    /// A pass-through to a capability on another connection; calls are
    /// tail-forwarded.
    Remote {
        via: Weak<RefCell<PeerState>>,
        target: CallTarget,
        is_promise: bool,
    },
}

struct Export {
    refcount: u32,
    kind: ExportKind,
}

struct Import {
    /// References still held locally.
    refcount: u32,
    /// Total references ever received; the final `Release` reports this
    /// so the remote export drops to zero.
    total_received: u32,
    /// Set once a `Resolve` for this promise import arrives.
    resolved: Option<CapRef>,
    embargo: Option<EmbargoId>,
    /// Whether the application has routed calls through this import;
    /// resolution then requires a loopback embargo.
    used_for_calls: bool,
}

impl Import {
    fn new() -> Self {
        Self {
            refcount: 0,
            total_received: 0,
            resolved: None,
            embargo: None,
            used_for_calls: false,
        }
    }
}

/// Reader options for locally built, trusted messages.
fn trusted_reader_options() -> message::ReaderOptions {
    message::ReaderOptions {
        traversal_limit_in_words: None,
        nesting_limit: i32::MAX,
        segment_limit: u32::MAX,
    }
}

struct Embargo {
    /// Fully built outbound messages held until the loopback returns.
    queue: ReplayQueue<Vec<u8>>,
    import: ImportId,
}

struct Provision {
    cap: VatCap,
    provide_peer: Weak<RefCell<PeerState>>,
    provide_answer: AnswerId,
}

struct JoinPart {
    peer: Weak<RefCell<PeerState>>,
    answer: AnswerId,
    part_num: u16,
}

struct JoinState {
    part_count: u16,
    parts: Vec<JoinPart>,
}

/// State shared by every peer of one vat: provisions awaiting `Accept`
/// and in-progress joins.
#[derive(Default)]
pub struct VatShared {
    provisions: HashMap<Vec<u8>, Provision>,
    joins: HashMap<u32, JoinState>,
}

pub(crate) struct PeerState {
    transport: Box<dyn Transport>,
    framer: Framer,
    options: PeerOptions,
    bootstrap: Option<Rc<Dispatcher>>,
    dead: Option<Error>,
    shutting_down: bool,
    shutdown_callback: Option<Box<dyn FnOnce()>>,

    questions: SlotTable<Question>,
    answers: PeerKeyedTable<Answer>,
    exports: SlotTable<Export>,
    exports_by_server: HashMap<usize, ExportId>,
    imports: PeerKeyedTable<Import>,
    embargoes: SlotTable<Embargo>,
    vat: Rc<RefCell<VatShared>>,

    /// Third-party answer ids adopted into our question space.
    adopted_answers: HashMap<AnswerId, QuestionId>,

    outbound: VecDeque<Vec<u8>>,
    outbound_bytes: usize,

    self_weak: Weak<RefCell<PeerState>>,
}

/// Deferred work that must run without the state borrowed.
enum Action {
    Dispatch {
        dispatcher: Rc<Dispatcher>,
        interface_id: u64,
        method_id: u16,
        frame: Rc<Frame>,
        caps: Vec<CapRef>,
        answer_id: AnswerId,
    },
    ReturnCallback {
        question: QuestionId,
        handler: ReturnHandler,
        result: ReturnResult,
    },
    Replay {
        frames: Vec<Rc<Frame>>,
    },
    ForwardCall {
        via: Weak<RefCell<PeerState>>,
        target: CallTarget,
        frame: Rc<Frame>,
        answer_id: AnswerId,
    },
    CrossPeerRelease {
        via: Weak<RefCell<PeerState>>,
        import: ImportId,
    },
    SimpleReturnOnPeer {
        via: Weak<RefCell<PeerState>>,
        answer_id: AnswerId,
        exception: Option<Error>,
    },
    ShutdownComplete {
        callback: Box<dyn FnOnce()>,
    },
}

/// Live table sizes of one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableCounts {
    pub questions: usize,
    pub answers: usize,
    pub exports: usize,
    pub imports: usize,
}

/// One RPC connection endpoint.
pub struct Peer {
    state: Rc<RefCell<PeerState>>,
}

impl Clone for Peer {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl Peer {
    pub fn new(transport: Box<dyn Transport>, options: PeerOptions) -> Self {
        Self::with_vat(transport, options, Rc::new(RefCell::new(VatShared::default())))
    }

    /// Creates a peer sharing vat-level state (provisions, joins) with
    /// other peers of the same vat. Required for three-party handoff.
    pub fn with_vat(
        transport: Box<dyn Transport>,
        options: PeerOptions,
        vat: Rc<RefCell<VatShared>>,
    ) -> Self {
        let state = Rc::new(RefCell::new(PeerState {
            framer: Framer::new(options.reader_options),
            transport,
            options,
            bootstrap: None,
            dead: None,
            shutting_down: false,
            shutdown_callback: None,
            questions: SlotTable::new(),
            answers: PeerKeyedTable::new(),
            exports: SlotTable::new(),
            exports_by_server: HashMap::new(),
            imports: PeerKeyedTable::new(),
            embargoes: SlotTable::new(),
            vat,
            adopted_answers: HashMap::new(),
            outbound: VecDeque::new(),
            outbound_bytes: 0,
            self_weak: Weak::new(),
        }));
        state.borrow_mut().self_weak = Rc::downgrade(&state);
        Self { state }
    }

    fn from_state(state: Rc<RefCell<PeerState>>) -> Self {
        Self { state }
    }

    /// Publishes the bootstrap interface. A second call replaces the
    /// server handed out by *future* `Bootstrap` messages; exports
    /// already issued keep the previous server until released.
    pub fn set_bootstrap(&self, server: Rc<Dispatcher>) {
        self.state.borrow_mut().bootstrap = Some(server);
    }

    // -----------------------------------------------------------------
    // Outbound operations
    // -----------------------------------------------------------------

    /// Requests the remote peer's bootstrap capability. The callback's
    /// response carries the capability at index 0.
    pub fn bootstrap(&self, on_return: ReturnHandler) -> Result<QuestionId> {
        let mut st = self.state.borrow_mut();
        st.check_alive()?;
        let question_id = st.questions.push(Question {
            state: QuestionState::Waiting,
            on_return: Some(on_return),
        });
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Bootstrap,
                bootstrap::DATA_WORDS,
                bootstrap::PTR_WORDS,
            )?;
            body.set_u32(bootstrap::QUESTION_ID, question_id);
        }
        st.enqueue_message(&builder)?;
        Ok(question_id)
    }

    /// Issues a call. `build` fills in the parameter payload; the return
    /// callback fires when the remote answers.
    pub fn call<F>(
        &self,
        target: CallTarget,
        interface_id: u64,
        method_id: u16,
        build: F,
        on_return: ReturnHandler,
    ) -> Result<QuestionId>
    where
        F: FnOnce(&mut ResultsBuilder) -> Result<()>,
    {
        let mut params = ResultsBuilder::new();
        build(&mut params)?;

        let mut st = self.state.borrow_mut();
        st.check_alive()?;
        if st.shutting_down {
            return Err(Error::failed("peer is shutting down"));
        }
        let (target, embargo) = st.effective_target(target);
        let question_id = st.questions.push(Question {
            state: QuestionState::Waiting,
            on_return: Some(on_return),
        });
        let result = st.build_call_message(question_id, &target, interface_id, method_id, &params);
        let builder = match result {
            Ok(b) => b,
            Err(e) => {
                st.questions.erase(question_id);
                return Err(e);
            }
        };
        match embargo {
            Some(embargo_id) => match st.embargoes.get_mut(embargo_id) {
                Some(embargo) => embargo.queue.push(builder.to_bytes()),
                None => st.enqueue_message(&builder)?,
            },
            None => st.enqueue_message(&builder)?,
        }
        Ok(question_id)
    }

    /// Cancels an outstanding question, or releases a retained one.
    /// Either way a `Finish` goes out so the remote can free its answer.
    pub fn finish(&self, question_id: QuestionId, release_result_caps: bool) -> Result<()> {
        let (result, action) = {
            let mut st = self.state.borrow_mut();
            st.check_alive()?;
            let question = st
                .questions
                .get_mut(question_id)
                .ok_or_else(|| Error::failed(format!("no such question {question_id}")))?;
            match question.state {
                QuestionState::Waiting | QuestionState::AwaitingThirdParty { .. } => {
                    question.state = QuestionState::CanceledAwaitingReturn;
                    question.on_return = None;
                    (st.send_finish(question_id, release_result_caps), None)
                }
                QuestionState::Retained(_) => {
                    st.questions.erase(question_id);
                    let r = st.send_finish(question_id, release_result_caps);
                    (r, st.maybe_complete_shutdown())
                }
                QuestionState::CanceledAwaitingReturn => (Ok(()), None),
            }
        };
        if let Some(action) = action {
            self.run_actions(vec![action]);
        }
        result
    }

    /// Drops `count` references to an import; at zero, a `Release` is
    /// sent and the import is forgotten.
    pub fn release(&self, import_id: ImportId, count: u32) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_alive()?;
        st.release_import(import_id, count)
    }

    /// Delegates `target` to a third party: sends `Provide` naming the
    /// recipient.
    pub fn provide(
        &self,
        target: CallTarget,
        recipient_key: &[u8],
        on_return: ReturnHandler,
    ) -> Result<QuestionId> {
        let mut st = self.state.borrow_mut();
        st.check_alive()?;
        let question_id = st.questions.push(Question {
            state: QuestionState::Waiting,
            on_return: Some(on_return),
        });
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Provide,
                provide::DATA_WORDS,
                provide::PTR_WORDS,
            )?;
            body.set_u32(provide::QUESTION_ID, question_id);
            let mut target_b = body.init_struct(
                provide::TARGET,
                message_target::DATA_WORDS,
                message_target::PTR_WORDS,
            )?;
            PeerState::write_target(&mut target_b, &target)?;
            body.set_data(provide::RECIPIENT, recipient_key)?;
        }
        st.enqueue_message(&builder)?;
        Ok(question_id)
    }

    /// Redeems a provision on this connection. The response carries the
    /// provided capability at index 0. With `embargo` set, calls
    /// pipelined on the accept answer stay queued on the host until a
    /// `Disembargo.context.accept` releases them.
    pub fn accept(
        &self,
        provision_key: &[u8],
        embargo: bool,
        on_return: ReturnHandler,
    ) -> Result<QuestionId> {
        let mut st = self.state.borrow_mut();
        st.check_alive()?;
        let question_id = st.questions.push(Question {
            state: QuestionState::Waiting,
            on_return: Some(on_return),
        });
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Accept,
                accept::DATA_WORDS,
                accept::PTR_WORDS,
            )?;
            body.set_u32(accept::QUESTION_ID, question_id);
            body.set_bool(accept::EMBARGO, embargo);
            body.set_data(accept::PROVISION, provision_key)?;
        }
        st.enqueue_message(&builder)?;
        Ok(question_id)
    }

    /// Signals that calls pipelined on an accept answer may now be
    /// dispatched (`Disembargo.context.accept`).
    pub fn disembargo_accept(&self, accept_question: QuestionId) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_alive()?;
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Disembargo,
                disembargo::DATA_WORDS,
                disembargo::PTR_WORDS,
            )?;
            body.set_u16(disembargo::WHICH, disembargo::ACCEPT);
            let mut target_b = body.init_struct(
                disembargo::TARGET,
                message_target::DATA_WORDS,
                message_target::PTR_WORDS,
            )?;
            PeerState::write_target(
                &mut target_b,
                &CallTarget::PromisedAnswer {
                    question: accept_question,
                    ops: Vec::new(),
                },
            )?;
        }
        st.enqueue_message(&builder)
    }

    /// Sends one part of a join key.
    pub fn join(
        &self,
        target: CallTarget,
        join_id: u32,
        part_count: u16,
        part_num: u16,
        on_return: ReturnHandler,
    ) -> Result<QuestionId> {
        let mut st = self.state.borrow_mut();
        st.check_alive()?;
        let question_id = st.questions.push(Question {
            state: QuestionState::Waiting,
            on_return: Some(on_return),
        });
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Join,
                join::DATA_WORDS,
                join::PTR_WORDS,
            )?;
            body.set_u32(join::QUESTION_ID, question_id);
            let mut target_b = body.init_struct(
                join::TARGET,
                message_target::DATA_WORDS,
                message_target::PTR_WORDS,
            )?;
            PeerState::write_target(&mut target_b, &target)?;
            let mut key = body.init_struct(
                join::KEY_PART,
                join_key_part::DATA_WORDS,
                join_key_part::PTR_WORDS,
            )?;
            key.set_u32(join_key_part::JOIN_ID, join_id);
            key.set_u16(join_key_part::PART_COUNT, part_count);
            key.set_u16(join_key_part::PART_NUM, part_num);
        }
        st.enqueue_message(&builder)?;
        Ok(question_id)
    }

    /// Stops accepting new outbound calls, waits for outstanding
    /// questions to return, then closes the transport and runs
    /// `on_complete`. Re-entry during the drain is a no-op.
    pub fn shutdown(&self, on_complete: Box<dyn FnOnce()>) {
        let action = {
            let mut st = self.state.borrow_mut();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            st.shutdown_callback = Some(on_complete);
            // Questions whose results we retained get their Finish now.
            let retained: Vec<QuestionId> = st
                .questions
                .iter_mut()
                .filter(|(_, q)| matches!(q.state, QuestionState::Retained(_)))
                .map(|(id, _)| id)
                .collect();
            for id in retained {
                st.questions.erase(id);
                let _ = st.send_finish(id, true);
            }
            st.maybe_complete_shutdown()
        };
        self.run_actions(action.into_iter().collect());
    }

    pub fn outbound_count(&self) -> usize {
        self.state.borrow().outbound.len()
    }

    pub fn outbound_bytes(&self) -> usize {
        self.state.borrow().outbound_bytes
    }

    /// Retries handing queued outbound messages to the transport, e.g.
    /// after backpressure cleared.
    pub fn flush_outbound(&self) {
        self.state.borrow_mut().flush();
    }

    /// Live table sizes, for introspection and tests.
    pub fn table_counts(&self) -> TableCounts {
        let st = self.state.borrow();
        TableCounts {
            questions: st.questions.len(),
            answers: st.answers.len(),
            exports: st.exports.len(),
            imports: st.imports.len(),
        }
    }

    /// Adjusts the outbound queue's message and byte limits (0 = unlimited).
    pub fn set_limits(&self, messages: usize, bytes: usize) {
        let mut st = self.state.borrow_mut();
        st.options.outbound_queue_messages = messages;
        st.options.outbound_queue_bytes = bytes;
    }

    // -----------------------------------------------------------------
    // Inbound events
    // -----------------------------------------------------------------

    /// Feeds raw transport bytes into the framer, handling every message
    /// completed by them.
    pub fn handle_bytes(&self, bytes: &[u8]) -> Result<()> {
        let frames = {
            let mut st = self.state.borrow_mut();
            if let Some(dead) = &st.dead {
                return Err(dead.clone());
            }
            st.framer.push(bytes)
        };
        match frames {
            Ok(frames) => {
                for frame in frames {
                    self.handle_frame(Rc::new(frame))?;
                }
                Ok(())
            }
            Err(e) => {
                self.fatal_error(e.clone());
                Err(e)
            }
        }
    }

    /// The transport closed. A mid-frame EOF or carried error fails all
    /// outstanding questions with `canceled`.
    pub fn handle_close(&self, error: Option<Error>) {
        let mid_frame = { self.state.borrow().framer.finish().err() };
        let error = error.or(mid_frame);
        self.fatal_error(
            error.unwrap_or_else(|| Error::disconnected("connection closed")),
        );
    }

    /// Handles one complete inbound message. Unrecognized or unsupported
    /// messages are echoed back as `Unimplemented` without closing the
    /// connection; decode errors and protocol violations tear it down.
    pub fn handle_frame(&self, frame: Rc<Frame>) -> Result<()> {
        let outcome = self.handle_frame_inner(&frame);
        match outcome {
            Ok(actions) => {
                self.run_actions(actions);
                Ok(())
            }
            Err(e) if e.kind == bosun::ErrorKind::Unimplemented => {
                let mut st = self.state.borrow_mut();
                st.send_unimplemented(&frame)?;
                Ok(())
            }
            Err(e) => {
                if e.is_decode_error() {
                    self.fatal_error(e.clone());
                } else {
                    self.abort_connection(e.clone());
                }
                Err(e)
            }
        }
    }

    fn handle_frame_inner(&self, frame: &Rc<Frame>) -> Result<Vec<Action>> {
        let root = frame.get_root_struct()?;
        let parsed = protocol::read_envelope(&root)?;
        let (tag, body) = match parsed {
            Ok(pair) => pair,
            Err(_raw) => {
                let mut st = self.state.borrow_mut();
                st.send_unimplemented(frame)?;
                return Ok(Vec::new());
            }
        };
        match tag {
            MessageTag::Unimplemented => self.on_unimplemented(&body),
            MessageTag::Abort => {
                let error = protocol::read_exception(&body);
                self.fatal_error(error);
                Ok(Vec::new())
            }
            MessageTag::Call => self.on_call(frame.clone(), false),
            MessageTag::Return => self.on_return(frame, &body),
            MessageTag::Finish => self.on_finish(&body),
            MessageTag::Resolve => self.on_resolve(&body),
            MessageTag::Release => self.on_release(&body),
            MessageTag::Bootstrap => self.on_bootstrap(&body),
            MessageTag::Provide => self.on_provide(&body),
            MessageTag::Accept => self.on_accept(&body),
            MessageTag::Join => self.on_join(&body),
            MessageTag::Disembargo => self.on_disembargo(&body),
            MessageTag::ThirdPartyAnswer => self.on_third_party_answer(&body),
            MessageTag::ObsoleteSave | MessageTag::ObsoleteDelete => {
                let mut st = self.state.borrow_mut();
                st.send_unimplemented(frame)?;
                Ok(Vec::new())
            }
        }
    }

    // -----------------------------------------------------------------
    // Per-message handlers. Each parses and mutates under one borrow and
    // returns deferred callbacks as actions.
    // -----------------------------------------------------------------

    fn on_bootstrap(&self, body: &StructReader<'_>) -> Result<Vec<Action>> {
        let answer_id = body.get_u32(bootstrap::QUESTION_ID);
        let mut st = self.state.borrow_mut();
        if st.answers.contains(answer_id) {
            return Err(Error::failed(format!(
                "bootstrap reused in-flight question id {answer_id}"
            )));
        }
        match st.bootstrap.clone() {
            Some(server) => {
                let mut results = ResultsBuilder::new();
                results.set_root_cap(CapRef::Local(server));
                let mut answer = Answer::new(SendResultsTo::Caller);
                answer.returned = true;
                st.answers.insert(answer_id, answer);
                st.finish_results(answer_id, results)?;
            }
            None => {
                let mut answer = Answer::new(SendResultsTo::Caller);
                answer.returned = true;
                st.answers.insert(answer_id, answer);
                st.send_return_exception(
                    answer_id,
                    &Error::failed("no bootstrap capability is configured"),
                )?;
            }
        }
        Ok(Vec::new())
    }

    fn on_call(&self, frame: Rc<Frame>, replayed: bool) -> Result<Vec<Action>> {
        let mut st = self.state.borrow_mut();
        let root = frame.get_root_struct()?;
        let body = root.get_struct(envelope::BODY)?;
        let answer_id = body.get_u32(call::QUESTION_ID);
        let interface_id = body.get_u64(call::INTERFACE_ID);
        let method_id = body.get_u16(call::METHOD_ID);
        let send_results_to = match body.get_u16(call::SEND_RESULTS_TO) {
            call::TO_CALLER => SendResultsTo::Caller,
            call::TO_YOURSELF => SendResultsTo::Yourself,
            call::TO_THIRD_PARTY => SendResultsTo::ThirdParty,
            other => {
                return Err(Error::unimplemented(format!(
                    "unsupported sendResultsTo variant {other}"
                )))
            }
        };

        if replayed {
            // The placeholder vanishes if the caller finished (canceled)
            // while the call was queued.
            if !st.answers.contains(answer_id) {
                return Ok(Vec::new());
            }
        } else {
            if st.answers.contains(answer_id) {
                return Err(Error::failed(format!(
                    "call reused in-flight question id {answer_id}"
                )));
            }
            st.answers.insert(answer_id, Answer::new(send_results_to));
        }

        let target = body.get_struct(call::TARGET)?;
        let resolved = match st.resolve_message_target(&target)? {
            TargetResolution::Queue { on_answer } => {
                match st.queue_on_answer(on_answer, frame) {
                    Ok(()) => return Ok(Vec::new()),
                    Err(e) => {
                        st.send_return_exception(answer_id, &e)?;
                        return Ok(Vec::new());
                    }
                }
            }
            TargetResolution::Resolved(cap) => cap,
        };

        match resolved {
            VatCap::Server(dispatcher) => {
                let third_party_key = if send_results_to == SendResultsTo::ThirdParty {
                    Some(
                        body.get_data(call::SEND_RESULTS_TO_THIRD_PARTY)?
                            .to_vec(),
                    )
                } else {
                    None
                };
                let payload_reader = body.get_struct(call::PARAMS)?;
                let descriptors = payload::read_cap_table(&payload_reader)?;
                let caps = st.import_caps(&descriptors)?;
                if let Some(answer) = st.answers.get_mut(answer_id) {
                    answer.send_results_to = send_results_to;
                    answer.third_party_key = third_party_key;
                }
                Ok(vec![Action::Dispatch {
                    dispatcher,
                    interface_id,
                    method_id,
                    frame: frame.clone(),
                    caps,
                    answer_id,
                }])
            }
            VatCap::Remote { via, target, .. } => Ok(vec![Action::ForwardCall {
                via,
                target,
                frame: frame.clone(),
                answer_id,
            }]),
        }
    }

    fn on_return(&self, frame: &Rc<Frame>, body: &StructReader<'_>) -> Result<Vec<Action>> {
        let mut st = self.state.borrow_mut();
        let mut answer_id = body.get_u32(ret::ANSWER_ID);
        // A third-party answer id adopted earlier routes to the original
        // question.
        if let Some(original) = st.adopted_answers.remove(&answer_id) {
            answer_id = original;
        }
        let which = body.get_u16(ret::WHICH);
        let question = st
            .questions
            .get_mut(answer_id)
            .ok_or_else(|| Error::failed(format!("Return names unknown question {answer_id}")))?;
        let canceled = matches!(question.state, QuestionState::CanceledAwaitingReturn);

        if canceled {
            // Bookkeeping only: the Finish we already sent releases the
            // result caps remotely.
            st.questions.erase(answer_id);
            return Ok(st.maybe_complete_shutdown().into_iter().collect());
        }

        let mut actions = Vec::new();
        match which {
            ret::RESULTS => {
                let payload_reader = body.get_struct(ret::BODY)?;
                let descriptors = payload::read_cap_table(&payload_reader)?;
                let caps = st.import_caps(&descriptors)?;
                let response = Response {
                    frame: frame.clone(),
                    caps,
                };
                let question = st.questions.get_mut(answer_id).expect("checked above");
                let handler = question.on_return.take();
                if let Some(handler) = handler {
                    actions.push(Action::ReturnCallback {
                        question: answer_id,
                        handler,
                        result: ReturnResult::Results(response),
                    });
                }
            }
            ret::EXCEPTION => {
                let error = protocol::read_exception(&body.get_struct(ret::BODY)?);
                let question = st.questions.get_mut(answer_id).expect("checked above");
                if let Some(handler) = question.on_return.take() {
                    actions.push(Action::ReturnCallback {
                        question: answer_id,
                        handler,
                        result: ReturnResult::Exception(error),
                    });
                }
                st.questions.erase(answer_id);
                st.send_finish(answer_id, true)?;
                actions.extend(st.maybe_complete_shutdown());
            }
            ret::CANCELED => {
                let question = st.questions.get_mut(answer_id).expect("checked above");
                if let Some(handler) = question.on_return.take() {
                    actions.push(Action::ReturnCallback {
                        question: answer_id,
                        handler,
                        result: ReturnResult::Canceled,
                    });
                }
                st.questions.erase(answer_id);
                actions.extend(st.maybe_complete_shutdown());
            }
            ret::RESULTS_SENT_ELSEWHERE => {
                let question = st.questions.get_mut(answer_id).expect("checked above");
                if let Some(handler) = question.on_return.take() {
                    actions.push(Action::ReturnCallback {
                        question: answer_id,
                        handler,
                        result: ReturnResult::ResultsSentElsewhere,
                    });
                }
                st.questions.erase(answer_id);
                st.send_finish(answer_id, false)?;
                actions.extend(st.maybe_complete_shutdown());
            }
            ret::TAKE_FROM_OTHER_QUESTION_TAG => {
                let other = body.get_u32(ret::TAKE_FROM_OTHER_QUESTION);
                let stashed = match st.questions.get(other) {
                    Some(Question {
                        state: QuestionState::Retained(response),
                        ..
                    }) => Some(response.clone()),
                    _ => None,
                };
                let question = st.questions.get_mut(answer_id).expect("checked above");
                let handler = question.on_return.take();
                let result = match stashed {
                    Some(response) => ReturnResult::Results(response),
                    // The other question is canceled or unknown.
                    None => ReturnResult::Exception(Error::failed(format!(
                        "takeFromOtherQuestion names unavailable question {other}"
                    ))),
                };
                if let Some(handler) = handler {
                    actions.push(Action::ReturnCallback {
                        question: answer_id,
                        handler,
                        result,
                    });
                }
                st.questions.erase(answer_id);
                st.send_finish(answer_id, true)?;
                actions.extend(st.maybe_complete_shutdown());
            }
            ret::ACCEPT_FROM_THIRD_PARTY | ret::AWAIT_FROM_THIRD_PARTY => {
                let completion_key = body
                    .get_pointer(ret::BODY)
                    .get_data()?
                    .to_vec();
                let question = st.questions.get_mut(answer_id).expect("checked above");
                question.state = QuestionState::AwaitingThirdParty { completion_key };
            }
            other => {
                return Err(Error::unimplemented(format!(
                    "unsupported Return variant {other}"
                )))
            }
        }
        Ok(actions)
    }

    fn on_finish(&self, body: &StructReader<'_>) -> Result<Vec<Action>> {
        let answer_id = body.get_u32(finish::QUESTION_ID);
        let release_result_caps = !body.get_bool(finish::RELEASE_RESULT_CAPS);
        let mut st = self.state.borrow_mut();
        let answer = st
            .answers
            .remove(answer_id)
            .ok_or_else(|| Error::failed(format!("Finish names unknown answer {answer_id}")))?;
        let mut actions = Vec::new();
        if !answer.returned {
            // Cancellation: a Return must still cross so the caller can
            // free its question table.
            st.send_return_variant(answer_id, ret::CANCELED, None)?;
        }
        if release_result_caps {
            for export_id in &answer.result_exports {
                actions.extend(st.release_export(*export_id, 1)?);
            }
        }
        // Drop vat-level state created under this answer id.
        {
            let self_ptr = st.self_weak.clone();
            let mut vat = st.vat.borrow_mut();
            vat.provisions.retain(|_, p| {
                !(p.provide_answer == answer_id && Weak::ptr_eq(&p.provide_peer, &self_ptr))
            });
            vat.joins.retain(|_, j| {
                j.parts.retain(|part| {
                    !(part.answer == answer_id && Weak::ptr_eq(&part.peer, &self_ptr))
                });
                !j.parts.is_empty()
            });
        }
        Ok(actions)
    }

    fn on_release(&self, body: &StructReader<'_>) -> Result<Vec<Action>> {
        let id = body.get_u32(release::ID);
        let count = body.get_u32(release::REFERENCE_COUNT);
        let mut st = self.state.borrow_mut();
        st.release_export(id, count)
    }

    fn on_resolve(&self, body: &StructReader<'_>) -> Result<Vec<Action>> {
        let promise_id = body.get_u32(resolve::PROMISE_ID);
        let which = body.get_u16(resolve::WHICH);
        let mut st = self.state.borrow_mut();
        let resolution = match which {
            resolve::CAP => {
                let desc_reader = body.get_struct(resolve::BODY)?;
                let descriptor = payload::read_cap_table_entry(&desc_reader)?;
                let caps = st.import_caps(std::slice::from_ref(&descriptor))?;
                caps.into_iter().next().unwrap_or(CapRef::None)
            }
            resolve::EXCEPTION => {
                CapRef::Broken(protocol::read_exception(&body.get_struct(resolve::BODY)?))
            }
            other => {
                return Err(Error::unimplemented(format!(
                    "unsupported Resolve variant {other}"
                )))
            }
        };
        let Some(import) = st.imports.get_mut(promise_id) else {
            // A resolution for a promise we no longer hold.
            return Ok(Vec::new());
        };
        import.resolved = Some(resolution);
        if import.used_for_calls && import.embargo.is_none() {
            let embargo_id = st.embargoes.push(Embargo {
                queue: ReplayQueue::new(),
                import: promise_id,
            });
            if let Some(import) = st.imports.get_mut(promise_id) {
                import.embargo = Some(embargo_id);
            }
            st.send_disembargo_loopback(
                disembargo::SENDER_LOOPBACK,
                embargo_id,
                promise_id,
            )?;
        }
        Ok(Vec::new())
    }

    fn on_disembargo(&self, body: &StructReader<'_>) -> Result<Vec<Action>> {
        let which = body.get_u16(disembargo::WHICH);
        let embargo_id = body.get_u32(disembargo::EMBARGO_ID);
        let mut st = self.state.borrow_mut();
        match which {
            disembargo::SENDER_LOOPBACK => {
                // Echo. Our outbound queue is FIFO, so the echo leaves
                // after any call we already accepted on this target.
                let target = body.get_struct(disembargo::TARGET)?;
                let import_id = target.get_u32(message_target::IMPORTED_CAP);
                st.send_disembargo_loopback(
                    disembargo::RECEIVER_LOOPBACK,
                    embargo_id,
                    import_id,
                )?;
                Ok(Vec::new())
            }
            disembargo::RECEIVER_LOOPBACK => {
                let Some(embargo) = st.embargoes.erase(embargo_id) else {
                    return Err(Error::failed(format!(
                        "receiverLoopback names unknown embargo {embargo_id}"
                    )));
                };
                if let Some(import) = st.imports.get_mut(embargo.import) {
                    import.embargo = None;
                }
                for bytes in embargo.queue_into_iter() {
                    st.enqueue_bytes(bytes)?;
                }
                Ok(Vec::new())
            }
            disembargo::ACCEPT => {
                let target = body.get_struct(disembargo::TARGET)?;
                let promised = target.get_struct(message_target::PROMISED_ANSWER)?;
                let answer_id = promised.get_u32(crate::protocol::promised_answer::QUESTION_ID);
                let frames = match st.answers.get_mut(answer_id) {
                    Some(answer) => match answer.embargo_queue.take() {
                        Some(mut queue) => queue.drain(),
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                };
                Ok(if frames.is_empty() {
                    Vec::new()
                } else {
                    vec![Action::Replay { frames }]
                })
            }
            disembargo::PROVIDE => {
                // The provider-side signal carries no state we track
                // beyond the provision itself.
                Ok(Vec::new())
            }
            other => Err(Error::unimplemented(format!(
                "unsupported Disembargo variant {other}"
            ))),
        }
    }

    fn on_provide(&self, body: &StructReader<'_>) -> Result<Vec<Action>> {
        let answer_id = body.get_u32(provide::QUESTION_ID);
        let mut st = self.state.borrow_mut();
        if st.answers.contains(answer_id) {
            return Err(Error::failed(format!(
                "provide reused in-flight question id {answer_id}"
            )));
        }
        let target = body.get_struct(provide::TARGET)?;
        let resolved = match st.resolve_message_target(&target)? {
            TargetResolution::Resolved(cap) => cap,
            TargetResolution::Queue { .. } => {
                st.answers.insert(answer_id, Answer::new(SendResultsTo::Caller));
                st.send_return_exception(
                    answer_id,
                    &Error::failed("provide target is not resolved yet"),
                )?;
                return Ok(Vec::new());
            }
        };
        let recipient = body.get_data(provide::RECIPIENT)?.to_vec();
        {
            let provide_peer = st.self_weak.clone();
            let mut vat = st.vat.borrow_mut();
            if vat.provisions.contains_key(&recipient) {
                return Err(Error::failed(
                    "duplicate provision for the same recipient key",
                ));
            }
            vat.provisions.insert(
                recipient,
                Provision {
                    cap: resolved,
                    provide_peer,
                    provide_answer: answer_id,
                },
            );
        }
        st.answers.insert(answer_id, Answer::new(SendResultsTo::Caller));
        Ok(Vec::new())
    }

    fn on_accept(&self, body: &StructReader<'_>) -> Result<Vec<Action>> {
        let answer_id = body.get_u32(accept::QUESTION_ID);
        let embargo = body.get_bool(accept::EMBARGO);
        let mut st = self.state.borrow_mut();
        if st.answers.contains(answer_id) {
            return Err(Error::failed(format!(
                "accept reused in-flight question id {answer_id}"
            )));
        }
        let key = body.get_data(accept::PROVISION)?.to_vec();
        let provision = { st.vat.borrow().provisions.get(&key).map(|p| (p.cap.clone(), p.provide_peer.clone(), p.provide_answer)) };
        let mut answer = Answer::new(SendResultsTo::Caller);
        if embargo {
            answer.embargo_queue = Some(ReplayQueue::new());
        }
        st.answers.insert(answer_id, answer);
        match provision {
            None => {
                st.send_return_exception(
                    answer_id,
                    &Error::failed("accept names an unknown provision"),
                )?;
                Ok(Vec::new())
            }
            Some((cap, provide_peer, provide_answer)) => {
                let local = st.vatcap_to_capref(cap);
                let mut results = ResultsBuilder::new();
                results.set_root_cap(local);
                st.finish_results(answer_id, results)?;
                // The provider's Provide question completes now that the
                // provision is redeemed.
                Ok(vec![Action::SimpleReturnOnPeer {
                    via: provide_peer,
                    answer_id: provide_answer,
                    exception: None,
                }])
            }
        }
    }

    fn on_join(&self, body: &StructReader<'_>) -> Result<Vec<Action>> {
        let answer_id = body.get_u32(join::QUESTION_ID);
        let mut st = self.state.borrow_mut();
        if st.answers.contains(answer_id) {
            return Err(Error::failed(format!(
                "join reused in-flight question id {answer_id}"
            )));
        }
        let key = body.get_struct(join::KEY_PART)?;
        let join_id = key.get_u32(join_key_part::JOIN_ID);
        let part_count = key.get_u16(join_key_part::PART_COUNT);
        let part_num = key.get_u16(join_key_part::PART_NUM);
        st.answers.insert(answer_id, Answer::new(SendResultsTo::Caller));

        enum JoinOutcome {
            Incomplete,
            Complete(Vec<JoinPart>),
            /// Mismatched part counts or a duplicate part: every part
            /// already gathered fails along with the new one.
            Mismatch(Vec<JoinPart>),
        }

        let outcome = {
            let self_ptr = st.self_weak.clone();
            let mut vat = st.vat.borrow_mut();
            let entry = vat.joins.entry(join_id).or_insert_with(|| JoinState {
                part_count,
                parts: Vec::new(),
            });
            if entry.part_count != part_count
                || entry.parts.iter().any(|p| p.part_num == part_num)
            {
                let failed = vat.joins.remove(&join_id).map(|j| j.parts).unwrap_or_default();
                JoinOutcome::Mismatch(failed)
            } else {
                entry.parts.push(JoinPart {
                    peer: self_ptr,
                    answer: answer_id,
                    part_num,
                });
                if entry.parts.len() == entry.part_count as usize {
                    match vat.joins.remove(&join_id) {
                        Some(j) => JoinOutcome::Complete(j.parts),
                        None => JoinOutcome::Incomplete,
                    }
                } else {
                    JoinOutcome::Incomplete
                }
            }
        };

        let self_ptr = st.self_weak.clone();
        let mut actions = Vec::new();
        match outcome {
            JoinOutcome::Incomplete => {}
            JoinOutcome::Complete(parts) => {
                for part in parts {
                    if Weak::ptr_eq(&part.peer, &self_ptr) {
                        st.send_return_variant(part.answer, ret::RESULTS, None)?;
                        if let Some(answer) = st.answers.get_mut(part.answer) {
                            answer.returned = true;
                        }
                    } else {
                        actions.push(Action::SimpleReturnOnPeer {
                            via: part.peer,
                            answer_id: part.answer,
                            exception: None,
                        });
                    }
                }
            }
            JoinOutcome::Mismatch(failed) => {
                let error = Error::failed("join key parts disagree");
                st.send_return_exception(answer_id, &error)?;
                for part in failed {
                    if Weak::ptr_eq(&part.peer, &self_ptr) {
                        st.send_return_exception(part.answer, &error)?;
                    } else {
                        actions.push(Action::SimpleReturnOnPeer {
                            via: part.peer,
                            answer_id: part.answer,
                            exception: Some(error.clone()),
                        });
                    }
                }
            }
        }
        Ok(actions)
    }

    fn on_third_party_answer(&self, body: &StructReader<'_>) -> Result<Vec<Action>> {
        let answer_id = body.get_u32(third_party_answer::ANSWER_ID);
        let key = body.get_data(third_party_answer::COMPLETION)?.to_vec();
        let mut st = self.state.borrow_mut();
        let question_id = st.questions.iter_mut().find_map(|(id, q)| {
            matches!(&q.state,
                QuestionState::AwaitingThirdParty { completion_key } if *completion_key == key)
            .then_some(id)
        });
        match question_id {
            Some(question_id) => {
                if st.adopted_answers.insert(answer_id, question_id).is_some() {
                    return Err(Error::failed(format!(
                        "conflicting third-party answer id {answer_id}"
                    )));
                }
                if let Some(q) = st.questions.get_mut(question_id) {
                    q.state = QuestionState::Waiting;
                }
                Ok(Vec::new())
            }
            None => Err(Error::failed(
                "third-party answer names an unknown completion key",
            )),
        }
    }

    fn on_unimplemented(&self, body: &StructReader<'_>) -> Result<Vec<Action>> {
        // The remote could not handle a message we sent. If it carried a
        // question, fail that question.
        let inner = protocol::read_envelope(body)?;
        let mut st = self.state.borrow_mut();
        let mut actions = Vec::new();
        if let Ok((tag, inner_body)) = inner {
            let question_id = match tag {
                MessageTag::Call => Some(inner_body.get_u32(call::QUESTION_ID)),
                MessageTag::Bootstrap => Some(inner_body.get_u32(bootstrap::QUESTION_ID)),
                MessageTag::Provide => Some(inner_body.get_u32(provide::QUESTION_ID)),
                MessageTag::Accept => Some(inner_body.get_u32(accept::QUESTION_ID)),
                MessageTag::Join => Some(inner_body.get_u32(join::QUESTION_ID)),
                _ => None,
            };
            if let Some(question_id) = question_id {
                if let Some(question) = st.questions.get_mut(question_id) {
                    if let Some(handler) = question.on_return.take() {
                        actions.push(Action::ReturnCallback {
                            question: question_id,
                            handler,
                            result: ReturnResult::Exception(Error::unimplemented(
                                "the remote peer does not implement this message",
                            )),
                        });
                    }
                    st.questions.erase(question_id);
                    actions.extend(st.maybe_complete_shutdown());
                }
            }
        }
        Ok(actions)
    }

    // -----------------------------------------------------------------
    // Action execution and callbacks
    // -----------------------------------------------------------------

    fn run_actions(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Dispatch {
                    dispatcher,
                    interface_id,
                    method_id,
                    frame,
                    caps,
                    answer_id,
                } => self.invoke_handler(dispatcher, interface_id, method_id, frame, caps, answer_id),
                Action::ReturnCallback {
                    question,
                    handler,
                    result,
                } => {
                    let is_results = matches!(result, ReturnResult::Results(_));
                    let response_copy = match &result {
                        ReturnResult::Results(r) => Some(r.clone()),
                        _ => None,
                    };
                    let retain = handler(self, result);
                    if is_results {
                        self.after_results_callback(question, retain, response_copy);
                    }
                }
                Action::Replay { frames } => {
                    for frame in frames {
                        match self.on_call(frame, true) {
                            Ok(followup) => self.run_actions(followup),
                            Err(e) => self.abort_connection(e),
                        }
                    }
                }
                Action::ForwardCall {
                    via,
                    target,
                    frame,
                    answer_id,
                } => self.forward_call(via, target, frame, answer_id),
                Action::CrossPeerRelease { via, import } => {
                    if let Some(state) = via.upgrade() {
                        let peer = Peer::from_state(state);
                        let _ = peer.release(import, 1);
                    }
                }
                Action::SimpleReturnOnPeer {
                    via,
                    answer_id,
                    exception,
                } => {
                    if let Some(state) = via.upgrade() {
                        let mut st = state.borrow_mut();
                        let result = match exception {
                            Some(e) => st.send_return_exception(answer_id, &e),
                            None => st.send_return_variant(answer_id, ret::RESULTS, None),
                        };
                        if result.is_ok() {
                            if let Some(answer) = st.answers.get_mut(answer_id) {
                                answer.returned = true;
                            }
                        }
                    }
                }
                Action::ShutdownComplete { callback } => callback(),
            }
        }
    }

    /// After a results callback: either retain the question (stashing the
    /// response for `takeFromOtherQuestion`) or finish it.
    fn after_results_callback(
        &self,
        question_id: QuestionId,
        retain: bool,
        response: Option<Response>,
    ) {
        let action = {
            let mut st = self.state.borrow_mut();
            let Some(question) = st.questions.get_mut(question_id) else {
                return;
            };
            if retain {
                if let Some(response) = response {
                    question.state = QuestionState::Retained(response);
                }
                None
            } else {
                // Releasing result caps is only safe when the payload
                // carried none; otherwise the application now owns import
                // references that must survive until it calls release().
                let release = response.as_ref().map_or(true, |r| r.cap_count() == 0);
                st.questions.erase(question_id);
                let _ = st.send_finish(question_id, release);
                st.maybe_complete_shutdown()
            }
        };
        if let Some(action) = action {
            self.run_actions(vec![action]);
        }
    }

    fn invoke_handler(
        &self,
        dispatcher: Rc<Dispatcher>,
        interface_id: u64,
        method_id: u16,
        frame: Rc<Frame>,
        caps: Vec<CapRef>,
        answer_id: AnswerId,
    ) {
        let handler = dispatcher.lookup(interface_id, method_id);
        let ticket = Ticket {
            peer: self.clone(),
            answer_id,
            results: ResultsBuilder::new(),
        };
        match handler {
            None => {
                let _ = self.complete_answer(
                    answer_id,
                    Err(Error::unimplemented(format!(
                        "no handler for interface {interface_id:#x} method {method_id}"
                    ))),
                );
            }
            Some(handler) => {
                let mut ctx = CallContext::new(Params::new(frame, caps), ticket);
                match handler(self, &mut ctx) {
                    Ok(()) => {
                        if let Some(ticket) = ctx.take_ticket() {
                            let Ticket {
                                answer_id, results, ..
                            } = ticket;
                            let _ = self.complete_answer(answer_id, Ok(results));
                        }
                    }
                    Err(error) => {
                        if ctx.take_ticket().is_some() {
                            let _ = self.complete_answer(answer_id, Err(error));
                        }
                    }
                }
            }
        }
    }

    /// Completes an answer with results or an exception; handler errors
    /// and ticket firings both land here. Missing answers (canceled via
    /// `Finish`) are dropped silently.
    pub(crate) fn complete_answer(
        &self,
        answer_id: AnswerId,
        result: core::result::Result<ResultsBuilder, Error>,
    ) -> Result<()> {
        let actions = {
            let mut st = self.state.borrow_mut();
            if !st.answers.contains(answer_id) {
                return Ok(());
            }
            match result {
                Ok(results) => st.finish_results(answer_id, results)?,
                Err(error) => {
                    st.send_return_exception(answer_id, &error)?;
                }
            }
            let frames = match st.answers.get_mut(answer_id) {
                Some(answer) => answer.replay.drain(),
                None => Vec::new(),
            };
            if frames.is_empty() {
                Vec::new()
            } else {
                vec![Action::Replay { frames }]
            }
        };
        self.run_actions(actions);
        Ok(())
    }

    /// Tail-forwards a call received on this connection to a capability
    /// living on another connection of this vat, routing the return back.
    /// The inbound capability table is re-expressed for the outgoing
    /// connection through `payload::forward_descriptor`.
    fn forward_call(
        &self,
        via: Weak<RefCell<PeerState>>,
        target: CallTarget,
        frame: Rc<Frame>,
        answer_id: AnswerId,
    ) {
        let Some(out_state) = via.upgrade() else {
            let _ = self.complete_answer(
                answer_id,
                Err(Error::disconnected("forwarding connection is gone")),
            );
            return;
        };
        let out_peer = Peer::from_state(out_state);

        let parse = || -> Result<(u64, u16, Vec<Descriptor>)> {
            let root = frame.get_root_struct()?;
            let body = root.get_struct(envelope::BODY)?;
            let payload_reader = body.get_struct(call::PARAMS)?;
            Ok((
                body.get_u64(call::INTERFACE_ID),
                body.get_u16(call::METHOD_ID),
                payload::read_cap_table(&payload_reader)?,
            ))
        };
        let (interface_id, method_id, descriptors) = match parse() {
            Ok(x) => x,
            Err(e) => {
                let _ = self.complete_answer(answer_id, Err(e));
                return;
            }
        };

        let mut remapper = ConnectionRemapper {
            src: self,
            dst: &out_peer,
        };
        let mut forwarded = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            match payload::forward_descriptor(descriptor, &mut remapper) {
                Ok(d) => forwarded.push(d),
                Err(e) => {
                    let _ = self.complete_answer(answer_id, Err(e));
                    return;
                }
            }
        }

        let back = self.clone();
        let outcome = out_peer.send_forwarded_call(
            target,
            interface_id,
            method_id,
            &frame,
            forwarded,
            Box::new(move |forward_peer, result| {
                match result {
                    ReturnResult::Results(response) => {
                        let _ = back.forward_results_back(forward_peer, answer_id, response);
                    }
                    ReturnResult::Exception(e) => {
                        let _ = back.complete_answer(answer_id, Err(e));
                    }
                    ReturnResult::Canceled => {
                        let _ = back.complete_answer(
                            answer_id,
                            Err(Error::failed("forwarded call was canceled")),
                        );
                    }
                    ReturnResult::ResultsSentElsewhere => {
                        let _ = back.complete_answer(
                            answer_id,
                            Err(Error::failed(
                                "forwarded call sent its results elsewhere",
                            )),
                        );
                    }
                }
                false
            }),
        );
        if let Err(e) = outcome {
            let _ = self.complete_answer(answer_id, Err(e));
        }
    }

    /// Issues a call whose parameter payload is copied out of an inbound
    /// frame and whose capability table has already been remapped into
    /// this connection's terms.
    fn send_forwarded_call(
        &self,
        target: CallTarget,
        interface_id: u64,
        method_id: u16,
        source: &Rc<Frame>,
        descriptors: Vec<Descriptor>,
        on_return: ReturnHandler,
    ) -> Result<QuestionId> {
        let mut st = self.state.borrow_mut();
        st.check_alive()?;
        let question_id = st.questions.push(Question {
            state: QuestionState::Waiting,
            on_return: Some(on_return),
        });
        let built = PeerState::build_forwarded_call(
            question_id,
            &target,
            interface_id,
            method_id,
            source,
            &descriptors,
        );
        let builder = match built {
            Ok(b) => b,
            Err(e) => {
                st.questions.erase(question_id);
                return Err(e);
            }
        };
        st.enqueue_message(&builder)?;
        Ok(question_id)
    }

    /// Delivers a forwarded call's results back to the original caller.
    /// Capabilities that cannot cross connections come back as null.
    fn forward_results_back(
        &self,
        forward_peer: &Peer,
        answer_id: AnswerId,
        response: Response,
    ) -> Result<()> {
        let mut results = ResultsBuilder::new();
        copy::clone_any_pointer(&response.content()?, results.content())?;
        let vatcaps: Vec<Option<VatCap>> = {
            let mut forward_st = forward_peer.state.borrow_mut();
            response
                .caps
                .iter()
                .map(|cap| forward_st.capref_to_vatcap(cap.clone()).ok())
                .collect()
        };
        {
            let mut st = self.state.borrow_mut();
            for vatcap in vatcaps {
                results.caps.push(match vatcap {
                    Some(vatcap) => st.vatcap_to_capref(vatcap),
                    None => CapRef::None,
                });
            }
        }
        self.complete_answer(answer_id, Ok(results))
    }

    // -----------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------

    /// A decode error or transport failure: close the connection and fail
    /// every outstanding question with `canceled`.
    fn fatal_error(&self, error: Error) {
        let (handlers, shutdown) = {
            let mut st = self.state.borrow_mut();
            if st.dead.is_some() {
                return;
            }
            st.dead = Some(error);
            st.transport.close();
            let handlers: Vec<(QuestionId, ReturnHandler)> = st
                .questions
                .drain()
                .into_iter()
                .filter_map(|(id, mut q)| q.on_return.take().map(|h| (id, h)))
                .collect();
            (handlers, st.shutdown_callback.take())
        };
        for (_, handler) in handlers {
            let _ = handler(self, ReturnResult::Canceled);
        }
        if let Some(callback) = shutdown {
            callback();
        }
    }

    /// A protocol violation: send `Abort` with the reason, then tear
    /// down.
    fn abort_connection(&self, error: Error) {
        {
            let mut st = self.state.borrow_mut();
            if st.dead.is_some() {
                return;
            }
            let mut builder = message::Builder::new_default();
            let built = protocol::init_message(
                &mut builder,
                MessageTag::Abort,
                protocol::exception::DATA_WORDS,
                protocol::exception::PTR_WORDS,
            )
            .and_then(|mut body| protocol::write_exception(&mut body, &error));
            if built.is_ok() {
                let _ = st.enqueue_message(&builder);
            }
        }
        self.fatal_error(error);
    }
}

/// How a call target resolved.
enum TargetResolution {
    Resolved(VatCap),
    /// The target is a promised answer that has not completed; the call
    /// must wait on this answer.
    Queue { on_answer: AnswerId },
}

impl PeerState {
    fn check_alive(&self) -> Result<()> {
        match &self.dead {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    // ---- outbound plumbing ----

    fn enqueue_message(&mut self, builder: &message::Builder) -> Result<()> {
        self.enqueue_bytes(builder.to_bytes())
    }

    fn enqueue_bytes(&mut self, bytes: Vec<u8>) -> Result<()> {
        let limit_msgs = self.options.outbound_queue_messages;
        let limit_bytes = self.options.outbound_queue_bytes;
        if limit_msgs != 0 && self.outbound.len() >= limit_msgs {
            return Err(Error::queue_full("outbound message limit reached"));
        }
        if limit_bytes != 0 && self.outbound_bytes + bytes.len() > limit_bytes {
            return Err(Error::queue_full("outbound byte limit reached"));
        }
        self.outbound_bytes += bytes.len();
        self.outbound.push_back(bytes);
        self.flush();
        Ok(())
    }

    /// Hands queued messages to the transport in order. A transport
    /// refusal leaves the remainder queued for a later flush; hard
    /// transport failures are reported through `handle_close`.
    fn flush(&mut self) {
        while let Some(front) = self.outbound.front() {
            match self.transport.write(front) {
                Ok(()) => {
                    let sent = self.outbound.pop_front().expect("front exists");
                    self.outbound_bytes -= sent.len();
                }
                Err(_) => break,
            }
        }
    }

    /// Builds a complete outbound `Call` message: target, method
    /// coordinates, and the parameter payload (content deep-copied,
    /// capabilities exported into the table).
    fn build_call_message(
        &mut self,
        question_id: QuestionId,
        target: &CallTarget,
        interface_id: u64,
        method_id: u16,
        params: &ResultsBuilder,
    ) -> Result<message::Builder> {
        let (descriptors, _touched) = self.export_caps(&params.caps)?;
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Call,
                call::DATA_WORDS,
                call::PTR_WORDS,
            )?;
            body.set_u32(call::QUESTION_ID, question_id);
            body.set_u64(call::INTERFACE_ID, interface_id);
            body.set_u16(call::METHOD_ID, method_id);
            body.set_u16(call::SEND_RESULTS_TO, call::TO_CALLER);
            {
                let mut target_b = body.init_struct(
                    call::TARGET,
                    message_target::DATA_WORDS,
                    message_target::PTR_WORDS,
                )?;
                Self::write_target(&mut target_b, target)?;
            }
            let mut payload_b = body.init_struct(
                call::PARAMS,
                payload_schema::DATA_WORDS,
                payload_schema::PTR_WORDS,
            )?;
            {
                let reader = message::Reader::new(&params.message, trusted_reader_options());
                copy::clone_any_pointer(
                    &reader.get_root()?,
                    payload_b.get_any(payload_schema::CONTENT)?,
                )?;
            }
            payload::write_cap_table(&mut payload_b, &descriptors)?;
        }
        Ok(builder)
    }

    /// Builds a forwarded `Call`: the parameter content is deep-copied
    /// from the source frame and the capability table is written from
    /// pre-remapped descriptors, bypassing `export_caps`.
    fn build_forwarded_call(
        question_id: QuestionId,
        target: &CallTarget,
        interface_id: u64,
        method_id: u16,
        source: &Rc<Frame>,
        descriptors: &[Descriptor],
    ) -> Result<message::Builder> {
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Call,
                call::DATA_WORDS,
                call::PTR_WORDS,
            )?;
            body.set_u32(call::QUESTION_ID, question_id);
            body.set_u64(call::INTERFACE_ID, interface_id);
            body.set_u16(call::METHOD_ID, method_id);
            body.set_u16(call::SEND_RESULTS_TO, call::TO_CALLER);
            {
                let mut target_b = body.init_struct(
                    call::TARGET,
                    message_target::DATA_WORDS,
                    message_target::PTR_WORDS,
                )?;
                Self::write_target(&mut target_b, target)?;
            }
            let mut payload_b = body.init_struct(
                call::PARAMS,
                payload_schema::DATA_WORDS,
                payload_schema::PTR_WORDS,
            )?;
            {
                let root = source.get_root_struct()?;
                let source_body = root.get_struct(envelope::BODY)?;
                let source_payload = source_body.get_struct(call::PARAMS)?;
                copy::clone_any_pointer(
                    &source_payload.get_any(payload_schema::CONTENT),
                    payload_b.get_any(payload_schema::CONTENT)?,
                )?;
            }
            payload::write_cap_table(&mut payload_b, descriptors)?;
        }
        Ok(builder)
    }

    fn send_finish(&mut self, question_id: QuestionId, release_result_caps: bool) -> Result<()> {
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Finish,
                finish::DATA_WORDS,
                finish::PTR_WORDS,
            )?;
            body.set_u32(finish::QUESTION_ID, question_id);
            // Stored inverted: the schema default is true.
            body.set_bool(finish::RELEASE_RESULT_CAPS, !release_result_caps);
        }
        self.enqueue_message(&builder)
    }

    fn send_release(&mut self, import_id: ImportId, count: u32) -> Result<()> {
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Release,
                release::DATA_WORDS,
                release::PTR_WORDS,
            )?;
            body.set_u32(release::ID, import_id);
            body.set_u32(release::REFERENCE_COUNT, count);
        }
        self.enqueue_message(&builder)
    }

    fn send_disembargo_loopback(
        &mut self,
        which: u16,
        embargo_id: EmbargoId,
        import_id: ImportId,
    ) -> Result<()> {
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Disembargo,
                disembargo::DATA_WORDS,
                disembargo::PTR_WORDS,
            )?;
            body.set_u16(disembargo::WHICH, which);
            body.set_u32(disembargo::EMBARGO_ID, embargo_id);
            let mut target_b = body.init_struct(
                disembargo::TARGET,
                message_target::DATA_WORDS,
                message_target::PTR_WORDS,
            )?;
            PeerState::write_target(&mut target_b, &CallTarget::Import(import_id))?;
        }
        self.enqueue_message(&builder)
    }

    fn send_unimplemented(&mut self, original: &Rc<Frame>) -> Result<()> {
        let mut builder = message::Builder::new_default();
        {
            let mut root = builder.init_root(envelope::DATA_WORDS, envelope::PTR_WORDS);
            root.set_u16(envelope::WHICH, MessageTag::Unimplemented as u16);
            let original_root = original.get_root()?;
            copy::clone_any_pointer(&original_root, root.get_any(envelope::BODY)?)?;
        }
        self.enqueue_message(&builder)
    }

    fn send_return_exception(&mut self, answer_id: AnswerId, error: &Error) -> Result<()> {
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Return,
                ret::DATA_WORDS,
                ret::PTR_WORDS,
            )?;
            body.set_u32(ret::ANSWER_ID, answer_id);
            body.set_u16(ret::WHICH, ret::EXCEPTION);
            let mut exception = body.init_struct(
                ret::BODY,
                protocol::exception::DATA_WORDS,
                protocol::exception::PTR_WORDS,
            )?;
            protocol::write_exception(&mut exception, error)?;
        }
        self.enqueue_message(&builder)?;
        if let Some(answer) = self.answers.get_mut(answer_id) {
            answer.returned = true;
        }
        Ok(())
    }

    /// Sends a bare `Return` variant with no payload (canceled, empty
    /// results, resultsSentElsewhere, ...).
    fn send_return_variant(
        &mut self,
        answer_id: AnswerId,
        which: u16,
        completion_key: Option<&[u8]>,
    ) -> Result<()> {
        let mut builder = message::Builder::new_default();
        {
            let mut body = protocol::init_message(
                &mut builder,
                MessageTag::Return,
                ret::DATA_WORDS,
                ret::PTR_WORDS,
            )?;
            body.set_u32(ret::ANSWER_ID, answer_id);
            body.set_u16(ret::WHICH, which);
            if which == ret::RESULTS {
                body.init_struct(
                    ret::BODY,
                    payload_schema::DATA_WORDS,
                    payload_schema::PTR_WORDS,
                )?;
            }
            if let Some(key) = completion_key {
                body.get_pointer(ret::BODY)?.set_data(key)?;
            }
        }
        self.enqueue_message(&builder)
    }

    /// Builds and sends the `Return` for completed results, stashing them
    /// for pipelined resolution.
    fn finish_results(&mut self, answer_id: AnswerId, results: ResultsBuilder) -> Result<()> {
        let ResultsBuilder { message, caps } = results;
        let (descriptors, new_exports) = self.export_caps(&caps)?;
        let sent = Rc::new(SentResults {
            message: Rc::new(message),
            caps,
        });

        let (send_results_to, third_party_key) = match self.answers.get(answer_id) {
            Some(answer) => (answer.send_results_to, answer.third_party_key.clone()),
            None => (SendResultsTo::Caller, None),
        };

        match send_results_to {
            SendResultsTo::Caller => {
                let mut builder = message::Builder::new_default();
                {
                    let mut body = protocol::init_message(
                        &mut builder,
                        MessageTag::Return,
                        ret::DATA_WORDS,
                        ret::PTR_WORDS,
                    )?;
                    body.set_u32(ret::ANSWER_ID, answer_id);
                    body.set_u16(ret::WHICH, ret::RESULTS);
                    let mut payload_b = body.init_struct(
                        ret::BODY,
                        payload_schema::DATA_WORDS,
                        payload_schema::PTR_WORDS,
                    )?;
                    {
                        let reader =
                            message::Reader::new(&*sent.message, trusted_reader_options());
                        copy::clone_any_pointer(
                            &reader.get_root()?,
                            payload_b.get_any(payload_schema::CONTENT)?,
                        )?;
                    }
                    payload::write_cap_table(&mut payload_b, &descriptors)?;
                }
                self.enqueue_message(&builder)?;
            }
            SendResultsTo::Yourself => {
                self.send_return_variant(answer_id, ret::RESULTS_SENT_ELSEWHERE, None)?;
            }
            SendResultsTo::ThirdParty => {
                self.send_return_variant(
                    answer_id,
                    ret::ACCEPT_FROM_THIRD_PARTY,
                    third_party_key.as_deref(),
                )?;
            }
        }

        if let Some(answer) = self.answers.get_mut(answer_id) {
            answer.returned = true;
            answer.results = Some(sent);
            answer.result_exports = new_exports;
        }
        Ok(())
    }

    // ---- capability table plumbing ----

    /// Converts application capabilities into wire descriptors, exporting
    /// as needed. Returns the descriptors plus the export ids that gained
    /// a reference (for later release bookkeeping).
    fn export_caps(&mut self, caps: &[CapRef]) -> Result<(Vec<Descriptor>, Vec<ExportId>)> {
        let mut descriptors = Vec::with_capacity(caps.len());
        let mut touched = Vec::new();
        for cap in caps {
            let descriptor = match cap {
                CapRef::None | CapRef::Broken(_) => Descriptor::None,
                CapRef::Local(server) => {
                    let id = self.export_server(server.clone());
                    touched.push(id);
                    Descriptor::SenderHosted(id)
                }
                CapRef::Export(id) => {
                    let export = self
                        .exports
                        .get_mut(*id)
                        .ok_or_else(|| Error::failed(format!("unknown export {id}")))?;
                    export.refcount += 1;
                    touched.push(*id);
                    match export.kind {
                        ExportKind::Remote {
                            is_promise: true, ..
                        } => Descriptor::SenderPromise(*id),
                        _ => Descriptor::SenderHosted(*id),
                    }
                }
                CapRef::Import(id) | CapRef::ThirdPartyVine(id) => {
                    Descriptor::ReceiverHosted(*id)
                }
                CapRef::Answer { question, ops } => Descriptor::ReceiverAnswer {
                    question: *question,
                    ops: ops.clone(),
                },
                CapRef::OwnAnswer { .. } => {
                    return Err(Error::failed(
                        "cannot send a promise on one of our own answers back to its asker",
                    ))
                }
            };
            descriptors.push(descriptor);
        }
        Ok((descriptors, touched))
    }

    fn export_server(&mut self, server: Rc<Dispatcher>) -> ExportId {
        let key = Rc::as_ptr(&server) as usize;
        if let Some(&id) = self.exports_by_server.get(&key) {
            if let Some(export) = self.exports.get_mut(id) {
                export.refcount += 1;
                return id;
            }
        }
        let id = self.exports.push(Export {
            refcount: 1,
            kind: ExportKind::Server(server),
        });
        self.exports_by_server.insert(key, id);
        id
    }

    /// Records one received reference to an import, creating the entry on
    /// first sight.
    fn note_import_ref(&mut self, id: ImportId) {
        let import = self.imports.entry(id).or_insert_with(Import::new);
        import.refcount += 1;
        import.total_received += 1;
    }

    /// Resolves inbound wire descriptors into local capability handles,
    /// adding import references as required.
    fn import_caps(&mut self, descriptors: &[Descriptor]) -> Result<Vec<CapRef>> {
        let mut caps = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            caps.push(match descriptor {
                Descriptor::None => CapRef::None,
                Descriptor::SenderHosted(id) | Descriptor::SenderPromise(id) => {
                    self.note_import_ref(*id);
                    CapRef::Import(*id)
                }
                Descriptor::ReceiverHosted(id) => {
                    if self.exports.get(*id).is_none() {
                        return Err(Error::failed(format!(
                            "receiverHosted names unknown export {id}"
                        )));
                    }
                    CapRef::Export(*id)
                }
                Descriptor::ReceiverAnswer { question, ops } => {
                    match self.answers.get(*question) {
                        None => CapRef::Broken(Error::failed(format!(
                            "receiverAnswer names unknown answer {question}"
                        ))),
                        Some(answer) if answer.returned => match &answer.results {
                            Some(results) => match Self::resolve_ops(results, ops) {
                                Ok(cap) => cap,
                                Err(e) => CapRef::Broken(e),
                            },
                            None => CapRef::Broken(Error::failed(
                                "receiverAnswer names an answer that failed",
                            )),
                        },
                        Some(_) => CapRef::OwnAnswer {
                            answer: *question,
                            ops: ops.clone(),
                        },
                    }
                }
                Descriptor::ThirdPartyHosted { vine_id } => {
                    self.note_import_ref(*vine_id);
                    CapRef::ThirdPartyVine(*vine_id)
                }
            });
        }
        Ok(caps)
    }

    /// Applies transform ops to stashed results, yielding the referenced
    /// capability.
    fn resolve_ops(results: &SentResults, ops: &[PipelineOp]) -> Result<CapRef> {
        let reader = message::Reader::new(&*results.message, trusted_reader_options());
        let pointer = reader.get_root()?.apply_pipeline_ops(ops)?;
        let index = pointer.get_capability()?;
        results
            .caps
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Error::failed(format!("capability index {index} out of range")))
    }

    // ---- target resolution ----

    fn write_target(
        builder: &mut bosun::layout::StructBuilder<'_>,
        target: &CallTarget,
    ) -> Result<()> {
        match target {
            CallTarget::Import(id) => {
                builder.set_u16(message_target::WHICH, message_target::TAG_IMPORTED_CAP);
                builder.set_u32(message_target::IMPORTED_CAP, *id);
            }
            CallTarget::PromisedAnswer { question, ops } => {
                builder.set_u16(message_target::WHICH, message_target::TAG_PROMISED_ANSWER);
                let mut promised = builder.init_struct(
                    message_target::PROMISED_ANSWER,
                    protocol::promised_answer::DATA_WORDS,
                    protocol::promised_answer::PTR_WORDS,
                )?;
                payload::write_promised_answer(&mut promised, *question, ops)?;
            }
        }
        Ok(())
    }

    /// Resolves an inbound `MessageTarget` to something callable.
    fn resolve_message_target(&mut self, target: &StructReader<'_>) -> Result<TargetResolution> {
        match target.get_u16(message_target::WHICH) {
            message_target::TAG_IMPORTED_CAP => {
                let id = target.get_u32(message_target::IMPORTED_CAP);
                let export = self
                    .exports
                    .get(id)
                    .ok_or_else(|| Error::failed(format!("call target names unknown export {id}")))?;
                Ok(TargetResolution::Resolved(match &export.kind {
                    ExportKind::Server(d) => VatCap::Server(d.clone()),
                    ExportKind::Remote {
                        via,
                        target,
                        is_promise,
                    } => VatCap::Remote {
                        via: via.clone(),
                        target: target.clone(),
                        is_promise: *is_promise,
                    },
                }))
            }
            message_target::TAG_PROMISED_ANSWER => {
                let promised = target.get_struct(message_target::PROMISED_ANSWER)?;
                let answer_id = promised.get_u32(protocol::promised_answer::QUESTION_ID);
                let ops = payload::read_transform(&promised)?;
                let answer = self.answers.get(answer_id).ok_or_else(|| {
                    Error::failed(format!("call target names unknown answer {answer_id}"))
                })?;
                if answer.embargo_queue.is_some() || !answer.returned {
                    return Ok(TargetResolution::Queue {
                        on_answer: answer_id,
                    });
                }
                let results = answer.results.clone();
                match results {
                    Some(results) => {
                        let cap = Self::resolve_ops(&results, &ops)?;
                        self.capref_to_vatcap(cap)
                            .map(TargetResolution::Resolved)
                    }
                    None => Err(Error::failed(
                        "pipelined call on an answer that returned no results",
                    )),
                }
            }
            other => Err(Error::unimplemented(format!(
                "unsupported MessageTarget variant {other}"
            ))),
        }
    }

    fn queue_on_answer(&mut self, on_answer: AnswerId, frame: Rc<Frame>) -> Result<()> {
        let answer = self
            .answers
            .get_mut(on_answer)
            .ok_or_else(|| Error::failed("queue target vanished"))?;
        if let Some(queue) = answer.embargo_queue.as_mut() {
            queue.push(frame);
        } else {
            answer.replay.push(frame);
        }
        Ok(())
    }

    /// Lifts a connection-scoped capability to a vat-scoped one.
    fn capref_to_vatcap(&mut self, cap: CapRef) -> Result<VatCap> {
        match cap {
            CapRef::Local(d) => Ok(VatCap::Server(d)),
            CapRef::Export(id) => {
                let export = self
                    .exports
                    .get(id)
                    .ok_or_else(|| Error::failed(format!("unknown export {id}")))?;
                Ok(match &export.kind {
                    ExportKind::Server(d) => VatCap::Server(d.clone()),
                    ExportKind::Remote {
                        via,
                        target,
                        is_promise,
                    } => VatCap::Remote {
                        via: via.clone(),
                        target: target.clone(),
                        is_promise: *is_promise,
                    },
                })
            }
            CapRef::Import(id) | CapRef::ThirdPartyVine(id) => Ok(VatCap::Remote {
                via: self.self_weak.clone(),
                target: CallTarget::Import(id),
                is_promise: false,
            }),
            CapRef::Answer { question, ops } => Ok(VatCap::Remote {
                via: self.self_weak.clone(),
                target: CallTarget::PromisedAnswer { question, ops },
                is_promise: true,
            }),
            CapRef::OwnAnswer { .. } => Err(Error::failed(
                "a pending own answer cannot be lifted to a vat capability",
            )),
            CapRef::None => Err(Error::failed("null capability")),
            CapRef::Broken(e) => Err(e),
        }
    }

    /// Lowers a vat-scoped capability into this connection's terms,
    /// creating proxy exports for remote targets on other connections.
    fn vatcap_to_capref(&mut self, cap: VatCap) -> CapRef {
        match cap {
            VatCap::Server(d) => CapRef::Local(d),
            VatCap::Remote {
                via,
                target,
                is_promise,
            } => {
                if Weak::ptr_eq(&via, &self.self_weak) {
                    // Already scoped to this connection.
                    match target {
                        CallTarget::Import(id) => CapRef::Import(id),
                        CallTarget::PromisedAnswer { question, ops } => {
                            CapRef::Answer { question, ops }
                        }
                    }
                } else {
                    let id = self.exports.push(Export {
                        refcount: 0,
                        kind: ExportKind::Remote {
                            via,
                            target,
                            is_promise,
                        },
                    });
                    CapRef::Export(id)
                }
            }
        }
    }

    /// Rewrites a call target through any resolution that has arrived,
    /// and reports the embargo the call must wait on, if any.
    fn effective_target(&mut self, target: CallTarget) -> (CallTarget, Option<EmbargoId>) {
        if let CallTarget::Import(id) = target {
            if let Some(import) = self.imports.get_mut(id) {
                import.used_for_calls = true;
                if let Some(embargo) = import.embargo {
                    return (CallTarget::Import(id), Some(embargo));
                }
                if let Some(resolved) = import.resolved.clone() {
                    match resolved {
                        CapRef::Import(other) if other != id => {
                            return self.effective_target(CallTarget::Import(other));
                        }
                        CapRef::Answer { question, ops } => {
                            return (CallTarget::PromisedAnswer { question, ops }, None);
                        }
                        _ => {}
                    }
                }
            }
        }
        (target, None)
    }

    // ---- reference counting ----

    fn release_import(&mut self, import_id: ImportId, count: u32) -> Result<()> {
        let Some(import) = self.imports.get_mut(import_id) else {
            return Err(Error::failed(format!("unknown import {import_id}")));
        };
        let count = count.min(import.refcount);
        import.refcount -= count;
        if import.refcount == 0 {
            // All references we ever received go back in one message, so
            // the remote's export drops to zero.
            let total = import.total_received;
            self.imports.remove(import_id);
            self.send_release(import_id, total)?;
        }
        Ok(())
    }

    fn release_export(&mut self, export_id: ExportId, count: u32) -> Result<Vec<Action>> {
        let Some(export) = self.exports.get_mut(export_id) else {
            return Err(Error::failed(format!(
                "release names unknown export {export_id}"
            )));
        };
        if count > export.refcount {
            return Err(Error::failed(format!(
                "released {count} references to export {export_id}, which has {}",
                export.refcount
            )));
        }
        export.refcount -= count;
        if export.refcount > 0 {
            return Ok(Vec::new());
        }
        let export = self.exports.erase(export_id).expect("present above");
        let mut actions = Vec::new();
        match export.kind {
            ExportKind::Server(server) => {
                let key = Rc::as_ptr(&server) as usize;
                self.exports_by_server.remove(&key);
            }
            ExportKind::Remote { via, target, .. } => {
                if let CallTarget::Import(import) = target {
                    actions.push(Action::CrossPeerRelease { via, import });
                }
            }
        }
        Ok(actions)
    }

    // ---- shutdown ----

    /// When a shutdown is pending and the question table has drained,
    /// close the transport and hand back the completion callback.
    fn maybe_complete_shutdown(&mut self) -> Option<Action> {
        if !self.shutting_down || self.dead.is_some() {
            return None;
        }
        if !self.questions.is_empty() {
            return None;
        }
        let callback = self.shutdown_callback.take()?;
        self.flush();
        self.transport.close();
        self.dead = Some(Error::disconnected("peer shut down"));
        Some(Action::ShutdownComplete { callback })
    }
}

impl Embargo {
    fn queue_into_iter(mut self) -> Vec<Vec<u8>> {
        self.queue.drain()
    }
}

/// The forwarding policy of `payload::forward_descriptor`, applied when a
/// payload received on `src` is re-sent over `dst`: capabilities whose
/// host is reachable through the destination connection short-circuit to
/// `receiverHosted`/`receiverAnswer`, everything else becomes a proxy
/// export on `dst` whose calls tail-forward.
struct ConnectionRemapper<'a> {
    src: &'a Peer,
    dst: &'a Peer,
}

impl ConnectionRemapper<'_> {
    /// Emits the destination-side descriptor for a capability reachable
    /// through `via`. `take_ref` holds an extra reference on the
    /// underlying import for the proxy's lifetime; callers that already
    /// accounted for the inbound descriptor's reference pass false.
    fn remote_descriptor(
        &mut self,
        via: Weak<RefCell<PeerState>>,
        target: CallTarget,
        is_promise: bool,
        take_ref: bool,
    ) -> Descriptor {
        let mut dst = self.dst.state.borrow_mut();
        if Weak::ptr_eq(&via, &dst.self_weak) {
            return match target {
                CallTarget::Import(id) => Descriptor::ReceiverHosted(id),
                CallTarget::PromisedAnswer { question, ops } => {
                    Descriptor::ReceiverAnswer { question, ops }
                }
            };
        }
        if take_ref {
            if let (CallTarget::Import(id), Some(state)) = (&target, via.upgrade()) {
                state.borrow_mut().note_import_ref(*id);
            }
        }
        let id = dst.exports.push(Export {
            refcount: 1,
            kind: ExportKind::Remote {
                via,
                target,
                is_promise,
            },
        });
        if is_promise {
            Descriptor::SenderPromise(id)
        } else {
            Descriptor::SenderHosted(id)
        }
    }

    fn server_descriptor(&mut self, server: Rc<Dispatcher>) -> Descriptor {
        let mut dst = self.dst.state.borrow_mut();
        Descriptor::SenderHosted(dst.export_server(server))
    }

    /// Maps a capability handle scoped to the source connection into a
    /// descriptor for the destination. Handles that cannot cross (broken
    /// caps, pending own answers) forward as the null capability, so only
    /// dependent calls fail.
    fn capref_descriptor(&mut self, cap: CapRef) -> Descriptor {
        let vatcap = {
            let mut src = self.src.state.borrow_mut();
            src.capref_to_vatcap(cap)
        };
        match vatcap {
            Ok(VatCap::Server(d)) => self.server_descriptor(d),
            Ok(VatCap::Remote {
                via,
                target,
                is_promise,
            }) => self.remote_descriptor(via, target, is_promise, true),
            Err(_) => Descriptor::None,
        }
    }
}

impl payload::Remapper for ConnectionRemapper<'_> {
    fn remap_hosted(&mut self, import_id: u32, promise: bool) -> Result<Descriptor> {
        let via = {
            let mut src = self.src.state.borrow_mut();
            src.note_import_ref(import_id);
            src.self_weak.clone()
        };
        Ok(self.remote_descriptor(via, CallTarget::Import(import_id), promise, false))
    }

    fn remap_own_export(&mut self, export_id: u32) -> Result<Descriptor> {
        {
            let src = self.src.state.borrow();
            if src.exports.get(export_id).is_none() {
                return Err(Error::failed(format!(
                    "forwarded receiverHosted names unknown export {export_id}"
                )));
            }
        }
        Ok(self.capref_descriptor(CapRef::Export(export_id)))
    }

    fn remap_answer(&mut self, question: u32, ops: &[PipelineOp]) -> Result<Descriptor> {
        let results = {
            let src = self.src.state.borrow();
            match src.answers.get(question) {
                Some(answer) if answer.returned => answer.results.clone(),
                _ => None,
            }
        };
        Ok(match results {
            Some(results) => match PeerState::resolve_ops(&results, ops) {
                Ok(cap) => self.capref_descriptor(cap),
                Err(_) => Descriptor::None,
            },
            // A pending or failed answer forwards as null.
            None => Descriptor::None,
        })
    }

    fn remap_vine(&mut self, vine_id: u32) -> Result<Descriptor> {
        // No direct three-party path from here: fall back to routing
        // through the vine. The receiver-answer form only arises through
        // the same-connection shortcut, when the vine's host is the
        // destination itself.
        let via = {
            let mut src = self.src.state.borrow_mut();
            src.note_import_ref(vine_id);
            src.self_weak.clone()
        };
        Ok(self.remote_descriptor(via, CallTarget::Import(vine_id), false, false))
    }
}
