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

//! End-to-end tests driving peers over deterministic in-memory pipes.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bosun::message::{self, ReaderOptions};
use bosun::{Error, ErrorKind};
use bosun_rpc::protocol::{
    self, bootstrap as bootstrap_schema, call as call_schema, envelope, message_target,
    payload as payload_schema, resolve as resolve_schema, ret, third_party_answer, MessageTag,
};
use bosun_rpc::{
    CallTarget, CapRef, Dispatcher, Peer, PeerOptions, PipelineOp, ResultsBuilder, ReturnResult,
    Ticket, Transport, VatShared,
};

// ---------------------------------------------------------------------------
// Harness: queue-backed transports pumped by hand.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SharedQueue {
    bytes: RefCell<VecDeque<Vec<u8>>>,
}

struct QueueTransport {
    queue: Rc<SharedQueue>,
}

impl Transport for QueueTransport {
    fn write(&mut self, bytes: &[u8]) -> bosun::Result<()> {
        self.queue.bytes.borrow_mut().push_back(bytes.to_vec());
        Ok(())
    }

    fn close(&mut self) {}
}

struct Link {
    left: Peer,
    right: Peer,
    left_out: Rc<SharedQueue>,
    right_out: Rc<SharedQueue>,
}

fn new_vat() -> Rc<RefCell<VatShared>> {
    Rc::new(RefCell::new(VatShared::default()))
}

fn link_with_vats(left_vat: Rc<RefCell<VatShared>>, right_vat: Rc<RefCell<VatShared>>) -> Link {
    let left_out = Rc::new(SharedQueue::default());
    let right_out = Rc::new(SharedQueue::default());
    let left = Peer::with_vat(
        Box::new(QueueTransport {
            queue: left_out.clone(),
        }),
        PeerOptions::default(),
        left_vat,
    );
    let right = Peer::with_vat(
        Box::new(QueueTransport {
            queue: right_out.clone(),
        }),
        PeerOptions::default(),
        right_vat,
    );
    Link {
        left,
        right,
        left_out,
        right_out,
    }
}

fn link() -> Link {
    link_with_vats(new_vat(), new_vat())
}

fn deliver(from: &Rc<SharedQueue>, to: &Peer) -> usize {
    let pending: Vec<Vec<u8>> = from.bytes.borrow_mut().drain(..).collect();
    for bytes in &pending {
        to.handle_bytes(bytes).expect("peer rejected a frame");
    }
    pending.len()
}

impl Link {
    fn pump(&self) {
        loop {
            let moved = deliver(&self.left_out, &self.right) + deliver(&self.right_out, &self.left);
            if moved == 0 {
                break;
            }
        }
    }
}

fn pump_all(links: &[&Link]) {
    loop {
        let mut moved = 0;
        for l in links {
            moved += deliver(&l.left_out, &l.right) + deliver(&l.right_out, &l.left);
        }
        if moved == 0 {
            break;
        }
    }
}

/// Builds one raw frame for hand-crafted protocol inputs.
fn craft<F>(build: F) -> Vec<u8>
where
    F: FnOnce(&mut message::Builder) -> bosun::Result<()>,
{
    let mut builder = message::Builder::new_default();
    build(&mut builder).expect("crafting a frame");
    builder.to_bytes()
}

/// Drains and parses a peer's raw outbound frames.
fn parse_frames(queue: &Rc<SharedQueue>) -> Vec<bosun_rpc::Frame> {
    queue
        .bytes
        .borrow_mut()
        .drain(..)
        .map(|bytes| bosun::serialize::read_message(&bytes[..], ReaderOptions::new()).unwrap())
        .collect()
}

fn frame_tag(frame: &bosun_rpc::Frame) -> MessageTag {
    let root = frame.get_root_struct().unwrap();
    protocol::read_envelope(&root).unwrap().unwrap().0
}

// ---------------------------------------------------------------------------
// Test services
// ---------------------------------------------------------------------------

const CALCULATOR: u64 = 0xbeef_cafe_0000_0001;
const ADD: u16 = 0;
const ECHO_SELF: u16 = 1;
const LOG: u16 = 2;

const CHAIN: u64 = 0xbeef_cafe_0000_0002;
const NEXT: u16 = 0;
const RESOLVE: u16 = 1;

fn calculator(log: Rc<RefCell<Vec<u32>>>) -> Rc<Dispatcher> {
    let shared: Rc<RefCell<Option<Rc<Dispatcher>>>> = Rc::new(RefCell::new(None));
    let shared_clone = shared.clone();
    let dispatcher = Rc::new(
        Dispatcher::new()
            .on(CALCULATOR, ADD, |_peer, ctx| {
                let params = ctx.params.content()?.get_struct()?;
                let (a, b) = (params.get_u32(0), params.get_u32(4));
                let mut result = ctx.results().content().init_struct(1, 0);
                result.set_u32(0, a + b);
                Ok(())
            })
            .on(CALCULATOR, ECHO_SELF, move |_peer, ctx| {
                let me = shared_clone
                    .borrow()
                    .clone()
                    .ok_or_else(|| Error::failed("service not wired"))?;
                ctx.results().set_root_cap(CapRef::Local(me));
                Ok(())
            })
            .on(CALCULATOR, LOG, move |_peer, ctx| {
                let marker = ctx.params.content()?.get_struct()?.get_u32(0);
                log.borrow_mut().push(marker);
                ctx.results().content().init_struct(0, 0);
                Ok(())
            }),
    );
    *shared.borrow_mut() = Some(dispatcher.clone());
    dispatcher
}

/// A chain service whose `next` defers its return through a ticket.
fn chain_service(
    ticket_slot: Rc<RefCell<Option<Ticket>>>,
    value: u64,
) -> (Rc<Dispatcher>, Rc<Dispatcher>) {
    let tail = Rc::new(Dispatcher::new().on(CHAIN, RESOLVE, move |_peer, ctx| {
        let mut result = ctx.results().content().init_struct(1, 0);
        result.set_u64(0, value);
        Ok(())
    }));
    let head = {
        let slot = ticket_slot.clone();
        Rc::new(Dispatcher::new().on(CHAIN, NEXT, move |_peer, ctx| {
            *slot.borrow_mut() = ctx.take_ticket();
            Ok(())
        }))
    };
    (head, tail)
}

fn expect_import(cap: Option<CapRef>) -> u32 {
    match cap {
        Some(CapRef::Import(id)) => id,
        other => panic!("expected an import, got {other:?}"),
    }
}

fn set_u32_params(a: u32, b: u32) -> impl FnOnce(&mut ResultsBuilder) -> bosun::Result<()> {
    move |params| {
        let mut s = params.content().init_struct(1, 0);
        s.set_u32(0, a);
        s.set_u32(4, b);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn bootstrap_and_call() {
    let l = link();
    l.left.set_bootstrap(calculator(Default::default()));

    let cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let cap_clone = cap.clone();
    l.right
        .bootstrap(Box::new(move |_peer, result| {
            match result {
                ReturnResult::Results(resp) => *cap_clone.borrow_mut() = resp.cap(0),
                _ => panic!("bootstrap failed"),
            }
            false
        }))
        .unwrap();
    l.pump();

    let import = expect_import(cap.borrow_mut().take());
    let sum: Rc<Cell<Option<u32>>> = Default::default();
    let sum_clone = sum.clone();
    l.right
        .call(
            CallTarget::Import(import),
            CALCULATOR,
            ADD,
            set_u32_params(40, 2),
            Box::new(move |_peer, result| {
                match result {
                    ReturnResult::Results(resp) => {
                        let s = resp.content().unwrap().get_struct().unwrap();
                        sum_clone.set(Some(s.get_u32(0)));
                    }
                    ReturnResult::Exception(e) => panic!("call failed: {e}"),
                    _ => panic!("unexpected return"),
                }
                false
            }),
        )
        .unwrap();
    l.pump();
    assert_eq!(sum.get(), Some(42));

    // Drop the capability; every table drains to zero on both sides.
    l.right.release(import, 1).unwrap();
    l.pump();
    let left = l.left.table_counts();
    let right = l.right.table_counts();
    assert_eq!(left.exports, 0);
    assert_eq!(left.answers, 0);
    assert_eq!(right.imports, 0);
    assert_eq!(right.questions, 0);
}

#[test]
fn bootstrap_without_server_returns_exception() {
    let l = link();
    let failed: Rc<Cell<bool>> = Default::default();
    let failed_clone = failed.clone();
    l.right
        .bootstrap(Box::new(move |_peer, result| {
            if let ReturnResult::Exception(e) = result {
                assert_eq!(e.kind, ErrorKind::Failed);
                failed_clone.set(true);
            }
            false
        }))
        .unwrap();
    l.pump();
    assert!(failed.get());
}

#[test]
fn handler_error_becomes_return_exception() {
    let l = link();
    l.left.set_bootstrap(Rc::new(Dispatcher::new().on(
        CALCULATOR,
        ADD,
        |_peer, _ctx| Err(Error::overloaded("busy")),
    )));

    let cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let cap_clone = cap.clone();
    l.right
        .bootstrap(Box::new(move |_peer, result| {
            if let ReturnResult::Results(resp) = result {
                *cap_clone.borrow_mut() = resp.cap(0);
            }
            false
        }))
        .unwrap();
    l.pump();
    let import = expect_import(cap.borrow_mut().take());

    let got: Rc<Cell<Option<ErrorKind>>> = Default::default();
    let got_clone = got.clone();
    l.right
        .call(
            CallTarget::Import(import),
            CALCULATOR,
            ADD,
            set_u32_params(1, 2),
            Box::new(move |_peer, result| {
                if let ReturnResult::Exception(e) = result {
                    got_clone.set(Some(e.kind));
                }
                false
            }),
        )
        .unwrap();
    l.pump();
    assert_eq!(got.get(), Some(ErrorKind::Overloaded));
}

#[test]
fn missing_method_becomes_unimplemented_exception() {
    let l = link();
    l.left.set_bootstrap(calculator(Default::default()));

    let cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let cap_clone = cap.clone();
    l.right
        .bootstrap(Box::new(move |_peer, result| {
            if let ReturnResult::Results(resp) = result {
                *cap_clone.borrow_mut() = resp.cap(0);
            }
            false
        }))
        .unwrap();
    l.pump();
    let import = expect_import(cap.borrow_mut().take());

    let got: Rc<Cell<Option<ErrorKind>>> = Default::default();
    let got_clone = got.clone();
    l.right
        .call(
            CallTarget::Import(import),
            CALCULATOR,
            99,
            |_| Ok(()),
            Box::new(move |_peer, result| {
                if let ReturnResult::Exception(e) = result {
                    got_clone.set(Some(e.kind));
                }
                false
            }),
        )
        .unwrap();
    l.pump();
    assert_eq!(got.get(), Some(ErrorKind::Unimplemented));
}

#[test]
fn promise_pipeline_dispatches_in_send_order() {
    let l = link();
    let ticket_slot: Rc<RefCell<Option<Ticket>>> = Default::default();
    let (head, tail) = chain_service(ticket_slot.clone(), 7777);
    l.left.set_bootstrap(head);

    let cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let cap_clone = cap.clone();
    l.right
        .bootstrap(Box::new(move |_peer, result| {
            if let ReturnResult::Results(resp) = result {
                *cap_clone.borrow_mut() = resp.cap(0);
            }
            false
        }))
        .unwrap();
    l.pump();
    let import = expect_import(cap.borrow_mut().take());

    let order: Rc<RefCell<Vec<&'static str>>> = Default::default();

    // First call: next(), whose return is deferred on the server.
    let o1 = order.clone();
    let next_question = l
        .right
        .call(
            CallTarget::Import(import),
            CHAIN,
            NEXT,
            |_| Ok(()),
            Box::new(move |_peer, result| {
                assert!(matches!(result, ReturnResult::Results(_)));
                o1.borrow_mut().push("next");
                false
            }),
        )
        .unwrap();

    // Second call immediately targets the promised link from the first.
    let o2 = order.clone();
    let value: Rc<Cell<Option<u64>>> = Default::default();
    let value_clone = value.clone();
    l.right
        .call(
            CallTarget::PromisedAnswer {
                question: next_question,
                ops: vec![PipelineOp::GetPointerField(0)],
            },
            CHAIN,
            RESOLVE,
            |_| Ok(()),
            Box::new(move |_peer, result| {
                match result {
                    ReturnResult::Results(resp) => {
                        let s = resp.content().unwrap().get_struct().unwrap();
                        value_clone.set(Some(s.get_u64(0)));
                    }
                    _ => panic!("resolve failed"),
                }
                o2.borrow_mut().push("resolve");
                false
            }),
        )
        .unwrap();

    // Both calls cross; the pipelined one parks on the pending answer.
    l.pump();
    assert!(order.borrow().is_empty());

    // The deferred next() now completes: the parked call replays, and the
    // two returns arrive in send order.
    let ticket = ticket_slot.borrow_mut().take().expect("server got the call");
    ticket
        .send_results(|results| {
            let index = results.add_cap(CapRef::Local(tail));
            let mut s = results.content().init_struct(0, 1);
            s.set_capability(0, index)?;
            Ok(())
        })
        .unwrap();
    l.pump();

    assert_eq!(*order.borrow(), vec!["next", "resolve"]);
    assert_eq!(value.get(), Some(7777));
}

#[test]
fn canceled_question_drops_its_return() {
    let l = link();
    let ticket_slot: Rc<RefCell<Option<Ticket>>> = Default::default();
    let (head, _tail) = chain_service(ticket_slot.clone(), 0);
    l.left.set_bootstrap(head);

    let cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let cap_clone = cap.clone();
    l.right
        .bootstrap(Box::new(move |_peer, result| {
            if let ReturnResult::Results(resp) = result {
                *cap_clone.borrow_mut() = resp.cap(0);
            }
            false
        }))
        .unwrap();
    l.pump();
    let import = expect_import(cap.borrow_mut().take());

    let fired: Rc<Cell<bool>> = Default::default();
    let fired_clone = fired.clone();
    let question = l
        .right
        .call(
            CallTarget::Import(import),
            CHAIN,
            NEXT,
            |_| Ok(()),
            Box::new(move |_peer, _result| {
                fired_clone.set(true);
                false
            }),
        )
        .unwrap();
    l.pump();

    // Cancel while the server still holds the ticket.
    l.right.finish(question, true).unwrap();
    l.pump();

    // The server's deferred completion lands on a dead answer: no-op.
    let ticket = ticket_slot.borrow_mut().take().expect("server got the call");
    ticket.send_results(|_| Ok(())).unwrap();
    l.pump();

    assert!(!fired.get());
    assert_eq!(l.right.table_counts().questions, 0);
    assert_eq!(l.left.table_counts().answers, 0);
}

#[test]
fn export_dedup_and_refcounts_drain_to_zero() {
    let l = link();
    l.left.set_bootstrap(calculator(Default::default()));

    let cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let cap_clone = cap.clone();
    l.right
        .bootstrap(Box::new(move |_peer, result| {
            if let ReturnResult::Results(resp) = result {
                *cap_clone.borrow_mut() = resp.cap(0);
            }
            false
        }))
        .unwrap();
    l.pump();
    let import = expect_import(cap.borrow_mut().take());

    // echoSelf returns the same server; the export table must reuse the
    // same id rather than grow.
    let echoed: Rc<RefCell<Option<CapRef>>> = Default::default();
    let echoed_clone = echoed.clone();
    l.right
        .call(
            CallTarget::Import(import),
            CALCULATOR,
            ECHO_SELF,
            |_| Ok(()),
            Box::new(move |_peer, result| {
                if let ReturnResult::Results(resp) = result {
                    *echoed_clone.borrow_mut() = resp.cap(0);
                }
                false
            }),
        )
        .unwrap();
    l.pump();
    let echoed_import = expect_import(echoed.borrow_mut().take());
    assert_eq!(echoed_import, import);
    assert_eq!(l.left.table_counts().exports, 1);

    // Two references were received in total; one release covers both.
    l.right.release(import, 2).unwrap();
    l.pump();
    assert_eq!(l.left.table_counts().exports, 0);
    assert_eq!(l.right.table_counts().imports, 0);
}

#[test]
fn unknown_message_tag_is_echoed_as_unimplemented() {
    let l = link();
    let bytes = craft(|b| {
        let mut root = b.init_root(envelope::DATA_WORDS, envelope::PTR_WORDS);
        root.set_u16(envelope::WHICH, 333);
        Ok(())
    });
    l.left.handle_bytes(&bytes).unwrap();

    let frames = parse_frames(&l.left_out);
    assert_eq!(frames.len(), 1);
    let root = frames[0].get_root_struct().unwrap();
    assert_eq!(frame_tag(&frames[0]), MessageTag::Unimplemented);
    // The original message rides along in the body.
    let original = root.get_struct(envelope::BODY).unwrap();
    assert_eq!(original.get_u16(envelope::WHICH), 333);
}

#[test]
fn unknown_question_in_return_aborts() {
    let l = link();
    let bytes = craft(|b| {
        let mut body =
            protocol::init_message(b, MessageTag::Return, ret::DATA_WORDS, ret::PTR_WORDS)?;
        body.set_u32(ret::ANSWER_ID, 555);
        body.set_u16(ret::WHICH, ret::CANCELED);
        Ok(())
    });
    assert!(l.left.handle_bytes(&bytes).is_err());
    let frames = parse_frames(&l.left_out);
    assert_eq!(frames.len(), 1);
    assert_eq!(frame_tag(&frames[0]), MessageTag::Abort);
    // The peer is dead: further operations fail.
    assert!(l.left.bootstrap(Box::new(|_, _| false)).is_err());
}

#[test]
fn send_results_to_yourself_answers_results_sent_elsewhere() {
    let l = link();
    l.left.set_bootstrap(calculator(Default::default()));

    // Bootstrap to force export 0 into existence.
    l.left
        .handle_bytes(&craft(|b| {
            let mut body = protocol::init_message(
                b,
                MessageTag::Bootstrap,
                bootstrap_schema::DATA_WORDS,
                bootstrap_schema::PTR_WORDS,
            )?;
            body.set_u32(bootstrap_schema::QUESTION_ID, 0);
            Ok(())
        }))
        .unwrap();
    let _ = parse_frames(&l.left_out);

    l.left
        .handle_bytes(&craft(|b| {
            let mut body = protocol::init_message(
                b,
                MessageTag::Call,
                call_schema::DATA_WORDS,
                call_schema::PTR_WORDS,
            )?;
            body.set_u32(call_schema::QUESTION_ID, 1);
            body.set_u64(call_schema::INTERFACE_ID, CALCULATOR);
            body.set_u16(call_schema::METHOD_ID, ADD);
            body.set_u16(call_schema::SEND_RESULTS_TO, call_schema::TO_YOURSELF);
            let mut target = body.init_struct(
                call_schema::TARGET,
                message_target::DATA_WORDS,
                message_target::PTR_WORDS,
            )?;
            target.set_u16(message_target::WHICH, message_target::TAG_IMPORTED_CAP);
            target.set_u32(message_target::IMPORTED_CAP, 0);
            drop(target);
            let mut payload = body.init_struct(
                call_schema::PARAMS,
                payload_schema::DATA_WORDS,
                payload_schema::PTR_WORDS,
            )?;
            let mut args = payload.init_struct(payload_schema::CONTENT, 1, 0)?;
            args.set_u32(0, 20);
            args.set_u32(4, 22);
            Ok(())
        }))
        .unwrap();

    let frames = parse_frames(&l.left_out);
    assert_eq!(frames.len(), 1);
    let root = frames[0].get_root_struct().unwrap();
    assert_eq!(frame_tag(&frames[0]), MessageTag::Return);
    let body = root.get_struct(envelope::BODY).unwrap();
    assert_eq!(body.get_u32(ret::ANSWER_ID), 1);
    assert_eq!(body.get_u16(ret::WHICH), ret::RESULTS_SENT_ELSEWHERE);
}

#[test]
fn take_from_other_question_reuses_a_retained_response() {
    let l = link();
    l.left.set_bootstrap(calculator(Default::default()));

    // First question: retain the response.
    let cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let cap_clone = cap.clone();
    let retained = l
        .right
        .bootstrap(Box::new(move |_peer, result| {
            if let ReturnResult::Results(resp) = result {
                *cap_clone.borrow_mut() = resp.cap(0);
            }
            true
        }))
        .unwrap();
    l.pump();
    let _import = expect_import(cap.borrow_mut().take());

    // Second question never really goes anywhere; we forge its Return as
    // takeFromOtherQuestion naming the retained one.
    let got_cap: Rc<Cell<bool>> = Default::default();
    let got_clone = got_cap.clone();
    let q2 = l
        .right
        .call(
            CallTarget::Import(0),
            CALCULATOR,
            ADD,
            |_| Ok(()),
            Box::new(move |_peer, result| {
                if let ReturnResult::Results(resp) = result {
                    got_clone.set(resp.cap_count() == 1);
                }
                false
            }),
        )
        .unwrap();
    // Swallow the real outbound call; answer it by reference instead.
    let _ = parse_frames(&l.right_out);
    l.right
        .handle_bytes(&craft(|b| {
            let mut body =
                protocol::init_message(b, MessageTag::Return, ret::DATA_WORDS, ret::PTR_WORDS)?;
            body.set_u32(ret::ANSWER_ID, q2);
            body.set_u16(ret::WHICH, ret::TAKE_FROM_OTHER_QUESTION_TAG);
            body.set_u32(ret::TAKE_FROM_OTHER_QUESTION, retained);
            Ok(())
        }))
        .unwrap();
    assert!(got_cap.get());

    // Open question (b): naming a canceled/unknown question yields an
    // exception.
    let got_err: Rc<Cell<Option<ErrorKind>>> = Default::default();
    let err_clone = got_err.clone();
    let q3 = l
        .right
        .call(
            CallTarget::Import(0),
            CALCULATOR,
            ADD,
            |_| Ok(()),
            Box::new(move |_peer, result| {
                if let ReturnResult::Exception(e) = result {
                    err_clone.set(Some(e.kind));
                }
                false
            }),
        )
        .unwrap();
    let _ = parse_frames(&l.right_out);
    l.right
        .handle_bytes(&craft(|b| {
            let mut body =
                protocol::init_message(b, MessageTag::Return, ret::DATA_WORDS, ret::PTR_WORDS)?;
            body.set_u32(ret::ANSWER_ID, q3);
            body.set_u16(ret::WHICH, ret::TAKE_FROM_OTHER_QUESTION_TAG);
            body.set_u32(ret::TAKE_FROM_OTHER_QUESTION, 444);
            Ok(())
        }))
        .unwrap();
    assert_eq!(got_err.get(), Some(ErrorKind::Failed));
}

#[test]
fn resolve_triggers_loopback_embargo_and_preserves_order() {
    let log: Rc<RefCell<Vec<u32>>> = Default::default();
    let l = link();
    l.left.set_bootstrap(calculator(log.clone()));

    let cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let cap_clone = cap.clone();
    l.right
        .bootstrap(Box::new(move |_peer, result| {
            if let ReturnResult::Results(resp) = result {
                *cap_clone.borrow_mut() = resp.cap(0);
            }
            false
        }))
        .unwrap();
    l.pump();
    let import = expect_import(cap.borrow_mut().take());

    let log_call = |marker: u32| {
        let l = &l;
        l.right
            .call(
                CallTarget::Import(import),
                CALCULATOR,
                LOG,
                move |params| {
                    let mut s = params.content().init_struct(1, 0);
                    s.set_u32(0, marker);
                    Ok(())
                },
                Box::new(|_, _| false),
            )
            .unwrap();
    };

    log_call(1);
    l.pump();
    assert_eq!(*log.borrow(), vec![1]);

    // The import resolves (to itself, via a forged Resolve); because it
    // has carried calls, the peer must embargo further sends until the
    // loopback echoes.
    l.right
        .handle_bytes(&craft(|b| {
            let mut body = protocol::init_message(
                b,
                MessageTag::Resolve,
                resolve_schema::DATA_WORDS,
                resolve_schema::PTR_WORDS,
            )?;
            body.set_u32(resolve_schema::PROMISE_ID, import);
            body.set_u16(resolve_schema::WHICH, resolve_schema::CAP);
            let mut desc = body.init_struct(
                resolve_schema::BODY,
                protocol::cap_descriptor::DATA_WORDS,
                protocol::cap_descriptor::PTR_WORDS,
            )?;
            desc.set_u16(
                protocol::cap_descriptor::WHICH,
                protocol::cap_descriptor::SENDER_HOSTED,
            );
            desc.set_u32(protocol::cap_descriptor::ID, import);
            Ok(())
        }))
        .unwrap();

    log_call(2);
    log_call(3);

    // Only the senderLoopback crosses; the two calls stay embargoed.
    deliver(&l.right_out, &l.left);
    assert_eq!(*log.borrow(), vec![1]);

    // The echo releases them in insertion order.
    l.pump();
    assert_eq!(*log.borrow(), vec![1, 2, 3]);
}

#[test]
fn three_party_provide_accept_with_embargoed_pipeline() {
    let log: Rc<RefCell<Vec<u32>>> = Default::default();
    let vat_a = new_vat();
    let vat_b = new_vat();
    let vat_x = new_vat();

    // Link 1: A <-> B. Link 2: X <-> B. B's two peers share a vat.
    let ab = link_with_vats(vat_a.clone(), vat_b.clone());
    let xb = link_with_vats(vat_x.clone(), vat_b.clone());
    let (a, b_from_a) = (&ab.left, &ab.right);
    let (x, _b_from_x) = (&xb.left, &xb.right);
    b_from_a.set_bootstrap(calculator(log.clone()));

    // A obtains C from B.
    let cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let cap_clone = cap.clone();
    a.bootstrap(Box::new(move |_peer, result| {
        if let ReturnResult::Results(resp) = result {
            *cap_clone.borrow_mut() = resp.cap(0);
        }
        false
    }))
    .unwrap();
    pump_all(&[&ab, &xb]);
    let c = expect_import(cap.borrow_mut().take());

    // A provides C to X under an agreed provision key.
    let provided: Rc<Cell<bool>> = Default::default();
    let provided_clone = provided.clone();
    a.provide(
        CallTarget::Import(c),
        b"prov-7",
        Box::new(move |_peer, result| {
            provided_clone.set(matches!(result, ReturnResult::Results(_)));
            false
        }),
    )
    .unwrap();
    pump_all(&[&ab, &xb]);

    // X accepts with an embargo and immediately pipelines two calls on
    // the accept answer, before any disembargo.
    let accepted: Rc<RefCell<Option<CapRef>>> = Default::default();
    let accepted_clone = accepted.clone();
    let accept_q = x
        .accept(
            b"prov-7",
            true,
            Box::new(move |_peer, result| {
                if let ReturnResult::Results(resp) = result {
                    *accepted_clone.borrow_mut() = resp.cap(0);
                }
                false
            }),
        )
        .unwrap();
    for marker in [101, 102] {
        x.call(
            CallTarget::PromisedAnswer {
                question: accept_q,
                ops: vec![],
            },
            CALCULATOR,
            LOG,
            move |params| {
                let mut s = params.content().init_struct(1, 0);
                s.set_u32(0, marker);
                Ok(())
            },
            Box::new(|_, _| false),
        )
        .unwrap();
    }
    pump_all(&[&ab, &xb]);

    // The accept returned (X holds the cap, A's provide completed), but
    // the pipelined calls are still embargoed on B.
    assert!(provided.get());
    assert!(matches!(
        accepted.borrow().as_ref(),
        Some(CapRef::Import(_))
    ));
    assert!(log.borrow().is_empty());

    // The disembargo releases them in X's send order.
    x.disembargo_accept(accept_q).unwrap();
    pump_all(&[&ab, &xb]);
    assert_eq!(*log.borrow(), vec![101, 102]);
}

#[test]
fn accepted_capability_is_callable_across_connections() {
    let log: Rc<RefCell<Vec<u32>>> = Default::default();
    let vat_b = new_vat();
    let ab = link_with_vats(new_vat(), vat_b.clone());
    let xb = link_with_vats(new_vat(), vat_b.clone());
    let (a, b_from_a) = (&ab.left, &ab.right);
    let x = &xb.left;
    b_from_a.set_bootstrap(calculator(log.clone()));

    // A gets C from B and provides it to X; X accepts (no embargo) and
    // then calls through its accepted capability. The call crosses X->B
    // and dispatches on B's service.
    let cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let cap_clone = cap.clone();
    a.bootstrap(Box::new(move |_peer, result| {
        if let ReturnResult::Results(resp) = result {
            *cap_clone.borrow_mut() = resp.cap(0);
        }
        false
    }))
    .unwrap();
    pump_all(&[&ab, &xb]);
    let c = expect_import(cap.borrow_mut().take());

    a.provide(CallTarget::Import(c), b"key", Box::new(|_, _| false))
        .unwrap();
    pump_all(&[&ab, &xb]);

    let accepted: Rc<RefCell<Option<CapRef>>> = Default::default();
    let accepted_clone = accepted.clone();
    x.accept(
        b"key",
        false,
        Box::new(move |_peer, result| {
            if let ReturnResult::Results(resp) = result {
                *accepted_clone.borrow_mut() = resp.cap(0);
            }
            false
        }),
    )
    .unwrap();
    pump_all(&[&ab, &xb]);
    let through = expect_import(accepted.borrow_mut().take());

    let sum: Rc<Cell<Option<u32>>> = Default::default();
    let sum_clone = sum.clone();
    x.call(
        CallTarget::Import(through),
        CALCULATOR,
        ADD,
        set_u32_params(30, 12),
        Box::new(move |_peer, result| {
            if let ReturnResult::Results(resp) = result {
                let s = resp.content().unwrap().get_struct().unwrap();
                sum_clone.set(Some(s.get_u32(0)));
            }
            false
        }),
    )
    .unwrap();
    pump_all(&[&ab, &xb]);
    assert_eq!(sum.get(), Some(42));
}

const GIVEBACK: u64 = 0xbeef_cafe_0000_0003;
const GIVE_BACK: u16 = 0;

#[test]
fn pipelined_resolution_to_an_import_tail_forwards() {
    // B's giveBack method returns whatever capability the caller passed
    // in. A pipelines a call on that promise before the return arrives;
    // on B the promise resolves to one of B's *imports* (a cap A hosts),
    // so B must tail-forward the pipelined call back to A and route the
    // return to the original caller.
    let l = link();
    l.left.set_bootstrap(Rc::new(Dispatcher::new().on(
        GIVEBACK,
        GIVE_BACK,
        |_peer, ctx| {
            let cap = ctx
                .params
                .cap(0)
                .ok_or_else(|| Error::failed("missing capability argument"))?;
            ctx.results().set_root_cap(cap);
            Ok(())
        },
    )));

    let log: Rc<RefCell<Vec<u32>>> = Default::default();
    let local_service = calculator(log.clone());

    let cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let cap_clone = cap.clone();
    l.right
        .bootstrap(Box::new(move |_peer, result| {
            if let ReturnResult::Results(resp) = result {
                *cap_clone.borrow_mut() = resp.cap(0);
            }
            false
        }))
        .unwrap();
    l.pump();
    let giver = expect_import(cap.borrow_mut().take());

    let q1 = l
        .right
        .call(
            CallTarget::Import(giver),
            GIVEBACK,
            GIVE_BACK,
            move |params| {
                let index = params.add_cap(CapRef::Local(local_service));
                let mut s = params.content().init_struct(0, 1);
                s.set_capability(0, index)?;
                Ok(())
            },
            Box::new(|_, _| false),
        )
        .unwrap();

    // The pipelined call also carries a capability argument, so the
    // forwarded call's descriptor table goes through the remap policy.
    let extra: Rc<Dispatcher> = Rc::new(Dispatcher::new());
    let logged: Rc<Cell<bool>> = Default::default();
    let logged_clone = logged.clone();
    l.right
        .call(
            CallTarget::PromisedAnswer {
                question: q1,
                ops: vec![],
            },
            CALCULATOR,
            LOG,
            move |params| {
                let index = params.add_cap(CapRef::Local(extra));
                let mut s = params.content().init_struct(1, 1);
                s.set_u32(0, 55);
                s.set_capability(0, index)?;
                Ok(())
            },
            Box::new(move |_peer, result| {
                logged_clone.set(matches!(result, ReturnResult::Results(_)));
                false
            }),
        )
        .unwrap();

    l.pump();
    assert!(logged.get());
    assert_eq!(*log.borrow(), vec![55]);
    // The forwarder took references on both inbound caps: the giveBack
    // argument and the forwarded call's argument.
    assert_eq!(l.left.table_counts().imports, 2);
}

#[test]
fn join_completes_when_all_parts_arrive() {
    let vat_b = new_vat();
    let ab = link_with_vats(new_vat(), vat_b.clone());
    let xb = link_with_vats(new_vat(), vat_b.clone());
    let (a, b_from_a) = (&ab.left, &ab.right);
    let x = &xb.left;
    b_from_a.set_bootstrap(calculator(Default::default()));
    xb.right.set_bootstrap(calculator(Default::default()));

    // Both joiners need a target capability on B.
    let a_cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let a_cap_clone = a_cap.clone();
    a.bootstrap(Box::new(move |_peer, result| {
        if let ReturnResult::Results(resp) = result {
            *a_cap_clone.borrow_mut() = resp.cap(0);
        }
        false
    }))
    .unwrap();
    let x_cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let x_cap_clone = x_cap.clone();
    x.bootstrap(Box::new(move |_peer, result| {
        if let ReturnResult::Results(resp) = result {
            *x_cap_clone.borrow_mut() = resp.cap(0);
        }
        false
    }))
    .unwrap();
    pump_all(&[&ab, &xb]);
    let a_import = expect_import(a_cap.borrow_mut().take());
    let x_import = expect_import(x_cap.borrow_mut().take());

    let a_done: Rc<Cell<bool>> = Default::default();
    let a_done_clone = a_done.clone();
    a.join(
        CallTarget::Import(a_import),
        9,
        2,
        0,
        Box::new(move |_peer, result| {
            a_done_clone.set(matches!(result, ReturnResult::Results(_)));
            false
        }),
    )
    .unwrap();
    pump_all(&[&ab, &xb]);
    // One part is not enough.
    assert!(!a_done.get());

    let x_done: Rc<Cell<bool>> = Default::default();
    let x_done_clone = x_done.clone();
    x.join(
        CallTarget::Import(x_import),
        9,
        2,
        1,
        Box::new(move |_peer, result| {
            x_done_clone.set(matches!(result, ReturnResult::Results(_)));
            false
        }),
    )
    .unwrap();
    pump_all(&[&ab, &xb]);
    assert!(a_done.get());
    assert!(x_done.get());
}

#[test]
fn join_part_count_mismatch_fails_every_part() {
    let vat_b = new_vat();
    let ab = link_with_vats(new_vat(), vat_b.clone());
    let xb = link_with_vats(new_vat(), vat_b.clone());
    let (a, b_from_a) = (&ab.left, &ab.right);
    let x = &xb.left;
    b_from_a.set_bootstrap(calculator(Default::default()));
    xb.right.set_bootstrap(calculator(Default::default()));

    let a_cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let a_cap_clone = a_cap.clone();
    a.bootstrap(Box::new(move |_peer, result| {
        if let ReturnResult::Results(resp) = result {
            *a_cap_clone.borrow_mut() = resp.cap(0);
        }
        false
    }))
    .unwrap();
    let x_cap: Rc<RefCell<Option<CapRef>>> = Default::default();
    let x_cap_clone = x_cap.clone();
    x.bootstrap(Box::new(move |_peer, result| {
        if let ReturnResult::Results(resp) = result {
            *x_cap_clone.borrow_mut() = resp.cap(0);
        }
        false
    }))
    .unwrap();
    pump_all(&[&ab, &xb]);
    let a_import = expect_import(a_cap.borrow_mut().take());
    let x_import = expect_import(x_cap.borrow_mut().take());

    let a_err: Rc<Cell<bool>> = Default::default();
    let a_err_clone = a_err.clone();
    a.join(
        CallTarget::Import(a_import),
        10,
        2,
        0,
        Box::new(move |_peer, result| {
            a_err_clone.set(matches!(result, ReturnResult::Exception(_)));
            false
        }),
    )
    .unwrap();
    let x_err: Rc<Cell<bool>> = Default::default();
    let x_err_clone = x_err.clone();
    x.join(
        CallTarget::Import(x_import),
        10,
        3,
        1,
        Box::new(move |_peer, result| {
            x_err_clone.set(matches!(result, ReturnResult::Exception(_)));
            false
        }),
    )
    .unwrap();
    pump_all(&[&ab, &xb]);
    assert!(a_err.get());
    assert!(x_err.get());
}

#[test]
fn third_party_answer_adoption_translates_answer_ids() {
    let l = link();
    let got: Rc<Cell<bool>> = Default::default();
    let got_clone = got.clone();
    let q = l
        .right
        .bootstrap(Box::new(move |_peer, result| {
            got_clone.set(matches!(result, ReturnResult::Results(_)));
            false
        }))
        .unwrap();
    let _ = parse_frames(&l.right_out);

    // The callee hands the answer to a third party...
    l.right
        .handle_bytes(&craft(|b| {
            let mut body =
                protocol::init_message(b, MessageTag::Return, ret::DATA_WORDS, ret::PTR_WORDS)?;
            body.set_u32(ret::ANSWER_ID, q);
            body.set_u16(ret::WHICH, ret::AWAIT_FROM_THIRD_PARTY);
            body.get_pointer(ret::BODY)?.set_data(b"completion-1")?;
            Ok(())
        }))
        .unwrap();
    assert!(!got.get());

    // ...which introduces itself with the completion key and its own
    // answer id...
    l.right
        .handle_bytes(&craft(|b| {
            let mut body = protocol::init_message(
                b,
                MessageTag::ThirdPartyAnswer,
                third_party_answer::DATA_WORDS,
                third_party_answer::PTR_WORDS,
            )?;
            body.set_u32(third_party_answer::ANSWER_ID, 77);
            body.get_pointer(third_party_answer::COMPLETION)?
                .set_data(b"completion-1")?;
            Ok(())
        }))
        .unwrap();
    assert!(!got.get());

    // ...and the real return under the adopted id reaches the original
    // question's callback.
    l.right
        .handle_bytes(&craft(|b| {
            let mut body =
                protocol::init_message(b, MessageTag::Return, ret::DATA_WORDS, ret::PTR_WORDS)?;
            body.set_u32(ret::ANSWER_ID, 77);
            body.set_u16(ret::WHICH, ret::RESULTS);
            body.init_struct(ret::BODY, payload_schema::DATA_WORDS, payload_schema::PTR_WORDS)?;
            Ok(())
        }))
        .unwrap();
    assert!(got.get());
}

#[test]
fn outbound_queue_limits_apply_backpressure() {
    struct GatedTransport {
        queue: Rc<SharedQueue>,
        open: Rc<Cell<bool>>,
    }
    impl Transport for GatedTransport {
        fn write(&mut self, bytes: &[u8]) -> bosun::Result<()> {
            if self.open.get() {
                self.queue.bytes.borrow_mut().push_back(bytes.to_vec());
                Ok(())
            } else {
                Err(Error::overloaded("transport busy"))
            }
        }
        fn close(&mut self) {}
    }

    let out = Rc::new(SharedQueue::default());
    let open = Rc::new(Cell::new(false));
    let peer = Peer::new(
        Box::new(GatedTransport {
            queue: out.clone(),
            open: open.clone(),
        }),
        PeerOptions::default(),
    );
    peer.set_limits(2, 0);

    peer.bootstrap(Box::new(|_, _| false)).unwrap();
    peer.bootstrap(Box::new(|_, _| false)).unwrap();
    assert_eq!(peer.outbound_count(), 2);
    let err = peer.bootstrap(Box::new(|_, _| false)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::QueueFull);

    // Once the transport unblocks, a flush drains the queue in order.
    open.set(true);
    peer.flush_outbound();
    assert_eq!(peer.outbound_count(), 0);
    assert_eq!(out.bytes.borrow().len(), 2);
}

#[test]
fn shutdown_waits_for_in_flight_questions() {
    let l = link();
    l.left.set_bootstrap(calculator(Default::default()));

    let done: Rc<Cell<bool>> = Default::default();
    let done_clone = done.clone();
    l.right.bootstrap(Box::new(|_, _| false)).unwrap();
    l.right.shutdown(Box::new(move || done_clone.set(true)));
    // The outstanding bootstrap question keeps the peer alive.
    assert!(!done.get());
    // New outbound calls are refused during the drain.
    assert!(l
        .right
        .call(CallTarget::Import(0), CALCULATOR, ADD, |_| Ok(()), Box::new(|_, _| false))
        .is_err());

    l.pump();
    assert!(done.get());
    // Idempotent re-entry.
    l.right.shutdown(Box::new(|| panic!("second shutdown callback")));
}
