mod common;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use broker_handle::codec::{MATCHTAG_NONE, NODEID_ANY, flags};
use broker_handle::{
    Error, Future, FutureError, FutureState, HandleBuilder, Message, MessageType, ReactorError,
    RpcFlags, RunFlags, RunOutcome, SendError,
};
use bytes::Bytes;
use proptest::prelude::*;

#[test]
fn test_submit_wait_returns_exact_payload() {
    let (handle, mut broker) = common::pair();
    let future = handle.submit(Bytes::from_static(b"{\"tasks\":[]}"), RpcFlags::NONE).unwrap();

    let request = broker.recv();
    assert_eq!(request.kind, MessageType::Request);
    assert_eq!(request.topic, "job-ingest.submit");
    assert_eq!(request.matchtag, future.match_tag());
    assert_eq!(&request.payload[..], b"{\"tasks\":[]}");

    broker.respond(&request, b"{\"id\":1234}");

    let payload = future.wait(-1.0).unwrap();
    assert_eq!(&payload[..], b"{\"id\":1234}");
    assert_eq!(future.state(), FutureState::Fulfilled(payload));
}

#[test]
fn test_wait_timeout_leaves_future_pending() {
    let (handle, mut broker) = common::pair();
    let future = handle.rpc("kvs.get", "key").unwrap();
    let request = broker.recv();

    let result = future.wait(Duration::from_millis(20));
    assert!(matches!(result, Err(Error::Future(FutureError::Timeout))));
    assert!(result.unwrap_err().is_timeout());
    assert_eq!(future.state(), FutureState::Pending);

    broker.respond(&request, b"value");
    assert_eq!(&future.wait(-1.0).unwrap()[..], b"value");
}

#[test]
fn test_broker_error_response() {
    let (handle, mut broker) = common::pair();
    let future = handle.rpc("nosuch.method", "").unwrap();
    let request = broker.recv();

    broker.respond_error(&request, libc::ENOSYS, "no such method");

    match future.wait(-1.0) {
        Err(Error::Future(FutureError::Broker { errnum, message })) => {
            assert_eq!(errnum, libc::ENOSYS as u32);
            assert_eq!(message, "no such method");
        }
        other => panic!("expected broker error, got {other:?}"),
    }
}

#[test]
fn test_then_runs_once_from_reactor() {
    let (handle, mut broker) = common::pair();
    let calls = Rc::new(Cell::new(0));
    let seen = Rc::new(RefCell::new(Bytes::new()));

    let future = handle.rpc("kvs.get", "key").unwrap();
    let request = broker.recv();
    {
        let calls = calls.clone();
        let seen = seen.clone();
        future
            .then(move |_, future| {
                calls.set(calls.get() + 1);
                *seen.borrow_mut() = future.get().unwrap()?;
                Ok(())
            })
            .unwrap();
    }
    assert_eq!(handle.reactor_active(), 1);

    broker.respond(&request, b"value");
    broker.respond(&request, b"duplicate");

    let outcome = handle.run_reactor(RunFlags::NONE).unwrap();
    assert_eq!(outcome, RunOutcome::Completed { active: 0 });
    assert_eq!(calls.get(), 1);
    assert_eq!(&seen.borrow()[..], b"value");
}

#[test]
fn test_then_on_ready_future_is_deferred() {
    let (handle, mut broker) = common::pair();
    let calls = Rc::new(Cell::new(0));

    let future = handle.rpc("kvs.get", "key").unwrap();
    let request = broker.recv();
    broker.respond(&request, b"value");
    future.wait(-1.0).unwrap();

    let counter = calls.clone();
    future
        .then(move |_, _| {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .unwrap();
    assert_eq!(calls.get(), 0);

    handle.run_reactor(RunFlags::NONE).unwrap();
    assert_eq!(calls.get(), 1);
    assert_eq!(handle.reactor_active(), 0);
}

#[test]
fn test_connection_loss_fails_continuation() {
    let (handle, broker) = common::pair();
    let failed = Rc::new(Cell::new(false));

    let future = handle.rpc("kvs.get", "key").unwrap();
    let flag = failed.clone();
    future
        .then(move |_, future| {
            flag.set(future.state() == FutureState::Failed(FutureError::ConnectionLost));
            Ok(())
        })
        .unwrap();

    drop(broker);

    handle.run_reactor(RunFlags::NONE).unwrap();
    assert!(failed.get());
}

#[test]
fn test_streaming_rpc() {
    let (handle, mut broker) = common::pair();
    let future = handle
        .rpc_with("job-info.eventlog-watch", "42", NODEID_ANY, RpcFlags::STREAMING)
        .unwrap();

    let request = broker.recv();
    assert_ne!(request.flags & flags::STREAMING, 0);
    broker.respond(&request, b"submit");
    broker.respond(&request, b"start");
    broker.respond_error(&request, libc::ENODATA, "");

    assert_eq!(&future.wait(-1.0).unwrap()[..], b"submit");
    assert!(future.reset());
    assert_eq!(&future.wait(-1.0).unwrap()[..], b"start");
    assert!(future.reset());
    match future.wait(-1.0) {
        Err(Error::Future(e)) => assert!(e.is_end_of_stream()),
        other => panic!("expected end of stream, got {other:?}"),
    }
    assert!(!future.reset());
}

#[test]
fn test_noresponse_future_is_fulfilled() {
    let (handle, mut broker) = common::pair();
    let future = handle
        .rpc_with("log.append", "hello", 3, RpcFlags::NORESPONSE)
        .unwrap();

    assert!(future.is_ready());
    assert_eq!(future.wait(0.0).unwrap(), Bytes::new());

    let request = broker.recv();
    assert_eq!(request.matchtag, MATCHTAG_NONE);
    assert_eq!(request.nodeid, 3);
    assert_ne!(request.flags & flags::NORESPONSE, 0);
}

#[test]
fn test_late_response_for_dropped_future_is_discarded() {
    let (handle, mut broker) = common::pair();

    let stale = handle.rpc("kvs.get", "old").unwrap();
    let stale_tag = stale.match_tag();
    drop(stale);

    let fresh = handle.rpc("kvs.get", "new").unwrap();
    assert_ne!(fresh.match_tag(), stale_tag);

    let first = broker.recv();
    let second = broker.recv();
    broker.respond(&first, b"stale");
    broker.respond(&second, b"fresh");

    assert_eq!(&fresh.wait(-1.0).unwrap()[..], b"fresh");
}

#[test]
fn test_dropped_stream_keeps_tag_until_stream_ends() {
    let (handle, mut broker) = common::pair();

    let stream = handle
        .rpc_with("job-info.eventlog-watch", "42", NODEID_ANY, RpcFlags::STREAMING)
        .unwrap();
    let watch = broker.recv();
    broker.respond(&watch, b"submit");
    assert_eq!(&stream.wait(-1.0).unwrap()[..], b"submit");
    let stream_tag = stream.match_tag();
    drop(stream);

    let fresh = handle.rpc("kvs.get", "key").unwrap();
    assert_ne!(fresh.match_tag(), stream_tag);
    let get = broker.recv();

    broker.respond(&watch, b"start");
    broker.respond(&get, b"value");
    assert_eq!(&fresh.wait(-1.0).unwrap()[..], b"value");
    drop(fresh);

    broker.respond_error(&watch, libc::ENODATA, "");
    let next = handle.rpc("kvs.get", "again").unwrap();
    let again = broker.recv();
    broker.respond(&again, b"again");
    next.wait(-1.0).unwrap();

    // The stream has ended, so its tag is free again.
    let reused = handle.rpc("kvs.get", "reused").unwrap();
    assert_eq!(reused.match_tag(), stream_tag);
}

#[test]
fn test_wait_accepts_unrepresentable_timeouts() {
    let (handle, mut broker) = common::pair();

    let first = handle.rpc("kvs.get", "a").unwrap();
    let request = broker.recv();
    broker.respond(&request, b"a");
    assert_eq!(&first.wait(Duration::MAX).unwrap()[..], b"a");

    let second = handle.rpc("kvs.get", "b").unwrap();
    let request = broker.recv();
    broker.respond(&request, b"b");
    assert_eq!(&second.wait(1e30_f64).unwrap()[..], b"b");
}

#[test]
fn test_zero_timeout_sees_response_already_sent() {
    let (handle, mut broker) = common::pair();
    let future = handle.rpc("kvs.get", "key").unwrap();
    let request = broker.recv();

    assert!(future.wait(Duration::ZERO).unwrap_err().is_timeout());

    broker.respond(&request, b"value");
    std::thread::sleep(Duration::from_millis(20));

    assert_eq!(&future.wait(Duration::ZERO).unwrap()[..], b"value");
}

#[test]
fn test_nested_wait_respects_max_depth() {
    let (handle, _broker) = common::pair_with(HandleBuilder::new().max_reactor_depth(1));
    let result = Rc::new(RefCell::new(None));

    let seen = result.clone();
    handle
        .timer_watcher_create(Duration::from_millis(1), Duration::ZERO, move |handle, _, _| {
            let future = handle.rpc("kvs.get", "key")?;
            *seen.borrow_mut() = Some(future.wait(-1.0));
            Ok(())
        })
        .unwrap()
        .start()
        .unwrap();

    handle.run_reactor(RunFlags::NONE).unwrap();

    assert!(matches!(
        result.borrow_mut().take(),
        Some(Err(Error::Reactor(ReactorError::AlreadyRunning { depth: 1 })))
    ));
    assert_eq!(handle.reactor_depth(), 0);
}

#[test]
fn test_unsent_request_frees_its_tag() {
    let (handle, mut broker) =
        common::pair_with(HandleBuilder::new().codec(common::RejectingCodec("bad")));

    for _ in 0..3 {
        let result = handle.rpc("bad", "");
        assert!(matches!(result, Err(Error::Send(SendError::EncodeFailure(_)))));
    }
    assert!(format!("{handle:?}").contains("outstanding: Some(0)"));

    let future = handle.rpc("kvs.get", "key").unwrap();
    assert_eq!(future.match_tag(), 1);
    let request = broker.recv();
    assert_eq!(request.topic, "kvs.get");
}

#[test]
fn test_wait_inside_callback_runs_nested_reactor() {
    let (handle, broker) = common::pair();
    let broker = Rc::new(RefCell::new(broker));
    let ticks = Rc::new(Cell::new(0));
    let answer = Rc::new(RefCell::new(None));

    let ticker = {
        let ticks = ticks.clone();
        handle
            .timer_watcher_create(Duration::from_millis(1), Duration::from_millis(1), move |_, _, _| {
                ticks.set(ticks.get() + 1);
                Ok(())
            })
            .unwrap()
    };

    {
        let broker = broker.clone();
        let answer = answer.clone();
        let ticker = ticker.clone();
        handle
            .timer_watcher_create(Duration::from_millis(1), Duration::ZERO, move |handle, _, _| {
                let future = handle.rpc("kvs.get", "key")?;
                {
                    let mut broker = broker.borrow_mut();
                    let request = broker.recv();
                    broker.respond(&request, b"nested");
                }
                assert_eq!(handle.reactor_depth(), 1);
                *answer.borrow_mut() = Some(future.wait(-1.0)?);
                assert_eq!(handle.reactor_depth(), 1);
                ticker.stop()
            })
            .unwrap()
            .start()
            .unwrap();
    }
    ticker.start().unwrap();

    let outcome = handle.run_reactor(RunFlags::NONE).unwrap();
    assert_eq!(outcome, RunOutcome::Completed { active: 0 });
    assert_eq!(answer.borrow().as_deref(), Some(&b"nested"[..]));
    assert_eq!(handle.reactor_depth(), 0);
}

proptest! {
    #[test]
    fn prop_match_tags_unique_among_outstanding(ops in proptest::collection::vec(any::<Option<usize>>(), 1..64)) {
        let (handle, _broker) = common::pair();
        let mut outstanding = Vec::new();

        for op in ops {
            match op {
                Some(victim) if !outstanding.is_empty() => {
                    outstanding.remove(victim % outstanding.len());
                }
                _ => outstanding.push(handle.rpc("kvs.get", "").unwrap()),
            }

            let tags: HashSet<u32> = outstanding.iter().map(|f| f.match_tag()).collect();
            prop_assert_eq!(tags.len(), outstanding.len());
            prop_assert!(!tags.contains(&MATCHTAG_NONE));
        }
    }
}

#[derive(Debug, Clone)]
enum TagOp {
    Request { streaming: bool },
    Drop(usize),
    Answer(usize),
}

fn tag_op() -> impl Strategy<Value = TagOp> {
    prop_oneof![
        any::<bool>().prop_map(|streaming| TagOp::Request { streaming }),
        any::<usize>().prop_map(TagOp::Drop),
        any::<usize>().prop_map(TagOp::Answer),
    ]
}

/// A request the broker may still answer, with the caller's future if it
/// was kept.
struct OpenRequest {
    request: Message,
    streaming: bool,
    answered: bool,
    future: Option<Future>,
}

proptest! {
    #[test]
    fn prop_responses_only_reach_their_own_future(ops in proptest::collection::vec(tag_op(), 1..48)) {
        let (handle, mut broker) = common::pair();
        let mut open: Vec<OpenRequest> = Vec::new();
        let mut seq = 0u32;

        for op in ops {
            match op {
                TagOp::Request { streaming } => {
                    seq += 1;
                    let flags = if streaming { RpcFlags::STREAMING } else { RpcFlags::NONE };
                    let future = handle.rpc_with("kvs.get", format!("req-{seq}"), NODEID_ANY, flags).unwrap();
                    open.push(OpenRequest {
                        request: broker.recv(),
                        streaming,
                        answered: false,
                        future: Some(future),
                    });
                }
                TagOp::Drop(pick) => {
                    let held: Vec<usize> = (0..open.len()).filter(|&i| open[i].future.is_some()).collect();
                    if held.is_empty() {
                        continue;
                    }
                    let index = held[pick % held.len()];
                    open[index].future = None;
                    if !open[index].streaming && open[index].answered {
                        open.remove(index);
                    }
                }
                TagOp::Answer(pick) => {
                    let answerable: Vec<usize> = (0..open.len())
                        .filter(|&i| open[i].streaming || !open[i].answered)
                        .collect();
                    if answerable.is_empty() {
                        continue;
                    }
                    let index = answerable[pick % answerable.len()];
                    let entry = &mut open[index];
                    broker.respond(&entry.request, &entry.request.payload);
                    entry.answered = true;
                    if !entry.streaming && entry.future.is_none() {
                        open.remove(index);
                    }

                    handle.reactor_incref();
                    handle.run_reactor(RunFlags::NOWAIT).unwrap();
                    handle.reactor_decref();
                }
            }

            let live: Vec<(&Message, &Future)> = open
                .iter()
                .filter_map(|entry| entry.future.as_ref().map(|future| (&entry.request, future)))
                .collect();
            let tags: HashSet<u32> = live.iter().map(|(_, future)| future.match_tag()).collect();
            prop_assert_eq!(tags.len(), live.len());
            prop_assert!(!tags.contains(&MATCHTAG_NONE));

            for (request, future) in live {
                prop_assert_eq!(request.matchtag, future.match_tag());
                match future.state() {
                    FutureState::Pending => {}
                    FutureState::Fulfilled(payload) => prop_assert_eq!(payload, request.payload.clone()),
                    FutureState::Failed(error) => prop_assert!(false, "unexpected failure {:?}", error),
                }
            }
        }
    }
}
