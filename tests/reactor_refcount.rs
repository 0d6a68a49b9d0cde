mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use broker_handle::{Error, RunFlags, RunOutcome, WatcherError};
use proptest::prelude::*;

#[test]
fn test_run_returns_when_last_watcher_stops() {
    let (handle, _broker) = common::pair();
    let fired = Rc::new(Cell::new(0));

    let counter = fired.clone();
    let watcher = handle
        .timer_watcher_create(Duration::from_millis(10), Duration::ZERO, move |_, _, _| {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .unwrap();
    watcher.start().unwrap();
    assert_eq!(handle.reactor_active(), 1);

    let start = Instant::now();
    let outcome = handle.run_reactor(RunFlags::NONE).unwrap();

    assert_eq!(outcome, RunOutcome::Completed { active: 0 });
    assert!(start.elapsed() >= Duration::from_millis(10));
    assert_eq!(fired.get(), 1);
    assert!(!watcher.is_active());
}

#[test]
fn test_run_without_active_watchers_returns_immediately() {
    let (handle, _broker) = common::pair();
    let outcome = handle.run_reactor(RunFlags::NONE).unwrap();
    assert_eq!(outcome, RunOutcome::Completed { active: 0 });
}

#[test]
fn test_incref_keeps_reactor_running() {
    let (handle, _broker) = common::pair();
    handle.reactor_incref();

    handle
        .timer_watcher_create(Duration::from_millis(5), Duration::ZERO, |handle, _, _| {
            handle.reactor_decref();
            Ok(())
        })
        .unwrap()
        .start()
        .unwrap();

    assert_eq!(handle.reactor_active(), 2);
    let outcome = handle.run_reactor(RunFlags::NONE).unwrap();
    assert_eq!(outcome, RunOutcome::Completed { active: 0 });
}

#[test]
fn test_double_start_is_rejected() {
    let (handle, _broker) = common::pair();
    let watcher = handle
        .timer_watcher_create(Duration::from_secs(60), Duration::ZERO, |_, _, _| Ok(()))
        .unwrap();

    watcher.start().unwrap();
    assert!(matches!(
        watcher.start(),
        Err(Error::Watcher(WatcherError::DuplicateRegistration(_)))
    ));
    assert_eq!(handle.reactor_active(), 1);

    watcher.stop().unwrap();
    watcher.stop().unwrap();
    assert_eq!(handle.reactor_active(), 0);
}

#[test]
fn test_nowait_runs_single_iteration() {
    let (handle, _broker) = common::pair();
    let watcher = handle
        .timer_watcher_create(Duration::from_secs(60), Duration::ZERO, |_, _, _| Ok(()))
        .unwrap();
    watcher.start().unwrap();

    let start = Instant::now();
    let outcome = handle.run_reactor(RunFlags::NOWAIT).unwrap();

    assert_eq!(outcome, RunOutcome::Completed { active: 1 });
    assert!(start.elapsed() < Duration::from_secs(1));
    watcher.destroy().unwrap();
}

#[derive(Debug, Clone)]
enum Op {
    Start(usize),
    Stop(usize),
    Destroy(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4usize).prop_map(Op::Start),
        (0..4usize).prop_map(Op::Stop),
        (0..4usize).prop_map(Op::Destroy),
    ]
}

proptest! {
    #[test]
    fn prop_refcount_tracks_started_watchers(ops in proptest::collection::vec(op(), 0..48)) {
        let (handle, _broker) = common::pair();
        let watchers: Vec<_> = (0..4)
            .map(|_| {
                handle
                    .timer_watcher_create(Duration::from_secs(3600), Duration::ZERO, |_, _, _| Ok(()))
                    .unwrap()
            })
            .collect();
        let mut started = [false; 4];
        let mut destroyed = [false; 4];

        for op in ops {
            match op {
                Op::Start(i) => {
                    let result = watchers[i].start();
                    if destroyed[i] || started[i] {
                        prop_assert!(result.is_err());
                    } else {
                        prop_assert!(result.is_ok());
                        started[i] = true;
                    }
                }
                Op::Stop(i) => {
                    prop_assert_eq!(watchers[i].stop().is_ok(), !destroyed[i]);
                    started[i] = false;
                }
                Op::Destroy(i) => {
                    prop_assert_eq!(watchers[i].destroy().is_ok(), !destroyed[i]);
                    started[i] = false;
                    destroyed[i] = true;
                }
            }

            let expected = started.iter().filter(|s| **s).count();
            prop_assert_eq!(handle.reactor_active(), expected);
        }

        for watcher in &watchers {
            let _ = watcher.stop();
        }
        prop_assert_eq!(handle.reactor_active(), 0);
        prop_assert_eq!(
            handle.run_reactor(RunFlags::NONE).unwrap(),
            RunOutcome::Completed { active: 0 }
        );
    }
}
