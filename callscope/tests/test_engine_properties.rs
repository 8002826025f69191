use callscope::domain::{FatalError, LocalIndex};
use callscope::engine::{EngineLimits, ManualClock, ProfilerState};
use callscope::snapshot::{encode, read_snapshot, SnapshotEdge};
use std::sync::Arc;

const LIMITS: EngineLimits = EngineLimits { max_methods: 8, max_call_depth: 32 };

fn engine() -> (Arc<ManualClock>, ProfilerState) {
    let clock = Arc::new(ManualClock::new(0));
    let state = ProfilerState::new(LIMITS, clock.clone());
    (clock, state)
}

#[test]
fn test_nested_calls_scenario() {
    let (clock, state) = engine();
    let a = state.new_method("app::A").unwrap();
    let b = state.new_method("app::B").unwrap();

    state.enter(a).unwrap();
    clock.set(5);
    state.enter(b).unwrap();
    clock.set(15);
    state.exit(b);
    clock.set(30);
    state.exit(a);

    let snapshot = state.snapshot();
    let a = snapshot.find("app::A").unwrap();
    assert_eq!(a.hits, 1);
    assert_eq!(a.net_time_ns, 30);
    assert_eq!(a.children, vec![SnapshotEdge { child: LocalIndex(1), time_ns: 10 }]);

    let b = snapshot.find("app::B").unwrap();
    assert_eq!(b.hits, 1);
    assert_eq!(b.net_time_ns, 10);
    assert!(b.children.is_empty());
}

#[test]
fn test_balanced_calls_accumulate() {
    let (clock, state) = engine();
    let m = state.new_method("app::work").unwrap();

    for duration in [3, 7, 10] {
        state.enter(m).unwrap();
        clock.advance(duration);
        state.exit(m);
        clock.advance(100);
    }

    let record = state.method(m).unwrap();
    assert_eq!(record.hits(), 3);
    assert_eq!(record.net_time_ns(), 20);
}

#[test]
fn test_recursion_counts_outermost_only() {
    let (clock, state) = engine();
    let fib = state.new_method("math::fib").unwrap();

    clock.set(100);
    state.enter(fib).unwrap();
    clock.set(110);
    state.enter(fib).unwrap();
    clock.set(120);
    state.enter(fib).unwrap();
    clock.set(130);
    state.exit(fib);
    clock.set(140);
    state.exit(fib);
    clock.set(150);
    state.exit(fib);

    let record = state.method(fib).unwrap();
    assert_eq!(record.hits(), 1);
    assert_eq!(record.net_time_ns(), 50);
    assert!(record.children().is_empty());
}

#[test]
fn test_child_time_is_cumulative() {
    let (clock, state) = engine();
    let parent = state.new_method("app::parent").unwrap();
    let child = state.new_method("app::child").unwrap();

    state.enter(parent).unwrap();
    for _ in 0..4 {
        state.enter(child).unwrap();
        clock.advance(25);
        state.exit(child);
        clock.advance(5);
    }
    state.exit(parent);

    let record = state.method(parent).unwrap();
    assert_eq!(record.net_time_ns(), 120);
    assert_eq!(record.children().len(), 1);
    assert_eq!(record.children()[0].child, child.local());
    assert_eq!(record.children()[0].time_ns, 100);
    assert_eq!(state.method(child).unwrap().hits(), 4);
}

#[test]
fn test_stale_ids_are_ignored() {
    let (clock, state) = engine();
    let old = state.new_method("app::old").unwrap();

    let session = state.start_new_session();
    state.end_session();
    assert_eq!(state.session(), session);
    let fresh = state.new_method("app::fresh").unwrap();
    // Same slot, different session
    assert_eq!(old.local(), fresh.local());

    state.enter(old).unwrap();
    clock.advance(10);
    state.exit(old);

    assert!(state.method(old).is_none());
    assert_eq!(state.method(fresh).unwrap().hits(), 0);
    assert!(state.snapshot().is_empty());
}

#[test]
fn test_recording_disabled_during_session_switch() {
    let (clock, state) = engine();
    state.start_new_session();
    let m = state.new_method("app::m").unwrap();

    state.enter(m).unwrap();
    clock.advance(10);
    state.exit(m);
    assert_eq!(state.method(m).unwrap().hits(), 0);

    state.end_session();
    state.enter(m).unwrap();
    clock.advance(10);
    state.exit(m);
    assert_eq!(state.method(m).unwrap().hits(), 1);
}

#[test]
fn test_reset_keeps_registrations() {
    let (clock, state) = engine();
    let a = state.new_method("app::A").unwrap();
    let b = state.new_method("app::B").unwrap();
    state.enter(a).unwrap();
    state.enter(b).unwrap();
    clock.advance(10);
    state.exit(b);
    state.exit(a);

    state.reset_stats();

    assert_eq!(state.method_count(), 2);
    for id in [a, b] {
        let record = state.method(id).unwrap();
        assert_eq!(record.hits(), 0);
        assert_eq!(record.net_time_ns(), 0);
        assert!(record.children().is_empty());
    }
    assert_eq!(state.method(b).unwrap().name(), "app::B");

    // Ids handed out before the reset still record
    state.enter(a).unwrap();
    clock.advance(4);
    state.exit(a);
    assert_eq!(state.method(a).unwrap().net_time_ns(), 4);
}

#[test]
fn test_method_limit_is_fatal() {
    let (_clock, state) = engine();
    for i in 0..LIMITS.max_methods {
        state.new_method(&format!("app::m{i}")).unwrap();
    }
    let err = state.new_method("app::one_too_many").unwrap_err();
    assert!(matches!(err, FatalError::MethodLimitExceeded { limit: 8, .. }));
    assert_eq!(state.method_count(), LIMITS.max_methods);
}

#[test]
fn test_call_depth_limit_is_fatal() {
    let clock = Arc::new(ManualClock::new(0));
    let state =
        ProfilerState::new(EngineLimits { max_methods: 8, max_call_depth: 2 }, clock.clone());
    let a = state.new_method("app::a").unwrap();
    let b = state.new_method("app::b").unwrap();
    let c = state.new_method("app::c").unwrap();

    state.enter(a).unwrap();
    state.enter(b).unwrap();
    let err = state.enter(c).unwrap_err();
    assert!(matches!(err, FatalError::CallStackOverflow { limit: 2, .. }));
}

#[test]
fn test_snapshot_includes_calls_in_flight_once() {
    let (clock, state) = engine();
    let outer = state.new_method("app::outer").unwrap();
    let inner = state.new_method("app::inner").unwrap();

    state.enter(outer).unwrap();
    clock.set(10);
    state.enter(inner).unwrap();
    clock.set(25);

    let snapshot = state.snapshot();
    let frozen_outer = snapshot.find("app::outer").unwrap();
    assert_eq!(frozen_outer.hits, 1);
    assert_eq!(frozen_outer.net_time_ns, 25);
    assert_eq!(frozen_outer.children, vec![SnapshotEdge { child: inner.local(), time_ns: 15 }]);

    // The live counters were not touched by the snapshot
    assert_eq!(state.method(outer).unwrap().hits(), 0);

    clock.set(40);
    state.exit(inner);
    state.exit(outer);
    let record = state.method(outer).unwrap();
    assert_eq!(record.hits(), 1);
    assert_eq!(record.net_time_ns(), 40);
}

#[test]
fn test_snapshot_codec_is_stable() {
    let (clock, state) = engine();
    let ids: Vec<_> = ["svc::handle", "svc::parse", "db::query"]
        .iter()
        .map(|name| state.new_method(name).unwrap())
        .collect();
    state.enter(ids[0]).unwrap();
    state.enter(ids[1]).unwrap();
    clock.advance(3);
    state.exit(ids[1]);
    state.enter(ids[2]).unwrap();
    clock.advance(9);
    state.exit(ids[2]);
    state.exit(ids[0]);

    let snapshot = state.snapshot();
    let bytes = encode(&snapshot).unwrap();
    let decoded = read_snapshot(&mut bytes.as_slice()).unwrap();
    assert_eq!(decoded, snapshot);
    assert_eq!(encode(&decoded).unwrap(), bytes);
}

#[test]
fn test_threads_record_independently() {
    let (_clock, state) = engine();
    let state = Arc::new(state);
    let m = state.new_method("app::worker").unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    state.enter(m).unwrap();
                    state.exit(m);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(state.method(m).unwrap().hits(), 400);
    assert!(state.tracked_threads() <= 4);
}

#[test]
fn test_reset_restarts_calls_in_flight() {
    let (clock, state) = engine();
    let outer = state.new_method("app::outer").unwrap();
    let inner = state.new_method("app::inner").unwrap();

    state.enter(outer).unwrap();
    clock.set(5);
    state.enter(inner).unwrap();
    clock.set(10);
    state.reset_stats();

    clock.set(18);
    state.exit(inner);
    clock.set(25);
    state.exit(outer);

    let outer = state.method(outer).unwrap();
    assert_eq!(outer.hits(), 1);
    assert_eq!(outer.net_time_ns(), 15);
    assert_eq!(outer.children()[0].time_ns, 8);
    let inner = state.method(inner).unwrap();
    assert_eq!((inner.hits(), inner.net_time_ns()), (1, 8));
}

#[test]
fn test_snapshot_skips_threads_that_died_mid_call() {
    let (clock, state) = engine();
    let state = Arc::new(state);
    let m = state.new_method("app::abandoned").unwrap();

    let worker = Arc::clone(&state);
    std::thread::spawn(move || worker.enter(m).unwrap()).join().unwrap();
    clock.advance(50);

    let snapshot = state.snapshot();
    assert!(snapshot.is_empty());
    assert_eq!(state.tracked_threads(), 0);
    assert_eq!(state.method(m).unwrap().hits(), 0);
}
