use std::thread;
use std::time::{Duration, Instant};

use stepwise_cache::ComputationResult;
use stepwise_test::{self as test, ToyEngine};

use crate::{int, ok, setup_cache};

#[test]
fn test_concurrent_lookups_compute_once() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let key = test::key("square", [int(3), int(50)]);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2).map(|_| s.spawn(|| cache.lookup(&key))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results, vec![Ok(ok(int(9))), Ok(ok(int(9)))]);
    assert_eq!(engine.calls("square"), 1);
}

#[test]
fn test_many_lookups_of_one_key() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let key = test::key("square", [int(12), int(20)]);

    thread::scope(|s| {
        for _ in 0..16 {
            s.spawn(|| assert_eq!(cache.lookup(&key), Ok(ok(int(144)))));
        }
    });

    assert_eq!(engine.calls("square"), 1);
    assert_eq!(cache.stats().computations, 1);
}

#[test]
fn test_finished_key_takes_no_steps() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let key = test::key("square", [int(4)]);

    assert_eq!(cache.lookup(&key), Ok(ok(int(16))));
    let steps = engine.total_steps();

    for _ in 0..10 {
        assert_eq!(cache.lookup(&key), Ok(ok(int(16))));
    }
    assert_eq!(engine.total_steps(), steps);
    assert_eq!(engine.calls("square"), 1);
    assert!(cache.finished_elapsed(&key).is_some());
}

#[test]
fn test_non_blocking_lookup() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let slow = test::key("square", [int(2), int(100)]);

    let started = Instant::now();
    assert_eq!(cache.lookup_several(&[slow.clone()], false, true), Ok(None));
    assert!(started.elapsed() < Duration::from_millis(100));

    // the non-blocking call registered the key, so this waits for the same computation
    assert_eq!(cache.lookup(&slow), Ok(ok(int(4))));
    assert_eq!(
        cache.lookup_several(&[slow], false, true),
        Ok(Some(vec![ok(int(4))]))
    );
    assert_eq!(engine.calls("square"), 1);
}

#[test]
fn test_lookup_without_leaving_in_cache() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let cached = test::key("square", [int(5)]);
    let transient = test::key("square", [int(6)]);

    cache.lookup(&cached).unwrap();

    let results = cache
        .lookup_several(&[cached.clone(), transient.clone()], true, false)
        .unwrap();
    assert_eq!(results, Some(vec![ok(int(25)), ok(int(36))]));

    // keys that were cached before stay, the rest is evicted after reading
    assert!(cache.finished_elapsed(&cached).is_some());
    assert!(cache.finished_elapsed(&transient).is_none());

    cache.lookup(&transient).unwrap();
    assert_eq!(engine.calls("square"), 3);
}

#[test]
fn test_flush_recomputes() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let key = test::key("square", [int(7)]);

    cache.lookup(&key).unwrap();
    cache.flush();
    assert_eq!(cache.stats().finished, 0);

    assert_eq!(cache.lookup(&key), Ok(ok(int(49))));
    assert_eq!(engine.calls("square"), 2);
}

#[test]
fn test_flush_keeps_in_flight_work() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let key = test::key("square", [int(8), int(50)]);

    assert_eq!(cache.lookup_several(&[key.clone()], false, true), Ok(None));
    cache.flush();
    assert_eq!(cache.lookup(&key), Ok(ok(int(64))));
    assert_eq!(engine.calls("square"), 1);

    // the result was delivered but registered before the flush, so it is not retained
    assert!(cache.finished_elapsed(&key).is_none());
}

#[test]
fn test_batch_results_keep_order() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let keys: Vec<_> = (0..20).map(|n| test::key("square", [int(n)])).collect();

    let results = cache.lookup_several(&keys, true, true).unwrap().unwrap();
    let expected: Vec<_> = (0..20).map(|n| ComputationResult::Result(int(n * n))).collect();
    assert_eq!(results, expected);

    let stats = cache.stats();
    assert_eq!(stats.finished, 20);
    assert_eq!(stats.intermediates, 0);
    assert_eq!(stats.lookups, 20);
}
