use std::thread;
use std::time::{Duration, Instant};

use stepwise_cache::CacheError;
use stepwise_test::{self as test, ToyEngine};

use crate::{int, ok, setup_cache};

/// A sum that will not finish during any test.
fn endless() -> stepwise_cache::ComputationKey {
    test::key("sum", [int(0), int(i64::MAX / 2)])
}

#[test]
fn test_teardown_wakes_blocked_callers() {
    let engine = ToyEngine::new().with_step_delay(Duration::from_millis(1));
    let cache = setup_cache(&engine, |config| config.disable_splitting = true);
    let waiting = test::key("bundle", [test::encoded_call("sum", [int(0), int(i64::MAX / 2)])]);

    thread::scope(|s| {
        let running = s.spawn(|| cache.lookup(&endless()));
        let awaiting = s.spawn(|| cache.lookup(&waiting));

        // let both computations get going
        while cache.stats().awaiting == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        cache.teardown();
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(running.join().unwrap(), Err(CacheError::ShutDown));
        assert_eq!(awaiting.join().unwrap(), Err(CacheError::ShutDown));
    });

    // every context was released, none is held by a worker
    assert_eq!(engine.live_contexts(), 0);
}

#[test]
fn test_teardown_is_idempotent() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    assert_eq!(cache.lookup(&test::key("square", [int(3)])), Ok(ok(int(9))));

    cache.teardown();
    cache.teardown();

    assert_eq!(engine.live_contexts(), 0);
    assert_eq!(
        cache.lookup(&test::key("square", [int(3)])),
        Err(CacheError::ShutDown)
    );
}

#[test]
fn test_teardown_with_many_pending_nodes() {
    let engine = ToyEngine::new().with_step_delay(Duration::from_millis(1));
    let cache = setup_cache(&engine, |config| {
        config.workers = 2;
        config.disable_splitting = true;
    });
    let keys: Vec<_> = (0..16)
        .map(|n| test::key("sum", [int(n), int(i64::MAX / 2)]))
        .collect();

    assert_eq!(cache.lookup_several(&keys, false, true), Ok(None));
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    cache.teardown();
    assert!(started.elapsed() < Duration::from_secs(1));

    let stats = cache.stats();
    assert_eq!(stats.intermediates, 0);
    assert_eq!(stats.running, 0);
    assert_eq!(engine.live_contexts(), 0);
}

#[test]
fn test_drop_tears_down() {
    let engine = ToyEngine::new().with_step_delay(Duration::from_millis(1));
    let cache = setup_cache(&engine, |config| config.disable_splitting = true);

    assert_eq!(cache.lookup_several(&[endless()], false, true), Ok(None));
    thread::sleep(Duration::from_millis(10));
    drop(cache);

    assert_eq!(engine.live_contexts(), 0);
}
