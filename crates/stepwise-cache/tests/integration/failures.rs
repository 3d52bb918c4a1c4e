use stepwise_cache::{CacheError, EngineFailure, Value};
use stepwise_test::{self as test, ToyEngine};

use crate::{int, ok, setup_cache};

#[test]
fn test_failure_is_returned_and_not_cached() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let key = test::key("fail", [Value::str("boom")]);

    let expected = Err(CacheError::EngineFailure(EngineFailure::new("boom")));
    assert_eq!(cache.lookup(&key), expected);
    assert!(cache.finished_elapsed(&key).is_none());

    // looking it up again runs it again
    assert_eq!(cache.lookup(&key), expected);
    assert_eq!(engine.calls("fail"), 2);
}

#[test]
fn test_failure_propagates_to_dependents() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let dependent = test::key(
        "bundle",
        [
            test::encoded_call("throw", [Value::str("first")]),
            test::encoded_call("fail", [Value::str("boom")]),
        ],
    );

    assert_eq!(
        cache.lookup(&dependent),
        Err(CacheError::EngineFailure(EngineFailure::new("boom")))
    );
    assert!(cache.finished_elapsed(&dependent).is_none());

    // the exception of the sibling is a regular result and stays cached
    let sibling = test::key("throw", [Value::str("first")]);
    assert!(cache.finished_elapsed(&sibling).is_some());
}

#[test]
fn test_failure_in_batch_fails_the_batch() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let keys = [
        test::key("square", [int(2)]),
        test::key("fail", [Value::str("boom")]),
    ];

    assert!(matches!(
        cache.lookup_several(&keys, true, true),
        Err(CacheError::EngineFailure(_))
    ));
    // the healthy key is unaffected
    assert_eq!(cache.lookup(&keys[0]), Ok(ok(int(4))));
}

#[test]
fn test_engine_panic_becomes_failure() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |config| config.workers = 1);
    let key = test::key("panic", [Value::str("kaboom")]);

    let Err(CacheError::EngineFailure(failure)) = cache.lookup(&key) else {
        panic!("expected a failure");
    };
    assert!(failure.message().contains("kaboom"));

    // the single worker survived the panic
    assert_eq!(cache.lookup(&test::key("square", [int(3)])), Ok(ok(int(9))));
}

#[test]
fn test_panicked_context_is_not_reused() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |config| config.workers = 1);

    cache.lookup(&test::key("square", [int(1)])).unwrap();
    assert_eq!(engine.contexts_created(), 1);

    let _ = cache.lookup(&test::key("panic", [Value::str("kaboom")]));
    cache.lookup(&test::key("square", [int(2)])).unwrap();
    assert_eq!(engine.contexts_created(), 2);
}

#[test]
fn test_context_creation_panic_becomes_failure() {
    let engine = ToyEngine::new().with_panicking_create(0);
    let cache = setup_cache(&engine, |config| config.workers = 1);
    let key = test::key("square", [int(3)]);

    let Err(CacheError::EngineFailure(failure)) = cache.lookup(&key) else {
        panic!("expected a failure");
    };
    assert!(failure.message().contains("create_context boom"));
    assert_eq!(cache.stats().intermediates, 0);

    // the worker survived and the failure was not cached
    assert_eq!(cache.lookup(&key), Ok(ok(int(9))));
    assert_eq!(engine.contexts_created(), 1);
}

#[test]
fn test_context_failing_to_reset_is_dropped() {
    let engine = ToyEngine::new().with_panicking_reset();
    let cache = setup_cache(&engine, |config| config.workers = 1);

    assert_eq!(cache.lookup(&test::key("square", [int(1)])), Ok(ok(int(1))));
    assert_eq!(cache.lookup(&test::key("square", [int(2)])), Ok(ok(int(4))));
    assert_eq!(engine.contexts_created(), 2);
}

#[test]
fn test_unknown_agent_fails() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());

    assert!(matches!(
        cache.lookup(&test::key("no-such-agent", [])),
        Err(CacheError::EngineFailure(_))
    ));
}
