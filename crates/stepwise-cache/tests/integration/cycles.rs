use std::thread;
use std::time::Duration;

use stepwise_cache::ComputationResult;
use stepwise_test::{self as test, ToyEngine};

use crate::{int, setup_cache};

fn cycle_exception() -> ComputationResult {
    ComputationResult::exception("cyclic dependency detected")
}

#[test]
fn test_two_cycle_is_broken() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let ping = test::key("ping", [int(1)]);
    let pong = test::key("pong", [int(1)]);

    let result = cache.lookup(&ping).unwrap();
    assert!(result.is_exception(), "unexpected {result:?}");

    // both members are finished and stay finished
    assert_eq!(cache.lookup(&pong).unwrap(), cycle_exception());
    assert_eq!(cache.stats().cycles_broken, 1);
    assert_eq!(cache.stats().intermediates, 0);
}

#[test]
fn test_self_recursion_is_broken() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let key = test::key("selfish", [int(1)]);

    assert_eq!(cache.lookup(&key).unwrap(), cycle_exception());
    assert_eq!(engine.calls("selfish"), 1);
}

#[test]
fn test_dependents_of_a_cycle_are_woken() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    // bundle -> ping -> pong -> ping
    let outside = test::key("bundle", [test::encoded_call("ping", [int(2)])]);

    assert_eq!(cache.lookup(&outside).unwrap(), cycle_exception());
    assert_eq!(cache.stats().intermediates, 0);
}

#[test]
fn test_concurrent_waiters_on_a_cycle() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());

    thread::scope(|s| {
        for n in 0..4 {
            let cache = &cache;
            s.spawn(move || {
                let key = test::key(if n % 2 == 0 { "ping" } else { "pong" }, [int(3)]);
                let result = cache.lookup(&key).unwrap();
                assert!(result.is_exception());
            });
        }
    });

    // give the idle workers a few maintenance rounds, nothing is left to break
    thread::sleep(Duration::from_millis(20));
    assert_eq!(cache.stats().cycles_broken, 1);
}
