use stepwise_cache::{ComputationResult, Value};
use stepwise_test::{self as test, ToyEngine};

use crate::{int, ok, setup_cache};

fn delayed(ms: i64, value: i64) -> Value {
    test::encoded_call("delayed", [int(ms), int(value)])
}

fn delayed_throw(ms: i64, message: &str) -> Value {
    test::encoded_call("delayed_throw", [int(ms), Value::str(message)])
}

#[test]
fn test_first_exception_in_request_order() {
    // [ok1, fail1, ok2, fail2] under different completion orders
    let orders = [[40, 30, 10, 0], [0, 40, 10, 5], [10, 0, 30, 40], [0, 0, 0, 0]];

    for (n, [a, b, c, d]) in orders.into_iter().enumerate() {
        let engine = ToyEngine::new();
        let cache = setup_cache(&engine, |_| ());
        let key = test::key(
            "bundle",
            [
                delayed(a, 1),
                delayed_throw(b, "fail1"),
                delayed(c, 2),
                delayed_throw(d, "fail2"),
            ],
        );

        assert_eq!(
            cache.lookup(&key),
            Ok(ComputationResult::exception("fail1")),
            "completion order #{n}"
        );
    }
}

#[test]
fn test_bundle_results_form_a_tuple() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    let key = test::key(
        "bundle",
        [
            test::encoded_call("square", [int(2)]),
            test::encoded_call("square", [int(3)]),
            test::encoded_call("square", [int(2)]),
        ],
    );

    assert_eq!(
        cache.lookup(&key),
        Ok(ok(Value::tuple([int(4), int(9), int(4)])))
    );
    // the repeated call is the same key
    assert_eq!(engine.calls("square"), 2);
}

#[test]
fn test_fully_cached_request_is_answered_right_away() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());
    cache.lookup(&test::key("square", [int(5)])).unwrap();

    let key = test::key("bundle", [test::encoded_call("square", [int(5)])]);
    assert_eq!(cache.lookup(&key), Ok(ok(Value::tuple([int(25)]))));
    assert_eq!(engine.calls("square"), 1);
}

#[test]
fn test_recursive_requests_share_subcomputations() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());

    assert_eq!(cache.lookup(&test::key("fib", [int(30)])), Ok(ok(int(832_040))));
    // every fib(n) for n in 0..=30 ran exactly once
    assert_eq!(engine.calls("fib"), 31);
}

#[test]
fn test_malformed_requests_become_exceptions() {
    let engine = ToyEngine::new();
    let cache = setup_cache(&engine, |_| ());

    let cases = [
        (int(1), "cache-call argument must be a tuple"),
        (
            Value::tuple([Value::tuple([Value::symbol("square")])]),
            "cache-call tuple must contain two or three elements",
        ),
        (
            Value::tuple([Value::tuple([Value::symbol("square"), int(1)])]),
            "cache-call arguments must be a tuple",
        ),
    ];

    for (request, message) in cases {
        let key = test::key("raw", [request]);
        assert_eq!(cache.lookup(&key), Ok(ComputationResult::exception(message)));
    }

    let bad_dataset = Value::tuple([Value::symbol("Dataset"), int(1), int(2)]);
    let result = cache.lookup(&test::key("raw", [bad_dataset])).unwrap();
    let message = match &result {
        ComputationResult::Exception(Value::Str(message)) => message.to_string(),
        other => panic!("unexpected {other:?}"),
    };
    assert!(message.starts_with("Badly formed dataset request"), "{message}");
}
