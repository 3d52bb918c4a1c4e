use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stepwise_test::{self as test, ToyEngine, sum_digest};

use crate::{int, ok, setup_cache};

#[test]
fn test_split_result_matches_unsplit() {
    let engine = ToyEngine::new()
        .with_sum_budget(500)
        .with_step_delay(Duration::from_millis(1));
    let cache = setup_cache(&engine, |config| {
        config.min_split_interval = Duration::ZERO;
    });
    let key = test::key("sum", [int(0), int(40_000)]);

    assert_eq!(cache.lookup(&key), Ok(ok(sum_digest(0, 40_000))));

    let stats = cache.stats();
    assert!(stats.splits >= 1, "expected at least one split: {stats:?}");
    assert!(engine.calls("sum.piece") >= 2);
    assert_eq!(stats.intermediates, 0);
}

#[test]
fn test_split_pieces_leave_no_finished_entries() {
    let engine = ToyEngine::new()
        .with_sum_budget(500)
        .with_step_delay(Duration::from_millis(1));
    let cache = setup_cache(&engine, |config| {
        config.min_split_interval = Duration::ZERO;
    });
    let key = test::key("sum", [int(0), int(40_000)]);

    assert_eq!(cache.lookup(&key), Ok(ok(sum_digest(0, 40_000))));

    let stats = cache.stats();
    assert!(stats.splits >= 1, "expected at least one split: {stats:?}");
    assert_eq!(stats.finished, 1);
    assert!(cache.finished_elapsed(&key).is_some());
}

#[test]
fn test_disabled_splitting_never_splits() {
    let engine = ToyEngine::new()
        .with_sum_budget(500)
        .with_step_delay(Duration::from_micros(200));
    let cache = setup_cache(&engine, |config| {
        config.min_split_interval = Duration::ZERO;
        config.disable_splitting = true;
    });
    let key = test::key("sum", [int(0), int(20_000)]);

    assert_eq!(cache.lookup(&key), Ok(ok(sum_digest(0, 20_000))));
    assert_eq!(cache.stats().splits, 0);
    assert_eq!(engine.calls("sum.piece"), 0);
}

#[test]
fn test_short_computations_are_not_split() {
    // the split interval is never reached
    let engine = ToyEngine::new().with_sum_budget(100);
    let cache = setup_cache(&engine, |config| {
        config.min_split_interval = Duration::from_secs(60);
    });
    let key = test::key("sum", [int(0), int(5_000)]);

    assert_eq!(cache.lookup(&key), Ok(ok(sum_digest(0, 5_000))));
    assert_eq!(cache.stats().splits, 0);
}

#[test]
fn test_seeded_split_fuzz() {
    let mut rng = StdRng::seed_from_u64(0x5EED);

    let reference_engine = ToyEngine::new();
    let reference = setup_cache(&reference_engine, |config| {
        config.disable_splitting = true;
    });

    let mut splits = 0;
    for trial in 0..100 {
        let seed = rng.random();
        let lo = rng.random_range(-1_000..1_000);
        let hi = lo + rng.random_range(1_000..12_000);
        let split_interval = Duration::from_micros(rng.random_range(0..2_000));

        let engine = ToyEngine::new()
            .with_seed(seed)
            .with_sum_budget(rng.random_range(50..400))
            .with_step_delay(Duration::from_micros(rng.random_range(0..100)));
        let cache = setup_cache(&engine, |config| {
            config.workers = rng.random_range(2..6);
            config.min_split_interval = split_interval;
        });

        let key = test::key("sum", [int(lo), int(hi)]);
        let split = cache.lookup(&key);
        let unsplit = reference.lookup(&key);

        assert_eq!(split, unsplit, "trial {trial} with seed {seed} diverged");
        assert_eq!(unsplit, Ok(ok(sum_digest(lo, hi))));
        splits += cache.stats().splits;
    }

    assert!(splits > 0, "no trial was ever split");
    assert_eq!(reference.stats().splits, 0);
}
