use bytes::Bytes;

use stepwise_cache::data::PagedStore;
use stepwise_cache::{ComputationResult, PageId, Value};
use stepwise_test::{self as test, ToyEngine};

use crate::{int, ok, setup_cache_with_data};

fn load(bucket: &str, key: &str) -> stepwise_cache::ComputationKey {
    test::key("load", [Value::str(bucket), Value::str(key)])
}

fn numbered(len: u8) -> Bytes {
    (0..len).collect::<Vec<_>>().into()
}

#[test]
fn test_dataset_is_fetched_in_chunks() {
    let engine = ToyEngine::new();
    let (cache, _store, loader) = setup_cache_with_data(&engine, |config| {
        config.dataset_chunk_size = 10;
        config.max_fetch_chunk_size = 4;
    });
    loader.insert("bucket", "data", numbered(25));

    assert_eq!(
        cache.lookup(&load("bucket", "data")),
        Ok(ok(Value::Bytes(numbered(25))))
    );
    // chunks 0..10, 10..20 and 20..25, each fetched in pieces of at most 4 bytes
    assert_eq!(loader.fetch_count(), 3 + 3 + 2);
    assert_eq!(cache.stats().data_loads, 3);
}

#[test]
fn test_stored_pages_are_not_fetched_again() {
    let engine = ToyEngine::new();
    let (cache, _store, loader) = setup_cache_with_data(&engine, |config| {
        config.dataset_chunk_size = 8;
    });
    loader.insert("bucket", "data", numbered(20));
    let key = load("bucket", "data");

    let first = cache.lookup(&key).unwrap();
    let fetches = loader.fetch_count();
    assert!(fetches > 0);

    cache.flush();
    assert_eq!(cache.lookup(&key), Ok(first));
    assert_eq!(engine.calls("load"), 2);
    assert_eq!(loader.fetch_count(), fetches);
}

#[test]
fn test_indexed_keys_are_concatenated_in_order() {
    let engine = ToyEngine::new();
    let (cache, _store, loader) = setup_cache_with_data(&engine, |_| ());
    loader.insert("bucket", "parts_10", Bytes::from_static(b"!"));
    loader.insert("bucket", "parts_2", Bytes::from_static(b"world"));
    loader.insert("bucket", "parts_1", Bytes::from_static(b"hello "));
    loader.insert("bucket", "parts_old", Bytes::from_static(b"ignored"));

    assert_eq!(
        cache.lookup(&load("bucket", "parts")),
        Ok(ok(Value::Bytes(Bytes::from_static(b"hello world!"))))
    );
}

#[test]
fn test_missing_dataset_is_an_exception() {
    let engine = ToyEngine::new();
    let (cache, _store, loader) = setup_cache_with_data(&engine, |_| ());
    let key = load("bucket", "nope");

    assert_eq!(
        cache.lookup(&key),
        Ok(ComputationResult::exception("no keys matching bucket/nope"))
    );
    assert_eq!(loader.fetch_count(), 0);
    assert!(cache.finished_elapsed(&key).is_some());
}

#[test]
fn test_fetch_failure_is_a_cached_exception() {
    let engine = ToyEngine::new();
    let (cache, _store, loader) = setup_cache_with_data(&engine, |config| {
        config.dataset_chunk_size = 4;
    });
    loader.insert("bucket", "data", numbered(12));
    loader.set_failing(true);
    let key = load("bucket", "data");

    let result = cache.lookup(&key).unwrap();
    let message = match &result {
        ComputationResult::Exception(Value::Str(message)) => message.to_string(),
        other => panic!("unexpected {other:?}"),
    };
    assert!(message.starts_with("failed to load bucket/data"), "{message}");
    assert!(message.contains("connection reset"), "{message}");

    // the exception is a regular result, the loader is not asked again
    loader.set_failing(false);
    assert_eq!(cache.lookup(&key), Ok(result));
    assert_eq!(engine.calls("load"), 1);

    // a context stuck on a failed fetch must not leak
    assert_eq!(cache.stats().intermediates, 0);
}

#[test]
fn test_store_only_pages() {
    let engine = ToyEngine::new();
    let (cache, store, _loader) = setup_cache_with_data(&engine, |_| ());
    store.store(PageId(7), Bytes::from_static(b"seven"));

    assert_eq!(
        cache.lookup(&test::key("page", [int(7)])),
        Ok(ok(Value::Bytes(Bytes::from_static(b"seven"))))
    );
    assert_eq!(
        cache.lookup(&test::key("page", [int(8)])),
        Ok(ComputationResult::exception("contents of page#8 are lost"))
    );
    assert_eq!(cache.stats().data_loads, 0);
}
