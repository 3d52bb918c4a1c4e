use std::sync::Arc;

use stepwise_cache::data::{MemoryPageStore, PagedStore};
use stepwise_cache::{ComputationCache, ComputationResult, Config, Value};
use stepwise_test::{self as test, MemoryLoader, ToyEngine};

/// Creates a cache driving `engine` with fast test timings.
pub fn setup_cache(engine: &ToyEngine, update_config: impl FnOnce(&mut Config)) -> ComputationCache<ToyEngine> {
    test::setup();

    let mut config = test::fast_config();
    update_config(&mut config);

    ComputationCache::new(engine.clone(), &config).unwrap()
}

/// Like [`setup_cache`], with a shared page store and an in-memory loader.
pub fn setup_cache_with_data(
    engine: &ToyEngine,
    update_config: impl FnOnce(&mut Config),
) -> (ComputationCache<ToyEngine>, Arc<MemoryPageStore>, Arc<MemoryLoader>) {
    test::setup();

    let mut config = test::fast_config();
    update_config(&mut config);

    let store = Arc::new(MemoryPageStore::new(config.page_store_capacity));
    let loader = Arc::new(MemoryLoader::new());
    let cache = ComputationCache::with_data(
        engine.clone(),
        &config,
        Arc::clone(&store) as Arc<dyn PagedStore>,
        loader.clone(),
    )
    .unwrap();

    (cache, store, loader)
}

pub fn int(n: i64) -> Value {
    Value::Int(n)
}

pub fn ok(value: Value) -> ComputationResult {
    ComputationResult::Result(value)
}
