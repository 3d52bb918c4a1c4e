// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod cycles;
pub mod data_loading;
pub mod failures;
pub mod lookups;
pub mod requests;
pub mod splitting;
pub mod teardown;
pub mod utils;

pub use utils::*;
