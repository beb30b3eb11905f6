// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod coordination;
pub mod pool;
pub mod utils;
pub mod worker;

pub use utils::*;
