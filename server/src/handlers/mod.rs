//! Request handlers for storage operations.

mod storage;

pub use storage::*;
