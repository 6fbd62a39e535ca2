//! Database module for PostgreSQL persistence.

mod bsos;
mod pool;

pub use bsos::*;
pub use pool::*;
