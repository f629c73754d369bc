//! Shared helpers.

mod decimal;

pub use decimal::*;
