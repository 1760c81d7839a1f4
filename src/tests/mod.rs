//! Cross-module tests: a whole page context wired over in-memory stores.
//!
//! Fixtures live in `crate::testing`.

mod persistence;
