//! Shared test helpers for bridge integration tests.
//!
//! Note: We use `helpers/mod.rs` instead of the modern `helpers.rs` + `helpers/` pattern
//! because Cargo auto-discovers top-level `.rs` files in `tests/` as integration tests.
//! A `tests/helpers.rs` file would be compiled as a standalone test, which we don't want.

pub mod harness;
