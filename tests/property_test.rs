// tests/property_test.rs

//! Property-based tests for steward.
//!
//! These verify the invariants the whole design leans on: single lease
//! ownership under arbitrary interleavings, and the write-once initialize
//! marker.

#[path = "support/mod.rs"]
mod support;

mod property {
    pub mod lease_test;
}
