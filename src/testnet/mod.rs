//! Shared fixtures for unit tests
//!
//! Isolated chain stores, recording collaborators and local overlay nodes.

pub mod test_utils;

pub use test_utils::*;
