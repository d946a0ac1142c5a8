//! Shared utilities.
//!
//! Hashing primitives and test helpers.

pub mod hash;

#[cfg(test)]
pub mod testutil;
