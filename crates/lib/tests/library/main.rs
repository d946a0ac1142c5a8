//! Integration tests for kiln-lib.

mod common;

#[cfg(unix)]
mod build_tests;
mod provenance_tests;
