//! Testing utilities and mock implementations
//!
//! Mocks for exercising the publish path without a broker or HTTP proxy.

pub mod mocks;

pub use mocks::*;
