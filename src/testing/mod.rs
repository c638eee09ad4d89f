//! Testing utilities and mock implementations
//!
//! Lets the client state machine, factory and subscriptions be exercised
//! without a broker or a native MQTT stack.

pub mod mocks;

pub use mocks::*;
