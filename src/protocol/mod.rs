//! Value types shared between the client state machine and the native layer
//!
//! - [`options`] - identity, connection options, status and QoS
//! - [`events`] - structured event keys, payload map and typed payloads

pub mod events;
pub mod options;

pub use events::*;
pub use options::*;
