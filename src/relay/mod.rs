//! Data Relay Module
//!
//! Pairs accepted clients with the remote target and copies bytes both ways.

pub mod engine;
pub mod forwarder;
pub mod session;

pub use engine::{RelayEngine, RelaySettings};
pub use forwarder::{Direction, ForwardEnd, Forwarder, DEFAULT_BUFFER_SIZE};
pub use session::{Session, SessionStats};
