//! Connection Module
//!
//! Inbound listener and the outbound remote target.

pub mod listener;
pub mod target;

pub use listener::Listener;
pub use target::RemoteTarget;
