//! portrelay Library
//!
//! Transparent TCP port forwarder: every accepted client connection is paired
//! with a new connection to one fixed remote target, and bytes are relayed
//! unmodified in both directions until either side closes.

pub mod config;
pub mod connection;
pub mod error;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use connection::{Listener, RemoteTarget};
pub use error::ForwardError;
pub use relay::{RelayEngine, RelaySettings, Session};
pub use shutdown::ShutdownCoordinator;

/// Common error type for configuration and startup
pub type Result<T> = anyhow::Result<T>;
