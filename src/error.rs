//! Relay Error Types
//!
//! Errors raised while listening, connecting and forwarding. Each variant is
//! scoped: bind failures are fatal to the process, everything else is local
//! to a single connection or session.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::relay::Direction;

/// Errors produced by the forwarding subsystem
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The listening socket could not be created, bound or put into listen mode
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Host name resolution failed
    #[error("failed to resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Host name resolution succeeded but produced nothing to connect to
    #[error("no addresses resolved for {target}")]
    NoAddresses { target: String },

    /// A single accept call failed
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// The remote target refused or could not be reached
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The remote target did not answer within the connect timeout
    #[error("connection to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    /// Read or write failure on one direction of a session
    #[error("{direction} stream error: {source}")]
    Stream {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

impl ForwardError {
    /// Whether this error should stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, ForwardError::Bind { .. })
    }

    /// Underlying I/O error kind, when there is one
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            ForwardError::Bind { source, .. }
            | ForwardError::Resolve { source, .. }
            | ForwardError::Connect { source, .. }
            | ForwardError::Stream { source, .. }
            | ForwardError::Accept(source) => Some(source.kind()),
            ForwardError::NoAddresses { .. } | ForwardError::ConnectTimeout { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_bind_is_fatal() {
        let bind = ForwardError::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        let accept = ForwardError::Accept(io::Error::new(io::ErrorKind::Other, "emfile"));
        let connect = ForwardError::Connect {
            target: "127.0.0.1:1".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };

        assert!(bind.is_fatal());
        assert!(!accept.is_fatal());
        assert!(!connect.is_fatal());
        assert_eq!(connect.io_kind(), Some(io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_stream_error_names_direction() {
        let err = ForwardError::Stream {
            direction: Direction::RemoteToClient,
            source: io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"),
        };
        assert_eq!(err.to_string(), "remote->client stream error: broken pipe");
    }
}
