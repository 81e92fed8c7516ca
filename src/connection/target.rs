//! Fixed remote target

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ForwardError;

/// The single (host, port) every client is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    host: String,
    port: u16,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve the target to socket addresses
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>, ForwardError> {
        resolve(&self.host, self.port).await
    }

    /// Open a new connection, trying each resolved address in order
    pub async fn connect(
        &self,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpStream, ForwardError> {
        let addrs = self.resolve().await?;

        let mut last_error = None;
        for addr in addrs {
            match try_connect(addr, connect_timeout).await {
                Ok(stream) => {
                    info!("Connected to remote target {} ({})", self, addr);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ForwardError::NoAddresses {
            target: self.to_string(),
        }))
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Resolve `host:port`, accepting literal addresses without a DNS lookup
pub(crate) async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, ForwardError> {
    if let Ok(ip) = host.trim_matches(&['[', ']'][..]).parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    debug!("Resolving host: {}:{}", host, port);
    let target = format!("{}:{}", host, port);
    let addrs: Vec<SocketAddr> = lookup_host(target.as_str())
        .await
        .map_err(|source| ForwardError::Resolve {
            target: target.clone(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(ForwardError::NoAddresses { target });
    }
    debug!("Resolved {} to {} addresses", target, addrs.len());
    Ok(addrs)
}

async fn try_connect(
    addr: SocketAddr,
    connect_timeout: Option<Duration>,
) -> Result<TcpStream, ForwardError> {
    let connect = TcpStream::connect(addr);
    let result = match connect_timeout {
        Some(limit) => timeout(limit, connect)
            .await
            .map_err(|_| ForwardError::ConnectTimeout {
                target: addr.to_string(),
                timeout: limit,
            })?,
        None => connect.await,
    };

    result.map_err(|source| ForwardError::Connect {
        target: addr.to_string(),
        source,
    })
}
