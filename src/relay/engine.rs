//! Relay Engine

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, info_span, instrument, warn, Instrument, Span};
use uuid::Uuid;

use super::{Direction, Forwarder, Session, SessionStats, DEFAULT_BUFFER_SIZE};
use crate::config::Config;
use crate::connection::RemoteTarget;
use crate::error::ForwardError;

type SessionMap = Arc<Mutex<HashMap<Uuid, Arc<Session>>>>;

/// Per-session relay tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
            connect_timeout: None,
        }
    }
}

impl From<&Config> for RelaySettings {
    fn from(config: &Config) -> Self {
        Self {
            buffer_size: config.relay.buffer_size,
            idle_timeout: config.relay.idle_timeout,
            connect_timeout: config.remote.connect_timeout,
        }
    }
}

/// Wires accepted clients to the remote target and tracks live sessions
pub struct RelayEngine {
    target: RemoteTarget,
    settings: RelaySettings,
    active_sessions: SessionMap,
    sessions_established: AtomicUsize,
}

impl RelayEngine {
    /// Create a new relay engine
    pub fn new(target: RemoteTarget, settings: RelaySettings) -> Self {
        Self {
            target,
            settings,
            active_sessions: Arc::new(Mutex::new(HashMap::new())),
            sessions_established: AtomicUsize::new(0),
        }
    }

    /// Create a new relay engine from configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            RemoteTarget::new(config.remote.host.clone(), config.remote.port),
            RelaySettings::from(config),
        )
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Establish a new connection to the remote target
    pub async fn connect_to_target(&self) -> Result<TcpStream, ForwardError> {
        debug!("Connecting to remote target {}", self.target);
        self.target.connect(self.settings.connect_timeout).await
    }

    /// Pair an accepted client with a fresh remote connection.
    ///
    /// On connect failure the client is closed and no forwarders start. On
    /// success both forwarders are spawned and the session is returned
    /// without waiting for them.
    #[instrument(skip(self, client))]
    pub async fn start_session(
        &self,
        client: TcpStream,
        client_addr: SocketAddr,
    ) -> Result<Arc<Session>, ForwardError> {
        let remote = match self.connect_to_target().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Closing client {}: {}", client_addr, e);
                drop(client);
                return Err(e);
            }
        };

        let remote_addr = remote.peer_addr().map_err(|source| ForwardError::Connect {
            target: self.target.to_string(),
            source,
        })?;

        let session = Arc::new(Session::new(client_addr, remote_addr));
        self.active_sessions
            .lock()
            .insert(session.session_id, Arc::clone(&session));
        self.sessions_established.fetch_add(1, Ordering::Relaxed);

        let (client_read, client_write) = client.into_split();
        let (remote_read, remote_write) = remote.into_split();
        let span = info_span!("session", id = %session.session_id);

        self.spawn_forwarder(
            Forwarder::new(
                Direction::ClientToRemote,
                client_read,
                remote_write,
                self.settings.buffer_size,
            ),
            &session,
            span.clone(),
        );
        self.spawn_forwarder(
            Forwarder::new(
                Direction::RemoteToClient,
                remote_read,
                client_write,
                self.settings.buffer_size,
            ),
            &session,
            span,
        );

        info!(
            "Started session {} forwarding {} <-> {}",
            session.session_id, client_addr, remote_addr
        );
        Ok(session)
    }

    fn spawn_forwarder<R, W>(&self, forwarder: Forwarder<R, W>, session: &Arc<Session>, span: Span)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let forwarder = forwarder.with_idle_timeout(self.settings.idle_timeout);
        let session = Arc::clone(session);
        let active_sessions = Arc::clone(&self.active_sessions);

        tokio::spawn(
            async move {
                forwarder.run(&session).await;

                if session.forwarder_finished() {
                    active_sessions.lock().remove(&session.session_id);
                    session.log_stats();
                }
            }
            .instrument(span),
        );
    }

    /// Get all active sessions
    pub fn active_sessions(&self) -> Vec<Arc<Session>> {
        self.active_sessions.lock().values().cloned().collect()
    }

    /// Get active session count
    pub fn active_session_count(&self) -> usize {
        self.active_sessions.lock().len()
    }

    /// Get session by ID
    pub fn get_session(&self, session_id: &Uuid) -> Option<Arc<Session>> {
        self.active_sessions.lock().get(session_id).cloned()
    }

    /// Get statistics for all active sessions
    pub fn active_session_stats(&self) -> Vec<SessionStats> {
        self.active_sessions
            .lock()
            .values()
            .map(|session| session.to_stats())
            .collect()
    }

    /// Sessions established since start, including finished ones
    pub fn sessions_established(&self) -> usize {
        self.sessions_established.load(Ordering::Relaxed)
    }
}
