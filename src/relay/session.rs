//! Relay Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Forwarders started per session, one per direction
const FORWARDERS_PER_SESSION: usize = 2;

/// A client endpoint paired with its remote endpoint
///
/// The session does not hold the sockets themselves; their halves are owned by
/// the two forwarders. What it owns is the shared close signal: `close()` is
/// idempotent, and once it fires both forwarders stop and drop their halves,
/// which closes both endpoints together.
#[derive(Debug)]
pub struct Session {
    pub session_id: Uuid,
    pub client_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub start_time: Instant,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    /// Milliseconds since `start_time` at which data last moved
    last_activity_ms: AtomicU64,
    running_forwarders: AtomicUsize,
    closed: watch::Sender<bool>,
}

/// Statistics snapshot for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub client_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
}

impl Session {
    /// Create a new session with a random id
    pub fn new(client_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let session_id = Uuid::new_v4();
        debug!(
            "Creating new session: {} ({} -> {})",
            session_id, client_addr, remote_addr
        );

        let (closed, _) = watch::channel(false);
        Self {
            session_id,
            client_addr,
            remote_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            running_forwarders: AtomicUsize::new(FORWARDERS_PER_SESSION),
            closed,
        }
    }

    /// Close the session. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let closed_now = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });

        if closed_now {
            debug!("Session {} closed after {:?}", self.session_id, self.duration());
        }
        closed_now
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receiver that observes the close signal
    pub fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Wait until the session is closed
    pub async fn closed(&self) {
        let mut rx = self.subscribe_close();
        // The sender lives as long as `self`, so this only returns once closed
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Record that data moved in either direction
    pub fn touch(&self) {
        let now = self.start_time.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since data last moved in either direction
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.start_time.elapsed().saturating_sub(last)
    }

    /// Mark one forwarder as finished. Returns `true` for the last one.
    pub(crate) fn forwarder_finished(&self) -> bool {
        self.running_forwarders.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Number of forwarders still running
    pub fn running_forwarders(&self) -> usize {
        self.running_forwarders.load(Ordering::Acquire)
    }

    /// Get bytes transferred upstream (client to remote)
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Get bytes transferred downstream (remote to client)
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Add bytes to upstream counter
    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes to downstream counter
    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Generate session statistics
    pub fn to_stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id,
            client_addr: self.client_addr,
            remote_addr: self.remote_addr,
            duration_ms: self.duration().as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
        }
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            client_addr = %self.client_addr,
            remote_addr = %self.remote_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            total_bytes = self.total_bytes(),
            "Session completed"
        );
    }
}
