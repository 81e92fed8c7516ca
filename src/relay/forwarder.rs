//! One-direction copy loop

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::Session;
use crate::error::ForwardError;

/// Default read buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Which way a forwarder moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToRemote,
    RemoteToClient,
}

impl Direction {
    fn record(self, session: &Session, bytes: usize) {
        match self {
            Direction::ClientToRemote => session.add_bytes_up(bytes as u64),
            Direction::RemoteToClient => session.add_bytes_down(bytes as u64),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToRemote => f.write_str("client->remote"),
            Direction::RemoteToClient => f.write_str("remote->client"),
        }
    }
}

/// How a forwarder stopped
#[derive(Debug)]
pub enum ForwardEnd {
    /// The source reached end-of-stream
    Eof,
    /// The peer forwarder closed the session first
    SessionClosed,
    /// Neither direction moved data for the configured idle timeout
    IdleTimeout,
    /// A read or write failed
    Failed(ForwardError),
}

impl ForwardEnd {
    pub fn is_failure(&self) -> bool {
        matches!(self, ForwardEnd::Failed(_))
    }
}

/// Copies bytes from `reader` to `writer` until end-of-stream, error, idle
/// expiry or session close, then closes the session.
pub struct Forwarder<R, W> {
    direction: Direction,
    reader: R,
    writer: W,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
}

impl<R, W> Forwarder<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(direction: Direction, reader: R, writer: W, buffer_size: usize) -> Self {
        Self {
            direction,
            reader,
            writer,
            buffer_size: buffer_size.max(1),
            idle_timeout: None,
        }
    }

    /// Stop once the whole session has been idle this long
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }


    /// Run the copy loop to completion
    pub async fn run(mut self, session: &Session) -> ForwardEnd {
        let end = tokio::select! {
            biased;
            _ = session.closed() => ForwardEnd::SessionClosed,
            end = self.copy(session) => end,
        };

        // Close failures on an already broken endpoint are expected
        if let Err(e) = self.writer.shutdown().await {
            trace!("{}: shutdown of destination failed: {}", self.direction, e);
        }
        session.close();

        match &end {
            ForwardEnd::Eof => debug!("{}: connection closed by source", self.direction),
            ForwardEnd::SessionClosed => {
                debug!("{}: session closed by peer direction", self.direction)
            }
            ForwardEnd::IdleTimeout => info!(
                "{}: session idle for {:?}, closing",
                self.direction,
                session.idle_for()
            ),
            ForwardEnd::Failed(e) => match e.io_kind() {
                Some(io::ErrorKind::ConnectionReset)
                | Some(io::ErrorKind::ConnectionAborted)
                | Some(io::ErrorKind::BrokenPipe) => debug!("{}", e),
                _ => warn!("{}", e),
            },
        }

        end
    }

    async fn copy(&mut self, session: &Session) -> ForwardEnd {
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let n = match self.read_chunk(&mut buf, session).await {
                Ok(Some(0)) => return ForwardEnd::Eof,
                Ok(Some(n)) => n,
                Ok(None) => return ForwardEnd::IdleTimeout,
                Err(e) => return self.failed(e),
            };

            session.touch();

            if let Err(e) = self.write_chunk(&buf[..n], session).await {
                return self.failed(e);
            }
            trace!("{}: forwarded {} bytes", self.direction, n);
        }
    }

    /// Write a whole chunk, counting each partial write as activity so a slow
    /// consumer does not look idle.
    async fn write_chunk(&mut self, chunk: &[u8], session: &Session) -> io::Result<()> {
        let mut written = 0;
        while written < chunk.len() {
            let n = self.writer.write(&chunk[written..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += n;
            self.direction.record(session, n);
            session.touch();
        }
        Ok(())
    }

    /// Read one chunk. `Ok(None)` means the session went idle.
    async fn read_chunk(
        &mut self,
        buf: &mut [u8],
        session: &Session,
    ) -> io::Result<Option<usize>> {
        let Some(limit) = self.idle_timeout else {
            return self.reader.read(buf).await.map(Some);
        };

        loop {
            match timeout(limit, self.reader.read(buf)).await {
                Ok(result) => return result.map(Some),
                // The other direction may still be active
                Err(_) if session.idle_for() < limit => continue,
                Err(_) => return Ok(None),
            }
        }
    }

    fn failed(&self, source: io::Error) -> ForwardEnd {
        ForwardEnd::Failed(ForwardError::Stream {
            direction: self.direction,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn session() -> Session {
        Session::new(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:8000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_copies_chunks_in_order_until_eof() {
        let session = session();
        let reader = Builder::new().read(b"hello ").read(b"world").build();
        let writer = Builder::new().write(b"hello ").write(b"world").build();

        let end = Forwarder::new(Direction::ClientToRemote, reader, writer, DEFAULT_BUFFER_SIZE)
            .run(&session)
            .await;

        assert!(matches!(end, ForwardEnd::Eof));
        assert_eq!(session.bytes_up(), 11);
        assert_eq!(session.bytes_down(), 0);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_chunks_larger_than_buffer_are_split() {
        let session = session();
        let reader = Builder::new().read(b"abcdefgh").build();
        let writer = Builder::new().write(b"abc").write(b"def").write(b"gh").build();

        let end = Forwarder::new(Direction::RemoteToClient, reader, writer, 3)
            .run(&session)
            .await;

        assert!(matches!(end, ForwardEnd::Eof));
        assert_eq!(session.bytes_down(), 8);
    }

    #[tokio::test]
    async fn test_read_error_closes_session() {
        let session = session();
        let reader = Builder::new()
            .read(b"abc")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let writer = Builder::new().write(b"abc").build();

        let end = Forwarder::new(Direction::ClientToRemote, reader, writer, DEFAULT_BUFFER_SIZE)
            .run(&session)
            .await;

        match end {
            ForwardEnd::Failed(ForwardError::Stream { direction, source }) => {
                assert_eq!(direction, Direction::ClientToRemote);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("unexpected end: {:?}", other),
        }
        assert_eq!(session.bytes_up(), 3);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_write_error_closes_session() {
        let session = session();
        let reader = Builder::new().read(b"payload").build();
        let writer = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
            .build();

        let end = Forwarder::new(Direction::RemoteToClient, reader, writer, DEFAULT_BUFFER_SIZE)
            .run(&session)
            .await;

        assert!(end.is_failure());
        assert_eq!(session.bytes_down(), 0);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_stops_when_session_already_closed() {
        let session = session();
        session.close();

        let reader = Builder::new().build();
        let writer = Builder::new().build();

        let end = Forwarder::new(Direction::ClientToRemote, reader, writer, DEFAULT_BUFFER_SIZE)
            .run(&session)
            .await;

        assert!(matches!(end, ForwardEnd::SessionClosed));
    }

    #[tokio::test]
    async fn test_peer_close_interrupts_blocked_read() {
        let session = std::sync::Arc::new(session());
        let (_client, source) = tokio::io::duplex(64);
        let (sink, _remote) = tokio::io::duplex(64);

        let handle = {
            let session = session.clone();
            tokio::spawn(async move {
                Forwarder::new(Direction::ClientToRemote, source, sink, DEFAULT_BUFFER_SIZE)
                    .run(&session)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close();

        let end = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("forwarder did not stop")
            .unwrap();
        assert!(matches!(end, ForwardEnd::SessionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_session() {
        let session = session();
        let reader = Builder::new().wait(Duration::from_secs(60)).build();
        let writer = Builder::new().build();

        let end = Forwarder::new(Direction::ClientToRemote, reader, writer, DEFAULT_BUFFER_SIZE)
            .with_idle_timeout(Some(Duration::from_millis(100)))
            .run(&session)
            .await;

        assert!(matches!(end, ForwardEnd::IdleTimeout));
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_is_not_idle() {
        let session = std::sync::Arc::new(session());
        let payload = pattern(64 * 1024);
        let chunk = payload.len();
        let idle_timeout = Some(Duration::from_millis(300));

        // Client side drains 1 KiB every 20 ms while the remote stays quiet
        let (sink, mut client) = tokio::io::duplex(1024);
        let (_remote, quiet) = tokio::io::duplex(1024);

        let upload = {
            let session = session.clone();
            tokio::spawn(async move {
                Forwarder::new(
                    Direction::ClientToRemote,
                    quiet,
                    tokio::io::sink(),
                    DEFAULT_BUFFER_SIZE,
                )
                .with_idle_timeout(idle_timeout)
                .run(&session)
                .await
            })
        };

        let download = Forwarder::new(
            Direction::RemoteToClient,
            Builder::new().read(&payload).build(),
            sink,
            chunk,
        )
        .with_idle_timeout(idle_timeout)
        .run(&session);

        let drain = async {
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let n = client.read(&mut buf).await.unwrap();
                if n == 0 {
                    return received;
                }
                received.extend_from_slice(&buf[..n]);
            }
        };

        let (download_end, received) = tokio::join!(download, drain);

        assert_eq!(received.len(), payload.len());
        assert!(received == payload);
        assert!(matches!(download_end, ForwardEnd::Eof));
        assert!(matches!(upload.await.unwrap(), ForwardEnd::SessionClosed));
        assert_eq!(session.bytes_down(), payload.len() as u64);
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::ClientToRemote.to_string(), "client->remote");
        assert_eq!(Direction::RemoteToClient.to_string(), "remote->client");
    }
}
