//! Blind tunnel pump
//!
//! Copies raw bytes between the client and the upstream until both sides
//! close. The idle timeout applies to the tunnel as a whole: it fires only
//! when neither direction moved a byte for the whole interval.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::error::{Result, RotorError};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Last time any direction of a tunnel moved data
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

async fn pump<R, W>(mut reader: R, mut writer: W, activity: &Activity, idle: Duration) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let remaining = idle.saturating_sub(activity.idle_for());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "tunnel idle timeout"));
        }

        // Reads are cancel-safe; a timeout only means "check again"
        let n = match tokio::time::timeout(remaining, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => continue,
        };

        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }

        writer.write_all(&buf[..n]).await?;
        activity.touch();
        total += n as u64;
    }
}

/// Handles CONNECT tunnels once both legs are open
pub struct TunnelHandler;

impl TunnelHandler {
    /// Copy data bidirectionally between two streams
    ///
    /// Returns `(client_to_server, server_to_client)` byte counts. An error or
    /// idle timeout on either direction aborts both.
    #[instrument(skip(client, server))]
    pub async fn copy_bidirectional<C, S>(client: C, server: S, idle: Duration) -> Result<(u64, u64)>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let activity = Activity::new();

        let result = tokio::try_join!(
            pump(client_read, server_write, &activity, idle),
            pump(server_read, client_write, &activity, idle),
        );

        match result {
            Ok((bytes_sent, bytes_received)) => {
                debug!(bytes_sent, bytes_received, "Tunnel closed");
                Ok((bytes_sent, bytes_received))
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                debug!("Tunnel idle for {}ms", idle.as_millis());
                Err(RotorError::Timeout)
            }
            Err(e) => {
                debug!("Tunnel aborted: {}", e);
                Err(RotorError::Io(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_copy_bidirectional() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (mut target_client, target_server) = tokio::io::duplex(1024);

        let copy_handle = tokio::spawn(async move {
            TunnelHandler::copy_bidirectional(client, target_server, Duration::from_secs(5)).await
        });

        server.write_all(b"hello from client").await.unwrap();
        server.shutdown().await.unwrap();

        target_client.write_all(b"hello from server").await.unwrap();
        target_client.shutdown().await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = target_client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from client");

        let mut buf = vec![0u8; 100];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from server");

        let result = tokio::time::timeout(Duration::from_secs(1), copy_handle)
            .await
            .expect("copy_bidirectional timed out")
            .unwrap();
        assert_eq!(result.unwrap(), (17, 17));
    }

    #[tokio::test]
    async fn test_idle_tunnel_times_out() {
        let (client, _client_peer) = tokio::io::duplex(1024);
        let (_server_peer, server) = tokio::io::duplex(1024);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            TunnelHandler::copy_bidirectional(client, server, Duration::from_millis(100)),
        )
        .await
        .expect("idle timeout never fired");

        assert!(matches!(result, Err(RotorError::Timeout)));
    }

    #[tokio::test]
    async fn test_activity_on_one_side_keeps_tunnel_alive() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut server_peer, server) = tokio::io::duplex(1024);

        let copy_handle = tokio::spawn(async move {
            TunnelHandler::copy_bidirectional(client, server, Duration::from_millis(150)).await
        });

        // Only the server side talks, longer than one idle interval in total
        for _ in 0..4 {
            server_peer.write_all(b"tick").await.unwrap();
            let mut buf = [0u8; 4];
            client_peer.read_exact(&mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(60)).await;
        }

        client_peer.shutdown().await.unwrap();
        server_peer.shutdown().await.unwrap();

        let result = copy_handle.await.unwrap();
        assert_eq!(result.unwrap(), (0, 16));
    }
}
