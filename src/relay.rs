//! Bidirectional TCP relay with idle supervision.
//!
//! [`pipe`] moves bytes between a client-facing stream and a remote-facing
//! stream until either side reaches EOF or the pipe as a whole goes silent.
//! Each read is bounded by the idle timeout, but a timeout is a tick rather
//! than a failure: the direction re-checks how long the whole relay has been
//! quiet and only then gives up, so traffic in one direction keeps both
//! alive.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

const PIPE_BUF: usize = 8 * 1024;

/// RelayStats reports how a finished relay went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes moved from the client side to the remote side.
    pub from_client: u64,
    /// Bytes moved from the remote side to the client side.
    pub from_remote: u64,
    /// Whether the relay ended on the idle timeout rather than EOF.
    pub idle: bool,
}

/// pipe relays bytes between `client` and `remote` until either side reaches
/// EOF, a transfer fails, or the relay stays silent past `idle`. Both writers
/// are shut down on the way out.
pub async fn pipe<C, R>(client: C, remote: R, idle: Duration) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));
    let from_client = Arc::new(AtomicU64::new(0));
    let from_remote = Arc::new(AtomicU64::new(0));

    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut remote_r, mut remote_w) = tokio::io::split(remote);

    let up = copy_direction(
        &mut client_r,
        &mut remote_w,
        idle,
        start,
        Arc::clone(&last_activity),
        Arc::clone(&from_client),
    );
    let down = copy_direction(
        &mut remote_r,
        &mut client_w,
        idle,
        start,
        Arc::clone(&last_activity),
        Arc::clone(&from_remote),
    );

    // Either direction finishing ends the relay; the laggard is dropped
    let result = tokio::select! {
        r = up => r,
        r = down => r,
    };

    let _ = client_w.shutdown().await;
    let _ = remote_w.shutdown().await;

    let idle_out = result?;
    Ok(RelayStats {
        from_client: from_client.load(Ordering::Relaxed),
        from_remote: from_remote.load(Ordering::Relaxed),
        idle: idle_out,
    })
}

/// copy_direction moves bytes one way, returning true when it stopped on the
/// idle timeout and false on EOF.
async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    start: Instant,
    last_activity: Arc<AtomicU64>,
    count: Arc<AtomicU64>,
) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; PIPE_BUF];
    loop {
        match timeout(idle, reader.read(&mut buf)).await {
            Ok(Ok(0)) => return Ok(false),
            Ok(Ok(n)) => {
                last_activity.store(elapsed_millis(start), Ordering::Relaxed);
                writer.write_all(&buf[..n]).await?;
                count.fetch_add(n as u64, Ordering::Relaxed);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                // A timed-out read is only fatal once the relay as a whole
                // has been silent for the full idle budget
                let silent = elapsed_millis(start).saturating_sub(last_activity.load(Ordering::Relaxed));
                if silent >= idle.as_millis() as u64 {
                    debug!("relay idle for {silent}ms, closing");
                    return Ok(true);
                }
            }
        }
    }
}

fn elapsed_millis(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
