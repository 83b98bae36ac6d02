//! Bidirectional copy between the two halves of a [`ConnectionPair`]
//!
//! Each direction runs until its source reaches end-of-stream, then shuts down the
//! write side of its destination so the peer observes EOF. The two directions
//! are not symmetric:
//!
//! - remote EOF is a half-close: local -> remote keeps running, so a local
//!   service can still answer after the tunnel client finished sending;
//! - local EOF ends the pair: the local service is done, and waiting on the
//!   tunnel client would keep both sockets open for as long as it stays
//!   connected.
//!
//! Both directions share a cancellation token: local EOF, an I/O error in
//! either direction, or the idle watchdog cancels it and stops the other
//! direction immediately.

use std::io;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{CopyError, Direction};
use crate::metrics::RelayMetrics;
use crate::pair::ConnectionPair;
use crate::transport::RelayStream;

/// Default size of the per-direction copy buffer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Per-pair relay settings
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Close the pair when no byte moved in either direction for this long
    pub idle_timeout: Option<Duration>,
    pub buffer_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// How one copy direction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionEnd {
    /// Source reached end-of-stream and the destination was half-closed
    Eof,
    /// Read or write failed
    Failed,
    /// Stopped by the pair's cancellation token
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionReport {
    pub bytes: u64,
    pub end: DirectionEnd,
}

/// Summary of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub remote_to_local: DirectionReport,
    pub local_to_remote: DirectionReport,
    pub idle_timed_out: bool,
}

/// Last time a byte moved through the pair
struct ActivityClock {
    last: Mutex<Instant>,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.last.lock()
    }
}

/// Relay bytes in both directions until both are drained, then close the pair
///
/// Never fails: copy errors are logged with the pair's context and reflected in
/// the returned report. Both streams are closed before this returns.
pub async fn relay<R, L>(
    mut pair: ConnectionPair<R, L>,
    options: &RelayOptions,
    metrics: &RelayMetrics,
) -> RelayReport
where
    R: RelayStream,
    L: RelayStream,
{
    let span = pair.span().clone();
    let id = pair.id();

    async move {
        tracing::debug!("Relaying connection {}", id);

        let cancel = CancellationToken::new();
        let activity = ActivityClock::new();
        let buffer_size = options.buffer_size.max(1);

        let (remote_to_local, local_to_remote, idle_timed_out) = {
            let (remote_rd, remote_wr) = tokio::io::split(&mut pair.remote);
            let (local_rd, local_wr) = tokio::io::split(&mut pair.local);

            let upstream = copy_direction(
                Direction::RemoteToLocal,
                remote_rd,
                local_wr,
                buffer_size,
                &cancel,
                &activity,
                metrics,
            );
            let downstream = copy_direction(
                Direction::LocalToRemote,
                local_rd,
                remote_wr,
                buffer_size,
                &cancel,
                &activity,
                metrics,
            );

            let finished = CancellationToken::new();
            let copies = async {
                let reports = tokio::join!(upstream, downstream);
                finished.cancel();
                reports
            };
            let watchdog = async {
                let expired = idle_expired(&finished, options.idle_timeout, &activity).await;
                if expired {
                    tracing::info!("Connection idle, closing");
                    metrics.record_idle_timeout();
                    cancel.cancel();
                }
                expired
            };

            let ((up, down), idle_timed_out) = tokio::join!(copies, watchdog);
            (up, down, idle_timed_out)
        };

        pair.close().await;

        tracing::info!(
            bytes_in = remote_to_local.bytes,
            bytes_out = local_to_remote.bytes,
            "Connection closed"
        );

        RelayReport {
            remote_to_local,
            local_to_remote,
            idle_timed_out,
        }
    }
    .instrument(span)
    .await
}

async fn copy_direction<Rd, Wr>(
    direction: Direction,
    mut reader: Rd,
    mut writer: Wr,
    buffer_size: usize,
    cancel: &CancellationToken,
    activity: &ActivityClock,
    metrics: &RelayMetrics,
) -> DirectionReport
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;
    let end = match pump(
        direction,
        &mut reader,
        &mut writer,
        buffer_size,
        cancel,
        activity,
        metrics,
        &mut bytes,
    )
    .await
    {
        Ok(end) => {
            tracing::debug!("{} finished: {:?} after {} bytes", direction, end, bytes);
            if end == DirectionEnd::Eof && direction == Direction::LocalToRemote {
                cancel.cancel();
            }
            end
        }
        Err(source) => {
            // Stop the opposite direction right away
            cancel.cancel();

            let err = CopyError { direction, source };
            if err.is_peer_closed() {
                tracing::debug!("{}", err);
            } else {
                tracing::warn!("{}", err);
            }
            metrics.record_copy_error(err.to_string());
            DirectionEnd::Failed
        }
    };

    DirectionReport { bytes, end }
}

#[allow(clippy::too_many_arguments)]
async fn pump<Rd, Wr>(
    direction: Direction,
    reader: &mut Rd,
    writer: &mut Wr,
    buffer_size: usize,
    cancel: &CancellationToken,
    activity: &ActivityClock,
    metrics: &RelayMetrics,
    bytes: &mut u64,
) -> io::Result<DirectionEnd>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(DirectionEnd::Cancelled),
            read = reader.read(&mut buf) => read?,
        };

        if n == 0 {
            // Propagate EOF; the caller decides whether the pair ends here
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(DirectionEnd::Cancelled),
                shut = writer.shutdown() => shut?,
            }
            return Ok(DirectionEnd::Eof);
        }

        activity.touch();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(DirectionEnd::Cancelled),
            written = write_chunk(writer, &buf[..n]) => written?,
        }

        *bytes += n as u64;
        metrics.record_bytes(direction, n as u64);
        activity.touch();
    }
}

async fn write_chunk<Wr: AsyncWrite + Unpin>(writer: &mut Wr, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

/// `true` if the pair went idle before both copies finished
///
/// A pair that finished is never reported idle, even when the deadline passed
/// at the same moment.
async fn idle_expired(
    finished: &CancellationToken,
    idle_timeout: Option<Duration>,
    activity: &ActivityClock,
) -> bool {
    tokio::select! {
        biased;
        _ = finished.cancelled() => false,
        _ = idle_watchdog(idle_timeout, activity) => true,
    }
}

async fn idle_watchdog(idle_timeout: Option<Duration>, activity: &ActivityClock) {
    let Some(idle_timeout) = idle_timeout else {
        return std::future::pending().await;
    };

    loop {
        let deadline = activity.last() + idle_timeout;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}
