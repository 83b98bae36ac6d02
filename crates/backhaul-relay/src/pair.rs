use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tracing::Span;

use crate::transport::RelayStream;

/// One accepted tunnel connection bound to one freshly dialed local connection
///
/// The pair owns both streams. [`ConnectionPair::close`] consumes it, so both
/// streams are shut down and released exactly once.
pub struct ConnectionPair<R, L> {
    id: u64,
    pub(crate) remote: R,
    pub(crate) local: L,
    span: Span,
}

impl<R: RelayStream, L: RelayStream> ConnectionPair<R, L> {
    pub fn new(id: u64, remote: R, local: L, span: Span) -> Self {
        Self {
            id,
            remote,
            local,
            span,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Span carrying the connection context for every log line of this pair
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Shut down and release both streams
    pub async fn close(mut self) {
        if let Err(e) = self.remote.shutdown().await {
            tracing::trace!(parent: &self.span, "Remote shutdown: {}", e);
        }
        if let Err(e) = self.local.shutdown().await {
            tracing::trace!(parent: &self.span, "Local shutdown: {}", e);
        }
    }
}

/// Close a tunnel connection that never got a local counterpart
pub async fn discard_remote<R: RelayStream>(mut remote: R) {
    if let Err(e) = remote.shutdown().await {
        tracing::trace!("Remote shutdown after dial failure: {}", e);
    }
}

/// Connection ID counter shared by a listener loop
pub struct ConnectionIdGenerator {
    counter: AtomicU64,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_ids_are_monotonic() {
        let ids = ConnectionIdGenerator::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }

    #[tokio::test]
    async fn test_close_releases_both_streams() {
        let (remote, mut remote_peer) = tokio::io::duplex(64);
        let (local, mut local_peer) = tokio::io::duplex(64);
        let pair = ConnectionPair::new(7, remote, local, Span::none());
        assert_eq!(pair.id(), 7);

        pair.close().await;

        let mut buf = [0u8; 8];
        assert_eq!(remote_peer.read(&mut buf).await.unwrap(), 0);
        assert_eq!(local_peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_discard_remote_signals_eof() {
        let (remote, mut remote_peer) = tokio::io::duplex(64);
        discard_remote(remote).await;

        let mut buf = [0u8; 8];
        assert_eq!(remote_peer.read(&mut buf).await.unwrap(), 0);
    }
}
