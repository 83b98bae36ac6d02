use std::sync::Arc;

use backhaul_relay::{Accepted, ListenerSender, RelayStream};
use dashmap::DashMap;
use russh::client::{self, Msg, Session};
use russh::keys::ssh_key::{HashAlg, PublicKey};
use russh::{Channel, ChannelStream};
use tokio::sync::mpsc::error::TrySendError;

/// How the relay host's key is verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Trust any host key (logged with its fingerprint)
    #[default]
    AcceptAny,
    /// Require a matching entry in `~/.ssh/known_hosts`
    KnownHosts,
}

/// Stream type of a forwarded connection
pub type ForwardedStream = ChannelStream<Msg>;

/// Shared registry for remote forwards
/// Maps bound port -> listener sender
pub type ForwardRegistry = Arc<DashMap<u32, ListenerSender<ForwardedStream>>>;

pub fn new_forward_registry() -> ForwardRegistry {
    Arc::new(DashMap::new())
}

/// Find the listener for a forwarded channel
///
/// Falls back to the only registered forward when the server reports a
/// different port (e.g. a port that was requested as 0).
pub(crate) fn route(
    forwards: &ForwardRegistry,
    connected_port: u32,
) -> Option<ListenerSender<ForwardedStream>> {
    if let Some(sender) = forwards.get(&connected_port) {
        return Some(sender.clone());
    }
    if forwards.len() == 1 {
        return forwards.iter().next().map(|entry| entry.value().clone());
    }
    None
}

/// Client side event handler for the tunnel's SSH session
///
/// Forwarded channels are pushed into the matching listener. The handler is dropped
/// when the session ends, which clears the registry and closes every listener.
pub(crate) struct TunnelHandler {
    addr: String,
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    forwards: ForwardRegistry,
}

impl TunnelHandler {
    pub(crate) fn new(host: &str, port: u16, policy: HostKeyPolicy, forwards: ForwardRegistry) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            host: host.to_string(),
            port,
            policy,
            forwards,
        }
    }
}

impl Drop for TunnelHandler {
    fn drop(&mut self) {
        tracing::debug!("SSH session to {} ended", self.addr);
        self.forwards.clear();
    }
}

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);

        match self.policy {
            HostKeyPolicy::AcceptAny => {
                tracing::warn!(
                    "Accepting host key {} for {} without verification",
                    fingerprint,
                    self.addr
                );
                Ok(true)
            }
            HostKeyPolicy::KnownHosts => {
                match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(true) => {
                        tracing::info!("Host key verified for {}", self.addr);
                        Ok(true)
                    }
                    Ok(false) => {
                        tracing::error!(
                            "Host key {} for {} is not in known_hosts",
                            fingerprint,
                            self.addr
                        );
                        Ok(false)
                    }
                    Err(e) => {
                        tracing::error!("Host key verification failed for {}: {}", self.addr, e);
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let peer = format!("{}:{}", originator_address, originator_port);

        let Some(sender) = route(&self.forwards, connected_port) else {
            tracing::warn!(
                "Forwarded connection for {}:{} with no matching listener",
                connected_address,
                connected_port
            );
            let _ = channel.close().await;
            return Ok(());
        };

        tracing::debug!(
            "Forwarded connection from {} via {}:{}",
            peer,
            connected_address,
            connected_port
        );

        deliver(&sender, Accepted::new(channel.into_stream(), peer));
        Ok(())
    }
}

/// Hand a forwarded connection to its listener without waiting
///
/// Never blocks the session loop on a slow listener. Returns false when the
/// connection was dropped because the backlog is full or the listener is gone.
fn deliver<S: RelayStream>(sender: &ListenerSender<S>, accepted: Accepted<S>) -> bool {
    match sender.try_send(Ok(accepted)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!("Listener backlog full, dropping forwarded connection");
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!("Listener gone, dropping forwarded connection");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use backhaul_relay::{ChannelListener, RemoteListener};
    use tokio::io::DuplexStream;

    #[test]
    fn test_route_exact_and_fallback() {
        let forwards = new_forward_registry();
        assert!(route(&forwards, 11111).is_none());

        let (tx, _listener) = ChannelListener::<ForwardedStream>::channel(1, "a");
        forwards.insert(11111, tx);
        assert!(route(&forwards, 11111).is_some());
        // Single forward catches a port reassigned by the server
        assert!(route(&forwards, 40000).is_some());

        let (tx, _other) = ChannelListener::<ForwardedStream>::channel(1, "b");
        forwards.insert(22222, tx);
        assert!(route(&forwards, 40000).is_none());
        assert!(route(&forwards, 22222).is_some());
    }

    #[test]
    fn test_default_policy_accepts_any() {
        assert_eq!(HostKeyPolicy::default(), HostKeyPolicy::AcceptAny);
    }

    #[tokio::test]
    async fn test_dropped_handler_closes_listeners() {
        let forwards = new_forward_registry();
        let (tx, mut listener) = ChannelListener::<ForwardedStream>::channel(4, "relay:11111");
        forwards.insert(11111, tx);

        let handler = TunnelHandler::new("relay", 22, HostKeyPolicy::AcceptAny, forwards.clone());
        drop(handler);

        assert!(forwards.is_empty());
        let err = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .expect("Listener stayed open after the session ended")
            .err()
            .expect("Accept succeeded on a dead session");
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_deliver_drops_when_backlog_full() {
        let (tx, mut listener) = ChannelListener::<DuplexStream>::channel(1, "relay:11111");

        let (first, _first_peer) = tokio::io::duplex(64);
        let (second, _second_peer) = tokio::io::duplex(64);
        assert!(deliver(&tx, Accepted::new(first, "10.0.0.1:40001")));
        assert!(!deliver(&tx, Accepted::new(second, "10.0.0.2:40002")));

        // Only the first connection is queued
        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.peer, "10.0.0.1:40001");

        drop(listener);
        let (third, _third_peer) = tokio::io::duplex(64);
        assert!(!deliver(&tx, Accepted::new(third, "10.0.0.3:40003")));
    }
}
