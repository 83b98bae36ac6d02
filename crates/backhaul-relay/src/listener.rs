use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::error::AcceptError;
use crate::metrics::RelayMetrics;
use crate::pair::{discard_remote, ConnectionIdGenerator, ConnectionPair};
use crate::relay::{relay, RelayOptions};
use crate::transport::{Accepted, Dialer, RelayStream, RemoteListener};

/// Pause after a transient accept failure so a persistently failing listener cannot spin
pub const DEFAULT_ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Settings for a listener loop
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub relay: RelayOptions,
    /// Maximum number of simultaneously active pairs (None = unbounded)
    pub max_connections: Option<usize>,
    pub accept_retry_delay: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            relay: RelayOptions::default(),
            max_connections: None,
            accept_retry_delay: DEFAULT_ACCEPT_RETRY_DELAY,
        }
    }
}

/// Accepts tunnel connections and hands each one to its own relay task
pub struct ListenerLoop<L, D> {
    listener: L,
    dialer: Arc<D>,
    options: ServeOptions,
    metrics: RelayMetrics,
    ids: ConnectionIdGenerator,
}

impl<L, D> ListenerLoop<L, D>
where
    L: RemoteListener,
    D: Dialer,
{
    pub fn new(listener: L, dialer: Arc<D>, options: ServeOptions, metrics: RelayMetrics) -> Self {
        Self {
            listener,
            dialer,
            options,
            metrics,
            ids: ConnectionIdGenerator::new(),
        }
    }

    /// Accept until the listener dies or `shutdown` is cancelled
    ///
    /// Returns the terminal accept error when the transport goes away, `Ok(())` on
    /// shutdown. Relay tasks already dispatched keep running either way.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), AcceptError> {
        let limiter = self
            .options
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        tracing::info!(
            "Forwarding {} -> {}",
            self.listener.describe(),
            self.dialer.target()
        );

        loop {
            let permit = match &limiter {
                Some(limiter) => {
                    let acquire = limiter.clone().acquire_owned();
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        permit = acquire => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                    }
                }
                None => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok(accepted) => {
                    self.metrics.record_accept();
                    self.dispatch(accepted, permit);
                }
                Err(e) if e.is_terminal() => {
                    tracing::error!("{}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    self.metrics.record_accept_error(e.to_string());
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.options.accept_retry_delay) => {}
                    }
                }
            }
        }

        tracing::info!("Listener loop stopped");
        Ok(())
    }

    fn dispatch(&self, accepted: Accepted<L::Stream>, permit: Option<OwnedSemaphorePermit>) {
        let id = self.ids.next();
        let span = tracing::info_span!("connection", id, peer = %accepted.peer);
        tracing::info!(parent: &span, "Accepted connection");

        let dialer = self.dialer.clone();
        let options = self.options.relay.clone();
        let metrics = self.metrics.clone();
        let active = metrics.track_pair();

        tokio::spawn(async move {
            let _permit = permit;
            let _active = active;
            handle_connection(id, accepted.stream, dialer, options, metrics, span).await;
        });
    }
}

async fn handle_connection<S, D>(
    id: u64,
    remote: S,
    dialer: Arc<D>,
    options: RelayOptions,
    metrics: RelayMetrics,
    span: Span,
) where
    S: RelayStream,
    D: Dialer,
{
    tracing::debug!(parent: &span, "Dialing {}", dialer.target());

    match dialer.dial().instrument(span.clone()).await {
        Ok(local) => {
            let pair = ConnectionPair::new(id, remote, local, span);
            relay(pair, &options, &metrics).await;
        }
        Err(e) => {
            tracing::warn!(parent: &span, "{}", e);
            metrics.record_dial_failure(e.to_string());
            discard_remote(remote).await;
        }
    }
}
