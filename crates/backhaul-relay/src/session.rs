use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{SessionError, TransportError};
use crate::listener::{ListenerLoop, ServeOptions};
use crate::metrics::RelayMetrics;
use crate::transport::{Dialer, RemoteListener, TcpDialer, TransportSession};

/// Lifecycle of one tunnel session
///
/// `Connecting -> Listening -> Serving -> Terminated`; there is no way back. A
/// reconnect builds a new [`SessionLifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Listening,
    Serving,
    Terminated,
}

/// Owns the transport session and its remote listener
pub struct SessionLifecycle<T: TransportSession> {
    transport: T,
    listener: Option<T::Listener>,
    state: watch::Sender<SessionState>,
    metrics: RelayMetrics,
}

impl<T: TransportSession> SessionLifecycle<T> {
    pub fn new(transport: T) -> Self {
        Self::with_metrics(transport, RelayMetrics::new())
    }

    pub fn with_metrics(transport: T, metrics: RelayMetrics) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            transport,
            listener: None,
            state,
            metrics,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        tracing::debug!("Session state {:?} -> {:?}", previous, next);
    }

    /// Ask the relay host to listen on `bind_address:port`
    pub async fn establish(&mut self, bind_address: &str, port: u16) -> Result<(), SessionError> {
        match self.transport.open_remote_listener(bind_address, port).await {
            Ok(listener) => {
                tracing::info!("Remote listener open on {}", listener.describe());
                self.listener = Some(listener);
                self.transition(SessionState::Listening);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to open remote listener: {}", e);
                self.terminate().await;
                Err(e.into())
            }
        }
    }

    /// Run the listener loop until the transport dies or `shutdown` is cancelled
    ///
    /// Always ends in [`SessionState::Terminated`] with the transport closed.
    /// Connection pairs already relaying are left to drain on their own.
    pub async fn serve<D: Dialer>(
        mut self,
        dialer: Arc<D>,
        options: ServeOptions,
        shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        let Some(listener) = self.listener.take() else {
            self.terminate().await;
            return Err(TransportError::Other("remote listener not established".to_string()).into());
        };

        self.transition(SessionState::Serving);

        let result = ListenerLoop::new(listener, dialer, options, self.metrics.clone())
            .run(shutdown)
            .await
            .map_err(SessionError::ListenerClosed);

        self.terminate().await;

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            "Session ended: {} connections accepted, {} still active, {} dial failures (relay up {}s)",
            snapshot.accepted,
            snapshot.active_pairs,
            snapshot.dial_failures,
            snapshot.uptime.as_secs()
        );

        result
    }

    async fn terminate(&mut self) {
        self.transport.close().await;
        self.transition(SessionState::Terminated);
    }
}

/// Forward every connection from `listener` to `local_host:local_port`
///
/// Blocks until the listener fails terminally.
pub async fn run<L>(listener: L, local_host: &str, local_port: u16) -> Result<(), SessionError>
where
    L: RemoteListener,
{
    let dialer = Arc::new(TcpDialer::new(local_host, local_port));
    ListenerLoop::new(listener, dialer, ServeOptions::default(), RelayMetrics::new())
        .run(CancellationToken::new())
        .await
        .map_err(SessionError::ListenerClosed)
}
