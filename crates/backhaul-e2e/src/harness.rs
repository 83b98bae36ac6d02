//! Loopback relay host for E2E tests
//!
//! [`TestRelayHost`] plays the SSH relay host: it owns a TCP listener on
//! 127.0.0.1 standing in for the public port and a [`TestTransport`] that hands
//! connections accepted there to the session through a [`ChannelListener`].
//! Tests can inject accept failures or kill the transport outright.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backhaul_relay::{
    AcceptError, Accepted, ChannelListener, ListenerSender, RelayMetrics, ServeOptions,
    SessionError, SessionLifecycle, SessionState, TcpDialer, TransportError, TransportSession,
};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Forwarded connections queued between the public port and the session
const BACKLOG: usize = 32;

struct HostState {
    public: Mutex<Option<TcpListener>>,
    sender: Mutex<Option<ListenerSender<TcpStream>>>,
    killed: CancellationToken,
    refuse: bool,
}

/// A fake relay host with one public port
pub struct TestRelayHost {
    public_addr: SocketAddr,
    state: Arc<HostState>,
}

impl TestRelayHost {
    pub async fn start() -> Self {
        Self::bind(false).await
    }

    /// A relay host that refuses every listen request
    pub async fn refusing() -> Self {
        Self::bind(true).await
    }

    async fn bind(refuse: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind public port");
        let public_addr = listener.local_addr().unwrap();

        Self {
            public_addr,
            state: Arc::new(HostState {
                public: Mutex::new(Some(listener)),
                sender: Mutex::new(None),
                killed: CancellationToken::new(),
                refuse,
            }),
        }
    }

    /// Address clients connect to
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn public_port(&self) -> u16 {
        self.public_addr.port()
    }

    /// Transport session connected to this host
    pub fn transport(&self) -> TestTransport {
        TestTransport {
            state: self.state.clone(),
        }
    }

    /// Deliver a transient accept failure to the session
    pub async fn inject_accept_error(&self, reason: &str) {
        let sender = self.state.sender.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(Err(AcceptError::transient(reason))).await;
        }
    }

    /// Kill the transport: the public port closes and the next accept fails terminally
    pub async fn terminate(&self) {
        self.state.killed.cancel();
        let sender = self.state.sender.lock().take();
        if let Some(sender) = sender {
            let _ = sender
                .send(Err(AcceptError::closed("relay host terminated")))
                .await;
        }
    }
}

/// Transport session against a [`TestRelayHost`]
pub struct TestTransport {
    state: Arc<HostState>,
}

#[async_trait]
impl TransportSession for TestTransport {
    type Listener = ChannelListener<TcpStream>;

    async fn open_remote_listener(
        &mut self,
        bind_address: &str,
        port: u16,
    ) -> Result<Self::Listener, TransportError> {
        if self.state.refuse {
            return Err(TransportError::ListenRefused {
                bind_address: bind_address.to_string(),
                port,
                reason: "refused by test relay host".to_string(),
            });
        }
        if self.state.killed.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }

        let public = self
            .state
            .public
            .lock()
            .take()
            .ok_or_else(|| TransportError::Other("public port already forwarded".to_string()))?;

        let (tx, listener) = ChannelListener::channel(BACKLOG, format!("{}:{}", bind_address, port));
        *self.state.sender.lock() = Some(tx.clone());

        tokio::spawn(forward_public_port(public, tx, self.state.killed.clone()));

        Ok(listener)
    }

    async fn close(&mut self) {
        self.state.killed.cancel();
        self.state.sender.lock().take();
    }
}

async fn forward_public_port(
    public: TcpListener,
    sender: ListenerSender<TcpStream>,
    killed: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = killed.cancelled() => break,
            accepted = public.accept() => accepted,
        };

        let item = match accepted {
            Ok((stream, peer)) => Ok(Accepted::new(stream, peer.to_string())),
            Err(e) => Err(AcceptError::transient(e.to_string())),
        };

        if sender.send(item).await.is_err() {
            break;
        }
    }
    tracing::debug!("Test relay host public port closed");
}

/// A session serving a [`TestRelayHost`] in the background
pub struct TestTunnel {
    pub metrics: RelayMetrics,
    pub states: watch::Receiver<SessionState>,
    pub shutdown: CancellationToken,
    task: JoinHandle<Result<(), SessionError>>,
}

impl TestTunnel {
    /// Establish the remote listener and serve towards `127.0.0.1:local_port`
    ///
    /// Returns once the session has left `Listening`.
    pub async fn start(host: &TestRelayHost, local_port: u16, options: ServeOptions) -> Self {
        let metrics = RelayMetrics::new();
        let mut session = SessionLifecycle::with_metrics(host.transport(), metrics.clone());
        session
            .establish("127.0.0.1", host.public_port())
            .await
            .expect("Failed to establish remote listener");

        let mut states = session.subscribe();
        let shutdown = CancellationToken::new();
        let dialer = Arc::new(
            TcpDialer::new("127.0.0.1", local_port).with_connect_timeout(Some(Duration::from_secs(2))),
        );

        let task = tokio::spawn(session.serve(dialer, options, shutdown.clone()));

        // Listening until the spawned task enters its accept loop
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s != SessionState::Listening),
        )
        .await
        .expect("Session never started serving")
        .expect("Session dropped its state channel");

        Self {
            metrics,
            states,
            shutdown,
            task,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.states.borrow()
    }

    /// Wait for the session to end
    pub async fn join(self) -> Result<(), SessionError> {
        self.task.await.expect("Session task panicked")
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
