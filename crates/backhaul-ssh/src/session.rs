use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backhaul_relay::{ChannelListener, TransportError, TransportSession};
use russh::client::{self, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::Disconnect;

use crate::error::SshError;
use crate::handler::{new_forward_registry, ForwardRegistry, ForwardedStream, HostKeyPolicy, TunnelHandler};
use crate::keys::load_private_key;

/// Forwarded connections queued between the SSH session and the listener loop
const FORWARD_BACKLOG: usize = 128;

/// Connection settings for the relay host
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub host_key_policy: HostKeyPolicy,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl SshConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Authenticated SSH session able to register remote port forwards
pub struct SshTransport {
    handle: Handle<TunnelHandler>,
    forwards: ForwardRegistry,
    addr: String,
    closed: bool,
}

impl SshTransport {
    /// Connect and authenticate with the configured private key
    pub async fn connect(config: &SshConfig) -> Result<Self, SshError> {
        let addr = config.addr();
        let key = load_private_key(&config.key_path)?;

        let ssh_config = client::Config {
            keepalive_interval: Some(config.keepalive_interval),
            keepalive_max: 3,
            ..Default::default()
        };

        let forwards = new_forward_registry();
        let handler = TunnelHandler::new(
            &config.host,
            config.port,
            config.host_key_policy,
            forwards.clone(),
        );

        tracing::info!("Connecting to {}@{}", config.user, addr);

        let connect = client::connect(
            Arc::new(ssh_config),
            (config.host.as_str(), config.port),
            handler,
        );
        let mut handle = match tokio::time::timeout(config.connect_timeout, connect).await {
            Err(_) => return Err(SshError::Timeout { addr }),
            Ok(Err(russh::Error::UnknownKey)) => return Err(SshError::HostKeyRejected { addr }),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(handle)) => handle,
        };

        tracing::debug!("Connected to {}, authenticating", addr);

        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
        let auth = handle
            .authenticate_publickey(
                config.user.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await?;

        if !auth.success() {
            return Err(SshError::AuthenticationRejected {
                user: config.user.clone(),
            });
        }

        tracing::info!("Authenticated to {} as {}", addr, config.user);

        Ok(Self {
            handle,
            forwards,
            addr,
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.handle.is_closed()
    }
}

#[async_trait]
impl TransportSession for SshTransport {
    type Listener = ChannelListener<ForwardedStream>;

    async fn open_remote_listener(
        &mut self,
        bind_address: &str,
        port: u16,
    ) -> Result<Self::Listener, TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }

        let (tx, listener) = ChannelListener::channel(
            FORWARD_BACKLOG,
            format!("{} ({}:{})", self.addr, bind_address, port),
        );

        // Register first so channels opened right after the reply are not lost
        let requested = u32::from(port);
        self.forwards.insert(requested, tx);

        match self.handle.tcpip_forward(bind_address, requested).await {
            Ok(assigned) => {
                if assigned != 0 && assigned != requested {
                    if let Some((_, tx)) = self.forwards.remove(&requested) {
                        self.forwards.insert(assigned, tx);
                    }
                    tracing::info!("Relay host assigned port {}", assigned);
                }
                Ok(listener)
            }
            Err(russh::Error::RequestDenied) => {
                self.forwards.remove(&requested);
                Err(TransportError::ListenRefused {
                    bind_address: bind_address.to_string(),
                    port,
                    reason: "tcpip-forward request denied".to_string(),
                })
            }
            Err(e) => {
                self.forwards.remove(&requested);
                Err(TransportError::Other(e.to_string()))
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.forwards.clear();

        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await
        {
            tracing::debug!("SSH disconnect from {}: {}", self.addr, e);
        }
    }
}
