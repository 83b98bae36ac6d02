//! Local service stand-in for E2E tests
//!
//! Plays the service behind the tunnel on an ephemeral loopback port and
//! records what each finished connection sent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, DropGuard};

/// How the service treats each accepted connection
#[derive(Clone, Debug)]
pub enum ServiceBehavior {
    /// Echo everything until the client half-closes
    Echo,
    /// Read one chunk, answer with `reply`, then close
    Reply(Vec<u8>),
    /// Send `greeting` and close without reading
    Greet(Vec<u8>),
    /// Read until EOF without answering
    Drain,
    /// Read until EOF, wait, then send `reply` and close
    DelayedTrailer { delay: Duration, reply: Vec<u8> },
}

/// A connection the service has finished with
#[derive(Clone, Debug)]
pub struct ServedConnection {
    pub received: Vec<u8>,
    pub peer: SocketAddr,
}

type ServedLog = Arc<Mutex<Vec<ServedConnection>>>;

/// The service stops accepting when dropped
pub struct TestLocalService {
    addr: SocketAddr,
    served: ServedLog,
    _stop: DropGuard,
}

impl TestLocalService {
    /// An echo service
    pub async fn start() -> Self {
        Self::start_with(ServiceBehavior::Echo).await
    }

    pub async fn start_with(behavior: ServiceBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind local service");
        let addr = listener.local_addr().unwrap();

        let served = ServedLog::default();
        let stop = CancellationToken::new();
        tokio::spawn(accept_loop(listener, behavior, served.clone(), stop.clone()));

        Self {
            addr,
            served,
            _stop: stop.drop_guard(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Finished connections in completion order
    pub fn served(&self) -> Vec<ServedConnection> {
        self.served.lock().clone()
    }

    pub fn served_count(&self) -> usize {
        self.served.lock().len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    behavior: ServiceBehavior,
    served: ServedLog,
    stop: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Local service accept failed: {}", e);
                    continue;
                }
            },
        };

        let behavior = behavior.clone();
        let served = served.clone();
        tokio::spawn(async move {
            let received = behave(stream, behavior).await;
            served.lock().push(ServedConnection { received, peer });
        });
    }
    tracing::debug!("Local service stopped");
}

/// Run `behavior` on one connection and return what the client sent
async fn behave(mut stream: TcpStream, behavior: ServiceBehavior) -> Vec<u8> {
    let mut received = Vec::new();

    let outcome = match behavior {
        ServiceBehavior::Echo => {
            let (mut reader, mut writer) = stream.split();
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        received.extend_from_slice(&buf[..n]);
                        if let Err(e) = writer.write_all(&buf[..n]).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e),
                }
            }
        }
        ServiceBehavior::Reply(reply) => {
            let mut buf = [0u8; 4096];
            match stream.read(&mut buf).await {
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    stream.write_all(&reply).await
                }
                Err(e) => Err(e),
            }
        }
        ServiceBehavior::Greet(greeting) => stream.write_all(&greeting).await,
        ServiceBehavior::Drain => stream.read_to_end(&mut received).await.map(|_| ()),
        ServiceBehavior::DelayedTrailer { delay, reply } => {
            match stream.read_to_end(&mut received).await {
                Ok(_) => {
                    tokio::time::sleep(delay).await;
                    match stream.write_all(&reply).await {
                        Ok(()) => stream.shutdown().await,
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        }
    };

    if let Err(e) = outcome {
        tracing::debug!("Local service connection ended with error: {}", e);
    }
    received
}
