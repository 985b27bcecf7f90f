//! Stream server lifecycle
//!
//! Binds the listening endpoint and runs the accept loop. Each accepted
//! peer gets its own task that performs the handshake and then drives the
//! connection until it closes. `stop()` ends the accept loop only; open
//! connections tear themselves down.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use deribit_core::ServerSettings;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::websocket::{
    Broadcaster, ConnectionManager, ConnectionSettings, ControlProcessor, SubscriptionRegistry,
};
use crate::StreamError;

/// Stream server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub connection: ConnectionSettings,
    /// How long a broadcast waits on one subscriber's full queue
    pub send_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            connection: ConnectionSettings::default(),
            send_timeout: Duration::from_secs(2),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            connection: ConnectionSettings {
                outbound_queue: settings.outbound_queue,
                handshake_timeout: settings.handshake_timeout(),
                write_timeout: settings.write_timeout(),
            },
            send_timeout: settings.send_timeout(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Accept errors that only affect the peer being accepted
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Subscription stream server
pub struct StreamServer {
    manager: Arc<ConnectionManager>,
    processor: ControlProcessor,
    broadcaster: Broadcaster,
    shutdown: watch::Sender<bool>,
}

impl StreamServer {
    /// Bind the listening endpoint; a bind failure means the server cannot start
    pub async fn bind(config: ServerConfig) -> Result<Self, StreamError> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let manager =
            ConnectionManager::bind(&config.addr(), Arc::clone(&registry), config.connection)
                .await?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            manager: Arc::new(manager),
            processor: ControlProcessor::new(Arc::clone(&registry)),
            broadcaster: Broadcaster::new(registry, config.send_timeout),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.manager.local_addr()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.manager.registry()
    }

    /// Broadcaster sharing this server's registry
    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    /// Signal the accept loop to exit. Idempotent.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Stream server on {} stopping", self.local_addr());
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Accept connections until `stop()` is called or the listener fails
    pub async fn run(&self) -> Result<(), StreamError> {
        let mut shutdown = self.shutdown.subscribe();
        info!("Stream server listening on ws://{}", self.local_addr());

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                accepted = self.manager.accept_tcp() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(StreamError::Accept(e)) if is_transient(&e) => {
                        warn!("Transient accept error: {}", e);
                    }
                    Err(e) => {
                        error!("Accept loop failed: {}", e);
                        return Err(e);
                    }
                },
            }
        }

        info!("Stream server on {} stopped accepting", self.local_addr());
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let manager = Arc::clone(&self.manager);
        let processor = self.processor.clone();

        tokio::spawn(async move {
            match manager.handshake(stream, peer).await {
                Ok(connection) => {
                    let reason = connection.run(&processor).await;
                    debug!("Connection task for {} finished: {}", peer, reason);
                }
                Err(e) => warn!("Rejected connection: {}", e),
            }
        });
    }
}

impl std::fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamServer")
            .field("local_addr", &self.local_addr())
            .field("registry", self.registry())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Bind and start the server on the current runtime
pub async fn start(config: ServerConfig) -> Result<ServerHandle, StreamError> {
    let server = Arc::new(StreamServer::bind(config).await?);
    let local_addr = server.local_addr();

    let task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    info!(port = local_addr.port(), "Stream server started");

    Ok(ServerHandle {
        local_addr,
        server,
        task,
    })
}

/// Handle returned by [`start`]
pub struct ServerHandle {
    local_addr: SocketAddr,
    server: Arc<StreamServer>,
    task: JoinHandle<Result<(), StreamError>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.server.registry()
    }

    pub fn broadcaster(&self) -> Broadcaster {
        self.server.broadcaster()
    }

    pub fn stop(&self) {
        self.server.stop();
    }

    /// Wait for the accept loop to exit
    ///
    /// A panicked or cancelled accept loop is reported as [`StreamError::Accept`].
    pub async fn join(self) -> Result<(), StreamError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Stream server task failed: {}", e);
                Err(StreamError::Accept(io::Error::other(e)))
            }
        }
    }
}
