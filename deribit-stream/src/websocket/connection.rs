//! Connection lifecycle
//!
//! Accepts TCP peers, performs the WebSocket handshake, registers the
//! connection and drives its read/write loop until it closes. Every exit
//! path deregisters the connection through the [`Registration`] guard.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deribit_core::ConnectionState;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};

use super::handler::ControlProcessor;
use super::registry::SubscriptionRegistry;
use crate::{DeliveryFailure, StreamError};

/// Unique identifier for a subscriber connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection left the `Open` state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on a handle
    Requested,
    /// The peer sent a close frame or hung up
    Remote,
    /// A read, write or delivery fault
    Fault(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("closed locally"),
            Self::Remote => f.write_str("closed by peer"),
            Self::Fault(reason) => write!(f, "fault: {}", reason),
        }
    }
}

/// Lifecycle state shared by the owning [`Connection`] and its handles
#[derive(Debug)]
struct Lifecycle {
    id: ConnectionId,
    peer: SocketAddr,
    state: AtomicU8,
    faulted: AtomicBool,
    close_requested: Notify,
}

impl Lifecycle {
    fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            faulted: AtomicBool::new(false),
            close_requested: Notify::new(),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move `Open -> Closing` and wake the connection loop; no-op otherwise
    fn request_close(&self) -> bool {
        if self.transition(ConnectionState::Open, ConnectionState::Closing) {
            self.close_requested.notify_one();
            true
        } else {
            false
        }
    }

    fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::Release);
    }

    fn close_reason(&self) -> CloseReason {
        if self.faulted.load(Ordering::Acquire) {
            CloseReason::Fault("delivery timed out".to_string())
        } else {
            CloseReason::Requested
        }
    }
}

/// Non-owning reference to a live connection
///
/// This is what the registry stores and what broadcasts deliver through.
/// Dropping a handle never closes the connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    lifecycle: Arc<Lifecycle>,
    outbound: mpsc::Sender<Utf8Bytes>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.lifecycle.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.lifecycle.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Ask the connection to shut down. Idempotent and safe from any task or thread.
    pub fn close(&self) {
        if self.lifecycle.request_close() {
            debug!("Close requested for {}", self.id());
        }
    }

    /// Flag the connection as faulted and hand it to its lifecycle loop for teardown
    pub(crate) fn fault(&self, reason: &str) {
        self.lifecycle.faulted.store(true, Ordering::Release);
        if self.lifecycle.request_close() {
            warn!("{} marked as faulted: {}", self.id(), reason);
        }
    }

    /// Enqueue a payload for this connection, waiting at most `timeout` for queue space
    pub(crate) async fn deliver(
        &self,
        payload: Utf8Bytes,
        timeout: Duration,
    ) -> Result<(), DeliveryFailure> {
        if !self.is_open() {
            return Err(DeliveryFailure::Closed);
        }

        match tokio::time::timeout(timeout, self.outbound.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryFailure::Closed),
            Err(_) => Err(DeliveryFailure::TimedOut),
        }
    }

    /// Build an open handle backed by a bare queue, without any socket
    #[cfg(test)]
    pub(crate) fn detached(id: u64, capacity: usize) -> (Self, mpsc::Receiver<Utf8Bytes>) {
        let peer = SocketAddr::from(([127, 0, 0, 1], 0));
        let lifecycle = Arc::new(Lifecycle::new(ConnectionId(id), peer));
        lifecycle.transition(ConnectionState::Connecting, ConnectionState::Open);
        let (outbound, rx) = mpsc::channel(capacity);
        (Self { lifecycle, outbound }, rx)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.lifecycle.id)
            .field("peer", &self.lifecycle.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Scoped registration: dropping it deregisters the connection and marks it `Closed`
struct Registration {
    registry: Arc<SubscriptionRegistry>,
    lifecycle: Arc<Lifecycle>,
}

impl Registration {
    /// Remove the connection from the registry without marking it `Closed`
    fn unregister(&self) {
        self.registry.unregister(self.lifecycle.id);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.lifecycle
            .transition(ConnectionState::Open, ConnectionState::Closing);
        self.unregister();
        self.lifecycle.mark_closed();
    }
}

/// An open subscriber connection, owned by whoever drives its loop
pub struct Connection {
    handle: ConnectionHandle,
    stream: WebSocketStream<TcpStream>,
    outbound_rx: mpsc::Receiver<Utf8Bytes>,
    write_timeout: Duration,
    registration: Registration,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Drive the connection until it closes
    ///
    /// Inbound text frames go to the control processor one at a time;
    /// queued payloads are written to the socket in order. Malformed input
    /// never ends the loop: only a close request, a peer close or an I/O
    /// fault does.
    pub async fn run(self, processor: &ControlProcessor) -> CloseReason {
        let Connection {
            handle,
            stream,
            mut outbound_rx,
            write_timeout,
            registration,
        } = self;

        let id = handle.id();
        let lifecycle = Arc::clone(&handle.lifecycle);
        let (mut sink, mut source) = stream.split();

        // set when a close request abandons a half-written frame
        let mut write_interrupted = false;

        let reason = loop {
            tokio::select! {
                biased;

                _ = lifecycle.close_requested.notified() => break lifecycle.close_reason(),

                // queued payloads are written before more input is read
                outbound = outbound_rx.recv() => match outbound {
                    Some(payload) => {
                        let write = tokio::time::timeout(write_timeout, sink.send(Message::Text(payload)));
                        tokio::select! {
                            biased;

                            _ = lifecycle.close_requested.notified() => {
                                write_interrupted = true;
                                break lifecycle.close_reason();
                            }

                            written = write => match written {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => break CloseReason::Fault(format!("write failed: {}", e)),
                                Err(_) => break CloseReason::Fault("write timed out".to_string()),
                            },
                        }
                    }
                    None => break CloseReason::Requested,
                },

                inbound = source.next() => match inbound {
                    Some(Ok(Message::Text(text))) => processor.handle_text(id, text.as_str()),
                    Some(Ok(Message::Binary(data))) => processor.handle_binary(id, data.len()),
                    Some(Ok(Message::Close(_))) | None => break CloseReason::Remote,
                    // ping/pong are answered by the transport
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break CloseReason::Fault(format!("read failed: {}", e)),
                },
            }
        };

        lifecycle.transition(ConnectionState::Open, ConnectionState::Closing);

        // leave the registry before any further socket I/O
        registration.unregister();

        if !write_interrupted && !matches!(reason, CloseReason::Fault(_)) {
            // best effort close frame
            let _ = tokio::time::timeout(write_timeout, sink.close()).await;
        }

        drop(registration);

        match &reason {
            CloseReason::Fault(_) => warn!("WebSocket connection {} closed ({})", id, reason),
            _ => info!("WebSocket connection {} closed ({})", id, reason),
        }

        reason
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Per-connection resource limits
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Accepts peers and turns them into registered [`Connection`]s
pub struct ConnectionManager {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<SubscriptionRegistry>,
    settings: ConnectionSettings,
    next_id: AtomicU64,
}

impl ConnectionManager {
    /// Bind the listening endpoint
    pub async fn bind(
        addr: &str,
        registry: Arc<SubscriptionRegistry>,
        settings: ConnectionSettings,
    ) -> Result<Self, StreamError> {
        let bind_error = |source| StreamError::Bind {
            addr: addr.to_string(),
            source,
        };

        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        Ok(Self {
            listener,
            local_addr,
            registry,
            settings,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Wait for a peer to connect and complete its handshake
    pub async fn accept(&self) -> Result<Connection, StreamError> {
        let (stream, peer) = self.accept_tcp().await?;
        self.handshake(stream, peer).await
    }

    /// Wait for the next TCP peer, without handshaking
    pub(crate) async fn accept_tcp(&self) -> Result<(TcpStream, SocketAddr), StreamError> {
        let (stream, peer) = self.listener.accept().await.map_err(StreamError::Accept)?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        info!("New connection accepted from {}", peer);
        Ok((stream, peer))
    }

    /// Upgrade an accepted TCP stream and register the resulting connection
    ///
    /// A peer that fails or stalls the handshake is never registered.
    pub async fn handshake(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Connection, StreamError> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let lifecycle = Arc::new(Lifecycle::new(id, peer));

        let ws = match tokio::time::timeout(self.settings.handshake_timeout, accept_async(stream)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                return Err(StreamError::Handshake {
                    peer,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(StreamError::HandshakeTimeout { peer }),
        };

        lifecycle.transition(ConnectionState::Connecting, ConnectionState::Open);

        let (outbound, outbound_rx) = mpsc::channel(self.settings.outbound_queue);
        let handle = ConnectionHandle {
            lifecycle: Arc::clone(&lifecycle),
            outbound,
        };

        if let Err(e) = self.registry.register(handle.clone()) {
            lifecycle.mark_closed();
            return Err(e.into());
        }

        info!("WebSocket handshake successful: {} ({})", id, peer);

        Ok(Connection {
            handle,
            stream: ws,
            outbound_rx,
            write_timeout: self.settings.write_timeout,
            registration: Registration {
                registry: Arc::clone(&self.registry),
                lifecycle,
            },
        })
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local_addr", &self.local_addr)
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (handle, _rx) = ConnectionHandle::detached(1, 4);
        assert_eq!(handle.state(), ConnectionState::Open);

        handle.close();
        assert_eq!(handle.state(), ConnectionState::Closing);

        handle.close();
        assert_eq!(handle.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_registration_drop_unregisters() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (handle, _rx) = ConnectionHandle::detached(3, 4);
        registry.register(handle.clone()).unwrap();
        registry.add_subscription(handle.id(), "BTC-PERPETUAL").unwrap();

        let registration = Registration {
            registry: Arc::clone(&registry),
            lifecycle: Arc::clone(&handle.lifecycle),
        };
        drop(registration);

        assert!(!registry.is_registered(handle.id()));
        assert!(registry.subscribers_of("BTC-PERPETUAL").is_empty());
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_deliver_to_closed_handle_fails() {
        let (handle, _rx) = ConnectionHandle::detached(2, 4);
        handle.close();

        let result = handle
            .deliver(Utf8Bytes::from("{}"), Duration::from_millis(10))
            .await;
        assert_eq!(result, Err(DeliveryFailure::Closed));
    }

    #[tokio::test]
    async fn test_deliver_times_out_on_full_queue() {
        let (handle, _rx) = ConnectionHandle::detached(4, 1);

        handle
            .deliver(Utf8Bytes::from("first"), Duration::from_millis(10))
            .await
            .unwrap();

        let result = handle
            .deliver(Utf8Bytes::from("second"), Duration::from_millis(10))
            .await;
        assert_eq!(result, Err(DeliveryFailure::TimedOut));
    }

    #[tokio::test]
    async fn test_accept_registers_open_connection() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let manager = ConnectionManager::bind("127.0.0.1:0", Arc::clone(&registry), ConnectionSettings::default())
            .await
            .unwrap();

        let url = format!("ws://{}", manager.local_addr());
        let client = tokio::spawn(async move { tokio_tungstenite::connect_async(url).await });

        let connection = manager.accept().await.unwrap();
        let handle = connection.handle();
        assert_eq!(handle.id(), connection.id());
        assert_eq!(handle.state(), ConnectionState::Open);
        assert!(registry.is_registered(handle.id()));

        let (_client, _response) = client.await.unwrap().unwrap();

        // dropping an unrun connection still deregisters it
        drop(connection);
        assert!(!registry.is_registered(handle.id()));
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let first = ConnectionManager::bind("127.0.0.1:0", Arc::clone(&registry), ConnectionSettings::default())
            .await
            .unwrap();

        let taken = first.local_addr().to_string();
        let second = ConnectionManager::bind(&taken, registry, ConnectionSettings::default()).await;
        assert!(matches!(second, Err(StreamError::Bind { .. })));
    }
}
