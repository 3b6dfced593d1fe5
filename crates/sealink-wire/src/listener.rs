//! Listener: accepts inbound connections and completes the acceptor side of
//! the handshake.
//!
//! A [`Listener`] owns one [`EventLoop`]. The accept task runs on that loop,
//! and so does every connection it accepts. For each inbound socket the
//! listener reads exactly one handshake frame (bounded by the configured
//! handshake timeout), then hands the socket and the peer key to
//! [`Connection::accept`].

use crate::connection::Connection;
use crate::dispatch::EventHandler;
use crate::error::WireError;
use crate::event_loop::EventLoop;
use crate::frame::{read_frame, Frame};
use crate::keys::PublicKey;
use crate::packet::Packet;
use crate::registry::ConnectionRegistry;
use sealink_types::{SecurityMode, WireConfig};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// A bound listener and the connections it accepted.
pub struct Listener<M: Packet> {
    local_addr: SocketAddr,
    registry: ConnectionRegistry<M>,
    event_loop: Arc<EventLoop>,
}

impl<M: Packet> Listener<M> {
    /// Bind `config.listen_addr` and start accepting.
    pub fn bind(config: &WireConfig, handler: Arc<dyn EventHandler<M>>) -> Result<Self, WireError> {
        config.validate()?;

        let event_loop = Arc::new(EventLoop::start(
            "sealink-listener",
            config.read_buffer_size,
        )?);

        let std_listener = std::net::TcpListener::bind(config.listen_addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let listener = {
            let _guard = event_loop.enter();
            TcpListener::from_std(std_listener)?
        };

        let registry = ConnectionRegistry::new();
        info!("Listening on {} ({})", local_addr, config.security);

        event_loop.spawn(accept_loop(
            listener,
            config.clone(),
            registry.clone(),
            handler,
            Arc::downgrade(&event_loop),
        ));

        Ok(Self {
            local_addr,
            registry,
            event_loop,
        })
    }

    /// The bound address. Useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry<M> {
        &self.registry
    }

    /// Number of live accepted connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_running(&self) -> bool {
        self.event_loop.is_running()
    }

    /// Disconnect every accepted connection and stop the loop.
    pub fn shutdown(&self) {
        let connections = self.registry.connections();
        if !connections.is_empty() {
            info!(
                "Listener on {} shutting down {} connection(s)",
                self.local_addr,
                connections.len()
            );
        }
        for connection in connections {
            connection.disconnect();
        }
        self.event_loop.stop();
    }
}

impl<M: Packet> Drop for Listener<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<M: Packet> std::fmt::Debug for Listener<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.registry.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Runs on the listener's loop until the loop stops.
async fn accept_loop<M: Packet>(
    listener: TcpListener,
    config: WireConfig,
    registry: ConnectionRegistry<M>,
    handler: Arc<dyn EventHandler<M>>,
    event_loop: Weak<EventLoop>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Accepted connection from {}", addr);
                let Some(event_loop) = event_loop.upgrade() else {
                    return;
                };
                let config = config.clone();
                let registry = registry.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_inbound(stream, addr, config, registry, handler, event_loop).await
                    {
                        warn!("Inbound connection from {} failed: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Read the initiator's handshake, then hand the socket to a connection.
async fn handle_inbound<M: Packet>(
    mut stream: TcpStream,
    addr: SocketAddr,
    config: WireConfig,
    registry: ConnectionRegistry<M>,
    handler: Arc<dyn EventHandler<M>>,
    event_loop: Arc<EventLoop>,
) -> Result<(), WireError> {
    let peer_key = match config.security {
        SecurityMode::Encrypted => Some(read_handshake(&mut stream, addr, &config).await?),
        SecurityMode::Plaintext => None,
    };

    let socket = stream.into_std()?;
    // Key generation is CPU-bound; keep it off the loop thread.
    let connection = tokio::task::spawn_blocking(move || {
        Connection::accept(socket, peer_key, &config, registry, handler, &event_loop)
    })
    .await
    .map_err(|e| WireError::HandshakeFailed(format!("accept task failed: {e}")))??;

    info!(
        "Accepted {} from {} (state: {})",
        connection.id(),
        addr,
        connection.state()
    );
    Ok(())
}

async fn read_handshake(
    stream: &mut TcpStream,
    addr: SocketAddr,
    config: &WireConfig,
) -> Result<PublicKey, WireError> {
    let timeout = config.handshake_timeout();
    let frame = tokio::time::timeout(timeout, read_frame(stream, config.max_frame_size))
        .await
        .map_err(|_| {
            WireError::HandshakeFailed(format!("no handshake from {addr} within {timeout:?}"))
        })??;

    match frame {
        Frame::Handshake { public_key } => Ok(PublicKey::from_der(&public_key)?),
        other => Err(WireError::HandshakeFailed(format!(
            "expected handshake from {addr}, got {} frame",
            other.kind()
        ))),
    }
}
