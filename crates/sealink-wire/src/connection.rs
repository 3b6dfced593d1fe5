//! Connection: one peer link, its handshake state, and its send path.
//!
//! A [`Connection`] is created either by [`Connection::open`] (the initiator
//! dials out) or by [`Connection::accept`] (a listener hands over a socket
//! whose handshake frame it already read). Reads arrive from an
//! [`EventLoop`]; writes happen synchronously on the caller's thread under a
//! per-connection lock.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting ──handshake frame──▶ Ready ──▶ Closed
//! AwaitingKey ──registry confirms key──▶ Ready ──▶ Closed
//! ```
//!
//! Readiness only ever flips from false to true, and `Connected` fires on
//! that flip. `Disconnected` fires exactly once, however many times
//! [`Connection::disconnect`] is called or a fatal error is seen.

use crate::dispatch::{
    ConnectionEvent, ConnectionEventKind, EventHandler, PacketEvent, PacketEventKind,
};
use crate::envelope;
use crate::error::WireError;
use crate::event_loop::{EventLoop, ReadSource};
use crate::frame::{decode_frame, encode_frame, Frame, FrameBuffer};
use crate::keys::{self, KeyPair, PrivateKey, PublicKey};
use crate::packet::Packet;
use crate::registry::ConnectionRegistry;
use sealink_types::{ConnectionId, SecurityMode, WireConfig};
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Pause between write attempts while the socket's send buffer is full.
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dialed out with [`Connection::open`].
    Initiator,
    /// Handed over by a listener via [`Connection::accept`].
    Acceptor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Acceptor => write!(f, "acceptor"),
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Initiator waiting for the peer's handshake frame.
    Connecting,
    /// Acceptor waiting for the registry to confirm the peer's key.
    AwaitingKey,
    /// Handshake complete; sends are allowed.
    Ready,
    /// Disconnected. Terminal.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::AwaitingKey => write!(f, "awaiting-key"),
            Self::Ready => write!(f, "ready"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A single framed, optionally encrypted link to a peer.
pub struct Connection<M: Packet> {
    id: ConnectionId,
    role: Role,
    mode: SecurityMode,
    peer_addr: SocketAddr,
    /// Read side, registered with the event loop.
    stream: TcpStream,
    /// Duplicate of the socket used for writes and shutdown.
    socket: std::net::TcpStream,
    write_lock: Mutex<()>,
    write_timeout: Duration,
    connection_timeout_ms: AtomicU64,
    local_keys: Option<KeyPair>,
    peer_key: OnceLock<PublicKey>,
    ready: AtomicBool,
    closed: AtomicBool,
    inbound: Mutex<FrameBuffer>,
    registry: Option<ConnectionRegistry<M>>,
    handler: Arc<dyn EventHandler<M>>,
    /// Initiators run their own loop and stop it on disconnect.
    owned_loop: Option<Arc<EventLoop>>,
    this: Weak<Self>,
}

/// Construction parameters shared by both roles.
struct Parts<M: Packet> {
    role: Role,
    stream: TcpStream,
    socket: std::net::TcpStream,
    peer_addr: SocketAddr,
    local_keys: Option<KeyPair>,
    peer_key: Option<PublicKey>,
    registry: Option<ConnectionRegistry<M>>,
    handler: Arc<dyn EventHandler<M>>,
    owned_loop: Option<Arc<EventLoop>>,
}

impl<M: Packet> Connection<M> {
    /// Dial `address`, start a private event loop and send our handshake.
    ///
    /// In encrypted mode the connection becomes ready once the peer's own
    /// handshake frame arrives. In plaintext mode it is ready immediately
    /// and `Connected` has fired by the time this returns.
    pub fn open(
        address: SocketAddr,
        config: &WireConfig,
        handler: Arc<dyn EventHandler<M>>,
    ) -> Result<Arc<Self>, WireError> {
        config.validate()?;
        info!("Opening {} connection to {}", config.security, address);

        let socket = std::net::TcpStream::connect(address)?;
        socket.set_nodelay(true)?;
        socket.set_nonblocking(true)?;

        let local_keys = match config.security {
            SecurityMode::Encrypted => Some(keys::generate_key_pair(config.key_bits)?),
            SecurityMode::Plaintext => None,
        };

        let event_loop = Arc::new(EventLoop::start(
            "sealink-initiator",
            config.read_buffer_size,
        )?);
        let stream = event_loop.adopt(socket.try_clone()?)?;

        let connection = Self::build(
            Parts {
                role: Role::Initiator,
                stream,
                socket,
                peer_addr: address,
                local_keys,
                peer_key: None,
                registry: None,
                handler,
                owned_loop: Some(Arc::clone(&event_loop)),
            },
            config,
        );

        match config.security {
            SecurityMode::Encrypted => {
                event_loop.register(connection.clone())?;
                if let Err(e) = connection.send_handshake() {
                    connection.abort(&e);
                    return Err(e);
                }
            }
            SecurityMode::Plaintext => {
                connection.mark_ready();
                event_loop.register(connection.clone())?;
            }
        }

        Ok(connection)
    }

    /// Take over a socket a listener accepted.
    ///
    /// `peer_key` is the key from the initiator's handshake frame; it is
    /// required in encrypted mode. The acceptor answers with its own
    /// handshake, joins `registry`, and becomes ready once the registry
    /// confirms the peer's key.
    pub fn accept(
        socket: std::net::TcpStream,
        peer_key: Option<PublicKey>,
        config: &WireConfig,
        registry: ConnectionRegistry<M>,
        handler: Arc<dyn EventHandler<M>>,
        event_loop: &EventLoop,
    ) -> Result<Arc<Self>, WireError> {
        if config.security == SecurityMode::Encrypted && peer_key.is_none() {
            return Err(WireError::MissingPeerKey);
        }

        let peer_addr = socket.peer_addr()?;
        socket.set_nodelay(true)?;
        socket.set_nonblocking(true)?;

        let local_keys = match config.security {
            SecurityMode::Encrypted => Some(keys::generate_key_pair(config.key_bits)?),
            SecurityMode::Plaintext => None,
        };
        let stream = event_loop.adopt(socket.try_clone()?)?;

        let connection = Self::build(
            Parts {
                role: Role::Acceptor,
                stream,
                socket,
                peer_addr,
                local_keys,
                peer_key,
                registry: Some(registry.clone()),
                handler,
                owned_loop: None,
            },
            config,
        );

        if config.security == SecurityMode::Encrypted {
            // Not yet registered, so a failure here is silent.
            if let Err(e) = connection.send_handshake() {
                connection.closed.store(true, Ordering::Release);
                let _ = connection.socket.shutdown(Shutdown::Both);
                return Err(e);
            }
        }

        registry.join(&connection);
        connection.confirm_peer_key();

        if let Err(e) = event_loop.register(connection.clone()) {
            connection.abort(&e);
            return Err(e);
        }

        Ok(connection)
    }

    fn build(parts: Parts<M>, config: &WireConfig) -> Arc<Self> {
        let peer_key = OnceLock::new();
        if let Some(key) = parts.peer_key {
            let _ = peer_key.set(key);
        }

        Arc::new_cyclic(|this| Self {
            id: ConnectionId::new(),
            role: parts.role,
            mode: config.security,
            peer_addr: parts.peer_addr,
            stream: parts.stream,
            socket: parts.socket,
            write_lock: Mutex::new(()),
            write_timeout: config.write_timeout(),
            connection_timeout_ms: AtomicU64::new(config.connection_timeout_ms),
            local_keys: parts.local_keys,
            peer_key,
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            inbound: Mutex::new(FrameBuffer::new(config.max_frame_size)),
            registry: parts.registry,
            handler: parts.handler,
            owned_loop: parts.owned_loop,
            this: this.clone(),
        })
    }

    // -- Accessors -----------------------------------------------------------

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.mode
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Result<SocketAddr, WireError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else if self.is_ready() {
            ConnectionState::Ready
        } else {
            match self.role {
                Role::Initiator => ConnectionState::Connecting,
                Role::Acceptor => ConnectionState::AwaitingKey,
            }
        }
    }

    /// Whether the handshake has completed. Never reverts to false.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The peer's public key, once known.
    pub fn peer_public_key(&self) -> Option<&PublicKey> {
        self.peer_key.get()
    }

    /// Our own public key. `None` in plaintext mode.
    pub fn local_public_key(&self) -> Option<&PublicKey> {
        self.local_keys.as_ref().map(|k| &k.public)
    }

    /// Liveness timeout. Stored and reported; not enforced by the engine.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_connection_timeout(&self, timeout: Duration) {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.connection_timeout_ms.store(ms, Ordering::Relaxed);
    }

    // -- Sending -------------------------------------------------------------

    /// Encode and write `message`, then fire `Sent`.
    ///
    /// Preconditions are checked before anything touches the socket:
    /// unsigned messages, closed connections and connections still in the
    /// handshake are rejected and leave the connection as it was. A failed
    /// write disconnects.
    pub fn send(&self, mut message: M) -> Result<(), WireError> {
        if !message.is_signed() {
            return Err(WireError::UnsignedMessage);
        }
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        if !self.is_ready() {
            return Err(WireError::NotReady);
        }

        message.on_before_send();
        let frame = match self.mode {
            SecurityMode::Encrypted => {
                let recipient = self.peer_key.get().ok_or(WireError::NotReady)?;
                Frame::Envelope(envelope::encode(&message, recipient)?)
            }
            SecurityMode::Plaintext => Frame::Plain {
                payload: serde_json::to_vec(&message)?,
            },
        };

        if let Err(e) = self.write_frame(&frame) {
            self.abort(&e);
            return Err(e);
        }

        self.emit_packet(PacketEventKind::Sent, message);
        Ok(())
    }

    fn send_handshake(&self) -> Result<(), WireError> {
        let public = self
            .local_public_key()
            .ok_or_else(|| WireError::HandshakeFailed("no local key pair".into()))?;
        let frame = Frame::Handshake {
            public_key: public.to_der()?,
        };
        self.write_frame(&frame)?;
        debug!(
            "Sent handshake to {} (key {})",
            self.peer_addr,
            public.fingerprint()
        );
        Ok(())
    }

    /// Write a whole frame, retrying while the send buffer is full.
    fn write_frame(&self, frame: &Frame) -> Result<(), WireError> {
        let bytes = encode_frame(frame)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + self.write_timeout;
        let mut written = 0;

        while written < bytes.len() {
            match (&self.socket).write(&bytes[written..]) {
                Ok(0) => return Err(WireError::ConnectionClosed),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(WireError::WriteTimeout);
                    }
                    std::thread::sleep(WRITE_RETRY_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // -- Receiving -----------------------------------------------------------

    /// Feed bytes read from the socket.
    ///
    /// Called by the event loop. Complete frames are processed in order;
    /// partial frames wait for more bytes. Before the handshake completes,
    /// anything but a handshake frame is discarded. After it, any frame
    /// that fails to decode closes the connection.
    pub fn on_readable(&self, bytes: &[u8]) {
        if self.is_closed() {
            return;
        }

        let (bodies, framing_error) = {
            let mut inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
            inbound.extend(bytes);
            let mut bodies = Vec::new();
            let framing_error = loop {
                match inbound.next_body() {
                    Ok(Some(body)) => bodies.push(body),
                    Ok(None) => break None,
                    Err(e) => {
                        inbound.clear();
                        break Some(e);
                    }
                }
            };
            (bodies, framing_error)
        };

        for body in bodies {
            if self.is_closed() {
                return;
            }
            if let Err(e) = self.process_frame(&body) {
                self.abort(&e);
                return;
            }
        }

        if let Some(e) = framing_error {
            self.abort(&e);
        }
    }

    fn process_frame(&self, body: &[u8]) -> Result<(), WireError> {
        if !self.is_ready() {
            return match decode_frame(body) {
                Ok(Frame::Handshake { public_key }) => self.observe_peer_key(&public_key),
                Ok(other) => {
                    debug!(
                        "Discarding {} frame from {} before handshake",
                        other.kind(),
                        self.peer_addr
                    );
                    Ok(())
                }
                Err(e) => {
                    debug!("Discarding frame from {} before handshake: {}", self.peer_addr, e);
                    Ok(())
                }
            };
        }

        let message: M = match (self.mode, decode_frame(body)?) {
            (SecurityMode::Encrypted, Frame::Envelope(env)) => {
                envelope::decode(&env, self.private_key()?)?
            }
            (SecurityMode::Plaintext, Frame::Plain { payload }) => {
                envelope::deserialize_payload(&payload)?
            }
            (_, other) => {
                return Err(WireError::StreamCorrupted(format!(
                    "unexpected {} frame on a ready {} connection",
                    other.kind(),
                    self.mode
                )));
            }
        };

        self.emit_packet(PacketEventKind::Received, message);
        Ok(())
    }

    fn observe_peer_key(&self, der: &[u8]) -> Result<(), WireError> {
        let key = PublicKey::from_der(der)
            .map_err(|e| WireError::HandshakeFailed(format!("peer key: {e}")))?;

        if let Err(key) = self.peer_key.set(key) {
            if self.peer_key.get() != Some(&key) {
                return Err(WireError::HandshakeFailed(
                    "peer presented a different key".into(),
                ));
            }
        }

        if let Some(key) = self.peer_key.get() {
            info!(
                "Handshake with {} complete (peer key {}, {} bits)",
                self.peer_addr,
                key.fingerprint(),
                key.bits()
            );
        }
        self.mark_ready();
        Ok(())
    }

    /// Acceptors are ready once the registry vouches for the peer key.
    fn confirm_peer_key(&self) {
        match self.mode {
            SecurityMode::Plaintext => self.mark_ready(),
            SecurityMode::Encrypted => {
                let confirmed = self
                    .registry
                    .as_ref()
                    .and_then(|registry| registry.public_key_of(self))
                    .is_some();
                if confirmed {
                    self.mark_ready();
                } else {
                    debug!("Registry has no key for {} yet", self.peer_addr);
                }
            }
        }
    }

    fn private_key(&self) -> Result<&PrivateKey, WireError> {
        self.local_keys
            .as_ref()
            .map(|k| &k.private)
            .ok_or_else(|| WireError::HandshakeFailed("no local key pair".into()))
    }

    fn mark_ready(&self) {
        if self.is_closed() {
            return;
        }
        if !self.ready.swap(true, Ordering::AcqRel) {
            self.emit_connection(ConnectionEventKind::Connected);
        }
    }

    // -- Teardown ------------------------------------------------------------

    /// Close the connection. Idempotent; `Disconnected` fires once.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("Shutdown of {} failed: {}", self.peer_addr, e);
            }
        }
        if let Some(registry) = &self.registry {
            registry.exit(self);
        }
        if let Some(event_loop) = &self.owned_loop {
            event_loop.stop();
        }
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        info!("Connection {} to {} closed", self.id, self.peer_addr);
        self.emit_connection(ConnectionEventKind::Disconnected);
    }

    /// Disconnect because of `error`.
    fn abort(&self, error: &WireError) {
        if self.is_closed() {
            return;
        }
        match error {
            WireError::ConnectionClosed => debug!("Peer {} closed the connection", self.peer_addr),
            other => warn!("Dropping connection to {}: {}", self.peer_addr, other),
        }
        self.disconnect();
    }

    // -- Events --------------------------------------------------------------

    fn emit_connection(&self, kind: ConnectionEventKind) {
        if let Some(this) = self.this.upgrade() {
            self.handler
                .on_connection_event(&ConnectionEvent::new(kind, this));
        }
    }

    fn emit_packet(&self, kind: PacketEventKind, message: M) {
        if let Some(this) = self.this.upgrade() {
            self.handler
                .on_packet_event(&PacketEvent::new(kind, this, message));
        }
    }
}

impl<M: Packet> ReadSource for Connection<M> {
    fn source_id(&self) -> ConnectionId {
        self.id
    }

    fn readiness_stream(&self) -> &TcpStream {
        &self.stream
    }

    fn deliver(&self, bytes: &[u8]) {
        self.on_readable(bytes);
    }

    fn fail(&self, error: WireError) {
        self.abort(&error);
    }

    fn is_finished(&self) -> bool {
        self.is_closed()
    }
}

impl<M: Packet> PartialEq for Connection<M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<M: Packet> Eq for Connection<M> {}

impl<M: Packet> std::hash::Hash for Connection<M> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<M: Packet> std::fmt::Debug for Connection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("mode", &self.mode)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ChannelHandler, Event};
    use crate::packet::AppPacket;
    use std::io::Read;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_config(security: SecurityMode) -> WireConfig {
        WireConfig {
            security,
            key_bits: 512,
            ..WireConfig::default()
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Event<AppPacket>>) -> Vec<Event<AppPacket>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn count_disconnects(events: &[Event<AppPacket>]) -> usize {
        events
            .iter()
            .filter(|e| {
                matches!(e, Event::Connection(c) if c.kind() == ConnectionEventKind::Disconnected)
            })
            .count()
    }

    /// An initiator dialing a raw listener that never answers the handshake.
    fn pending_initiator(
        security: SecurityMode,
    ) -> (
        Arc<Connection<AppPacket>>,
        std::net::TcpStream,
        UnboundedReceiver<Event<AppPacket>>,
    ) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (handler, rx) = ChannelHandler::<AppPacket>::new();
        let conn = Connection::open(addr, &test_config(security), handler).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (conn, peer, rx)
    }

    fn read_one_frame(peer: &mut std::net::TcpStream) -> Frame {
        let mut header = [0u8; 4];
        peer.read_exact(&mut header).unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
        peer.read_exact(&mut body).unwrap();
        decode_frame(&body).unwrap()
    }

    #[test]
    fn test_send_before_ready_writes_nothing() {
        let (conn, mut peer, _rx) = pending_initiator(SecurityMode::Encrypted);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        let result = conn.send(AppPacket::new("ping").sign());
        assert!(matches!(result, Err(WireError::NotReady)));
        assert!(!conn.is_closed());

        // Only the handshake frame reached the peer.
        assert!(matches!(read_one_frame(&mut peer), Frame::Handshake { .. }));
        peer.set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut byte = [0u8; 1];
        let err = peer.read(&mut byte).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
        conn.disconnect();
    }

    #[test]
    fn test_unsigned_rejected_before_readiness_check() {
        let (conn, _peer, _rx) = pending_initiator(SecurityMode::Encrypted);
        let result = conn.send(AppPacket::new("ping"));
        assert!(matches!(result, Err(WireError::UnsignedMessage)));
        conn.disconnect();
    }

    #[test]
    fn test_double_disconnect_fires_once() {
        let (conn, _peer, mut rx) = pending_initiator(SecurityMode::Encrypted);
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(count_disconnects(&drain(&mut rx)), 1);

        let result = conn.send(AppPacket::new("ping").sign());
        assert!(matches!(result, Err(WireError::ConnectionClosed)));
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _pa, _ra) = pending_initiator(SecurityMode::Plaintext);
        let (b, _pb, _rb) = pending_initiator(SecurityMode::Plaintext);
        assert_ne!(a.id(), b.id());
        assert_ne!(*a, *b);
        a.disconnect();
        b.disconnect();
    }

    #[test]
    fn test_pre_ready_garbage_is_discarded() {
        let (conn, _peer, mut rx) = pending_initiator(SecurityMode::Encrypted);

        let stray = encode_frame(&Frame::Plain {
            payload: b"{}".to_vec(),
        })
        .unwrap();
        conn.on_readable(&stray);
        let mut junk = 5u32.to_be_bytes().to_vec();
        junk.extend_from_slice(b"?????");
        conn.on_readable(&junk);

        assert!(!conn.is_closed());
        assert!(!conn.is_ready());
        assert!(drain(&mut rx).is_empty());
        conn.disconnect();
    }

    #[test]
    fn test_handshake_flips_readiness_once() {
        let (conn, _peer, mut rx) = pending_initiator(SecurityMode::Encrypted);
        let peer_keys = keys::generate_key_pair(512).unwrap();
        let handshake = encode_frame(&Frame::Handshake {
            public_key: peer_keys.public.to_der().unwrap(),
        })
        .unwrap();

        // Split across two reads.
        conn.on_readable(&handshake[..3]);
        assert!(!conn.is_ready());
        conn.on_readable(&handshake[3..]);
        assert!(conn.is_ready());
        assert_eq!(conn.peer_public_key(), Some(&peer_keys.public));

        let events = drain(&mut rx);
        let connected = events
            .iter()
            .filter(|e| {
                matches!(e, Event::Connection(c) if c.kind() == ConnectionEventKind::Connected)
            })
            .count();
        assert_eq!(connected, 1);

        // A second handshake on a ready connection is a protocol violation.
        conn.on_readable(&handshake);
        assert!(conn.is_closed());
        assert!(conn.is_ready());
        assert_eq!(count_disconnects(&drain(&mut rx)), 1);
    }

    #[test]
    fn test_garbage_after_ready_disconnects_once() {
        let (conn, _peer, mut rx) = pending_initiator(SecurityMode::Plaintext);
        assert!(conn.is_ready());

        let mut junk = 9u32.to_be_bytes().to_vec();
        junk.extend_from_slice(b"not json!");
        conn.on_readable(&junk);
        conn.on_readable(&junk);

        assert!(conn.is_closed());
        assert_eq!(count_disconnects(&drain(&mut rx)), 1);
    }

    fn count_received(events: &[Event<AppPacket>]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, Event::Packet(p) if p.kind() == PacketEventKind::Received))
            .count()
    }

    /// An encrypted initiator made ready by a handshake from fresh peer keys.
    fn ready_encrypted_initiator() -> (
        Arc<Connection<AppPacket>>,
        std::net::TcpStream,
        UnboundedReceiver<Event<AppPacket>>,
        KeyPair,
    ) {
        let (conn, peer, mut rx) = pending_initiator(SecurityMode::Encrypted);
        let peer_keys = keys::generate_key_pair(512).unwrap();
        let handshake = encode_frame(&Frame::Handshake {
            public_key: peer_keys.public.to_der().unwrap(),
        })
        .unwrap();
        conn.on_readable(&handshake);
        assert!(conn.is_ready());
        drain(&mut rx);
        (conn, peer, rx, peer_keys)
    }

    #[test]
    fn test_envelope_for_another_key_disconnects_once() {
        let (conn, _peer, mut rx, peer_keys) = ready_encrypted_initiator();

        // Wrapped to the peer's own key, so we cannot unwrap it.
        let misaddressed =
            envelope::encode(&AppPacket::new("ping").sign(), &peer_keys.public).unwrap();
        assert!(envelope::decode::<AppPacket>(&misaddressed, conn.private_key().unwrap()).is_err());

        let frame = encode_frame(&Frame::Envelope(misaddressed)).unwrap();
        conn.on_readable(&frame);
        conn.on_readable(&frame);

        assert!(conn.is_closed());
        let events = drain(&mut rx);
        assert_eq!(count_disconnects(&events), 1);
        assert_eq!(count_received(&events), 0);
    }

    #[test]
    fn test_envelope_with_unknown_shape_is_malformed() {
        let (conn, _peer, mut rx, _peer_keys) = ready_encrypted_initiator();

        let key = keys::SymmetricKey::generate();
        let odd = envelope::TransferEnvelope {
            encrypted_key: keys::asymmetric_encrypt(
                conn.local_public_key().unwrap(),
                key.as_bytes(),
            )
            .unwrap(),
            ciphertext: keys::symmetric_encrypt(&key, br#"{"unexpected": [1, 2, 3]}"#).unwrap(),
        };
        let decoded = envelope::decode::<AppPacket>(&odd, conn.private_key().unwrap());
        assert!(matches!(decoded, Err(WireError::MalformedMessage(_))));

        conn.on_readable(&encode_frame(&Frame::Envelope(odd)).unwrap());

        assert!(conn.is_closed());
        let events = drain(&mut rx);
        assert_eq!(count_disconnects(&events), 1);
        assert_eq!(count_received(&events), 0);
    }

    #[test]
    fn test_oversized_frame_is_fatal() {
        let (conn, _peer, mut rx) = pending_initiator(SecurityMode::Encrypted);
        conn.on_readable(&u32::MAX.to_be_bytes());
        assert!(conn.is_closed());
        assert_eq!(count_disconnects(&drain(&mut rx)), 1);
    }

    #[test]
    fn test_plaintext_initiator_ready_at_open() {
        let (conn, mut peer, mut rx) = pending_initiator(SecurityMode::Plaintext);
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.role(), Role::Initiator);
        assert_eq!(conn.security_mode(), SecurityMode::Plaintext);
        assert!(conn.local_public_key().is_none());

        let events = drain(&mut rx);
        assert!(matches!(
            events.first(),
            Some(Event::Connection(c)) if c.kind() == ConnectionEventKind::Connected
        ));

        conn.send(AppPacket::new("ping").sign()).unwrap();
        match read_one_frame(&mut peer) {
            Frame::Plain { payload } => {
                let packet: AppPacket = serde_json::from_slice(&payload).unwrap();
                assert_eq!(packet.kind, "ping");
                assert!(packet.sent_at.is_some());
            }
            other => panic!("Expected plain frame, got {other:?}"),
        }
        conn.disconnect();
    }

    #[test]
    fn test_accept_requires_peer_key_when_encrypted() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();
        let (socket, _) = listener.accept().unwrap();

        let event_loop = EventLoop::start("test-loop", 1024).unwrap();
        let (handler, _rx) = ChannelHandler::<AppPacket>::new();
        let registry = ConnectionRegistry::new();
        let result = Connection::accept(
            socket,
            None,
            &test_config(SecurityMode::Encrypted),
            registry.clone(),
            handler,
            &event_loop,
        );
        assert!(matches!(result, Err(WireError::MissingPeerKey)));
        assert!(registry.is_empty());
    }

    /// Records the thread each `Connected` event was delivered on.
    struct ThreadRecorder {
        connected_on: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl EventHandler<AppPacket> for ThreadRecorder {
        fn on_connection_event(&self, event: &ConnectionEvent<AppPacket>) {
            if event.kind() == ConnectionEventKind::Connected {
                self.connected_on
                    .lock()
                    .unwrap()
                    .push(std::thread::current().id());
            }
        }

        fn on_packet_event(&self, _event: &PacketEvent<AppPacket>) {}
    }

    #[test]
    fn test_acceptor_connected_fires_on_accepting_thread() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (socket, _) = listener.accept().unwrap();

        let event_loop = EventLoop::start("test-loop", 1024).unwrap();
        let recorder = Arc::new(ThreadRecorder {
            connected_on: Mutex::new(Vec::new()),
        });
        let handler: Arc<dyn EventHandler<AppPacket>> = recorder.clone();
        let conn = Connection::accept(
            socket,
            None,
            &test_config(SecurityMode::Plaintext),
            ConnectionRegistry::<AppPacket>::new(),
            handler,
            &event_loop,
        )
        .unwrap();

        // Already delivered, and on this thread rather than the loop's.
        assert_eq!(conn.role(), Role::Acceptor);
        assert_eq!(
            *recorder.connected_on.lock().unwrap(),
            vec![std::thread::current().id()]
        );
        conn.disconnect();
    }

    #[test]
    fn test_connection_timeout_accessors() {
        let (conn, _peer, _rx) = pending_initiator(SecurityMode::Plaintext);
        assert_eq!(conn.connection_timeout(), Duration::from_secs(10));
        conn.set_connection_timeout(Duration::from_millis(250));
        assert_eq!(conn.connection_timeout(), Duration::from_millis(250));
        conn.disconnect();
    }
}
