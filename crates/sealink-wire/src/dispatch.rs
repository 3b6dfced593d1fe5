//! Dispatch contract: how the engine reports lifecycle and packet events.
//!
//! Handlers are called synchronously on the thread that detected the event:
//! the event loop thread for receive/disconnect and for an initiator's
//! connect, the caller's thread for send. An acceptor's `Connected` fires
//! inside [`Connection::accept`] on the accepting thread (for a listener, a
//! blocking-pool thread), before the socket is handed to the loop, so no
//! read can race ahead of readiness. A slow handler stalls every connection
//! on its loop.

use crate::connection::Connection;
use crate::packet::Packet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    /// The connection became ready.
    Connected,
    /// The connection closed. Fired exactly once per connection.
    Disconnected,
}

/// Direction of a packet event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketEventKind {
    Sent,
    Received,
}

/// A connection lifecycle event.
#[derive(Debug, Clone)]
pub struct ConnectionEvent<M: Packet> {
    kind: ConnectionEventKind,
    connection: Arc<Connection<M>>,
}

impl<M: Packet> ConnectionEvent<M> {
    pub fn new(kind: ConnectionEventKind, connection: Arc<Connection<M>>) -> Self {
        Self { kind, connection }
    }

    pub fn kind(&self) -> ConnectionEventKind {
        self.kind
    }

    pub fn connection(&self) -> &Arc<Connection<M>> {
        &self.connection
    }
}

/// A packet sent or received on a connection.
#[derive(Debug, Clone)]
pub struct PacketEvent<M: Packet> {
    kind: PacketEventKind,
    connection: Arc<Connection<M>>,
    message: M,
}

impl<M: Packet> PacketEvent<M> {
    pub fn new(kind: PacketEventKind, connection: Arc<Connection<M>>, message: M) -> Self {
        Self {
            kind,
            connection,
            message,
        }
    }

    pub fn kind(&self) -> PacketEventKind {
        self.kind
    }

    pub fn connection(&self) -> &Arc<Connection<M>> {
        &self.connection
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    /// View the message as a more specific type, if it converts.
    ///
    /// Lets a handler consume e.g. image packets without matching on the
    /// general message type, while the base event stays intact.
    pub fn narrow<T>(&self) -> Option<NarrowedPacketEvent<'_, M, T>>
    where
        T: for<'a> TryFrom<&'a M>,
    {
        T::try_from(&self.message)
            .ok()
            .map(|message| NarrowedPacketEvent {
                base: self,
                message,
            })
    }
}

/// A [`PacketEvent`] whose message was converted to `T`.
#[derive(Debug)]
pub struct NarrowedPacketEvent<'e, M: Packet, T> {
    base: &'e PacketEvent<M>,
    message: T,
}

impl<'e, M: Packet, T> NarrowedPacketEvent<'e, M, T> {
    pub fn kind(&self) -> PacketEventKind {
        self.base.kind
    }

    pub fn connection(&self) -> &Arc<Connection<M>> {
        &self.base.connection
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    /// The un-narrowed event.
    pub fn base(&self) -> &PacketEvent<M> {
        self.base
    }
}

/// Receives engine events. One handler instance per engine.
pub trait EventHandler<M: Packet>: Send + Sync + 'static {
    fn on_connection_event(&self, event: &ConnectionEvent<M>);

    fn on_packet_event(&self, event: &PacketEvent<M>);
}

/// Either kind of engine event.
#[derive(Debug, Clone)]
pub enum Event<M: Packet> {
    Connection(ConnectionEvent<M>),
    Packet(PacketEvent<M>),
}

/// An [`EventHandler`] that forwards every event into a tokio channel.
///
/// Useful when the consumer is async or lives on another thread: the engine
/// side never blocks, and events arrive in detection order.
pub struct ChannelHandler<M: Packet> {
    tx: mpsc::UnboundedSender<Event<M>>,
}

impl<M: Packet> ChannelHandler<M> {
    /// Create a handler and the receiving end of its channel.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event<M>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl<M: Packet> EventHandler<M> for ChannelHandler<M> {
    fn on_connection_event(&self, event: &ConnectionEvent<M>) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(Event::Connection(event.clone()));
    }

    fn on_packet_event(&self, event: &PacketEvent<M>) {
        let _ = self.tx.send(Event::Packet(event.clone()));
    }
}
