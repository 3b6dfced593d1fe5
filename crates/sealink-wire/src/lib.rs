//! Sealink wire engine: secure peer-to-peer messaging over TCP.
//!
//! Two peers exchange public keys in a handshake, then send application
//! messages inside hybrid-encrypted envelopes: a one-time AES-256-GCM key per
//! message, wrapped under the recipient's RSA key. A plaintext mode skips
//! the handshake and frames messages as-is.
//!
//! ## Architecture
//!
//! - **Connection**: one peer link; handshake state, send path, lifecycle events
//! - **Listener**: accepts inbound sockets and reads the initiator's handshake
//! - **EventLoop**: a dedicated thread multiplexing read readiness
//! - **ConnectionRegistry**: live acceptor-side connections and their peer keys
//! - **EventHandler**: receives `Connected`/`Disconnected` and `Sent`/`Received`
//! - **TransferEnvelope**: the encrypted wire unit for application messages

pub mod connection;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod event_loop;
pub mod frame;
pub mod keys;
pub mod listener;
pub mod packet;
pub mod registry;
mod serde_b64;

pub use connection::{Connection, ConnectionState, Role};
pub use dispatch::{
    ChannelHandler, ConnectionEvent, ConnectionEventKind, Event, EventHandler,
    NarrowedPacketEvent, PacketEvent, PacketEventKind,
};
pub use envelope::TransferEnvelope;
pub use error::{CipherError, WireError};
pub use event_loop::EventLoop;
pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use listener::Listener;
pub use packet::{AppPacket, Packet};
pub use registry::{ConnectionRegistry, RegistryEntry};
pub use sealink_types::{ConnectionId, SecurityMode, WireConfig};
