//! Error taxonomy for the wire engine.

use thiserror::Error;

/// A cryptographic failure. Never swallowed: the caller decides whether it
/// is fatal to the connection.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Unsupported key size: {bits} bits (accepted {min}..={max})")]
    UnsupportedKeySize { bits: usize, min: usize, max: usize },
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),
    #[error("Invalid key encoding: {0}")]
    InvalidKey(String),
    #[error("Encryption failed: {0}")]
    Encrypt(String),
    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// Errors from the wire engine.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Connection is not ready: handshake has not completed")]
    NotReady,
    #[error("Packet is not signed")]
    UnsignedMessage,
    #[error("Stream corrupted: {0}")]
    StreamCorrupted(String),
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Encrypted acceptor requires the peer's public key")]
    MissingPeerKey,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Socket write stalled for longer than the write timeout")]
    WriteTimeout,
    #[error("Event loop is not running")]
    LoopStopped,
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(#[from] sealink_types::ConfigError),
}

impl WireError {
    /// Whether this error, raised on an established connection, means the
    /// stream can no longer be trusted and the connection must be dropped.
    ///
    /// Precondition violations (`NotReady`, `UnsignedMessage`) leave the
    /// connection usable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::NotReady
            | Self::UnsignedMessage
            | Self::MissingPeerKey
            | Self::LoopStopped
            | Self::Config(_) => false,
            Self::Cipher(_)
            | Self::MalformedMessage(_)
            | Self::StreamCorrupted(_)
            | Self::FrameTooLarge { .. }
            | Self::ConnectionClosed
            | Self::WriteTimeout
            | Self::HandshakeFailed(_)
            | Self::Io(_)
            | Self::Serialization(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_errors_are_recoverable() {
        assert!(!WireError::NotReady.is_fatal());
        assert!(!WireError::UnsignedMessage.is_fatal());
    }

    #[test]
    fn test_stream_errors_are_fatal() {
        assert!(WireError::StreamCorrupted("bad frame".into()).is_fatal());
        assert!(WireError::FrameTooLarge { size: 10, max: 1 }.is_fatal());
        assert!(WireError::Cipher(CipherError::Decrypt("tag mismatch".into())).is_fatal());
        assert!(WireError::MalformedMessage("unknown shape".into()).is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = WireError::FrameTooLarge { size: 2048, max: 1024 };
        assert_eq!(err.to_string(), "Frame too large: 2048 bytes (max 1024)");
        let err = WireError::from(CipherError::UnsupportedKeySize {
            bits: 128,
            min: 512,
            max: 8192,
        });
        assert!(err.to_string().contains("128 bits"));
    }
}
