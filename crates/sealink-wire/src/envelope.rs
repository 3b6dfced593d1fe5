//! Envelope codec: hybrid encryption of application messages.
//!
//! Each envelope carries its own one-time AES key, wrapped under the
//! recipient's RSA public key. No cipher state is shared between envelopes,
//! so every message decodes on its own.

use crate::error::{CipherError, WireError};
use crate::keys::{self, PrivateKey, PublicKey, SymmetricKey};
use crate::packet::Packet;
use serde::{Deserialize, Serialize};

/// The wire unit for application messages once a connection is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEnvelope {
    /// One-time symmetric key, encrypted under the recipient's public key.
    #[serde(with = "crate::serde_b64")]
    pub encrypted_key: Vec<u8>,
    /// Serialized message, encrypted under the one-time key.
    #[serde(with = "crate::serde_b64")]
    pub ciphertext: Vec<u8>,
}

/// Serialize, encrypt and wrap `message` for `recipient`.
///
/// Unsigned messages fail with [`WireError::UnsignedMessage`] before any
/// key material is generated.
pub fn encode<M: Packet>(message: &M, recipient: &PublicKey) -> Result<TransferEnvelope, WireError> {
    if !message.is_signed() {
        return Err(WireError::UnsignedMessage);
    }
    let plaintext = serde_json::to_vec(message)?;
    let key = SymmetricKey::generate();
    let ciphertext = keys::symmetric_encrypt(&key, &plaintext)?;
    let encrypted_key = keys::asymmetric_encrypt(recipient, key.as_bytes())?;
    Ok(TransferEnvelope {
        encrypted_key,
        ciphertext,
    })
}

/// Unwrap, decrypt and deserialize an envelope addressed to `private`.
pub fn decode<M: Packet>(envelope: &TransferEnvelope, private: &PrivateKey) -> Result<M, WireError> {
    let key_bytes = keys::asymmetric_decrypt(private, &envelope.encrypted_key)?;
    let key = SymmetricKey::from_bytes(&key_bytes).map_err(|e| match e {
        CipherError::InvalidKey(reason) => CipherError::Decrypt(reason),
        other => other,
    })?;
    let plaintext = keys::symmetric_decrypt(&key, &envelope.ciphertext)?;
    deserialize_payload(&plaintext)
}

/// Deserialize a decrypted (or plaintext-mode) payload.
pub(crate) fn deserialize_payload<M: Packet>(bytes: &[u8]) -> Result<M, WireError> {
    serde_json::from_slice(bytes).map_err(|e| WireError::MalformedMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key_pair;
    use crate::packet::AppPacket;
    use serde_json::json;

    #[test]
    fn test_roundtrip() {
        let kp = generate_key_pair(512).unwrap();
        let packet = AppPacket::new("chat")
            .with_body(json!({"text": "hello", "n": 3}))
            .sign();
        let envelope = encode(&packet, &kp.public).unwrap();
        let decoded: AppPacket = decode(&envelope, &kp.private).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_large_payload_roundtrip() {
        let kp = generate_key_pair(512).unwrap();
        let blob = "x".repeat(256 * 1024);
        let packet = AppPacket::new("image").with_body(json!({ "data": blob })).sign();
        let envelope = encode(&packet, &kp.public).unwrap();
        let decoded: AppPacket = decode(&envelope, &kp.private).unwrap();
        assert!(decoded.same_content(&packet));
    }

    #[test]
    fn test_unsigned_rejected() {
        let kp = generate_key_pair(512).unwrap();
        let result = encode(&AppPacket::new("ping"), &kp.public);
        assert!(matches!(result, Err(WireError::UnsignedMessage)));
    }

    #[test]
    fn test_fresh_key_per_envelope() {
        let kp = generate_key_pair(512).unwrap();
        let packet = AppPacket::new("ping").sign();
        let a = encode(&packet, &kp.public).unwrap();
        let b = encode(&packet, &kp.public).unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.encrypted_key, b.encrypted_key);
    }

    #[test]
    fn test_wrong_recipient_is_cipher_error() {
        let alice = generate_key_pair(512).unwrap();
        let bob = generate_key_pair(512).unwrap();
        let envelope = encode(&AppPacket::new("ping").sign(), &alice.public).unwrap();
        let result: Result<AppPacket, _> = decode(&envelope, &bob.private);
        assert!(matches!(result, Err(WireError::Cipher(_))));
    }

    #[test]
    fn test_tampered_ciphertext_is_cipher_error() {
        let kp = generate_key_pair(512).unwrap();
        let mut envelope = encode(&AppPacket::new("ping").sign(), &kp.public).unwrap();
        let mid = envelope.ciphertext.len() / 2;
        envelope.ciphertext[mid] ^= 0xff;
        let result: Result<AppPacket, _> = decode(&envelope, &kp.private);
        assert!(matches!(result, Err(WireError::Cipher(_))));
    }

    #[test]
    fn test_unknown_shape_is_malformed() {
        let kp = generate_key_pair(512).unwrap();
        let key = SymmetricKey::generate();
        let envelope = TransferEnvelope {
            encrypted_key: keys::asymmetric_encrypt(&kp.public, key.as_bytes()).unwrap(),
            ciphertext: keys::symmetric_encrypt(&key, br#"{"no_kind_here": true}"#).unwrap(),
        };
        let result: Result<AppPacket, _> = decode(&envelope, &kp.private);
        assert!(matches!(result, Err(WireError::MalformedMessage(_))));
    }
}
