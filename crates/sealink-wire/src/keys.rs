//! Key management: RSA key pairs, one-time AES keys, and the primitives that
//! wrap one inside the other.
//!
//! The asymmetric side only ever encrypts a 32-byte symmetric key, so the
//! payload size is bounded by the symmetric cipher, not the RSA modulus.
//!
//! ## Padding
//!
//! Keys of 1024 bits and up wrap with RSA-OAEP (SHA-256). A 512-bit modulus
//! is too small for OAEP-SHA-256 around a 32-byte key, so smaller keys fall
//! back to PKCS#1 v1.5. The scheme is a function of the modulus, so sender
//! and receiver always agree.

use crate::error::CipherError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sealink_types::config::{MAX_KEY_BITS, MIN_KEY_BITS};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key length in bytes (AES-256).
pub const SYMMETRIC_KEY_LEN: usize = 32;
/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// Moduli at or above this many bytes use OAEP.
const OAEP_MIN_MODULUS_BYTES: usize = 128;

/// An RSA public key as exchanged in handshake frames.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(RsaPublicKey);

impl PublicKey {
    /// Encode as SPKI DER for the wire.
    pub fn to_der(&self) -> Result<Vec<u8>, CipherError> {
        self.0
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CipherError::InvalidKey(e.to_string()))
    }

    /// Decode from SPKI DER.
    pub fn from_der(der: &[u8]) -> Result<Self, CipherError> {
        RsaPublicKey::from_public_key_der(der)
            .map(Self)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.0.size() * 8
    }

    /// Short hex digest of the DER encoding, for logs and registries.
    pub fn fingerprint(&self) -> String {
        match self.to_der() {
            Ok(der) => hex::encode(&Sha256::digest(&der)[..8]),
            Err(_) => "invalid".to_string(),
        }
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("bits", &self.bits())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// An RSA private key. Never serialized; zeroized on drop by `rsa`.
pub struct PrivateKey(RsaPrivateKey);

impl PrivateKey {
    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(RsaPublicKey::from(&self.0))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// A freshly generated asymmetric key pair.
#[derive(Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

/// Generate an RSA key pair with a modulus of `bits` bits.
pub fn generate_key_pair(bits: usize) -> Result<KeyPair, CipherError> {
    if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
        return Err(CipherError::UnsupportedKeySize {
            bits,
            min: MIN_KEY_BITS,
            max: MAX_KEY_BITS,
        });
    }
    let private = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| CipherError::KeyGeneration(e.to_string()))?;
    let public = PublicKey(RsaPublicKey::from(&private));
    Ok(KeyPair {
        public,
        private: PrivateKey(private),
    })
}

/// A one-time AES-256 key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_LEN]);

impl SymmetricKey {
    /// Generate a fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; SYMMETRIC_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Rebuild a key from unwrapped bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        let key: [u8; SYMMETRIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            CipherError::InvalidKey(format!(
                "symmetric key must be {SYMMETRIC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Encrypt `bytes` (a symmetric key) under `public`.
pub fn asymmetric_encrypt(public: &PublicKey, bytes: &[u8]) -> Result<Vec<u8>, CipherError> {
    let result = if public.0.size() >= OAEP_MIN_MODULUS_BYTES {
        public.0.encrypt(&mut OsRng, Oaep::new::<Sha256>(), bytes)
    } else {
        public.0.encrypt(&mut OsRng, Pkcs1v15Encrypt, bytes)
    };
    result.map_err(|e| CipherError::Encrypt(e.to_string()))
}

/// Decrypt a key wrapped by [`asymmetric_encrypt`].
pub fn asymmetric_decrypt(private: &PrivateKey, bytes: &[u8]) -> Result<Vec<u8>, CipherError> {
    let result = if private.0.size() >= OAEP_MIN_MODULUS_BYTES {
        private.0.decrypt(Oaep::new::<Sha256>(), bytes)
    } else {
        private.0.decrypt(Pkcs1v15Encrypt, bytes)
    };
    result.map_err(|e| CipherError::Decrypt(e.to_string()))
}

/// AES-256-GCM encrypt. Output is `nonce || ciphertext || tag`.
pub fn symmetric_encrypt(key: &SymmetricKey, bytes: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), bytes)
        .map_err(|e| CipherError::Encrypt(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverse [`symmetric_encrypt`]. Fails on a wrong key or any tampering.
pub fn symmetric_decrypt(key: &SymmetricKey, bytes: &[u8]) -> Result<Vec<u8>, CipherError> {
    if bytes.len() < NONCE_LEN {
        return Err(CipherError::Decrypt(format!(
            "ciphertext shorter than the {NONCE_LEN}-byte nonce"
        )));
    }
    let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| CipherError::Decrypt(e.to_string()))
}
