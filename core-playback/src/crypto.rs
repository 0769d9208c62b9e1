//! Segment decryption and deobfuscation.
//!
//! Two on-wire forms exist:
//!
//! - **XOR**: every byte XORed with a short repeating key.
//! - **AES-GCM**: `[nonce: 12][tag: 16][ciphertext]`, authenticated with a
//!   per-segment key. A 32-byte key selects AES-256, a 16-byte key AES-128.
//!
//! Everything here is pure and deterministic.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DeliveryError, Result};

/// Nonce length of the AES-GCM wire layout.
pub const NONCE_LEN: usize = 12;

/// Authentication tag length of the AES-GCM wire layout.
pub const TAG_LEN: usize = 16;

/// Bytes preceding the ciphertext.
pub const HEADER_LEN: usize = NONCE_LEN + TAG_LEN;

/// Key material for one segment or track.
#[derive(Clone, PartialEq, Eq)]
pub struct SegmentKey {
    key_bytes: Vec<u8>,
}

impl SegmentKey {
    /// Create from raw key bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(DeliveryError::Decryption("empty key".to_string()));
        }
        Ok(Self { key_bytes: bytes })
    }

    /// Parse a hex-encoded key.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| DeliveryError::Decryption(format!("Invalid hex key: {}", e)))?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key_bytes
    }

    pub fn len(&self) -> usize {
        self.key_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_bytes.is_empty()
    }
}

impl fmt::Debug for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentKey")
            .field("key_bytes", &"[REDACTED]")
            .field("len", &self.key_bytes.len())
            .finish()
    }
}

/// On-wire transformation applied to segment bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherScheme {
    /// Repeating-key XOR.
    Xor,
    /// AES-GCM with the nonce and tag prefixed to the ciphertext.
    #[default]
    AesGcm,
}

impl CipherScheme {
    /// Reverse the transformation.
    pub fn open(&self, data: &[u8], key: &SegmentKey) -> Result<Bytes> {
        match self {
            CipherScheme::Xor => deobfuscate(data, key.as_bytes()),
            CipherScheme::AesGcm => decrypt(data, key),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CipherScheme::Xor => "xor",
            CipherScheme::AesGcm => "aes-gcm",
        }
    }
}

/// XOR every byte with `key[i % key.len()]`.
///
/// The operation is its own inverse.
pub fn deobfuscate(data: &[u8], key: &[u8]) -> Result<Bytes> {
    if key.is_empty() {
        return Err(DeliveryError::Decryption("empty XOR key".to_string()));
    }

    let out: Vec<u8> = data
        .iter()
        .zip(key.iter().cycle())
        .map(|(byte, k)| byte ^ k)
        .collect();
    Ok(Bytes::from(out))
}

/// Verify and decrypt an AES-GCM segment in wire layout.
///
/// Fails on truncated input, a key that is neither 16 nor 32 bytes, or a tag
/// mismatch. Never returns unauthenticated bytes.
pub fn decrypt(data: &[u8], key: &SegmentKey) -> Result<Bytes> {
    if data.len() < HEADER_LEN {
        return Err(DeliveryError::Decryption(format!(
            "segment too short: {} bytes",
            data.len()
        )));
    }

    let (nonce, rest) = data.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    match key.len() {
        32 => open_detached::<Aes256Gcm>(key.as_bytes(), nonce, tag, ciphertext),
        16 => open_detached::<Aes128Gcm>(key.as_bytes(), nonce, tag, ciphertext),
        other => Err(DeliveryError::Decryption(format!(
            "unsupported AES key length: {}",
            other
        ))),
    }
}

/// Encrypt `plaintext` into the wire layout decrypted by [`decrypt`].
pub fn seal(plaintext: &[u8], key: &SegmentKey, nonce: &[u8; NONCE_LEN]) -> Result<Bytes> {
    let mut buffer = plaintext.to_vec();
    let tag = match key.len() {
        32 => seal_detached::<Aes256Gcm>(key.as_bytes(), nonce, &mut buffer)?,
        16 => seal_detached::<Aes128Gcm>(key.as_bytes(), nonce, &mut buffer)?,
        other => {
            return Err(DeliveryError::Decryption(format!(
                "unsupported AES key length: {}",
                other
            )))
        }
    };

    let mut out = BytesMut::with_capacity(HEADER_LEN + buffer.len());
    out.put_slice(nonce);
    out.put_slice(&tag);
    out.put_slice(&buffer);
    Ok(out.freeze())
}

fn open_detached<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    tag: &[u8],
    ciphertext: &[u8],
) -> Result<Bytes> {
    let cipher = C::new_from_slice(key)
        .map_err(|_| DeliveryError::Decryption("invalid key length".to_string()))?;

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| DeliveryError::Decryption("authentication failed".to_string()))?;

    Ok(Bytes::from(buffer))
}

fn seal_detached<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    buffer: &mut [u8],
) -> Result<Vec<u8>> {
    let cipher = C::new_from_slice(key)
        .map_err(|_| DeliveryError::Decryption("invalid key length".to_string()))?;

    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), b"", buffer)
        .map_err(|e| DeliveryError::Decryption(format!("Encryption failed: {}", e)))?;

    Ok(tag.to_vec())
}
