//! Session crypto: token-derived long-term secrets, one-shot session-key wrapping,
//! per-message AEAD framing, and the two independent hash derivations (tenant id,
//! channel id) that both start from the same client token.
//!
//! Built around AES-256-GCM over the base64 JSON envelope this fabric's wire
//! protocol uses, with a non-standard 16-byte nonce and a fresh random IV per
//! message.

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{AesGcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::Hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{FabricError, FabricResult};

pub const SESSION_KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;

const ENCRYPTION_SALT: &[u8] = b"ws_encryption_salt";
const PBKDF2_ITERATIONS: u32 = 100_000;
const CHANNEL_SALT: &[u8] = b"_ws_channel_salt_v1";

/// AES-256-GCM parameterized over a 16-byte nonce, matching the wire layout's
/// `iv(16) || tag(16) || ciphertext` envelope rather than the library default of a
/// 12-byte nonce.
type Aes256Gcm16 = AesGcm<aes_gcm::aes::Aes256, U16>;

pub type SessionKeyBytes = [u8; SESSION_KEY_SIZE];
pub type Iv = [u8; IV_SIZE];

/// Derives the token's long-term secret: `PBKDF2(token, "ws_encryption_salt", 100_000, 32, HMAC-SHA256)`.
pub fn derive_token_secret(token: &str) -> SessionKeyBytes {
    let mut out = [0u8; SESSION_KEY_SIZE];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(token.as_bytes(), ENCRYPTION_SALT, PBKDF2_ITERATIONS, &mut out)
        .expect("PBKDF2 output length is fixed and always valid");
    out
}

/// Derives the broadcast-channel id: `"channel_" + first 16 hex chars of SHA-256(token || salt)`.
pub fn channel_id_for_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(CHANNEL_SALT);
    let digest = hasher.finalize();
    let hex = hex_encode(&digest);
    format!("channel_{}", &hex[..16])
}

/// Generates a fresh random session key for a newly authenticated connection.
pub fn generate_session_key() -> SessionKeyBytes {
    let mut key = [0u8; SESSION_KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Generates the per-connection IV announced during the handshake. Unlike the
/// original design, this value is no longer reused to encrypt every frame -- see
/// `encrypt_frame` -- but it is still generated and sent so the wire layout
/// (`{type:"encryption", encryptionKey, iv}`) is unchanged.
pub fn generate_connection_iv() -> Iv {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Seals the session key under the token-derived secret for one-shot delivery during
/// the handshake: `base64(iv_wrap || tag || ciphertext)`.
pub fn seal_session_key(secret: &SessionKeyBytes, session_key: &SessionKeyBytes) -> FabricResult<String> {
    let mut iv_wrap = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv_wrap);

    let cipher = Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(secret));
    let nonce = Nonce::<Aes256Gcm16>::from_slice(&iv_wrap);
    let ciphertext = cipher
        .encrypt(nonce, session_key.as_slice())
        .map_err(|_| FabricError::Crypto("failed to seal session key".into()))?;

    let mut wire = Vec::with_capacity(IV_SIZE + ciphertext.len());
    wire.extend_from_slice(&iv_wrap);
    wire.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(wire))
}

/// Inverse of [`seal_session_key`].
pub fn unseal_session_key(secret: &SessionKeyBytes, sealed_b64: &str) -> FabricResult<SessionKeyBytes> {
    let wire = BASE64.decode(sealed_b64).map_err(|e| FabricError::Crypto(e.to_string()))?;
    if wire.len() < IV_SIZE + TAG_SIZE {
        return Err(FabricError::Crypto("sealed session key too short".into()));
    }
    let (iv_wrap, ciphertext) = wire.split_at(IV_SIZE);

    let cipher = Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(secret));
    let nonce = Nonce::<Aes256Gcm16>::from_slice(iv_wrap);
    let plain = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| FabricError::Crypto("failed to unseal session key".into()))?;

    plain
        .try_into()
        .map_err(|_| FabricError::Crypto("unsealed session key has the wrong length".into()))
}

/// Encrypts one message frame for the wire: `base64(iv || tag || ciphertext)`.
///
/// A fresh random IV is drawn for every call -- reusing a nonce under one key breaks
/// GCM's authentication guarantees. The wire format is unchanged: the IV still rides
/// along in the same 16-byte prefix slot, so a peer never needs to know the IV stopped being
/// constant.
pub fn encrypt_frame(key: &SessionKeyBytes, plaintext: &[u8]) -> FabricResult<String> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(key));
    let nonce = Nonce::<Aes256Gcm16>::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| FabricError::Crypto("failed to encrypt frame".into()))?;

    let mut wire = Vec::with_capacity(IV_SIZE + ciphertext.len());
    wire.extend_from_slice(&iv);
    wire.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(wire))
}

/// Decrypts one message frame from the wire.
pub fn decrypt_frame(key: &SessionKeyBytes, frame_b64: &str) -> FabricResult<Vec<u8>> {
    let wire = BASE64.decode(frame_b64).map_err(|e| FabricError::Crypto(e.to_string()))?;
    if wire.len() < IV_SIZE + TAG_SIZE {
        return Err(FabricError::Crypto("frame too short to contain iv and tag".into()));
    }
    let (iv, ciphertext) = wire.split_at(IV_SIZE);

    let cipher = Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(key));
    let nonce = Nonce::<Aes256Gcm16>::from_slice(iv);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| FabricError::Crypto("failed to decrypt frame".into()))
}

/// Non-cryptographic 64-bit hash used to derive the tenant-id key prefix. This is
/// intentionally not collision-resistant in the cryptographic sense -- it is a
/// namespace key, not a security boundary, so a fast FNV-1a variant is enough.
pub fn non_crypto_hash64(input: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in input.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Derives the tenant-id: `"user_" + non_crypto_hash64(token)`.
pub fn tenant_id_for_token(token: &str) -> String {
    format!("user_{:016x}", non_crypto_hash64(token))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{:02x}", byte).expect("writing into a String cannot fail");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_and_tenant_ids_are_distinct_but_deterministic() {
        let token = "meow moew meow";
        let channel_a = channel_id_for_token(token);
        let channel_b = channel_id_for_token(token);
        assert_eq!(channel_a, channel_b);
        assert!(channel_a.starts_with("channel_"));
        assert_eq!(channel_a.len(), "channel_".len() + 16);

        let tenant_a = tenant_id_for_token(token);
        let tenant_b = tenant_id_for_token(token);
        assert_eq!(tenant_a, tenant_b);
        assert_ne!(channel_a, tenant_a);
    }

    #[test]
    fn distinct_tokens_yield_distinct_tenants() {
        assert_ne!(tenant_id_for_token("alpha"), tenant_id_for_token("beta"));
        assert_ne!(channel_id_for_token("alpha"), channel_id_for_token("beta"));
    }

    #[test]
    fn session_key_round_trips_through_seal_and_unseal() {
        let secret = derive_token_secret("a token");
        let session_key = generate_session_key();
        let sealed = seal_session_key(&secret, &session_key).unwrap();
        let unsealed = unseal_session_key(&secret, &sealed).unwrap();
        assert_eq!(session_key, unsealed);
    }

    #[test]
    fn message_frames_round_trip_and_use_fresh_ivs() {
        let key = generate_session_key();
        let frame_a = encrypt_frame(&key, b"hello").unwrap();
        let frame_b = encrypt_frame(&key, b"hello").unwrap();
        // Same plaintext, same key -> ciphertexts must differ because the IV is fresh.
        assert_ne!(frame_a, frame_b);
        assert_eq!(decrypt_frame(&key, &frame_a).unwrap(), b"hello");
        assert_eq!(decrypt_frame(&key, &frame_b).unwrap(), b"hello");
    }

    #[test]
    fn tampered_frame_fails_to_decrypt() {
        let key = generate_session_key();
        let frame = encrypt_frame(&key, b"hello").unwrap();
        let mut wire = BASE64.decode(&frame).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        let tampered = BASE64.encode(wire);
        assert!(decrypt_frame(&key, &tampered).is_err());
    }
}
