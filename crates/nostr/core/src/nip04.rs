//! NIP-04: Encrypted Direct Message.
//!
//! The shared key is the x coordinate of the ECDH point between the sender's
//! secret key and the recipient's public key. Payloads are AES-256-CBC with
//! PKCS#7 padding and travel as `base64(ciphertext)?iv=base64(iv)`.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/04.md>

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine, engine::general_purpose::STANDARD};
use bitcoin::secp256k1::{PublicKey, SecretKey, ecdh};
use thiserror::Error;

/// Event kind for encrypted direct messages.
pub const KIND_ENCRYPTED_DIRECT_MESSAGE: u16 = 4;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Error)]
pub enum Nip04Error {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("decryption failed")]
    Decryption,

    #[error("plaintext is not utf-8")]
    Utf8,
}

/// Encrypt `plaintext` from `secret_key` to the hex x-only `recipient_pubkey`.
pub fn encrypt(
    secret_key: &[u8; 32],
    recipient_pubkey: &str,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    let key = shared_key(secret_key, recipient_pubkey)?;
    let iv: [u8; 16] = rand::random();
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!(
        "{}?iv={}",
        STANDARD.encode(ciphertext),
        STANDARD.encode(iv)
    ))
}

/// Decrypt a payload sent by the hex x-only `sender_pubkey` to `secret_key`.
pub fn decrypt(
    secret_key: &[u8; 32],
    sender_pubkey: &str,
    payload: &str,
) -> Result<String, Nip04Error> {
    let (ciphertext_b64, iv_b64) = payload
        .split_once("?iv=")
        .ok_or_else(|| Nip04Error::MalformedPayload("missing iv".to_string()))?;
    let ciphertext = STANDARD
        .decode(ciphertext_b64)
        .map_err(|error| Nip04Error::MalformedPayload(error.to_string()))?;
    let iv: [u8; 16] = STANDARD
        .decode(iv_b64)
        .map_err(|error| Nip04Error::MalformedPayload(error.to_string()))?
        .try_into()
        .map_err(|_| Nip04Error::MalformedPayload("iv must be 16 bytes".to_string()))?;

    let key = shared_key(secret_key, sender_pubkey)?;
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Nip04Error::Decryption)?;
    String::from_utf8(plaintext).map_err(|_| Nip04Error::Utf8)
}

fn shared_key(secret_key: &[u8; 32], pubkey_hex: &str) -> Result<[u8; 32], Nip04Error> {
    let secret = SecretKey::from_slice(secret_key)
        .map_err(|error| Nip04Error::InvalidSecretKey(error.to_string()))?;

    let x_only = hex::decode(pubkey_hex)
        .map_err(|error| Nip04Error::InvalidPublicKey(error.to_string()))?;
    if x_only.len() != 32 {
        return Err(Nip04Error::InvalidPublicKey(format!(
            "expected 32 bytes, got {}",
            x_only.len()
        )));
    }
    // Nostr keys are x-only; either parity yields the same shared x coordinate.
    let mut compressed = Vec::with_capacity(33);
    compressed.push(0x02);
    compressed.extend_from_slice(&x_only);
    let public = PublicKey::from_slice(&compressed)
        .map_err(|error| Nip04Error::InvalidPublicKey(error.to_string()))?;

    let point = ecdh::shared_secret_point(&public, &secret);
    let mut key = [0_u8; 32];
    key.copy_from_slice(&point[..32]);
    Ok(key)
}
