use bech32::{Bech32, Hrp};
use thiserror::Error;

use crate::nip01::{generate_secret_key, get_public_key};

const NSEC_HRP: &str = "nsec";
const NPUB_HRP: &str = "npub";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("bech32 error: {0}")]
    Bech32(String),
}

/// Secret key plus its x-only public key.
#[derive(Clone)]
pub struct Keypair {
    pub private_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

impl Keypair {
    pub fn generate() -> Self {
        let private_key = generate_secret_key();
        // A key produced by generate_secret_key is always in range.
        let public_key = get_public_key(&private_key).unwrap_or_default();
        Self {
            private_key,
            public_key,
        }
    }

    pub fn from_secret_key(private_key: [u8; 32]) -> Result<Self, KeyError> {
        let public_key = get_public_key(&private_key)
            .map_err(|error| KeyError::InvalidSecretKey(error.to_string()))?;
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Parse a secret key given either as 64 hex characters or as `nsec1...`.
    pub fn parse(secret: &str) -> Result<Self, KeyError> {
        let trimmed = secret.trim();
        let bytes = if trimmed.starts_with(NSEC_HRP) {
            decode_bech32(NSEC_HRP, trimmed)?
        } else {
            hex::decode(trimmed).map_err(|error| KeyError::InvalidSecretKey(error.to_string()))?
        };
        let private_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey("expected 32 bytes".to_string()))?;
        Self::from_secret_key(private_key)
    }

    pub fn npub(&self) -> Result<String, KeyError> {
        encode_bech32(NPUB_HRP, &self.public_key)
    }

    pub fn nsec(&self) -> Result<String, KeyError> {
        encode_bech32(NSEC_HRP, &self.private_key)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.private_key)
    }
}

fn encode_bech32(hrp: &str, data: &[u8; 32]) -> Result<String, KeyError> {
    let parsed_hrp = Hrp::parse(hrp).map_err(|error| KeyError::Bech32(error.to_string()))?;
    bech32::encode::<Bech32>(parsed_hrp, data).map_err(|error| KeyError::Bech32(error.to_string()))
}

fn decode_bech32(expected_hrp: &str, value: &str) -> Result<Vec<u8>, KeyError> {
    let (hrp, data) = bech32::decode(value).map_err(|error| KeyError::Bech32(error.to_string()))?;
    if hrp.as_str() != expected_hrp {
        return Err(KeyError::Bech32(format!(
            "expected {expected_hrp} prefix, got {}",
            hrp.as_str()
        )));
    }
    Ok(data)
}
