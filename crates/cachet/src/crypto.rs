//! Hybrid public-key encryption of secret values
//!
//! Secrets stored in a config document are encrypted so that anyone may add
//! one (the public keyset lives in the document itself) but only holders of
//! the private keyset can read it back.
//!
//! The scheme is a conventional envelope: a fresh ephemeral X25519 keypair
//! per message, ECDH against the recipient key, HKDF-SHA256 to derive a
//! ChaCha20-Poly1305 key, and the optional caller-supplied context bytes
//! bound as associated data. The wire form is
//! `ephemeral public key (32) || nonce (12) || AEAD ciphertext`.
//!
//! Keysets are JSON documents. The public keyset is embedded in the config
//! file (base64, heredoc-wrapped); the private keyset is handed to the
//! process through the `PRIVATE_JSON_KEYSET_<NAME>` environment variable,
//! base64 encoded. Decryption failures are reported without detail so the
//! error channel cannot be used as an oracle.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

const ALGORITHM: &str = "X25519_HKDF_SHA256_CHACHA20_POLY1305";
const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("cannot parse keyset")]
    InvalidKeyset(#[from] serde_json::Error),
    #[error("keyset algorithm {0:?} is not supported")]
    UnsupportedAlgorithm(String),
    #[error("keyset holds invalid key material")]
    InvalidKeyMaterial,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Public half of a keypair, safe to embed in a config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyset {
    pub key_id: u32,
    pub algorithm: String,
    /// base64 of the raw X25519 public key
    pub public_key: String,
}

/// Private half of a keypair, supplied through the environment only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateKeyset {
    pub key_id: u32,
    pub algorithm: String,
    pub public_key: String,
    /// base64 of the raw X25519 secret scalar
    pub private_key: String,
}

/// Generate a fresh keypair as a pair of JSON-encodable keysets.
pub fn generate_keyset() -> (PublicKeyset, PrivateKeyset) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let key_id = OsRng.next_u32();

    let public_keyset = PublicKeyset {
        key_id,
        algorithm: ALGORITHM.to_string(),
        public_key: BASE64.encode(public.as_bytes()),
    };
    let private_keyset = PrivateKeyset {
        key_id,
        algorithm: ALGORITHM.to_string(),
        public_key: public_keyset.public_key.clone(),
        private_key: BASE64.encode(secret.to_bytes()),
    };

    (public_keyset, private_keyset)
}

fn key_bytes(encoded: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::InvalidKeyMaterial)?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyMaterial)
}

fn derive_aead_key(
    shared_secret: &[u8],
    ephemeral_public: &[u8],
    recipient_public: &[u8],
) -> Result<[u8; 32], CryptoError> {
    let mut salt = Vec::with_capacity(EPHEMERAL_LEN * 2);
    salt.extend_from_slice(ephemeral_public);
    salt.extend_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(ALGORITHM.as_bytes(), &mut key)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(key)
}

/// Encrypts under a public keyset parsed from JSON.
#[derive(Debug)]
pub struct Encryptor {
    recipient: PublicKey,
}

impl Encryptor {
    pub fn new(public_json_keyset: &str) -> Result<Self, CryptoError> {
        let keyset: PublicKeyset = serde_json::from_str(public_json_keyset)?;
        if keyset.algorithm != ALGORITHM {
            return Err(CryptoError::UnsupportedAlgorithm(keyset.algorithm));
        }
        Ok(Self {
            recipient: PublicKey::from(key_bytes(&keyset.public_key)?),
        })
    }

    /// Encrypt `plaintext`, binding the optional `context` bytes.
    ///
    /// The same context must be presented on decryption; it is
    /// integrity-protected but not secret.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.recipient);

        let key = derive_aead_key(
            shared.as_bytes(),
            ephemeral_public.as_bytes(),
            self.recipient.as_bytes(),
        )?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: context.unwrap_or_default(),
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

/// Decrypts under a private keyset parsed from JSON.
pub struct Decryptor {
    secret: StaticSecret,
}

impl Decryptor {
    pub fn new(private_json_keyset: &str) -> Result<Self, CryptoError> {
        let keyset: PrivateKeyset = serde_json::from_str(private_json_keyset)?;
        if keyset.algorithm != ALGORITHM {
            return Err(CryptoError::UnsupportedAlgorithm(keyset.algorithm));
        }
        Ok(Self {
            secret: StaticSecret::from(key_bytes(&keyset.private_key)?),
        })
    }

    /// Decrypt a buffer produced by [Encryptor::encrypt].
    ///
    /// Every failure mode collapses into [CryptoError::DecryptionFailed];
    /// the caller learns that decryption failed, never why.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < EPHEMERAL_LEN + NONCE_LEN {
            return Err(CryptoError::DecryptionFailed);
        }

        let (ephemeral_public_bytes, rest) = ciphertext.split_at(EPHEMERAL_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let ephemeral_public: [u8; 32] = ephemeral_public_bytes
            .try_into()
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let ephemeral_public = PublicKey::from(ephemeral_public);
        let recipient_public = PublicKey::from(&self.secret);
        let shared = self.secret.diffie_hellman(&ephemeral_public);

        let key = derive_aead_key(
            shared.as_bytes(),
            ephemeral_public.as_bytes(),
            recipient_public.as_bytes(),
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: context.unwrap_or_default(),
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
