//! Message and beacon sealing.
//!
//! Every message is sealed with ChaCha20-Poly1305 under its own key. The key
//! is cut from a ChaCha20 keystream produced with the shared secret and a
//! nonce digested from the message id, the full timestamp and the associated
//! data; the id's top bits select where in the 64-byte block the 32-byte key
//! starts. A frame whose plaintext header changes therefore gets a fresh
//! key, so one Poly1305 key never signs two different messages.

use crate::error::Result;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use sha2::{Digest, Sha256};

pub const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const KEYSTREAM_LEN: usize = 64;

/// The shared long-term secret (a SHA-256 digest of the configured phrase).
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; KEY_LEN]);

impl Secret {
    pub fn from_phrase(phrase: &str) -> Self {
        Self(Sha256::digest(phrase.as_bytes()).into())
    }

    /// A random secret. Only processes forked after it was created share it.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Short hex id for logs; never reveals the secret.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..4])
    }

    fn message_key(&self, id: u64, timestamp: u64, aad: &[u8]) -> Result<LessSafeKey> {
        let digest = Sha256::new()
            .chain_update(id.to_le_bytes())
            .chain_update(timestamp.to_le_bytes())
            .chain_update(aad)
            .finalize();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);

        // Sealing zeros yields the raw keystream.
        let stream_key = LessSafeKey::new(UnboundKey::new(&CHACHA20_POLY1305, &self.0)?);
        let mut block = [0u8; KEYSTREAM_LEN];
        let _tag = stream_key.seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::empty(),
            &mut block,
        )?;

        let offset = ((id >> 56) & 31) as usize;
        let key = &block[offset..offset + KEY_LEN];
        Ok(LessSafeKey::new(UnboundKey::new(&CHACHA20_POLY1305, key)?))
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret({})", self.fingerprint())
    }
}

fn aead_nonce(id: u64, timestamp: u64) -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&(timestamp as u32).to_le_bytes());
    nonce[4..].copy_from_slice(&id.to_le_bytes());
    Nonce::assume_unique_for_key(nonce)
}

/// Encrypt `data` in place and return the tag.
pub(crate) fn seal(
    secret: &Secret,
    id: u64,
    timestamp: u64,
    aad: &[u8],
    data: &mut [u8],
) -> Result<[u8; TAG_LEN]> {
    let key = secret.message_key(id, timestamp, aad)?;
    let tag = key.seal_in_place_separate_tag(aead_nonce(id, timestamp), Aad::from(aad), data)?;
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(tag.as_ref());
    Ok(out)
}

/// Decrypt `sealed` (ciphertext followed by the tag) in place.
pub(crate) fn open(
    secret: &Secret,
    id: u64,
    timestamp: u64,
    aad: &[u8],
    sealed: &mut [u8],
) -> Result<()> {
    let key = secret.message_key(id, timestamp, aad)?;
    key.open_in_place(aead_nonce(id, timestamp), Aad::from(aad), sealed)?;
    Ok(())
}
