//! Passphrase encryption of bundle files.
//!
//! Layout (integers little-endian):
//!
//! ```text
//! +-------+---------+-----+-----------+-----------+---------------------------+
//! | MSYN  | version | kdf | salt (16) | nonce(12) | ciphertext || tag (16)    |
//! +-------+---------+-----+-----------+-----------+---------------------------+
//! ```
//!
//! The 40-byte header is authenticated as associated data, so a flipped
//! header byte fails like a wrong passphrase would.

use crate::{error::Result, Error};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

pub const MAGIC: &[u8; 4] = b"MSYN";

/// Binary format version
pub const FORMAT_VERSION: u32 = 1;

/// KDF id for PBKDF2-HMAC-SHA256
pub const KDF_PBKDF2_SHA256: u32 = 0;

pub const PBKDF2_ROUNDS: u32 = 600_000;

pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;
pub const HEADER_SIZE: usize = 4 + 4 + 4 + SALT_SIZE + NONCE_SIZE;

/// The cleartext header of an encrypted bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub kdf: u32,
    pub salt: [u8; SALT_SIZE],
    pub nonce: [u8; NONCE_SIZE],
}

impl Header {
    pub fn new(salt: [u8; SALT_SIZE], nonce: [u8; NONCE_SIZE]) -> Self {
        Self {
            version: FORMAT_VERSION,
            kdf: KDF_PBKDF2_SHA256,
            salt,
            nonce,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(MAGIC);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.kdf.to_le_bytes());
        out[12..28].copy_from_slice(&self.salt);
        out[28..40].copy_from_slice(&self.nonce);
        out
    }

    /// Parse and check the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE + TAG_SIZE {
            return Err(Error::InvalidBundle("file is truncated".into()));
        }
        if &data[0..4] != MAGIC {
            return Err(Error::InvalidBundle("not an msync bundle".into()));
        }

        let version = read_u32(&data[4..8]);
        if version != FORMAT_VERSION {
            return Err(Error::InvalidBundle(format!(
                "unsupported bundle version {version}"
            )));
        }
        let kdf = read_u32(&data[8..12]);
        if kdf != KDF_PBKDF2_SHA256 {
            return Err(Error::InvalidBundle(format!("unknown key derivation {kdf}")));
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&data[12..28]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[28..40]);
        Ok(Self {
            version,
            kdf,
            salt,
            nonce,
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// Stretch a passphrase into a cipher key.
pub fn derive_key(passphrase: &str, salt: &[u8; SALT_SIZE]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt with a fresh random salt and nonce.
pub fn seal(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);
    seal_with(plaintext, passphrase, salt, nonce)
}

/// Encrypt with a given salt and nonce. Deterministic.
pub fn seal_with(
    plaintext: &[u8],
    passphrase: &str,
    salt: [u8; SALT_SIZE],
    nonce: [u8; NONCE_SIZE],
) -> Result<Vec<u8>> {
    if passphrase.is_empty() {
        return Err(Error::Encryption("passphrase must not be empty".into()));
    }

    let header = Header::new(salt, nonce).to_bytes();
    let cipher = cipher(passphrase, &salt)?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &header,
            },
        )
        .map_err(|_| Error::Encryption("cipher rejected the input".into()))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a sealed file.
///
/// Structural problems are `InvalidBundle`; a failed authentication tag is
/// `IncorrectPassphrase`.
pub fn open(data: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let header = Header::parse(data)?;
    let cipher = cipher(passphrase, &header.salt)?;
    cipher
        .decrypt(
            Nonce::from_slice(&header.nonce),
            Payload {
                msg: &data[HEADER_SIZE..],
                aad: &data[..HEADER_SIZE],
            },
        )
        .map_err(|_| Error::IncorrectPassphrase)
}

fn cipher(passphrase: &str, salt: &[u8; SALT_SIZE]) -> Result<ChaCha20Poly1305> {
    let key = derive_key(passphrase, salt);
    ChaCha20Poly1305::new_from_slice(&key).map_err(|e| Error::Encryption(e.to_string()))
}
