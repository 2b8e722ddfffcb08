//! Authenticated encryption of session payloads at rest.
//!
//! A sealed payload is the JSON bundle `{"hash": <hex HMAC-SHA512>, "data": <plaintext>}`
//! encrypted with AES in counter mode and hex-encoded. With a random IV the
//! stored form is `<hex iv>:<hex ciphertext>`; in legacy mode it is the bare
//! hex ciphertext.
//!
//! # Legacy mode
//!
//! [`IvMode::Legacy`] derives both key and IV from the secret alone (OpenSSL
//! `EVP_BytesToKey` with MD5), so every payload sealed under one secret reuses
//! the same keystream. The random-IV mode normalizes the secret with a single
//! SHA-256 pass, which is not a password KDF either. Both behaviours exist to
//! read and write rows produced by existing deployments; prefer the random-IV
//! mode with a high-entropy secret.

use std::fmt;
use std::str::FromStr;

use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type HmacSha512 = Hmac<Sha512>;

/// Separator between the hex IV and the hex ciphertext.
const IV_DELIMITER: char = ':';

/// Default nonce length in bytes.
pub const DEFAULT_IV_LENGTH: usize = 16;

/// Symmetric cipher used to encrypt the integrity bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cipher {
    /// AES-128 in counter mode.
    Aes128Ctr,
    /// AES-192 in counter mode.
    Aes192Ctr,
    /// AES-256 in counter mode.
    #[default]
    Aes256Ctr,
}

impl Cipher {
    /// The OpenSSL-style name of the cipher.
    pub fn name(self) -> &'static str {
        match self {
            Cipher::Aes128Ctr => "aes-128-ctr",
            Cipher::Aes192Ctr => "aes-192-ctr",
            Cipher::Aes256Ctr => "aes-256-ctr",
        }
    }

    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Cipher::Aes128Ctr => 16,
            Cipher::Aes192Ctr => 24,
            Cipher::Aes256Ctr => 32,
        }
    }

    /// IV length in bytes.
    pub fn iv_len(self) -> usize {
        16
    }

    fn apply_keystream(self, key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
        match self {
            Cipher::Aes128Ctr => xor_keystream::<ctr::Ctr128BE<aes::Aes128>>(key, iv, buf),
            Cipher::Aes192Ctr => xor_keystream::<ctr::Ctr128BE<aes::Aes192>>(key, iv, buf),
            Cipher::Aes256Ctr => xor_keystream::<ctr::Ctr128BE<aes::Aes256>>(key, iv, buf),
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cipher {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-ctr" => Ok(Cipher::Aes128Ctr),
            "aes-192-ctr" => Ok(Cipher::Aes192Ctr),
            "aes-256-ctr" => Ok(Cipher::Aes256Ctr),
            other => Err(Error::configuration(format!(
                "unsupported cipher algorithm: {other}"
            ))),
        }
    }
}

fn xor_keystream<C: KeyIvInit + StreamCipher>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    let mut cipher = C::new_from_slices(key, iv)
        .map_err(|e| Error::integrity(format!("invalid key or iv length: {e}")))?;
    cipher.apply_keystream(buf);
    Ok(())
}

/// How the IV for each sealed payload is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvMode {
    /// A fresh random IV of the given length, stored in front of the ciphertext.
    Random(usize),
    /// Key and IV derived from the secret alone. Weak; see the module docs.
    Legacy,
}

impl Default for IvMode {
    fn default() -> Self {
        IvMode::Random(DEFAULT_IV_LENGTH)
    }
}

#[derive(Serialize, Deserialize)]
struct Bundle {
    hash: String,
    data: String,
}

/// Seals and opens session payloads under one secret.
#[derive(Clone)]
pub struct Envelope {
    secret: Vec<u8>,
    cipher: Cipher,
    mode: IvMode,
    key: Vec<u8>,
    // Only set in legacy mode.
    fixed_iv: Option<Vec<u8>>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("cipher", &self.cipher)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Envelope {
    /// Creates an envelope for `secret`.
    ///
    /// Fails with [`Error::Configuration`] when the secret is empty or when a
    /// random IV length does not match the cipher's IV size.
    pub fn new(secret: impl AsRef<[u8]>, cipher: Cipher, mode: IvMode) -> Result<Self> {
        let secret = secret.as_ref().to_vec();
        if secret.is_empty() {
            return Err(Error::configuration("secret must not be empty"));
        }

        let (key, fixed_iv) = match mode {
            IvMode::Random(len) => {
                if len != cipher.iv_len() {
                    return Err(Error::configuration(format!(
                        "{cipher} requires a {} byte iv, got ivlength {len}",
                        cipher.iv_len()
                    )));
                }
                let digest = Sha256::digest(&secret);
                (digest[..cipher.key_len()].to_vec(), None)
            }
            IvMode::Legacy => {
                let (key, iv) = evp_bytes_to_key(&secret, cipher.key_len(), cipher.iv_len());
                (key, Some(iv))
            }
        };

        Ok(Self {
            secret,
            cipher,
            mode,
            key,
            fixed_iv,
        })
    }

    /// The configured cipher.
    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    /// The configured IV mode.
    pub fn mode(&self) -> IvMode {
        self.mode
    }

    /// Seals `plaintext` into its stored representation.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let bundle = Bundle {
            hash: self.tag(plaintext)?,
            data: plaintext.to_owned(),
        };
        let mut buf = serde_json::to_vec(&bundle)?;

        match &self.fixed_iv {
            Some(iv) => {
                self.cipher.apply_keystream(&self.key, iv, &mut buf)?;
                Ok(hex::encode(buf))
            }
            None => {
                let mut iv = vec![0u8; self.cipher.iv_len()];
                rand::rngs::OsRng.fill_bytes(&mut iv);
                self.cipher.apply_keystream(&self.key, &iv, &mut buf)?;
                Ok(format!("{}{IV_DELIMITER}{}", hex::encode(iv), hex::encode(buf)))
            }
        }
    }

    /// Opens a sealed payload, returning the plaintext only if its tag verifies.
    pub fn open(&self, sealed: &str) -> Result<String> {
        let mut buf = match &self.fixed_iv {
            Some(iv) => {
                let mut buf = decode_hex(sealed, "ciphertext")?;
                self.cipher.apply_keystream(&self.key, iv, &mut buf)?;
                buf
            }
            None => {
                let (iv_hex, body_hex) = sealed
                    .split_once(IV_DELIMITER)
                    .ok_or_else(|| Error::integrity("missing iv delimiter"))?;
                let iv = decode_hex(iv_hex, "iv")?;
                if iv.len() != self.cipher.iv_len() {
                    return Err(Error::integrity(format!(
                        "iv is {} bytes, expected {}",
                        iv.len(),
                        self.cipher.iv_len()
                    )));
                }
                let mut buf = decode_hex(body_hex, "ciphertext")?;
                self.cipher.apply_keystream(&self.key, &iv, &mut buf)?;
                buf
            }
        };

        let bundle: Bundle = serde_json::from_slice(&buf)
            .map_err(|_| Error::integrity("sealed payload did not decrypt to a valid bundle"))?;
        buf.clear();

        let expected = self.tag(&bundle.data)?;
        let matches = expected.len() == bundle.hash.len()
            && bool::from(expected.as_bytes().ct_eq(bundle.hash.as_bytes()));
        if !matches {
            return Err(Error::integrity("hmac mismatch"));
        }

        Ok(bundle.data)
    }

    fn tag(&self, plaintext: &str) -> Result<String> {
        let mut mac = HmacSha512::new_from_slice(&self.secret)
            .map_err(|e| Error::configuration(format!("invalid hmac key: {e}")))?;
        mac.update(plaintext.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn decode_hex(input: &str, what: &str) -> Result<Vec<u8>> {
    hex::decode(input).map_err(|e| Error::integrity(format!("invalid {what} encoding: {e}")))
}

/// OpenSSL `EVP_BytesToKey` with MD5, no salt and a single iteration.
fn evp_bytes_to_key(secret: &[u8], key_len: usize, iv_len: usize) -> (Vec<u8>, Vec<u8>) {
    let mut derived = Vec::with_capacity(key_len + iv_len + 16);
    let mut block = Vec::new();
    while derived.len() < key_len + iv_len {
        let mut hasher = Md5::new();
        hasher.update(&block);
        hasher.update(secret);
        block = hasher.finalize().to_vec();
        derived.extend_from_slice(&block);
    }
    let iv = derived[key_len..key_len + iv_len].to_vec();
    derived.truncate(key_len);
    (derived, iv)
}
