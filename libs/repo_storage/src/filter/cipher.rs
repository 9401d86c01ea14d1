//! Encryption filters: AES-256-GCM over length-framed records.
//!
//! Stream ciphers with authentication need framing: plaintext is chopped
//! into records, each encrypted with a fresh random nonce and written as
//! `len (u32 BE) | nonce (12) | ciphertext+tag`. Decryption re-parses the
//! frames, so any truncation or bit flip fails authentication instead of
//! yielding garbage.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Context;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{FilterBuffer, FilterState, StreamFilter};

/// Plaintext bytes per encrypted record.
const RECORD_SIZE: usize = 64 * 1024;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherType {
    #[default]
    None,
    Aes256Gcm,
}

impl std::str::FromStr for CipherType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CipherType::None),
            "aes-256-gcm" => Ok(CipherType::Aes256Gcm),
            _ => anyhow::bail!("unknown cipher type '{s}'"),
        }
    }
}

/// A repository cipher key. Constructed from the 64-hex-char option value;
/// never printed.
#[derive(Clone)]
pub struct CipherKey([u8; 32]);

impl CipherKey {
    pub fn from_hex(hex_key: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(hex_key).context("cipher key is not valid hex")?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("cipher key must be exactly 32 bytes"))?;
        Ok(CipherKey(bytes))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&self.0).expect("key length is fixed at 32 bytes")
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey([redacted])")
    }
}

/// Shared pending-buffer emission, same shape as the codec filters.
struct Framed {
    pending: Vec<u8>,
    pending_off: usize,
}

impl Framed {
    fn new() -> Self {
        Framed {
            pending: Vec::new(),
            pending_off: 0,
        }
    }

    fn emit(&mut self, out: &mut FilterBuffer) -> bool {
        let written = out.push(&self.pending[self.pending_off..]);
        self.pending_off += written;
        if self.pending_off == self.pending.len() {
            self.pending.clear();
            self.pending_off = 0;
            true
        } else {
            false
        }
    }
}

pub struct EncryptFilter {
    cipher: Aes256Gcm,
    record: Vec<u8>,
    framed: Framed,
    input_consumed: bool,
    flushed: bool,
}

impl EncryptFilter {
    pub fn new(key: &CipherKey) -> Box<dyn StreamFilter> {
        Box::new(EncryptFilter {
            cipher: key.cipher(),
            record: Vec::with_capacity(RECORD_SIZE),
            framed: Framed::new(),
            input_consumed: false,
            flushed: false,
        })
    }

    fn seal_record(&mut self) -> anyhow::Result<()> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, self.record.as_slice())
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;
        self.record.clear();

        let frame_len = (NONCE_SIZE + ciphertext.len()) as u32;
        self.framed.pending.extend_from_slice(&frame_len.to_be_bytes());
        self.framed.pending.extend_from_slice(&nonce_bytes);
        self.framed.pending.extend_from_slice(&ciphertext);
        Ok(())
    }
}

impl StreamFilter for EncryptFilter {
    fn name(&self) -> &'static str {
        "encrypt"
    }

    fn run(&mut self, input: Option<&[u8]>, out: &mut FilterBuffer) -> anyhow::Result<FilterState> {
        match input {
            Some(input) => {
                if !self.input_consumed {
                    let mut rest = input;
                    while !rest.is_empty() {
                        let take = rest.len().min(RECORD_SIZE - self.record.len());
                        self.record.extend_from_slice(&rest[..take]);
                        rest = &rest[take..];
                        if self.record.len() == RECORD_SIZE {
                            self.seal_record()?;
                        }
                    }
                    self.input_consumed = true;
                }
                if self.framed.emit(out) {
                    self.input_consumed = false;
                    Ok(FilterState::Continue)
                } else {
                    Ok(FilterState::InputSame)
                }
            }
            None => {
                if !self.flushed {
                    if !self.record.is_empty() {
                        self.seal_record()?;
                    }
                    self.flushed = true;
                }
                if self.framed.emit(out) {
                    Ok(FilterState::Done)
                } else {
                    Ok(FilterState::Continue)
                }
            }
        }
    }
}

pub struct DecryptFilter {
    cipher: Aes256Gcm,
    buffered: Vec<u8>,
    framed: Framed,
    input_consumed: bool,
    flushed: bool,
}

impl DecryptFilter {
    pub fn new(key: &CipherKey) -> Box<dyn StreamFilter> {
        Box::new(DecryptFilter {
            cipher: key.cipher(),
            buffered: Vec::new(),
            framed: Framed::new(),
            input_consumed: false,
            flushed: false,
        })
    }

    /// Decrypt every complete frame in `buffered`.
    fn open_frames(&mut self) -> anyhow::Result<()> {
        loop {
            if self.buffered.len() < 4 {
                return Ok(());
            }
            let frame_len =
                u32::from_be_bytes(self.buffered[..4].try_into().unwrap()) as usize;
            anyhow::ensure!(
                frame_len >= NONCE_SIZE + TAG_SIZE,
                "corrupt encryption frame of {frame_len} byte(s)"
            );
            if self.buffered.len() < 4 + frame_len {
                return Ok(());
            }

            let frame: Vec<u8> = self.buffered.drain(..4 + frame_len).skip(4).collect();
            let (nonce_bytes, ciphertext) = frame.split_at(NONCE_SIZE);
            let plaintext = self
                .cipher
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| anyhow::anyhow!("decryption failed, wrong key or corrupt data"))?;
            self.framed.pending.extend_from_slice(&plaintext);
        }
    }
}

impl StreamFilter for DecryptFilter {
    fn name(&self) -> &'static str {
        "decrypt"
    }

    fn run(&mut self, input: Option<&[u8]>, out: &mut FilterBuffer) -> anyhow::Result<FilterState> {
        match input {
            Some(input) => {
                if !self.input_consumed {
                    self.buffered.extend_from_slice(input);
                    self.open_frames()?;
                    self.input_consumed = true;
                }
                if self.framed.emit(out) {
                    self.input_consumed = false;
                    Ok(FilterState::Continue)
                } else {
                    Ok(FilterState::InputSame)
                }
            }
            None => {
                if !self.flushed {
                    anyhow::ensure!(
                        self.buffered.is_empty(),
                        "encrypted stream ends with {} byte(s) of an incomplete frame",
                        self.buffered.len()
                    );
                    self.flushed = true;
                }
                if self.framed.emit(out) {
                    Ok(FilterState::Done)
                } else {
                    Ok(FilterState::Continue)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterPipeline;

    fn key() -> CipherKey {
        CipherKey::from_hex(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let payload = b"sensitive cluster bytes".repeat(9000);

        let mut encrypt = FilterPipeline::new(vec![EncryptFilter::new(&key())]);
        let ciphertext = encrypt.process(&payload).unwrap();
        assert_ne!(ciphertext, payload);

        let mut decrypt = FilterPipeline::with_buffer_size(vec![DecryptFilter::new(&key())], 1000);
        assert_eq!(decrypt.process(&ciphertext).unwrap(), payload);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let mut encrypt = FilterPipeline::new(vec![EncryptFilter::new(&key())]);
        let ciphertext = encrypt.process(b"payload").unwrap();

        let other = CipherKey::from_hex(&"cd".repeat(32)).unwrap();
        let mut decrypt = FilterPipeline::new(vec![DecryptFilter::new(&other)]);
        assert!(decrypt.process(&ciphertext).is_err());
    }

    #[test]
    fn corruption_fails_closed() {
        let mut encrypt = FilterPipeline::new(vec![EncryptFilter::new(&key())]);
        let mut ciphertext = encrypt.process(b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;

        let mut decrypt = FilterPipeline::new(vec![DecryptFilter::new(&key())]);
        assert!(decrypt.process(&ciphertext).is_err());
    }

    #[test]
    fn truncation_fails_closed() {
        let mut encrypt = FilterPipeline::new(vec![EncryptFilter::new(&key())]);
        let ciphertext = encrypt.process(b"payload").unwrap();

        let mut decrypt = FilterPipeline::new(vec![DecryptFilter::new(&key())]);
        assert!(decrypt.process(&ciphertext[..ciphertext.len() - 3]).is_err());
    }

    #[test]
    fn key_parsing() {
        assert!(CipherKey::from_hex("zz").is_err());
        assert!(CipherKey::from_hex("abcd").is_err());
        CipherKey::from_hex(&"00".repeat(32)).unwrap();
    }
}
