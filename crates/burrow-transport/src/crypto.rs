//! Shared-secret stream ciphers for the `encryptor` protocol.
//!
//! Wire compatibility with OpenSSL EVP: the key is derived with
//! `EVP_BytesToKey` (MD5, one iteration, no salt), and the encrypting
//! side prefixes a random IV to its first encrypted payload. Method
//! names follow the OpenSSL spelling (`aes-256-cfb`, `aes-128-ctr`, …).

use aes::{Aes128, Aes192, Aes256};
use bytes::Bytes;
use cfb_mode::{BufDecryptor, BufEncryptor};
use cipher::{KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use rand::RngCore;

use crate::TransportError;

type Ctr<C> = ctr::Ctr128BE<C>;

/// Supported cipher methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aes-128-cfb" => Some(Method::Aes128Cfb),
            "aes-192-cfb" => Some(Method::Aes192Cfb),
            "aes-256-cfb" => Some(Method::Aes256Cfb),
            "aes-128-ctr" => Some(Method::Aes128Ctr),
            "aes-192-ctr" => Some(Method::Aes192Ctr),
            "aes-256-ctr" => Some(Method::Aes256Ctr),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Aes128Cfb => "aes-128-cfb",
            Method::Aes192Cfb => "aes-192-cfb",
            Method::Aes256Cfb => "aes-256-cfb",
            Method::Aes128Ctr => "aes-128-ctr",
            Method::Aes192Ctr => "aes-192-ctr",
            Method::Aes256Ctr => "aes-256-ctr",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            Method::Aes128Cfb | Method::Aes128Ctr => 16,
            Method::Aes192Cfb | Method::Aes192Ctr => 24,
            Method::Aes256Cfb | Method::Aes256Ctr => 32,
        }
    }

    pub fn iv_len(&self) -> usize {
        16
    }
}

/// `EVP_BytesToKey` with MD5, one iteration, no salt:
/// `D_1 = MD5(password)`, `D_i = MD5(D_{i-1} || password)`, key is the
/// concatenation truncated to the method's key length.
pub fn bytes_to_key(method: Method, password: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(method.key_len() + 15);
    let mut previous: Option<[u8; 16]> = None;
    while key.len() < method.key_len() {
        let mut hasher = Md5::new();
        if let Some(block) = &previous {
            hasher.update(block);
        }
        hasher.update(password.as_bytes());
        let block: [u8; 16] = hasher.finalize().into();
        key.extend_from_slice(&block);
        previous = Some(block);
    }
    key.truncate(method.key_len());
    key
}

enum CipherCtx {
    Aes128CfbEnc(BufEncryptor<Aes128>),
    Aes192CfbEnc(BufEncryptor<Aes192>),
    Aes256CfbEnc(BufEncryptor<Aes256>),
    Aes128CfbDec(BufDecryptor<Aes128>),
    Aes192CfbDec(BufDecryptor<Aes192>),
    Aes256CfbDec(BufDecryptor<Aes256>),
    Aes128Ctr(Ctr<Aes128>),
    Aes192Ctr(Ctr<Aes192>),
    Aes256Ctr(Ctr<Aes256>),
}

fn bad_init() -> TransportError {
    TransportError::Cipher("cipher key/iv length mismatch".into())
}

impl CipherCtx {
    fn encryptor(method: Method, key: &[u8], iv: &[u8]) -> Result<Self, TransportError> {
        let ctx = match method {
            Method::Aes128Cfb => {
                CipherCtx::Aes128CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(|_| bad_init())?)
            }
            Method::Aes192Cfb => {
                CipherCtx::Aes192CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(|_| bad_init())?)
            }
            Method::Aes256Cfb => {
                CipherCtx::Aes256CfbEnc(BufEncryptor::new_from_slices(key, iv).map_err(|_| bad_init())?)
            }
            _ => return Self::counter(method, key, iv),
        };
        Ok(ctx)
    }

    fn decryptor(method: Method, key: &[u8], iv: &[u8]) -> Result<Self, TransportError> {
        let ctx = match method {
            Method::Aes128Cfb => {
                CipherCtx::Aes128CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(|_| bad_init())?)
            }
            Method::Aes192Cfb => {
                CipherCtx::Aes192CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(|_| bad_init())?)
            }
            Method::Aes256Cfb => {
                CipherCtx::Aes256CfbDec(BufDecryptor::new_from_slices(key, iv).map_err(|_| bad_init())?)
            }
            _ => return Self::counter(method, key, iv),
        };
        Ok(ctx)
    }

    // CTR keystreams are direction-agnostic.
    fn counter(method: Method, key: &[u8], iv: &[u8]) -> Result<Self, TransportError> {
        let ctx = match method {
            Method::Aes128Ctr => {
                CipherCtx::Aes128Ctr(Ctr::new_from_slices(key, iv).map_err(|_| bad_init())?)
            }
            Method::Aes192Ctr => {
                CipherCtx::Aes192Ctr(Ctr::new_from_slices(key, iv).map_err(|_| bad_init())?)
            }
            Method::Aes256Ctr => {
                CipherCtx::Aes256Ctr(Ctr::new_from_slices(key, iv).map_err(|_| bad_init())?)
            }
            _ => return Err(bad_init()),
        };
        Ok(ctx)
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CipherCtx::Aes128CfbEnc(c) => c.encrypt(data),
            CipherCtx::Aes192CfbEnc(c) => c.encrypt(data),
            CipherCtx::Aes256CfbEnc(c) => c.encrypt(data),
            CipherCtx::Aes128CfbDec(c) => c.decrypt(data),
            CipherCtx::Aes192CfbDec(c) => c.decrypt(data),
            CipherCtx::Aes256CfbDec(c) => c.decrypt(data),
            CipherCtx::Aes128Ctr(c) => c.apply_keystream(data),
            CipherCtx::Aes192Ctr(c) => c.apply_keystream(data),
            CipherCtx::Aes256Ctr(c) => c.apply_keystream(data),
        }
    }
}

/// Encrypting direction of one transmission.
pub struct Encryptor {
    method: Method,
    key: Vec<u8>,
    ctx: Option<CipherCtx>,
}

impl Encryptor {
    pub fn new(method: Method, password: &str) -> Self {
        Self {
            method,
            key: bytes_to_key(method, password),
            ctx: None,
        }
    }

    /// Encrypt one frame payload. The first call generates the IV and
    /// prefixes it to the ciphertext.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Bytes, TransportError> {
        match &mut self.ctx {
            Some(ctx) => {
                let mut out = plaintext.to_vec();
                ctx.apply(&mut out);
                Ok(Bytes::from(out))
            }
            None => {
                let iv_len = self.method.iv_len();
                let mut iv = vec![0u8; iv_len];
                rand::thread_rng().fill_bytes(&mut iv);

                let mut ctx = CipherCtx::encryptor(self.method, &self.key, &iv)?;
                let mut out = Vec::with_capacity(iv_len + plaintext.len());
                out.extend_from_slice(&iv);
                out.extend_from_slice(plaintext);
                ctx.apply(&mut out[iv_len..]);
                self.ctx = Some(ctx);
                Ok(Bytes::from(out))
            }
        }
    }
}

/// Decrypting direction of one transmission.
pub struct Decryptor {
    method: Method,
    key: Vec<u8>,
    ctx: Option<CipherCtx>,
}

impl Decryptor {
    pub fn new(method: Method, password: &str) -> Self {
        Self {
            method,
            key: bytes_to_key(method, password),
            ctx: None,
        }
    }

    /// Decrypt one frame payload. The first call peels the peer's IV off
    /// the front.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Bytes, TransportError> {
        match &mut self.ctx {
            Some(ctx) => {
                let mut out = ciphertext.to_vec();
                ctx.apply(&mut out);
                Ok(Bytes::from(out))
            }
            None => {
                let iv_len = self.method.iv_len();
                if ciphertext.len() <= iv_len {
                    return Err(TransportError::Cipher(
                        "first encrypted payload shorter than the IV".into(),
                    ));
                }

                let (iv, rest) = ciphertext.split_at(iv_len);
                let mut ctx = CipherCtx::decryptor(self.method, &self.key, iv)?;
                let mut out = rest.to_vec();
                ctx.apply(&mut out);
                self.ctx = Some(ctx);
                Ok(Bytes::from(out))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_matches_openssl() {
        // openssl enc -aes-128-cfb -k secret -nosalt -P -md md5
        let key = bytes_to_key(Method::Aes128Cfb, "secret");
        assert_eq!(
            key,
            [
                0x5e, 0xbe, 0x22, 0x94, 0xec, 0xd0, 0xe0, 0xf0, 0x8e, 0xab, 0x76, 0x90, 0xd2,
                0xa6, 0xee, 0x69
            ]
        );

        // Longer keys chain the digest.
        let key = bytes_to_key(Method::Aes256Cfb, "secret");
        assert_eq!(key.len(), 32);
        assert_eq!(&key[..16], &bytes_to_key(Method::Aes128Cfb, "secret")[..]);
    }

    #[test]
    fn round_trip_with_iv_prefix() {
        for method in [Method::Aes128Cfb, Method::Aes256Cfb, Method::Aes128Ctr] {
            let mut enc = Encryptor::new(method, "secret");
            let mut dec = Decryptor::new(method, "secret");

            let first = enc.encrypt(b"hello tunnel").unwrap();
            assert_eq!(first.len(), method.iv_len() + 12);
            assert_eq!(&dec.decrypt(&first).unwrap()[..], b"hello tunnel");

            // Later payloads carry no IV.
            let second = enc.encrypt(b"again").unwrap();
            assert_eq!(second.len(), 5);
            assert_eq!(&dec.decrypt(&second).unwrap()[..], b"again");
        }
    }

    #[test]
    fn ciphertext_hides_plaintext() {
        let mut enc = Encryptor::new(Method::Aes256Cfb, "secret");
        let sealed = enc.encrypt(b"hello tunnel").unwrap();
        assert!(!sealed
            .windows(b"hello".len())
            .any(|window| window == b"hello"));
    }

    #[test]
    fn wrong_password_garbles() {
        let mut enc = Encryptor::new(Method::Aes128Cfb, "secret");
        let mut dec = Decryptor::new(Method::Aes128Cfb, "wrong");
        let sealed = enc.encrypt(b"hello tunnel").unwrap();
        assert_ne!(&dec.decrypt(&sealed).unwrap()[..], b"hello tunnel");
    }

    #[test]
    fn truncated_first_payload_is_rejected() {
        let mut dec = Decryptor::new(Method::Aes128Cfb, "secret");
        assert!(dec.decrypt(&[0u8; 16]).is_err());
    }

    #[test]
    fn unknown_method_names() {
        assert_eq!(Method::from_name("aes-256-cfb"), Some(Method::Aes256Cfb));
        assert_eq!(Method::from_name("rc4-md5"), None);
    }
}
