//! Encryption and decryption algorithms.
//!
//! The SSH protocol encrypts packets with a symmetric cipher negotiated during key exchange; the
//! first algorithm on the client's list that the server also supports wins.
//!
//! # Supported algorithms
//!
//! - "chacha20-poly1305@openssh.com" ([`CHACHA20_POLY1305`])
//! - "aes128-ctr" ([`AES128_CTR`])
//! - "aes256-ctr" ([`AES256_CTR`])
//! - "none" ([`NONE`])
use derivative::Derivative;
use crate::Result;
use crate::mac::{Mac, MacVerified};
pub use self::chacha_poly::CHACHA20_POLY1305;
pub use self::none::NONE;
pub(crate) use self::none::Identity;
pub use self::stream::{AES128_CTR, AES256_CTR};

mod chacha_poly;
mod none;
mod stream;

/// Algorithm for encrypting and decrypting packets.
///
/// See the [module documentation][self] for details.
#[derive(Debug)]
pub struct CipherAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    pub(crate) block_len: usize,
    pub(crate) key_len: usize,
    pub(crate) iv_len: usize,
    pub(crate) variant: CipherAlgoVariant,
}

#[derive(Debug)]
pub(crate) enum CipherAlgoVariant {
    Standard(StandardCipherAlgo),
    Aead(AeadCipherAlgo),
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct StandardCipherAlgo {
    #[derivative(Debug = "ignore")]
    pub(crate) make_encrypt: fn(key: &[u8], iv: &[u8]) -> Box<dyn Encrypt + Send>,
    #[derivative(Debug = "ignore")]
    pub(crate) make_decrypt: fn(key: &[u8], iv: &[u8]) -> Box<dyn Decrypt + Send>,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct AeadCipherAlgo {
    pub(crate) tag_len: usize,
    #[derivative(Debug = "ignore")]
    pub(crate) make_encrypt: fn(key: &[u8], iv: &[u8]) -> Box<dyn AeadEncrypt + Send>,
    #[derivative(Debug = "ignore")]
    pub(crate) make_decrypt: fn(key: &[u8], iv: &[u8]) -> Box<dyn AeadDecrypt + Send>,
}

/// Outbound cipher state of a connection.
pub(crate) enum PacketEncrypt {
    EncryptAndMac(Box<dyn Encrypt + Send>, Box<dyn Mac + Send>),
    Aead(Box<dyn AeadEncrypt + Send>),
}

/// Inbound cipher state of a connection.
pub(crate) enum PacketDecrypt {
    EncryptAndMac(Box<dyn Decrypt + Send>, Box<dyn Mac + Send>),
    Aead(Box<dyn AeadDecrypt + Send>),
}

pub(crate) trait Encrypt {
    fn encrypt(&mut self, data: &mut [u8]);
}

pub(crate) trait Decrypt {
    fn decrypt(&mut self, data: &mut [u8]);
}

pub(crate) trait AeadEncrypt {
    fn encrypt_and_sign(&mut self, packet_seq: u64, packet: &mut [u8], tag: &mut [u8]);
}

pub(crate) trait AeadDecrypt {
    fn decrypt_packet_len(&mut self, packet_seq: u64, ciphertext: &[u8], plaintext: &mut [u8]);
    fn decrypt_and_verify(&mut self, packet_seq: u64, packet: &mut [u8], tag: &[u8]) -> Result<MacVerified>;
}

impl PacketEncrypt {
    pub fn is_aead(&self) -> bool {
        matches!(self, PacketEncrypt::Aead(_))
    }
}

impl PacketDecrypt {
    pub fn is_aead(&self) -> bool {
        matches!(self, PacketDecrypt::Aead(_))
    }
}
