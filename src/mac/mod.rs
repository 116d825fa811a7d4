//! Message authentication algorithms.
//!
//! Every non-AEAD packet carries a MAC computed over the packet sequence number and the plaintext,
//! which protects integrity and binds the packet to its position in the stream.
//!
//! # Supported algorithms
//!
//! - "hmac-sha2-256" ([`HMAC_SHA2_256`])
//! - "hmac-sha2-512" ([`HMAC_SHA2_512`])
//! - "none" ([`NONE`])
use crate::Result;
pub use self::hmac::{HMAC_SHA2_256, HMAC_SHA2_512};
pub use self::none::{Empty, NONE};

mod none;
mod hmac;

/// Algorithm for message authentication.
///
/// See the [module documentation][self] for details.
pub struct MacAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    pub(crate) tag_len: usize,
    pub(crate) key_len: usize,
    pub(crate) make_mac: fn(key: &[u8]) -> Box<dyn Mac + Send>,
}

pub(crate) trait Mac {
    fn sign(&mut self, packet_seq: u32, plaintext: &[u8], tag: &mut [u8]);
    fn verify(&mut self, packet_seq: u32, plaintext: &[u8], tag: &[u8]) -> Result<MacVerified>;
}

/// Proof that a MAC was verified; only the [`Mac`] implementations can mint it.
#[derive(Debug)]
pub struct MacVerified(());

impl MacVerified {
    pub fn assertion() -> Self {
        Self(())
    }
}
