//! Key exchange algorithms.
//!
//! A [`Kex`] implements the mathematics of one key exchange method; the transport drives it by
//! feeding it the peer's packets and draining the packets it wants to send. Once both flights are
//! in, [`Kex::finish`] produces the shared secret and the exchange hash.
//!
//! # Supported algorithms
//!
//! - "curve25519-sha256" ([`CURVE25519_SHA256`])
//! - "curve25519-sha256@libssh.org" ([`CURVE25519_SHA256_LIBSSH`])
use bytes::Bytes;
use num_bigint_dig::BigUint;
use crate::Result;
use crate::codec::PacketDecode;
pub use self::curve25519::{CURVE25519_SHA256, CURVE25519_SHA256_LIBSSH};

mod curve25519;

/// Algorithm for key exchange.
///
/// See the [module documentation][self] for details.
pub struct KexAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    pub(crate) make_kex: fn() -> Result<Box<dyn Kex + Send>>,
}

/// Data that enters the exchange hash.
#[derive(Debug)]
pub(crate) struct KexInput<'a> {
    pub client_ident: &'a [u8],
    pub server_ident: &'a [u8],
    pub client_kex_init: &'a [u8],
    pub server_kex_init: &'a [u8],
}

pub(crate) struct KexOutput {
    pub shared_secret: BigUint,
    pub exchange_hash: Vec<u8>,
    pub server_pubkey: Bytes,
    pub server_exchange_hash_sign: Bytes,
}

pub(crate) trait Kex {
    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()>;
    fn send_packet(&mut self) -> Result<Option<Bytes>>;
    fn is_exchanged(&self) -> bool;
    fn finish(&mut self, input: KexInput) -> Result<KexOutput>;
    fn compute_hash(&self, data: &[u8]) -> Vec<u8>;
}
