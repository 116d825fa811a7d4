//! Server host key algorithms.
//!
//! During key exchange the server presents its host key and signs the exchange hash with it. The
//! transport decodes the key, asks the registered
//! [host key verifiers][crate::transport::HostKeyVerifier] whether to trust it, and checks the
//! signature.
//!
//! # Supported algorithms
//!
//! - "ssh-ed25519" ([`SSH_ED25519`], uses [`Ed25519Pubkey`])
use bytes::Bytes;
use derivative::Derivative;
use std::fmt;
use crate::codec::PacketDecode;
use crate::error::{Result, Error};
pub use self::ed25519::{SSH_ED25519, Ed25519Pubkey};

mod ed25519;

/// Algorithm for server host keys.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PubkeyAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    #[derivative(Debug = "ignore")]
    pub(crate) verify: fn(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified>,
}

/// Public key in one of the supported formats.
///
/// This enum is marked as `#[non_exhaustive]`, so we might add new variants without breaking
/// backwards compatibility.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Pubkey {
    /// Ed25519 public key.
    Ed25519(Ed25519Pubkey),
}

impl Pubkey {
    /// Decode a public key from the SSH wire encoding (RFC 4253, section 6.6).
    pub fn decode(blob: Bytes) -> Result<Pubkey> {
        let mut blob = PacketDecode::new(blob);
        let format = blob.get_string()?;
        match format.as_str() {
            "ssh-ed25519" => ed25519::decode_pubkey(&mut blob),
            _ => Err(Error::Decode("unknown public key format")),
        }
    }

    /// Name of the format of this key.
    pub fn format_name(&self) -> &'static str {
        match self {
            Pubkey::Ed25519(_) => "ssh-ed25519",
        }
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Pubkey::Ed25519(pubkey) => fmt::Display::fmt(pubkey, f),
        }
    }
}

/// Proof that a signature was verified; only the [`PubkeyAlgo`] implementations can mint it.
#[derive(Debug)]
pub struct SignatureVerified(());

impl SignatureVerified {
    fn assertion() -> Self {
        Self(())
    }
}
