use std::time::Duration;
use crate::cipher::{self, CipherAlgo};
use crate::comp::{self, CompressAlgo};
use crate::kex::{self, KexAlgo};
use crate::mac::{self, MacAlgo};
use crate::pubkey::{self, PubkeyAlgo};

/// Configuration of a [`Transport`][super::Transport].
///
/// The algorithm lists are in preference order and are offered for both directions; the first
/// entry that the server also supports is negotiated.
#[derive(Clone)]
pub struct TransportConfig {
    /// Software version sent in the identification string, without the "SSH-2.0-" prefix. Must
    /// consist of printable ASCII without whitespace.
    pub version: String,

    /// Key exchange algorithms.
    pub kex_algos: Vec<&'static KexAlgo>,

    /// Server host key algorithms.
    pub server_pubkey_algos: Vec<&'static PubkeyAlgo>,

    /// Encryption algorithms.
    pub cipher_algos: Vec<&'static CipherAlgo>,

    /// Message authentication algorithms.
    pub mac_algos: Vec<&'static MacAlgo>,

    /// Compression algorithms.
    pub comp_algos: Vec<&'static CompressAlgo>,

    /// Bound on waits for a protocol rendezvous (service accept, key exchange completion).
    pub timeout: Duration,

    /// When set, a keepalive task sends SSH_MSG_IGNORE whenever this much time passes without
    /// outbound traffic. `None` disables the keepalive.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            version: concat!("minato_", env!("CARGO_PKG_VERSION")).into(),
            kex_algos: vec![&kex::CURVE25519_SHA256, &kex::CURVE25519_SHA256_LIBSSH],
            server_pubkey_algos: vec![&pubkey::SSH_ED25519],
            cipher_algos: vec![&cipher::CHACHA20_POLY1305, &cipher::AES256_CTR, &cipher::AES128_CTR],
            mac_algos: vec![&mac::HMAC_SHA2_256, &mac::HMAC_SHA2_512],
            comp_algos: vec![&comp::NONE, &comp::ZLIB_OPENSSH],
            timeout: Duration::from_secs(30),
            heartbeat_interval: None,
        }
    }
}

impl TransportConfig {
    /// The full identification string, e.g. `"SSH-2.0-minato_0.1.0"`.
    pub(crate) fn ident(&self) -> String {
        format!("SSH-2.0-{}", self.version)
    }
}
