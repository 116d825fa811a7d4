//! Payload compression algorithms.
//!
//! Compression applies to the packet payload only (RFC 4253, section 6.2) and keeps a single
//! deflate stream per direction for the lifetime of the keys, flushed at every packet boundary.
//!
//! # Supported algorithms
//!
//! - "none" ([`NONE`])
//! - "zlib" ([`ZLIB`])
//! - "zlib@openssh.com" ([`ZLIB_OPENSSH`], compression starts only after authentication)
use crate::Result;
pub use self::zlib::{ZLIB, ZLIB_OPENSSH};

mod zlib;

/// Algorithm for payload compression.
///
/// See the [module documentation][self] for details.
pub struct CompressAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    /// Delayed algorithms stay dormant until the transport learns that the user authenticated.
    pub(crate) delayed: bool,
    pub(crate) make_compress: fn() -> Box<dyn Compress + Send>,
    pub(crate) make_decompress: fn() -> Box<dyn Decompress + Send>,
}

impl CompressAlgo {
    pub(crate) fn is_none(&self) -> bool {
        self.name == "none"
    }
}

pub(crate) trait Compress {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

pub(crate) trait Decompress {
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

/// "none" compression (payloads pass through untouched).
pub static NONE: CompressAlgo = CompressAlgo {
    name: "none",
    delayed: false,
    make_compress: || Box::new(Identity),
    make_decompress: || Box::new(Identity),
};

struct Identity;

impl Compress for Identity {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

impl Decompress for Identity {
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
