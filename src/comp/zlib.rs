use flate2::{Compression, FlushCompress, FlushDecompress, Status};
use crate::error::{Error, Result};
use super::{CompressAlgo, Compress, Decompress};

/// "zlib" compression from RFC 4253, active from the first packet after NEWKEYS.
pub static ZLIB: CompressAlgo = CompressAlgo {
    name: "zlib",
    delayed: false,
    make_compress: || Box::new(ZlibCompress::new()),
    make_decompress: || Box::new(ZlibDecompress::new()),
};

/// "zlib@openssh.com" compression as introduced by OpenSSH.
///
/// Negotiated like "zlib", but both sides keep sending uncompressed payloads until the client has
/// authenticated.
pub static ZLIB_OPENSSH: CompressAlgo = CompressAlgo {
    name: "zlib@openssh.com",
    delayed: true,
    make_compress: || Box::new(ZlibCompress::new()),
    make_decompress: || Box::new(ZlibDecompress::new()),
};

struct ZlibCompress {
    stream: flate2::Compress,
}

impl ZlibCompress {
    fn new() -> ZlibCompress {
        ZlibCompress { stream: flate2::Compress::new(Compression::default(), true) }
    }
}

impl Compress for ZlibCompress {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut consumed = 0;
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let in_before = self.stream.total_in();
            let status = self.stream
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Partial)
                .map_err(|_| Error::Compress("could not deflate payload"))?;
            consumed += (self.stream.total_in() - in_before) as usize;

            match status {
                Status::StreamEnd => return Err(Error::Compress("deflate stream unexpectedly ended")),
                Status::Ok | Status::BufError => {
                    // the flush is complete once all input is consumed and the output buffer
                    // did not run full
                    if consumed == data.len() && out.len() < out.capacity() {
                        return Ok(out)
                    }
                },
            }
        }
    }
}

struct ZlibDecompress {
    stream: flate2::Decompress,
}

impl ZlibDecompress {
    fn new() -> ZlibDecompress {
        ZlibDecompress { stream: flate2::Decompress::new(true) }
    }
}

impl Decompress for ZlibDecompress {
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        let mut consumed = 0;
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let in_before = self.stream.total_in();
            let status = self.stream
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::None)
                .map_err(|_| Error::Compress("could not inflate payload"))?;
            consumed += (self.stream.total_in() - in_before) as usize;

            match status {
                Status::StreamEnd => return Err(Error::Compress("inflate stream unexpectedly ended")),
                Status::Ok | Status::BufError => {
                    if consumed == data.len() && out.len() < out.capacity() {
                        return Ok(out)
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_across_packets() {
        let mut c = ZlibCompress::new();
        let mut d = ZlibDecompress::new();

        // the deflate stream spans packets, so packets must be decompressed in order
        for payload in [&b"hello world"[..], &b""[..], &[0x55; 4000][..], &b"goodbye"[..]] {
            let compressed = c.compress(payload).unwrap();
            let decompressed = d.decompress(&compressed).unwrap();
            assert_eq!(decompressed.as_slice(), payload);
        }
    }

    #[test]
    fn test_compressible_payload_shrinks() {
        let mut c = ZlibCompress::new();
        let compressed = c.compress(&[0x11; 32 * 1024]).unwrap();
        assert!(compressed.len() < 1024);
    }

    #[test]
    fn test_garbage_fails() {
        let mut d = ZlibDecompress::new();
        assert!(d.decompress(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]).is_err());
    }
}
