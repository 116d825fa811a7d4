use bytes::{BufMut as _, BytesMut};
use rand::{RngCore as _, SeedableRng as _};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use crate::{Error, Result};
use crate::cipher::{self, PacketEncrypt};
use crate::comp::Compress;
use crate::mac;

/// Assembles outbound binary packets (RFC 4253, section 6).
///
/// The encoder owns the outbound half of the connection's algorithm state: cipher, MAC,
/// compression and the packet sequence number. The key exchanger swaps the algorithm state with
/// [`new_keys`][Encoder::new_keys] immediately after SSH_MSG_NEWKEYS is queued, under the same
/// write-lock hold, so no packet straddles a key change.
pub(crate) struct Encoder {
    encrypt: PacketEncrypt,
    block_len: usize,
    tag_len: usize,
    compress: Option<CompressState>,
    packet_seq: u32,
    authed: Arc<AtomicBool>,
    padding_rng: ChaCha8Rng,
}

pub(crate) struct CompressState {
    pub compress: Box<dyn Compress + Send>,
    pub delayed: bool,
}

impl Encoder {
    pub fn new(authed: Arc<AtomicBool>) -> Result<Encoder> {
        let padding_rng = ChaCha8Rng::from_rng(rand::rngs::OsRng)
            .map_err(|_| Error::Random("could not generate seed for padding generator"))?;
        Ok(Encoder {
            encrypt: PacketEncrypt::EncryptAndMac(Box::new(cipher::Identity), Box::new(mac::Empty)),
            block_len: 8,
            tag_len: 0,
            compress: None,
            packet_seq: 0,
            authed,
            padding_rng,
        })
    }

    /// The sequence number that the next encoded packet will use.
    pub fn seq(&self) -> u32 {
        self.packet_seq
    }

    /// Frame, pad, MAC and encrypt `payload` into `out`, returning the sequence number the
    /// packet was assigned. The sequence number wraps modulo 2^32.
    pub fn encode(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<u32> {
        log::trace!("encoding packet {}, len {}, seq {}",
            payload.first().copied().unwrap_or(0), payload.len(), self.packet_seq);

        let compressed;
        let payload = match self.compress {
            Some(ref mut c) if !c.delayed || self.authed.load(Ordering::Relaxed) => {
                compressed = c.compress.compress(payload)?;
                &compressed[..]
            },
            _ => payload,
        };

        let padding_len = calculate_padding_len(payload.len(), self.block_len, self.encrypt.is_aead());

        // packet layout:
        // 4 bytes: `packet_len = 1 + payload_len + padding_len` (u32 big endian)
        // 1 byte: padding_len (u8)
        // `payload_len` bytes: payload
        // `padding_len` bytes: random padding
        // `tag_len` bytes: mac tag

        let packet_begin = out.len();
        out.reserve(5 + payload.len() + padding_len + self.tag_len);
        out.put_u32((1 + payload.len() + padding_len) as u32);
        out.put_u8(padding_len as u8);
        out.put_slice(payload);
        out.put_bytes(0, padding_len + self.tag_len);

        let packet = &mut out[packet_begin..];
        self.padding_rng.fill_bytes(&mut packet[5 + payload.len()..][..padding_len]);

        let (plaintext, tag) = packet.split_at_mut(5 + payload.len() + padding_len);
        match self.encrypt {
            PacketEncrypt::EncryptAndMac(ref mut encrypt, ref mut mac) => {
                mac.sign(self.packet_seq, plaintext, tag);
                encrypt.encrypt(plaintext);
            },
            PacketEncrypt::Aead(ref mut aead) => {
                aead.encrypt_and_sign(self.packet_seq as u64, plaintext, tag);
            },
        }

        let packet_seq = self.packet_seq;
        self.packet_seq = self.packet_seq.wrapping_add(1);
        Ok(packet_seq)
    }

    /// Replace the outbound algorithm state. Takes effect with the next encoded packet.
    pub fn new_keys(
        &mut self,
        encrypt: PacketEncrypt,
        block_len: usize,
        tag_len: usize,
        compress: Option<CompressState>,
    ) {
        self.encrypt = encrypt;
        self.block_len = block_len;
        self.tag_len = tag_len;
        self.compress = compress;
    }

    #[cfg(test)]
    pub fn set_seq(&mut self, packet_seq: u32) {
        self.packet_seq = packet_seq;
    }
}

fn calculate_padding_len(payload_len: usize, block_len: usize, is_aead: bool) -> usize {
    // RFC 4253, section 6: at least 4 bytes of padding, and the encrypted region must be a
    // multiple of the block length (the length field does not count for AEAD ciphers)
    let header_len = if is_aead { 1 } else { 5 };
    let min_padded_len = header_len + payload_len + 4;
    let padded_len = (min_padded_len + block_len - 1) / block_len * block_len;
    padded_len - payload_len - header_len
}
