use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use crate::{Error, Result};
use crate::cipher::{self, PacketDecrypt};
use crate::comp::Decompress;
use crate::mac::{self, MacVerified};

/// The largest `packet_length` we accept, inclusive. The RFC minimum is far lower, but common
/// implementations negotiate larger packets; 256 KiB gives them headroom while still bounding a
/// bogus length field.
const PACKET_LEN_MAX: usize = 256 * 1024;

/// Identification lines longer than this many bytes are rejected.
const IDENT_LINE_MAX: usize = 256;

/// At most this many bytes of pre-identification header (MOTD lines) are tolerated.
const IDENT_HEADER_MAX: usize = 16 * 1024;

/// Streaming decoder of the inbound byte stream.
///
/// Bytes land in [`feed_buf`][Decoder::feed_buf]; [`consume_ident`][Decoder::consume_ident] and
/// then [`consume_packet`][Decoder::consume_packet] pull whole items out, returning `Ok(None)`
/// while more bytes are needed. Only the reader task touches the decoder, so the inbound key
/// switch is a plain method call between packets.
pub(crate) struct Decoder {
    buf: BytesMut,
    state: State,
    decrypt: PacketDecrypt,
    block_len: usize,
    tag_len: usize,
    decompress: Option<DecompressState>,
    packet_seq: u32,
    authed: Arc<AtomicBool>,
    ident_consumed: usize,
}

#[derive(Debug, Copy, Clone)]
enum State {
    /// Scanning identification lines; `pos` bytes of the current line have been scanned.
    Ident { pos: usize },
    /// Waiting for the first cipher block to learn the packet length.
    AwaitLength,
    /// Waiting for the rest of the packet and the MAC.
    AwaitRest { packet_len: usize },
}

pub(crate) struct DecompressState {
    pub decompress: Box<dyn Decompress + Send>,
    pub delayed: bool,
}

/// A decoded packet: the decompressed payload and the sequence number it arrived with.
#[derive(Debug)]
pub(crate) struct RecvPacket {
    pub payload: Bytes,
    pub packet_seq: u32,
}

impl Decoder {
    pub fn new(authed: Arc<AtomicBool>) -> Decoder {
        Decoder {
            buf: BytesMut::new(),
            state: State::Ident { pos: 0 },
            decrypt: PacketDecrypt::EncryptAndMac(Box::new(cipher::Identity), Box::new(mac::Empty)),
            block_len: 8,
            tag_len: 0,
            decompress: None,
            packet_seq: 0,
            authed,
            ident_consumed: 0,
        }
    }

    /// The buffer that inbound bytes should be appended to.
    pub fn feed_buf(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// The sequence number that the next inbound packet will be assigned.
    pub fn seq(&self) -> u32 {
        self.packet_seq
    }

    /// Scan for the server identification string (RFC 4253, section 4.2).
    ///
    /// Lines before the identification (MOTD) are skipped. Lines must be terminated by CRLF; a
    /// bare LF, an overlong line, or too much pre-identification data is a protocol error, and an
    /// identification other than SSH 2.0 or SSH 1.99 is a version error.
    pub fn consume_ident(&mut self) -> Result<Option<String>> {
        loop {
            let line = match self.consume_line()? {
                Some(line) => line,
                None => return Ok(None),
            };

            if line.starts_with(b"SSH-") {
                if !line.starts_with(b"SSH-2.0-") && !line.starts_with(b"SSH-1.99-") {
                    return Err(Error::ProtocolVersion(String::from_utf8_lossy(&line).into_owned()))
                }
                let ident = String::from_utf8(line.to_vec())
                    .map_err(|_| Error::Protocol("identification string is not valid utf-8"))?;
                self.state = State::AwaitLength;
                return Ok(Some(ident))
            }

            log::debug!("ignoring pre-identification line {:?}", String::from_utf8_lossy(&line));
        }
    }

    fn consume_line(&mut self) -> Result<Option<Bytes>> {
        let mut pos = match self.state {
            State::Ident { pos } => pos,
            _ => panic!("called consume_ident() after the identification was consumed"),
        };

        loop {
            if pos >= self.buf.len() {
                self.state = State::Ident { pos };
                return Ok(None)
            }

            match self.buf[pos] {
                b'\r' => {
                    if pos + 1 >= self.buf.len() {
                        self.state = State::Ident { pos };
                        return Ok(None)
                    }
                    if self.buf[pos + 1] != b'\n' {
                        return Err(Error::Protocol("identification line has bad line ending"))
                    }

                    let mut line = self.buf.split_to(pos + 2).freeze();
                    line.truncate(pos);

                    self.ident_consumed += pos + 2;
                    if self.ident_consumed > IDENT_HEADER_MAX {
                        return Err(Error::Protocol("too many header lines before identification"))
                    }

                    self.state = State::Ident { pos: 0 };
                    return Ok(Some(line))
                },
                b'\n' =>
                    return Err(Error::Protocol("identification line has bare line feed")),
                _ => {
                    pos += 1;
                    if pos > IDENT_LINE_MAX {
                        return Err(Error::Protocol("identification line is too long"))
                    }
                },
            }
        }
    }

    /// Try to pull one whole packet out of the buffered bytes.
    pub fn consume_packet(&mut self) -> Result<Option<RecvPacket>> {
        let packet_len = match self.state {
            State::AwaitLength => {
                let packet_len = match self.decrypt_packet_len()? {
                    Some(packet_len) => packet_len as usize,
                    None => return Ok(None),
                };

                if packet_len > PACKET_LEN_MAX {
                    return Err(Error::Protocol("invalid packet length (oversize)"));
                } else if packet_len < 1 {
                    return Err(Error::Protocol("invalid packet length (zero)"));
                }

                let aligned_len = if self.decrypt.is_aead() { packet_len } else { packet_len + 4 };
                if aligned_len % self.block_len != 0 {
                    return Err(Error::Protocol("invalid packet length (not aligned to cipher block length)"));
                }

                log::trace!("decrypted packet len {}", packet_len);
                self.state = State::AwaitRest { packet_len };
                packet_len
            },
            State::AwaitRest { packet_len } =>
                packet_len,
            State::Ident { .. } =>
                panic!("called consume_packet() before the identification was consumed"),
        };

        let total_packet_len = 4 + packet_len + self.tag_len;
        if self.buf.len() < total_packet_len {
            log::trace!("received only {} of {} bytes", self.buf.len(), total_packet_len);
            self.buf.reserve(total_packet_len - self.buf.len());
            return Ok(None)
        }

        let mut packet = self.buf.split_to(total_packet_len);
        let _verified: MacVerified = self.decrypt_packet_body(&mut packet, packet_len)?;

        let padding_len = packet[4] as usize;
        if packet_len < 1 + padding_len {
            return Err(Error::Protocol("invalid packet length (too short for given padding)"));
        }

        let payload_len = packet_len - padding_len - 1;
        let payload = packet.freeze().slice(5..(5 + payload_len));

        let payload = match self.decompress {
            Some(ref mut d) if !d.delayed || self.authed.load(Ordering::Relaxed) =>
                Bytes::from(d.decompress.decompress(&payload)?),
            _ => payload,
        };

        let packet_seq = self.packet_seq;
        self.packet_seq = self.packet_seq.wrapping_add(1);
        self.state = State::AwaitLength;
        Ok(Some(RecvPacket { payload, packet_seq }))
    }

    fn decrypt_packet_len(&mut self) -> Result<Option<u32>> {
        Ok(Some(match self.decrypt {
            PacketDecrypt::EncryptAndMac(ref mut decrypt, _) => {
                if self.buf.len() < self.block_len { return Ok(None) }
                decrypt.decrypt(&mut self.buf[..self.block_len]);
                u32::from_be_bytes(self.buf[..4].try_into().unwrap())
            },
            PacketDecrypt::Aead(ref mut aead) => {
                if self.buf.len() < 4 { return Ok(None) }
                let mut len_data = [0; 4];
                aead.decrypt_packet_len(self.packet_seq as u64, &self.buf[..4], &mut len_data);
                u32::from_be_bytes(len_data)
            },
        }))
    }

    fn decrypt_packet_body(&mut self, packet: &mut [u8], packet_len: usize) -> Result<MacVerified> {
        match self.decrypt {
            PacketDecrypt::EncryptAndMac(ref mut decrypt, ref mut mac) => {
                decrypt.decrypt(&mut packet[self.block_len..(4 + packet_len)]);

                let plaintext = &packet[..(4 + packet_len)];
                let tag = &packet[(4 + packet_len)..][..self.tag_len];
                mac.verify(self.packet_seq, plaintext, tag)
            },
            PacketDecrypt::Aead(ref mut aead) => {
                let (packet, tag) = packet.split_at_mut(4 + packet_len);
                aead.decrypt_and_verify(self.packet_seq as u64, packet, tag)
            },
        }
    }

    /// Enter the packet state directly, for tests that have no identification line.
    #[cfg(test)]
    pub fn skip_ident(&mut self) {
        self.state = State::AwaitLength;
    }

    /// Replace the inbound algorithm state. Takes effect with the next consumed packet.
    pub fn new_keys(
        &mut self,
        decrypt: PacketDecrypt,
        block_len: usize,
        tag_len: usize,
        decompress: Option<DecompressState>,
    ) {
        self.decrypt = decrypt;
        self.block_len = block_len;
        self.tag_len = tag_len;
        self.decompress = decompress;
    }
}
