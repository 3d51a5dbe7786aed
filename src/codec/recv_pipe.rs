use bytes::Bytes;
use crate::cipher::{self, Decrypt};
use crate::compress::Decompress;
use crate::error::{Error, Result};
use crate::mac::{self, Mac, MacAlgoVariant, MacVerified};
use super::Buffer;

/// Incremental decoder of the byte stream received from the peer.
///
/// Bytes are fed in chunks of any size with [`feed()`][Self::feed]; every call to
/// [`consume_packet()`][Self::consume_packet] then decodes at most one packet. The caller must
/// dispatch each packet before consuming the next one, because a packet (`SSH_MSG_NEWKEYS`) may
/// change the keys used to decode the packets that follow it.
pub(crate) struct RecvPipe {
    buf: Buffer,
    state: State,
    decrypt: Box<dyn Decrypt + Send>,
    mac: Box<dyn Mac + Send>,
    mac_variant: MacAlgoVariant,
    block_len: usize,
    tag_len: usize,
    decompress: Option<Box<dyn Decompress + Send>>,
    decompress_delayed: bool,
    packet_seq: u32,
    max_packet_len: usize,
    recv_bytes: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    AwaitingHeader,
    ScanningLine { pos: usize },
    AwaitingBody { packet_len: usize },
}

#[derive(Debug)]
pub(crate) struct RecvPacket {
    pub payload: Bytes,
    pub packet_seq: u32,
}

/// Keys and algorithms for one direction, installed after `SSH_MSG_NEWKEYS`.
pub(crate) struct DecryptKeys {
    pub decrypt: Box<dyn Decrypt + Send>,
    pub mac: Box<dyn Mac + Send>,
    pub mac_variant: MacAlgoVariant,
    pub block_len: usize,
    pub tag_len: usize,
}

impl RecvPipe {
    pub fn new(max_packet_len: usize) -> RecvPipe {
        RecvPipe {
            buf: Buffer::new(),
            state: State::AwaitingHeader,
            decrypt: Box::new(cipher::none::Identity),
            mac: Box::new(mac::none::Empty),
            mac_variant: MacAlgoVariant::EncryptAndMac,
            block_len: 8,
            tag_len: 0,
            decompress: None,
            decompress_delayed: false,
            packet_seq: 0,
            max_packet_len,
            recv_bytes: 0,
        }
    }

    /// Appends a chunk of received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        if self.buf.rpos() > 0 && self.state == State::AwaitingHeader {
            self.buf.compact();
        }
        self.buf.put_raw(data);
    }

    /// Minimal number of bytes that must be fed before the decoder can make progress.
    ///
    /// Returns 0 if a complete packet is already buffered.
    pub fn bytes_needed(&self) -> usize {
        let wanted = match self.state {
            State::ScanningLine { .. } => return 1,
            State::AwaitingHeader => self.header_len(),
            State::AwaitingBody { packet_len } => 4 + packet_len + self.tag_len,
        };
        wanted.saturating_sub(self.buf.available())
    }

    fn header_len(&self) -> usize {
        match self.mac_variant {
            MacAlgoVariant::EncryptAndMac => self.block_len,
            MacAlgoVariant::EncryptThenMac => 4,
        }
    }

    /// Decodes the identification line of the peer (RFC 4253, section 4.2).
    ///
    /// Lines that do not start with "SSH-" are skipped.
    pub fn consume_ident(&mut self) -> Result<Option<Bytes>> {
        loop {
            let line = match self.consume_line()? {
                Some(line) => line,
                None => return Ok(None),
            };

            if line.starts_with(b"SSH-") {
                if line.len() > 255 {
                    return Err(Error::Protocol("received identification string is too long"))
                }
                if !line.starts_with(b"SSH-2.0-") && !line.starts_with(b"SSH-1.99-") {
                    return Err(Error::Protocol("peer does not support protocol version 2.0"))
                }
                return Ok(Some(line));
            }
            log::debug!("skipping line before identification: {:?}", line);
        }
    }

    fn consume_line(&mut self) -> Result<Option<Bytes>> {
        let mut pos = match self.state {
            State::AwaitingHeader => 0,
            State::ScanningLine { pos } => pos,
            State::AwaitingBody { .. } =>
                return Err(Error::Protocol("identification line requested in the middle of a packet")),
        };

        let data = self.buf.unread();
        let mut line_len = None;
        while pos < data.len() {
            if data[pos] == b'\n' {
                let end = if pos > 0 && data[pos - 1] == b'\r' { pos - 1 } else { pos };
                line_len = Some(end);
                pos += 1;
                break
            }
            pos += 1;
            if pos > 8192 {
                return Err(Error::Protocol("peer sent too much data before identification"))
            }
        }

        match line_len {
            Some(line_len) => {
                let line = Bytes::copy_from_slice(&data[..line_len]);
                self.buf.skip(pos)?;
                self.state = State::AwaitingHeader;
                Ok(Some(line))
            },
            None => {
                self.state = State::ScanningLine { pos };
                Ok(None)
            },
        }
    }

    /// Decodes the next packet, if it has been received completely.
    pub fn consume_packet(&mut self) -> Result<Option<RecvPacket>> {
        let packet_len = match self.state {
            State::AwaitingHeader => match self.decode_header()? {
                Some(packet_len) => packet_len,
                None => return Ok(None),
            },
            State::AwaitingBody { packet_len } => packet_len,
            State::ScanningLine { .. } =>
                return Err(Error::Protocol("packet requested in the middle of identification line")),
        };

        let total_len = 4 + packet_len + self.tag_len;
        if self.buf.available() < total_len {
            log::trace!("received {} of {} bytes of packet", self.buf.available(), total_len);
            return Ok(None)
        }

        let _verified: MacVerified = self.decrypt_body(packet_len)?;
        let packet = &self.buf.unread()[..4 + packet_len];
        let padding_len = packet[4] as usize;
        if packet_len < 1 + padding_len {
            return Err(Error::Protocol("invalid packet length (too short for given padding)"))
        }
        let payload = &packet[5..(4 + packet_len - padding_len)];

        let payload = match self.decompress {
            Some(ref mut decompress) if !self.decompress_delayed => {
                let mut decompressed = Vec::new();
                decompress.decompress(payload, &mut decompressed)?;
                Bytes::from(decompressed)
            },
            _ => Bytes::copy_from_slice(payload),
        };

        self.buf.skip(total_len)?;
        let packet_seq = self.packet_seq;
        self.packet_seq = self.packet_seq.wrapping_add(1);
        self.recv_bytes += total_len as u64;
        self.state = State::AwaitingHeader;

        log::trace!("decoded packet {}, seq {}, payload len {}",
            payload.first().cloned().unwrap_or(0), packet_seq, payload.len());
        Ok(Some(RecvPacket { payload, packet_seq }))
    }

    fn decode_header(&mut self) -> Result<Option<usize>> {
        let header_len = self.header_len();
        if self.buf.available() < header_len {
            return Ok(None)
        }

        if self.mac_variant == MacAlgoVariant::EncryptAndMac {
            self.decrypt.decrypt(&mut self.buf.unread_mut()[..header_len]);
        }
        let len_bytes = &self.buf.unread()[..4];
        let packet_len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let packet_len = packet_len as usize;

        if packet_len < 5 {
            return Err(Error::Protocol("invalid packet length (too short)"))
        } else if packet_len > self.max_packet_len {
            return Err(Error::Protocol("invalid packet length (too long)"))
        }

        let aligned_len = match self.mac_variant {
            MacAlgoVariant::EncryptAndMac => 4 + packet_len,
            MacAlgoVariant::EncryptThenMac => packet_len,
        };
        if aligned_len % self.block_len != 0 {
            return Err(Error::Protocol("invalid packet length (not aligned to cipher block length)"))
        }

        log::trace!("decoded packet len {}", packet_len);
        self.state = State::AwaitingBody { packet_len };
        Ok(Some(packet_len))
    }

    fn decrypt_body(&mut self, packet_len: usize) -> Result<MacVerified> {
        let block_len = self.block_len;
        let tag_len = self.tag_len;
        let packet_seq = self.packet_seq;
        let data = self.buf.unread_mut();
        let (packet, tag) = data.split_at_mut(4 + packet_len);
        let tag = &tag[..tag_len];

        match self.mac_variant {
            MacAlgoVariant::EncryptAndMac => {
                self.decrypt.decrypt(&mut packet[block_len..]);
                self.mac.verify(packet_seq, packet, tag)
            },
            MacAlgoVariant::EncryptThenMac => {
                let verified = self.mac.verify(packet_seq, packet, tag)?;
                self.decrypt.decrypt(&mut packet[4..]);
                Ok(verified)
            },
        }
    }

    pub fn set_decrypt(&mut self, keys: DecryptKeys) {
        self.decrypt = keys.decrypt;
        self.mac = keys.mac;
        self.mac_variant = keys.mac_variant;
        self.block_len = keys.block_len;
        self.tag_len = keys.tag_len;
    }

    /// Installs a decompressor; a delayed one stays inactive until
    /// [`start_delayed_compression()`][Self::start_delayed_compression].
    pub fn set_decompress(&mut self, decompress: Box<dyn Decompress + Send>, delayed: bool) {
        self.decompress = Some(decompress);
        self.decompress_delayed = delayed;
    }

    pub fn start_delayed_compression(&mut self) {
        self.decompress_delayed = false;
    }

    pub fn packet_seq(&self) -> u32 {
        self.packet_seq
    }

    pub fn recv_bytes(&self) -> u64 {
        self.recv_bytes
    }

    #[cfg(test)]
    pub fn set_packet_seq(&mut self, packet_seq: u32) {
        self.packet_seq = packet_seq;
    }
}
