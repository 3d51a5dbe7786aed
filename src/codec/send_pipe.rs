use bytes::Bytes;
use rand::SeedableRng as _;
use crate::cipher::{self, Encrypt};
use crate::compress::Compress;
use crate::error::Result;
use crate::mac::{self, Mac, MacAlgoVariant};
use crate::util::CryptoRngCore;
use super::Buffer;

/// Encoder of the byte stream that we send to the peer.
///
/// Encoded packets are accumulated in an output buffer, which is drained by the writer with
/// [`take_bytes()`][Self::take_bytes]. Packets are encoded in the order of the calls to
/// [`feed_packet()`][Self::feed_packet], so holding `&mut SendPipe` is what orders the packets.
pub(crate) struct SendPipe {
    buf: Buffer,
    encrypt: Box<dyn Encrypt + Send>,
    mac: Box<dyn Mac + Send>,
    mac_variant: MacAlgoVariant,
    block_len: usize,
    tag_len: usize,
    compress: Option<Box<dyn Compress + Send>>,
    compress_delayed: bool,
    packet_seq: u32,
    padding_rng: rand_chacha::ChaCha8Rng,
    sent_bytes: u64,
}

/// Keys and algorithms for one direction, installed after `SSH_MSG_NEWKEYS`.
pub(crate) struct EncryptKeys {
    pub encrypt: Box<dyn Encrypt + Send>,
    pub mac: Box<dyn Mac + Send>,
    pub mac_variant: MacAlgoVariant,
    pub block_len: usize,
    pub tag_len: usize,
}

impl SendPipe {
    pub fn new(rng: &mut dyn CryptoRngCore) -> Result<SendPipe> {
        Ok(SendPipe {
            buf: Buffer::new(),
            encrypt: Box::new(cipher::none::Identity),
            mac: Box::new(mac::none::Empty),
            mac_variant: MacAlgoVariant::EncryptAndMac,
            block_len: 8,
            tag_len: 0,
            compress: None,
            compress_delayed: false,
            packet_seq: 0,
            padding_rng: rand_chacha::ChaCha8Rng::from_rng(rng.as_rngcore())
                .map_err(|_| crate::Error::Crypto("could not seed padding generator"))?,
            sent_bytes: 0,
        })
    }

    pub fn feed_ident(&mut self, ident: &[u8]) {
        self.buf.put_raw(ident);
        self.buf.put_raw(b"\r\n");
    }

    /// Encodes a packet with the given payload and returns its sequence number.
    pub fn feed_packet(&mut self, payload: &[u8]) -> Result<u32> {
        use rand::RngCore as _;

        let compressed;
        let payload = match self.compress {
            Some(ref mut compress) if !self.compress_delayed => {
                let mut out = Vec::with_capacity(payload.len() + 16);
                compress.compress(payload, &mut out)?;
                compressed = out;
                &compressed[..]
            },
            _ => payload,
        };

        let aligned_header_len = match self.mac_variant {
            MacAlgoVariant::EncryptAndMac => 5,
            MacAlgoVariant::EncryptThenMac => 1,
        };
        let padding_len = calculate_padding_len(aligned_header_len, payload.len(), self.block_len);
        let packet_len = 1 + payload.len() + padding_len;

        let packet_begin = self.buf.wpos();
        self.buf.put_u32(packet_len as u32);
        self.buf.put_u8(padding_len as u8);
        self.buf.put_raw(payload);

        let mut padding = [0u8; 255];
        self.padding_rng.fill_bytes(&mut padding[..padding_len]);
        self.buf.put_raw(&padding[..padding_len]);

        let packet_end = self.buf.wpos();
        self.buf.set_wpos(packet_end + self.tag_len);

        let packet_seq = self.packet_seq;
        let rpos = self.buf.rpos();
        let data = &mut self.buf.unread_mut()[(packet_begin - rpos)..];
        let (packet, tag) = data.split_at_mut(4 + packet_len);
        match self.mac_variant {
            MacAlgoVariant::EncryptAndMac => {
                self.mac.sign(packet_seq, packet, tag);
                self.encrypt.encrypt(packet);
            },
            MacAlgoVariant::EncryptThenMac => {
                self.encrypt.encrypt(&mut packet[4..]);
                self.mac.sign(packet_seq, packet, tag);
            },
        }

        self.packet_seq = self.packet_seq.wrapping_add(1);
        self.sent_bytes += (4 + packet_len + self.tag_len) as u64;
        log::trace!("encoded packet {}, seq {}, packet len {}",
            payload.first().cloned().unwrap_or(0), packet_seq, packet_len);
        Ok(packet_seq)
    }

    /// Takes all encoded bytes that are waiting to be written.
    pub fn take_bytes(&mut self) -> Bytes {
        let bytes = self.buf.take_unread();
        self.buf.clear();
        bytes
    }

    /// Number of encoded bytes that are waiting to be written.
    pub fn pending_len(&self) -> usize {
        self.buf.available()
    }

    pub fn set_encrypt(&mut self, keys: EncryptKeys) {
        self.encrypt = keys.encrypt;
        self.mac = keys.mac;
        self.mac_variant = keys.mac_variant;
        self.block_len = keys.block_len;
        self.tag_len = keys.tag_len;
    }

    pub fn set_compress(&mut self, compress: Box<dyn Compress + Send>, delayed: bool) {
        self.compress = Some(compress);
        self.compress_delayed = delayed;
    }

    pub fn start_delayed_compression(&mut self) {
        self.compress_delayed = false;
    }

    pub fn packet_seq(&self) -> u32 {
        self.packet_seq
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    #[cfg(test)]
    pub fn set_packet_seq(&mut self, packet_seq: u32) {
        self.packet_seq = packet_seq;
    }
}

/// Length of random padding for a payload.
///
/// The padding is at least 4 bytes and aligns `aligned_header_len + payload_len + padding_len` to
/// `block_len`; the whole packet (with the length field) is at least 16 bytes long.
fn calculate_padding_len(aligned_header_len: usize, payload_len: usize, block_len: usize) -> usize {
    let min_padded_len = aligned_header_len + payload_len + 4;
    let padded_len = (min_padded_len + block_len - 1) / block_len * block_len;
    let mut padding_len = padded_len - payload_len - aligned_header_len;
    while 5 + payload_len + padding_len < 16 {
        padding_len += block_len;
    }
    padding_len
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use crate::{cipher, compress, mac};
    use crate::codec::recv_pipe::{RecvPipe, DecryptKeys};
    use super::*;

    #[test]
    fn test_calculate_padding_len() {
        fn check(payload_len: usize, block_len: usize, expected_padding_len: usize) {
            let padding_len = calculate_padding_len(5, payload_len, block_len);
            assert_eq!(padding_len, expected_padding_len,
                "payload_len {}, block_len {}", payload_len, block_len);
            assert_eq!((5 + payload_len + padding_len) % block_len, 0);
        }

        check(0, 8, 11);
        check(3, 8, 8);
        check(4, 8, 7);
        check(6, 8, 5);
        check(7, 8, 4);
        check(8, 8, 11);
        check(11, 16, 16);
        check(12, 16, 15);
        check(27, 16, 16);
        check(28, 16, 15);
    }

    #[test]
    fn test_calculate_padding_len_etm() {
        // only padding_len + payload + padding is encrypted, but the packet must stay 16 bytes long
        assert_eq!(calculate_padding_len(1, 0, 8), 15);
        assert_eq!(calculate_padding_len(1, 3, 8), 12);
        assert_eq!(calculate_padding_len(1, 20, 16), 11);
    }

    fn make_rng() -> rand_chacha::ChaCha8Rng {
        rand_chacha::ChaCha8Rng::seed_from_u64(42)
    }

    fn install(
        send: &mut SendPipe,
        recv: &mut RecvPipe,
        cipher_algo: &cipher::CipherAlgo,
        mac_algo: &mac::MacAlgo,
    ) {
        let key = vec![0x42; cipher_algo.key_len];
        let iv = vec![0x24; cipher_algo.iv_len];
        let mac_key = vec![0x17; mac_algo.key_len];
        send.set_encrypt(EncryptKeys {
            encrypt: (cipher_algo.make_encrypt)(&key, &iv).unwrap(),
            mac: (mac_algo.make_mac)(&mac_key),
            mac_variant: mac_algo.variant,
            block_len: cipher_algo.block_len,
            tag_len: mac_algo.tag_len,
        });
        recv.set_decrypt(DecryptKeys {
            decrypt: (cipher_algo.make_decrypt)(&key, &iv).unwrap(),
            mac: (mac_algo.make_mac)(&mac_key),
            mac_variant: mac_algo.variant,
            block_len: cipher_algo.block_len,
            tag_len: mac_algo.tag_len,
        });
    }

    fn payloads() -> Vec<Vec<u8>> {
        vec![
            b"".to_vec(),
            b"\x05ssh-userauth".to_vec(),
            vec![0x5e; 1],
            (0..=255u8).collect(),
            vec![0xab; 3000],
        ]
    }

    #[test]
    fn test_send_then_recv() {
        let cipher_algos = [
            &cipher::NONE, &cipher::AES128_CTR, &cipher::AES256_CTR,
            &cipher::AES128_CBC, &cipher::AES256_CBC,
        ];
        let mac_algos = [
            &mac::NONE, &mac::HMAC_SHA2_256, &mac::HMAC_SHA1, &mac::HMAC_SHA2_512_ETM,
        ];

        for cipher_algo in cipher_algos {
            for mac_algo in mac_algos {
                let mut send = SendPipe::new(&mut make_rng()).unwrap();
                let mut recv = RecvPipe::new(35000);
                install(&mut send, &mut recv, cipher_algo, mac_algo);

                for payload in payloads().iter() {
                    send.feed_packet(payload).unwrap();
                }

                let wire = send.take_bytes();
                assert_eq!(send.pending_len(), 0);
                for byte in wire.chunks(7) {
                    recv.feed(byte);
                }

                for payload in payloads().iter() {
                    let packet = recv.consume_packet().unwrap()
                        .unwrap_or_else(|| panic!("{} {}", cipher_algo.name, mac_algo.name));
                    assert_eq!(packet.payload.as_ref(), &payload[..]);
                }
                assert!(recv.consume_packet().unwrap().is_none());
                assert_eq!(send.packet_seq(), recv.packet_seq());
            }
        }
    }

    #[test]
    fn test_delayed_compression() {
        let mut send = SendPipe::new(&mut make_rng()).unwrap();
        let mut recv = RecvPipe::new(35000);
        send.set_compress((compress::ZLIB_OPENSSH.make_compress)(), true);
        recv.set_decompress((compress::ZLIB_OPENSSH.make_decompress)(), true);

        send.feed_packet(&[0x34; 100]).unwrap();
        let before_auth = send.take_bytes();
        assert!(before_auth.len() > 100);

        send.start_delayed_compression();
        recv.feed(&before_auth);
        assert_eq!(recv.consume_packet().unwrap().unwrap().payload.as_ref(), &[0x34; 100][..]);
        recv.start_delayed_compression();

        send.feed_packet(&[0x34; 100]).unwrap();
        let after_auth = send.take_bytes();
        assert!(after_auth.len() < 100);
        recv.feed(&after_auth);
        assert_eq!(recv.consume_packet().unwrap().unwrap().payload.as_ref(), &[0x34; 100][..]);
    }

    #[test]
    fn test_packet_seq_wraps() {
        let mut send = SendPipe::new(&mut make_rng()).unwrap();
        let mut recv = RecvPipe::new(35000);
        install(&mut send, &mut recv, &cipher::AES128_CTR, &mac::HMAC_SHA2_256);
        send.set_packet_seq(u32::MAX - 1);
        recv.set_packet_seq(u32::MAX - 1);

        let seqs = (0..3)
            .map(|i| send.feed_packet(&[i; 10]).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(seqs, vec![u32::MAX - 1, u32::MAX, 0]);

        recv.feed(&send.take_bytes());
        for (i, expected_seq) in seqs.into_iter().enumerate() {
            let packet = recv.consume_packet().unwrap().unwrap();
            assert_eq!(packet.packet_seq, expected_seq);
            assert_eq!(packet.payload.as_ref(), &[i as u8; 10][..]);
        }
    }

    #[test]
    fn test_corrupted_mac() {
        let mut send = SendPipe::new(&mut make_rng()).unwrap();
        let mut recv = RecvPipe::new(35000);
        install(&mut send, &mut recv, &cipher::AES128_CTR, &mac::HMAC_SHA2_256);
        send.feed_packet(b"\x5ehello").unwrap();

        let mut wire = send.take_bytes().to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        recv.feed(&wire);
        assert!(matches!(recv.consume_packet(), Err(crate::Error::Mac)));
    }
}
