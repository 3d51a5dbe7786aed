use bytes::Bytes;
use std::task::Poll;
use crate::codec::Buffer;
use crate::codes::msg;
use crate::error::{Error, Result};
use crate::util::CryptoRngCore;
use super::{KexAlgo, KexInput, KexOutput, Kex};

/// "curve25519-sha256" key exchange from RFC 8731.
pub static CURVE25519_SHA256: KexAlgo = KexAlgo {
    name: "curve25519-sha256",
    make_kex: |rng| Ok(Box::new(init_kex(rng)?)),
};

/// "curve25519-sha256@libssh.com" key exchange, the same as [`CURVE25519_SHA256`].
pub static CURVE25519_SHA256_LIBSSH: KexAlgo = KexAlgo {
    name: "curve25519-sha256@libssh.com",
    make_kex: |rng| Ok(Box::new(init_kex(rng)?)),
};

struct Curve25519Kex {
    our_privkey: [u8; 32],
    our_pubkey: [u8; 32],
    init_sent: bool,
    reply: Option<EcdhReply>,
}

struct EcdhReply {
    server_pubkey: Bytes,
    server_eph_pubkey: [u8; 32],
    server_exchange_hash_sign: Bytes,
}

fn init_kex(rng: &mut dyn CryptoRngCore) -> Result<Curve25519Kex> {
    let mut our_privkey = [0; 32];
    rng.try_fill_bytes(&mut our_privkey)
        .map_err(|_| Error::Crypto("could not generate X25519 ephemeral private key"))?;
    let our_pubkey = x25519_dalek::x25519(our_privkey, x25519_dalek::X25519_BASEPOINT_BYTES);
    log::debug!("initialized curve25519 kex");
    Ok(Curve25519Kex { our_privkey, our_pubkey, init_sent: false, reply: None })
}

impl Kex for Curve25519Kex {
    fn recv_packet(&mut self, msg_id: u8, payload: &mut Buffer) -> Result<()> {
        match msg_id {
            msg::KEX_ECDH_REPLY => recv_ecdh_reply(self, payload),
            _ => Err(Error::PacketNotImplemented(msg_id)),
        }
    }

    fn send_packet(&mut self) -> Result<Option<Bytes>> {
        if self.init_sent {
            return Ok(None)
        }
        self.init_sent = true;

        // RFC 5656, section 4
        let mut payload = Buffer::new();
        payload.put_u8(msg::KEX_ECDH_INIT);
        payload.put_bytes(&self.our_pubkey);
        log::debug!("sending SSH_MSG_KEX_ECDH_INIT");
        Ok(Some(payload.finish()))
    }

    fn poll(&mut self, input: KexInput) -> Poll<Result<KexOutput>> {
        match self.reply.take() {
            Some(reply) => Poll::Ready(exchange(self, reply, input)),
            None => Poll::Pending,
        }
    }

    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        super::sha256_hash(data)
    }
}

fn recv_ecdh_reply(kex: &mut Curve25519Kex, payload: &mut Buffer) -> Result<()> {
    if kex.reply.is_some() {
        return Err(Error::Protocol("received duplicate SSH_MSG_KEX_ECDH_REPLY"))
    }

    // RFC 5656, section 4 and RFC 8731, section 3.1
    let server_pubkey = payload.get_bytes()?;
    let server_eph_pubkey = payload.get_byte_array::<32>()
        .map_err(|_| Error::Kex("server sent X25519 public key with invalid length"))?;
    let server_exchange_hash_sign = payload.get_bytes()?;

    log::debug!("received SSH_MSG_KEX_ECDH_REPLY");
    kex.reply = Some(EcdhReply { server_pubkey, server_eph_pubkey, server_exchange_hash_sign });
    Ok(())
}

fn exchange(kex: &mut Curve25519Kex, reply: EcdhReply, input: KexInput) -> Result<KexOutput> {
    let EcdhReply { server_pubkey, server_eph_pubkey, server_exchange_hash_sign } = reply;

    let shared_secret = x25519_dalek::x25519(kex.our_privkey, server_eph_pubkey);
    // RFC 8731, section 3
    if shared_secret == [0; 32] {
        return Err(Error::Kex("X25519 shared secret is all zeros"))
    }

    let mut exchange_data = Buffer::new();
    exchange_data.put_bytes(input.client_ident);
    exchange_data.put_bytes(input.server_ident);
    exchange_data.put_bytes(input.client_kex_init);
    exchange_data.put_bytes(input.server_kex_init);
    exchange_data.put_bytes(&server_pubkey);
    exchange_data.put_bytes(&kex.our_pubkey);
    exchange_data.put_bytes(&server_eph_pubkey);
    exchange_data.put_mpint_uint_be(&shared_secret);
    let exchange_hash = super::sha256_hash(&exchange_data.finish());

    Ok(KexOutput {
        shared_secret_be: shared_secret.to_vec(),
        exchange_hash,
        server_pubkey,
        server_exchange_hash_sign,
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use super::*;

    fn input() -> KexInput<'static> {
        KexInput {
            client_ident: b"SSH-2.0-c",
            server_ident: b"SSH-2.0-s",
            client_kex_init: b"\x14c",
            server_kex_init: b"\x14s",
        }
    }

    fn reply(server_eph_pubkey: &[u8]) -> Buffer {
        let mut reply = Buffer::new();
        reply.put_bytes(b"host key");
        reply.put_bytes(server_eph_pubkey);
        reply.put_bytes(b"signature");
        reply
    }

    #[test]
    fn test_exchange_with_peer() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        let mut kex = init_kex(&mut rng).unwrap();

        let mut init = Buffer::from(kex.send_packet().unwrap().unwrap());
        assert_eq!(init.get_u8().unwrap(), msg::KEX_ECDH_INIT);
        let client_pubkey = init.get_byte_array::<32>().unwrap();

        let server_privkey = [0x5a; 32];
        let server_pubkey = x25519_dalek::x25519(server_privkey, x25519_dalek::X25519_BASEPOINT_BYTES);
        let expected_secret = x25519_dalek::x25519(server_privkey, client_pubkey);

        kex.recv_packet(msg::KEX_ECDH_REPLY, &mut reply(&server_pubkey)).unwrap();
        let output = match kex.poll(input()) {
            Poll::Ready(output) => output.unwrap(),
            Poll::Pending => panic!("kex is not finished"),
        };
        assert_eq!(output.shared_secret_be, expected_secret.to_vec());
        assert_eq!(output.exchange_hash.len(), 32);
        assert!(kex.poll(input()).is_pending());
    }

    #[test]
    fn test_reject_low_order_point() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        let mut kex = init_kex(&mut rng).unwrap();
        kex.recv_packet(msg::KEX_ECDH_REPLY, &mut reply(&[0; 32])).unwrap();
        assert!(matches!(kex.poll(input()), Poll::Ready(Err(Error::Kex(_)))));
    }

    #[test]
    fn test_reject_short_pubkey() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        let mut kex = init_kex(&mut rng).unwrap();
        let res = kex.recv_packet(msg::KEX_ECDH_REPLY, &mut reply(&[1; 31]));
        assert!(matches!(res, Err(Error::Kex(_))));
    }
}
