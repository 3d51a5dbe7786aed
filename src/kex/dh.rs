use bytes::Bytes;
use derivative::Derivative;
use hex_literal::hex;
use num_bigint_dig::{BigUint, RandBigInt as _};
use std::task::Poll;
use crate::codec::Buffer;
use crate::codes::msg;
use crate::error::{Error, Result};
use crate::util::CryptoRngCore;
use super::{KexAlgo, KexInput, KexOutput, Kex};

/// "diffie-hellman-group14-sha1" key exchange from RFC 4253.
pub static DIFFIE_HELLMAN_GROUP14_SHA1: KexAlgo = KexAlgo {
    name: "diffie-hellman-group14-sha1",
    make_kex: |rng| Ok(Box::new(init_kex(Group::group_14(), super::sha1_hash, rng)?)),
};

/// "diffie-hellman-group14-sha256" key exchange from RFC 8268.
pub static DIFFIE_HELLMAN_GROUP14_SHA256: KexAlgo = KexAlgo {
    name: "diffie-hellman-group14-sha256",
    make_kex: |rng| Ok(Box::new(init_kex(Group::group_14(), super::sha256_hash, rng)?)),
};

/// "diffie-hellman-group16-sha512" key exchange from RFC 8268.
pub static DIFFIE_HELLMAN_GROUP16_SHA512: KexAlgo = KexAlgo {
    name: "diffie-hellman-group16-sha512",
    make_kex: |rng| Ok(Box::new(init_kex(Group::group_16(), super::sha512_hash, rng)?)),
};

#[derive(Debug)]
struct Group {
    g: BigUint,
    p: BigUint,
    p_minus_1: BigUint,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct DhKex {
    group: Group,
    #[derivative(Debug = "ignore")]
    hash: fn(&[u8]) -> Vec<u8>,
    #[derivative(Debug = "ignore")]
    our_x: BigUint,
    our_e: BigUint,
    init_sent: bool,
    reply: Option<DhReply>,
}

#[derive(Debug)]
struct DhReply {
    server_pubkey: Bytes,
    server_f: BigUint,
    server_exchange_hash_sign: Bytes,
}

fn init_kex(
    group: Group,
    hash: fn(&[u8]) -> Vec<u8>,
    rng: &mut dyn CryptoRngCore,
) -> Result<DhKex> {
    let our_x = rng.as_rngcore().gen_biguint_range(&BigUint::from(2u32), &group.p_minus_1);
    let our_e = group.g.modpow(&our_x, &group.p);
    log::debug!("initialized diffie-hellman kex with {}-bit group", group.p.bits());
    Ok(DhKex { group, hash, our_x, our_e, init_sent: false, reply: None })
}

impl Kex for DhKex {
    fn recv_packet(&mut self, msg_id: u8, payload: &mut Buffer) -> Result<()> {
        match msg_id {
            msg::KEXDH_REPLY => recv_kexdh_reply(self, payload),
            _ => Err(Error::PacketNotImplemented(msg_id)),
        }
    }

    fn send_packet(&mut self) -> Result<Option<Bytes>> {
        if self.init_sent {
            return Ok(None)
        }
        self.init_sent = true;

        // RFC 4253, section 8
        let mut payload = Buffer::new();
        payload.put_u8(msg::KEXDH_INIT);
        payload.put_biguint(&self.our_e);
        log::debug!("sending SSH_MSG_KEXDH_INIT");
        Ok(Some(payload.finish()))
    }

    fn poll(&mut self, input: KexInput) -> Poll<Result<KexOutput>> {
        match self.reply.take() {
            Some(reply) => Poll::Ready(exchange(self, reply, input)),
            None => Poll::Pending,
        }
    }

    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        (self.hash)(data)
    }
}

fn recv_kexdh_reply(kex: &mut DhKex, payload: &mut Buffer) -> Result<()> {
    if kex.reply.is_some() {
        return Err(Error::Protocol("received duplicate SSH_MSG_KEXDH_REPLY"))
    }

    let server_pubkey = payload.get_bytes()?;
    let server_f = payload.get_biguint()?;
    let server_exchange_hash_sign = payload.get_bytes()?;

    // RFC 8268, section 4
    if server_f <= BigUint::from(1u32) || server_f >= kex.group.p_minus_1 {
        return Err(Error::Kex("server sent invalid Diffie-Hellman public value"))
    }

    log::debug!("received SSH_MSG_KEXDH_REPLY");
    kex.reply = Some(DhReply { server_pubkey, server_f, server_exchange_hash_sign });
    Ok(())
}

fn exchange(kex: &mut DhKex, reply: DhReply, input: KexInput) -> Result<KexOutput> {
    let DhReply { server_pubkey, server_f, server_exchange_hash_sign } = reply;
    let shared_secret = server_f.modpow(&kex.our_x, &kex.group.p);

    let mut exchange_data = Buffer::new();
    exchange_data.put_bytes(input.client_ident);
    exchange_data.put_bytes(input.server_ident);
    exchange_data.put_bytes(input.client_kex_init);
    exchange_data.put_bytes(input.server_kex_init);
    exchange_data.put_bytes(&server_pubkey);
    exchange_data.put_biguint(&kex.our_e);
    exchange_data.put_biguint(&server_f);
    exchange_data.put_biguint(&shared_secret);
    let exchange_hash = (kex.hash)(&exchange_data.finish());

    Ok(KexOutput {
        shared_secret_be: shared_secret.to_bytes_be(),
        exchange_hash,
        server_pubkey,
        server_exchange_hash_sign,
    })
}

impl Group {
    fn group_14() -> Group {
        // RFC 3526, section 3
        let g = BigUint::from(2u32);
        let p = BigUint::from_bytes_be(&hex!(
            "FFFFFFFF" "FFFFFFFF" "C90FDAA2" "2168C234" "C4C6628B" "80DC1CD1"
            "29024E08" "8A67CC74" "020BBEA6" "3B139B22" "514A0879" "8E3404DD"
            "EF9519B3" "CD3A431B" "302B0A6D" "F25F1437" "4FE1356D" "6D51C245"
            "E485B576" "625E7EC6" "F44C42E9" "A637ED6B" "0BFF5CB6" "F406B7ED"
            "EE386BFB" "5A899FA5" "AE9F2411" "7C4B1FE6" "49286651" "ECE45B3D"
            "C2007CB8" "A163BF05" "98DA4836" "1C55D39A" "69163FA8" "FD24CF5F"
            "83655D23" "DCA3AD96" "1C62F356" "208552BB" "9ED52907" "7096966D"
            "670C354E" "4ABC9804" "F1746C08" "CA18217C" "32905E46" "2E36CE3B"
            "E39E772C" "180E8603" "9B2783A2" "EC07A28F" "B5C55DF0" "6F4C52C9"
            "DE2BCBF6" "95581718" "3995497C" "EA956AE5" "15D22618" "98FA0510"
            "15728E5A" "8AACAA68" "FFFFFFFF" "FFFFFFFF"
        ));
        let p_minus_1 = &p - BigUint::from(1u32);
        Group { g, p, p_minus_1 }
    }

    fn group_16() -> Group {
        // RFC 3526, section 5
        let g = BigUint::from(2u32);
        let p = BigUint::from_bytes_be(&hex!(
            "FFFFFFFF" "FFFFFFFF" "C90FDAA2" "2168C234" "C4C6628B" "80DC1CD1"
            "29024E08" "8A67CC74" "020BBEA6" "3B139B22" "514A0879" "8E3404DD"
            "EF9519B3" "CD3A431B" "302B0A6D" "F25F1437" "4FE1356D" "6D51C245"
            "E485B576" "625E7EC6" "F44C42E9" "A637ED6B" "0BFF5CB6" "F406B7ED"
            "EE386BFB" "5A899FA5" "AE9F2411" "7C4B1FE6" "49286651" "ECE45B3D"
            "C2007CB8" "A163BF05" "98DA4836" "1C55D39A" "69163FA8" "FD24CF5F"
            "83655D23" "DCA3AD96" "1C62F356" "208552BB" "9ED52907" "7096966D"
            "670C354E" "4ABC9804" "F1746C08" "CA18217C" "32905E46" "2E36CE3B"
            "E39E772C" "180E8603" "9B2783A2" "EC07A28F" "B5C55DF0" "6F4C52C9"
            "DE2BCBF6" "95581718" "3995497C" "EA956AE5" "15D22618" "98FA0510"
            "15728E5A" "8AAAC42D" "AD33170D" "04507A33" "A85521AB" "DF1CBA64"
            "ECFB8504" "58DBEF0A" "8AEA7157" "5D060C7D" "B3970F85" "A6E1E4C7"
            "ABF5AE8C" "DB0933D7" "1E8C94E0" "4A25619D" "CEE3D226" "1AD2EE6B"
            "F12FFA06" "D98A0864" "D8760273" "3EC86A64" "521F2B18" "177B200C"
            "BBE11757" "7A615D6C" "770988C0" "BAD946E2" "08E24FA0" "74E5AB31"
            "43DB5BFC" "E0FD108E" "4B82D120" "A9210801" "1A723C12" "A787E6D7"
            "88719A10" "BDBA5B26" "99C32718" "6AF4E23C" "1A946834" "B6150BDA"
            "2583E9CA" "2AD44CE8" "DBBBC2DB" "04DE8EF9" "2E8EFC14" "1FBECAA6"
            "287C5947" "4E6BC05D" "99B2964F" "A090C3A2" "233BA186" "515BE7ED"
            "1F612970" "CEE2D7AF" "B81BDD76" "2170481C" "D0069127" "D5B05AA9"
            "93B4EA98" "8D8FDDC1" "86FFB7DC" "90A6C08F" "4DF435C9" "34063199"
            "FFFFFFFF" "FFFFFFFF"
        ));
        let p_minus_1 = &p - BigUint::from(1u32);
        Group { g, p, p_minus_1 }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use super::*;

    #[test]
    fn test_exchange_with_peer() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let mut kex = init_kex(Group::group_14(), crate::kex::sha256_hash, &mut rng).unwrap();

        let mut init = Buffer::from(kex.send_packet().unwrap().unwrap());
        assert_eq!(init.get_u8().unwrap(), msg::KEXDH_INIT);
        let client_e = init.get_biguint().unwrap();
        assert!(kex.send_packet().unwrap().is_none());

        // play the server side of the exchange
        let group = Group::group_14();
        let server_y = BigUint::from(0x1234_5678_9abc_u64);
        let server_f = group.g.modpow(&server_y, &group.p);
        let expected_secret = client_e.modpow(&server_y, &group.p);

        let mut reply = Buffer::new();
        reply.put_bytes(b"host key");
        reply.put_biguint(&server_f);
        reply.put_bytes(b"signature");
        kex.recv_packet(msg::KEXDH_REPLY, &mut reply).unwrap();

        let input = KexInput {
            client_ident: b"SSH-2.0-c",
            server_ident: b"SSH-2.0-s",
            client_kex_init: b"\x14c",
            server_kex_init: b"\x14s",
        };
        let output = match kex.poll(input) {
            Poll::Ready(output) => output.unwrap(),
            Poll::Pending => panic!("kex is not finished"),
        };
        assert_eq!(output.shared_secret_be, expected_secret.to_bytes_be());
        assert_eq!(output.server_pubkey.as_ref(), b"host key");
        assert_eq!(output.server_exchange_hash_sign.as_ref(), b"signature");
        assert_eq!(output.exchange_hash.len(), 32);
    }

    #[test]
    fn test_reject_invalid_public_value() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let mut kex = init_kex(Group::group_14(), crate::kex::sha1_hash, &mut rng).unwrap();
        let mut reply = Buffer::new();
        reply.put_bytes(b"host key");
        reply.put_biguint(&BigUint::from(1u32));
        reply.put_bytes(b"signature");
        assert!(matches!(kex.recv_packet(msg::KEXDH_REPLY, &mut reply), Err(Error::Kex(_))));
    }
}
