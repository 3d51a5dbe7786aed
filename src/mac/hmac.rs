use hmac::{Hmac, Mac as _};
use crate::error::{Error, Result};
use super::{Mac, MacAlgo, MacAlgoVariant, MacVerified};

/// "hmac-sha2-256" MAC from RFC 6668.
pub static HMAC_SHA2_256: MacAlgo = MacAlgo {
    name: "hmac-sha2-256",
    tag_len: 32,
    key_len: 32,
    variant: MacAlgoVariant::EncryptAndMac,
    make_mac: |key| Box::new(new_hmac::<Hmac<sha2::Sha256>>(key)),
};

/// "hmac-sha2-512" MAC from RFC 6668.
pub static HMAC_SHA2_512: MacAlgo = MacAlgo {
    name: "hmac-sha2-512",
    tag_len: 64,
    key_len: 64,
    variant: MacAlgoVariant::EncryptAndMac,
    make_mac: |key| Box::new(new_hmac::<Hmac<sha2::Sha512>>(key)),
};

/// "hmac-sha1" MAC from RFC 4253.
pub static HMAC_SHA1: MacAlgo = MacAlgo {
    name: "hmac-sha1",
    tag_len: 20,
    key_len: 20,
    variant: MacAlgoVariant::EncryptAndMac,
    make_mac: |key| Box::new(new_hmac::<Hmac<sha1::Sha1>>(key)),
};

/// "hmac-sha2-256-etm@openssh.com" MAC (encrypt-then-MAC variant of "hmac-sha2-256").
pub static HMAC_SHA2_256_ETM: MacAlgo = MacAlgo {
    name: "hmac-sha2-256-etm@openssh.com",
    tag_len: 32,
    key_len: 32,
    variant: MacAlgoVariant::EncryptThenMac,
    make_mac: |key| Box::new(new_hmac::<Hmac<sha2::Sha256>>(key)),
};

/// "hmac-sha2-512-etm@openssh.com" MAC (encrypt-then-MAC variant of "hmac-sha2-512").
pub static HMAC_SHA2_512_ETM: MacAlgo = MacAlgo {
    name: "hmac-sha2-512-etm@openssh.com",
    tag_len: 64,
    key_len: 64,
    variant: MacAlgoVariant::EncryptThenMac,
    make_mac: |key| Box::new(new_hmac::<Hmac<sha2::Sha512>>(key)),
};

/// "hmac-sha1-etm@openssh.com" MAC (encrypt-then-MAC variant of "hmac-sha1").
pub static HMAC_SHA1_ETM: MacAlgo = MacAlgo {
    name: "hmac-sha1-etm@openssh.com",
    tag_len: 20,
    key_len: 20,
    variant: MacAlgoVariant::EncryptThenMac,
    make_mac: |key| Box::new(new_hmac::<Hmac<sha1::Sha1>>(key)),
};

struct HmacMac<M> {
    keyed: M,
}

fn new_hmac<M: hmac::digest::KeyInit>(key: &[u8]) -> HmacMac<M> {
    let keyed = <M as hmac::digest::KeyInit>::new_from_slice(key)
        .expect("HMAC can take key of any size");
    HmacMac { keyed }
}

impl<M: hmac::Mac + Clone> HmacMac<M> {
    fn start(&self, packet_seq: u32, data: &[u8]) -> M {
        let mut hmac = self.keyed.clone();
        hmac.update(&packet_seq.to_be_bytes());
        hmac.update(data);
        hmac
    }
}

impl<M: hmac::Mac + Clone> Mac for HmacMac<M> {
    fn sign(&mut self, packet_seq: u32, data: &[u8], tag: &mut [u8]) {
        tag.copy_from_slice(&self.start(packet_seq, data).finalize().into_bytes())
    }

    fn verify(&mut self, packet_seq: u32, data: &[u8], tag: &[u8]) -> Result<MacVerified> {
        match self.start(packet_seq, data).verify_slice(tag) {
            Ok(_) => Ok(MacVerified::assertion()),
            Err(_) => Err(Error::Mac),
        }
    }
}
