use bytes::Bytes;
use rsa::traits::PublicKeyParts as _;
use std::fmt;
use crate::codec::Buffer;
use crate::error::{Result, Error};
use super::{PubkeyAlgo, Pubkey, SignatureVerified};

/// "ssh-rsa" public key algorithm from RFC 4253 (uses SHA-1).
pub static SSH_RSA_SHA1: PubkeyAlgo = PubkeyAlgo {
    name: "ssh-rsa",
    verify: verify_sha1,
};

/// "rsa-sha2-256" public key algorithm from RFC 8332.
pub static RSA_SHA2_256: PubkeyAlgo = PubkeyAlgo {
    name: "rsa-sha2-256",
    verify: verify_sha256,
};

/// "rsa-sha2-512" public key algorithm from RFC 8332.
pub static RSA_SHA2_512: PubkeyAlgo = PubkeyAlgo {
    name: "rsa-sha2-512",
    verify: verify_sha512,
};

/// RSA public key.
///
/// You can convert it to and from [`rsa::RsaPublicKey`] using `from()`/`into()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPubkey {
    pub(crate) pubkey: rsa::RsaPublicKey,
}

fn verify_sha1(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified> {
    use sha1::Digest as _;
    let scheme = rsa::Pkcs1v15Sign::new::<sha1::Sha1>();
    verify(pubkey, &sha1::Sha1::digest(message), signature, "ssh-rsa", scheme)
}

fn verify_sha256(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified> {
    use sha2::Digest as _;
    let scheme = rsa::Pkcs1v15Sign::new::<sha2::Sha256>();
    verify(pubkey, &sha2::Sha256::digest(message), signature, "rsa-sha2-256", scheme)
}

fn verify_sha512(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified> {
    use sha2::Digest as _;
    let scheme = rsa::Pkcs1v15Sign::new::<sha2::Sha512>();
    verify(pubkey, &sha2::Sha512::digest(message), signature, "rsa-sha2-512", scheme)
}

fn verify(
    pubkey: &Pubkey,
    hashed: &[u8],
    signature: Bytes,
    algo_name: &str,
    scheme: rsa::Pkcs1v15Sign,
) -> Result<SignatureVerified> {
    let Pubkey::Rsa(pubkey) = pubkey else { return Err(Error::Signature) };

    let mut signature = super::decode_signature(signature, algo_name)?;
    let signature_data = signature.get_bytes()?;
    match pubkey.pubkey.verify(scheme, hashed, &signature_data) {
        Ok(_) => Ok(SignatureVerified::assertion()),
        Err(_) => Err(Error::Signature),
    }
}

pub(super) fn encode_pubkey(blob: &mut Buffer, pubkey: &RsaPubkey) {
    blob.put_str("ssh-rsa");
    blob.put_mpint_uint_be(&pubkey.pubkey.e().to_bytes_be());
    blob.put_mpint_uint_be(&pubkey.pubkey.n().to_bytes_be());
}

pub(super) fn decode_pubkey(blob: &mut Buffer) -> Result<RsaPubkey> {
    let e = blob.get_biguint()?;
    let n = blob.get_biguint()?;
    let pubkey = rsa::RsaPublicKey::new(n, e)
        .map_err(|_| Error::Crypto("rsa public key is not valid"))?;
    Ok(RsaPubkey { pubkey })
}

impl From<rsa::RsaPublicKey> for RsaPubkey {
    fn from(pubkey: rsa::RsaPublicKey) -> Self { Self { pubkey } }
}

impl From<RsaPubkey> for rsa::RsaPublicKey {
    fn from(pubkey: RsaPubkey) -> Self { pubkey.pubkey }
}

impl fmt::Display for RsaPubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rsa n {:x}, e {}", self.pubkey.n(), self.pubkey.e())
    }
}
