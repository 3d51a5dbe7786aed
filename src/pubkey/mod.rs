//! Public key algorithms used to authenticate the server.
//!
//! During the key exchange, the server signs the exchange hash with its host key. We decode the
//! host key, verify the signature with the negotiated algorithm and then ask the
//! [`HostKeyVerifier`][crate::HostKeyVerifier] whether the key can be trusted.
//!
//! # Supported algorithms
//!
//! - "ssh-ed25519" ([`SSH_ED25519`])
//! - "ecdsa-sha2-nistp256" ([`ECDSA_SHA2_NISTP256`])
//! - "ecdsa-sha2-nistp384" ([`ECDSA_SHA2_NISTP384`])
//! - "rsa-sha2-256" ([`RSA_SHA2_256`])
//! - "rsa-sha2-512" ([`RSA_SHA2_512`])
//! - "ssh-rsa" ([`SSH_RSA_SHA1`])
use bytes::Bytes;
use derivative::Derivative;
use std::fmt;
use crate::codec::Buffer;
use crate::error::{Result, Error};
pub use self::ecdsa::{ECDSA_SHA2_NISTP256, ECDSA_SHA2_NISTP384, EcdsaP256Pubkey, EcdsaP384Pubkey};
pub use self::ed25519::{SSH_ED25519, Ed25519Pubkey};
pub use self::rsa::{SSH_RSA_SHA1, RSA_SHA2_256, RSA_SHA2_512, RsaPubkey};

mod ecdsa;
mod ed25519;
mod rsa;

/// Algorithm for public key cryptography.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PubkeyAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    #[derivative(Debug = "ignore")]
    pub(crate) verify: fn(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified>,
}

/// Public key in one of supported formats.
///
/// This enum is marked as `#[non_exhaustive]`, so we might add new variants without breaking
/// backwards compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Pubkey {
    /// Ed25519 public key.
    Ed25519(Ed25519Pubkey),
    /// RSA public key.
    Rsa(RsaPubkey),
    /// ECDSA public key on NIST P-256 curve.
    EcdsaP256(EcdsaP256Pubkey),
    /// ECDSA public key on NIST P-384 curve.
    EcdsaP384(EcdsaP384Pubkey),
}

impl Pubkey {
    /// Decode a public key from SSH wire encoding (RFC 4253, section 6.6).
    pub fn decode(blob: Bytes) -> Result<Self> {
        let mut blob = Buffer::from(blob);
        let format = blob.get_string()?;
        match format.as_str() {
            "ssh-ed25519" => ed25519::decode_pubkey(&mut blob).map(Pubkey::Ed25519),
            "ssh-rsa" => rsa::decode_pubkey(&mut blob).map(Pubkey::Rsa),
            "ecdsa-sha2-nistp256" => ecdsa::decode_p256(&mut blob).map(Pubkey::EcdsaP256),
            "ecdsa-sha2-nistp384" => ecdsa::decode_p384(&mut blob).map(Pubkey::EcdsaP384),
            _ => {
                log::debug!("unknown pubkey format {:?}", format);
                Err(Error::Protocol("unknown public key format"))
            },
        }
    }

    /// Encode the public key into SSH wire encoding.
    pub fn encode(&self) -> Bytes {
        let mut blob = Buffer::new();
        match self {
            Pubkey::Ed25519(pubkey) => ed25519::encode_pubkey(&mut blob, pubkey),
            Pubkey::Rsa(pubkey) => rsa::encode_pubkey(&mut blob, pubkey),
            Pubkey::EcdsaP256(pubkey) => ecdsa::encode_p256(&mut blob, pubkey),
            Pubkey::EcdsaP384(pubkey) => ecdsa::encode_p384(&mut blob, pubkey),
        }
        blob.finish()
    }

    /// Name of the key type, as used in the wire encoding.
    pub fn type_name(&self) -> &'static str {
        match self {
            Pubkey::Ed25519(_) => "ssh-ed25519",
            Pubkey::Rsa(_) => "ssh-rsa",
            Pubkey::EcdsaP256(_) => "ecdsa-sha2-nistp256",
            Pubkey::EcdsaP384(_) => "ecdsa-sha2-nistp384",
        }
    }

    /// Compute a fingerprint of the public key.
    ///
    /// The fingerprint is the SHA-256 digest of the encoded key in base64 (not padded with `=`
    /// characters), prefixed with `SHA256:`, in the same format that OpenSSH uses.
    pub fn fingerprint(&self) -> String {
        use base64::Engine as _;
        use sha2::Digest as _;
        let digest = sha2::Sha256::digest(self.encode());
        format!("SHA256:{}", base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest))
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.type_name(), self.fingerprint())
    }
}

#[derive(Debug)]
pub(crate) struct SignatureVerified(());

impl SignatureVerified {
    fn assertion() -> Self { Self(()) }
}

/// Reads the signature blob header and checks that it matches the algorithm.
fn decode_signature(signature: Bytes, algo_name: &str) -> Result<Buffer> {
    let mut signature = Buffer::from(signature);
    if signature.get_string()? != algo_name {
        return Err(Error::Signature)
    }
    Ok(signature)
}
