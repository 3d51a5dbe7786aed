//! Packet authentication (MAC) algorithms.
//!
//! Every packet carries a tag computed with a keyed MAC over the packet sequence number and the
//! packet, so an attacker on the wire cannot alter or reorder packets unnoticed. The keys come
//! from the key exchange.
//!
//! The algorithm for each direction is the first one from [`ClientConfig::mac_algos`] that the
//! server also offers.
//!
//! [`ClientConfig::mac_algos`]: crate::ClientConfig::mac_algos
//!
//! # Supported algorithms
//!
//! | Name | Constant |
//! | --- | --- |
//! | `hmac-sha2-256` | [`HMAC_SHA2_256`] |
//! | `hmac-sha2-512` | [`HMAC_SHA2_512`] |
//! | `hmac-sha1` | [`HMAC_SHA1`] |
//! | `hmac-sha2-256-etm@openssh.com` | [`HMAC_SHA2_256_ETM`] |
//! | `hmac-sha2-512-etm@openssh.com` | [`HMAC_SHA2_512_ETM`] |
//! | `hmac-sha1-etm@openssh.com` | [`HMAC_SHA1_ETM`] |
//! | `none` | [`NONE`] |
use derivative::Derivative;
use crate::Result;
pub use self::hmac::{
    HMAC_SHA2_256, HMAC_SHA2_512, HMAC_SHA1,
    HMAC_SHA2_256_ETM, HMAC_SHA2_512_ETM, HMAC_SHA1_ETM,
};
pub use self::none::NONE;

mod hmac;
pub(crate) mod none;

/// A MAC algorithm that can be offered during negotiation.
///
/// The list of available algorithms is in the [module documentation][self].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MacAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    pub(crate) tag_len: usize,
    pub(crate) key_len: usize,
    pub(crate) variant: MacAlgoVariant,
    #[derivative(Debug = "ignore")]
    pub(crate) make_mac: fn(key: &[u8]) -> Box<dyn Mac + Send>,
}

/// Whether the MAC is computed over the plaintext (RFC 4253) or over the ciphertext, with the
/// packet length sent in clear (OpenSSH "-etm" variants).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum MacAlgoVariant {
    EncryptAndMac,
    EncryptThenMac,
}

/// Keyed MAC for one direction of the connection.
pub(crate) trait Mac {
    fn sign(&mut self, packet_seq: u32, data: &[u8], tag: &mut [u8]);
    fn verify(&mut self, packet_seq: u32, data: &[u8], tag: &[u8]) -> Result<MacVerified>;
}

/// Proof that a packet passed MAC verification.
#[derive(Debug)]
pub(crate) struct MacVerified(());

impl MacVerified {
    pub fn assertion() -> Self {
        Self(())
    }
}
