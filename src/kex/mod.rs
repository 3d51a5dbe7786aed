//! Key exchange algorithms.
//!
//! The SSH protocol supports several key exchange (kex) algorithms, which are used to establish
//! the one-time keys used for message [encryption][crate::cipher] and
//! [authentication][crate::mac].
//!
//! The client and the server exchange lists of supported algorithms, and the first algorithm on
//! the client's list that is also supported by the server is used for the connection.
//!
//! # Supported algorithms
//!
//! - "curve25519-sha256" / "curve25519-sha256@libssh.com" ([`CURVE25519_SHA256`] /
//! [`CURVE25519_SHA256_LIBSSH`])
//! - "diffie-hellman-group14-sha1" ([`DIFFIE_HELLMAN_GROUP14_SHA1`])
//! - "diffie-hellman-group14-sha256" ([`DIFFIE_HELLMAN_GROUP14_SHA256`])
//! - "diffie-hellman-group16-sha512" ([`DIFFIE_HELLMAN_GROUP16_SHA512`])
use bytes::Bytes;
use derivative::Derivative;
use std::task::Poll;
use crate::Result;
use crate::codec::Buffer;
use crate::util::CryptoRngCore;
pub use self::curve25519::{CURVE25519_SHA256, CURVE25519_SHA256_LIBSSH};
pub use self::dh::{
    DIFFIE_HELLMAN_GROUP14_SHA1, DIFFIE_HELLMAN_GROUP14_SHA256, DIFFIE_HELLMAN_GROUP16_SHA512,
};

mod curve25519;
mod dh;

/// Algorithm for key exchange.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct KexAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    /// Starts one run of the exchange.
    #[derivative(Debug = "ignore")]
    pub make_kex: fn(rng: &mut dyn CryptoRngCore) -> Result<Box<dyn Kex + Send>>,
}

/// Transcript data that enter the exchange hash.
#[derive(Debug)]
#[allow(missing_docs)]
pub struct KexInput<'a> {
    pub client_ident: &'a [u8],
    pub server_ident: &'a [u8],
    pub client_kex_init: &'a [u8],
    pub server_kex_init: &'a [u8],
}

/// Result of a finished key exchange.
pub struct KexOutput {
    /// The shared secret `K` as a big-endian unsigned integer.
    pub shared_secret_be: Vec<u8>,
    /// The exchange hash `H`.
    pub exchange_hash: Vec<u8>,
    /// Encoded public host key of the server.
    pub server_pubkey: Bytes,
    /// Signature of `H` made by the server host key.
    pub server_exchange_hash_sign: Bytes,
}

/// One run of a key exchange algorithm.
///
/// The negotiator feeds the kex packets (message numbers 30 to 49) to
/// [`recv_packet()`][Kex::recv_packet], sends whatever [`send_packet()`][Kex::send_packet]
/// produces and calls [`poll()`][Kex::poll] until the exchange yields its output.
pub trait Kex {
    /// Handles a kex packet from the server; `payload` is positioned after the message id.
    fn recv_packet(&mut self, msg_id: u8, payload: &mut Buffer) -> Result<()>;
    /// Returns the next packet that should be sent to the server, if any.
    fn send_packet(&mut self) -> Result<Option<Bytes>>;
    /// Finishes the exchange once all packets have been received.
    fn poll(&mut self, input: KexInput) -> Poll<Result<KexOutput>>;
    /// The hash function used for the exchange hash and for key derivation.
    fn compute_hash(&self, data: &[u8]) -> Vec<u8>;
}

fn sha1_hash(data: &[u8]) -> Vec<u8> {
    use sha1::digest::Digest as _;
    sha1::Sha1::digest(data).to_vec()
}

fn sha256_hash(data: &[u8]) -> Vec<u8> {
    use sha2::digest::Digest as _;
    sha2::Sha256::digest(data).to_vec()
}

fn sha512_hash(data: &[u8]) -> Vec<u8> {
    use sha2::digest::Digest as _;
    sha2::Sha512::digest(data).to_vec()
}
