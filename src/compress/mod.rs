//! Compression algorithms.
//!
//! Compression is negotiated like the other algorithms. The "delayed" variant
//! "zlib@openssh.com" is only switched on after the user has authenticated successfully, so that
//! the traffic before authentication is never compressed.
//!
//! # Supported algorithms
//!
//! - "none" ([`NONE`])
//! - "zlib" ([`ZLIB`])
//! - "zlib@openssh.com" ([`ZLIB_OPENSSH`])
use derivative::Derivative;
use crate::Result;
pub use self::none::NONE;
pub use self::zlib::{ZLIB, ZLIB_OPENSSH};

pub(crate) mod none;
mod zlib;

/// Algorithm for compressing packet payloads.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CompressAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    /// True if the compression starts only after successful user authentication.
    pub delayed: bool,
    #[derivative(Debug = "ignore")]
    pub(crate) make_compress: fn() -> Box<dyn Compress + Send>,
    #[derivative(Debug = "ignore")]
    pub(crate) make_decompress: fn() -> Box<dyn Decompress + Send>,
}

/// Compresses one payload, appending the output to `out`.
///
/// The compression state is carried over between payloads for the whole lifetime of the
/// negotiated algorithm.
pub(crate) trait Compress {
    fn compress(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()>;
}

/// Decompresses one payload, appending the output to `out`.
pub(crate) trait Decompress {
    fn decompress(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()>;
}
