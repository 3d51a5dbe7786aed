use crate::Result;
use super::{CompressAlgo, Compress, Decompress};

/// "none" compression.
pub static NONE: CompressAlgo = CompressAlgo {
    name: "none",
    delayed: false,
    make_compress: || Box::new(Identity),
    make_decompress: || Box::new(Identity),
};

#[derive(Debug)]
pub(crate) struct Identity;

impl Compress for Identity {
    fn compress(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(data);
        Ok(())
    }
}

impl Decompress for Identity {
    fn decompress(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(data);
        Ok(())
    }
}
