use flate2::{FlushCompress, FlushDecompress};
use crate::error::{Error, Result};
use super::{CompressAlgo, Compress, Decompress};

/// "zlib" compression from RFC 4253.
pub static ZLIB: CompressAlgo = CompressAlgo {
    name: "zlib",
    delayed: false,
    make_compress: || Box::new(ZlibCompress::new()),
    make_decompress: || Box::new(ZlibDecompress::new()),
};

/// "zlib@openssh.com" compression, which is delayed until user authentication succeeds.
pub static ZLIB_OPENSSH: CompressAlgo = CompressAlgo {
    name: "zlib@openssh.com",
    delayed: true,
    make_compress: || Box::new(ZlibCompress::new()),
    make_decompress: || Box::new(ZlibDecompress::new()),
};

// a single payload cannot decompress to more than this (RFC 4253, section 6.1)
const MAX_DECOMPRESSED_LEN: usize = 256 * 1024;

struct ZlibCompress {
    inner: flate2::Compress,
}

impl ZlibCompress {
    fn new() -> Self {
        Self { inner: flate2::Compress::new(flate2::Compression::default(), true) }
    }
}

impl Compress for ZlibCompress {
    fn compress(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        // every payload ends with a partial flush, so that the peer can decompress it without
        // waiting for the next one
        let start_in = self.inner.total_in();
        loop {
            let consumed = (self.inner.total_in() - start_in) as usize;
            let out_len = out.len();
            out.reserve(data.len() - consumed + 64);
            self.inner.compress_vec(&data[consumed..], out, FlushCompress::Partial)?;
            let now_consumed = (self.inner.total_in() - start_in) as usize;
            if now_consumed == data.len() && out.len() < out.capacity() {
                return Ok(())
            }
            if now_consumed == consumed && out.len() == out_len {
                return Err(Error::Protocol("zlib compression made no progress"))
            }
        }
    }
}

struct ZlibDecompress {
    inner: flate2::Decompress,
}

impl ZlibDecompress {
    fn new() -> Self {
        Self { inner: flate2::Decompress::new(true) }
    }
}

impl Decompress for ZlibDecompress {
    fn decompress(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let start_in = self.inner.total_in();
        let start_len = out.len();
        loop {
            let consumed = (self.inner.total_in() - start_in) as usize;
            let out_len = out.len();
            out.reserve(2 * data.len() + 64);
            self.inner.decompress_vec(&data[consumed..], out, FlushDecompress::Sync)?;
            let now_consumed = (self.inner.total_in() - start_in) as usize;
            if out.len() - start_len > MAX_DECOMPRESSED_LEN {
                return Err(Error::Protocol("decompressed payload is too long"))
            }
            if now_consumed == data.len() && out.len() < out.capacity() {
                return Ok(())
            }
            if now_consumed == consumed && out.len() == out_len {
                return Err(Error::Protocol("zlib decompression made no progress"))
            }
        }
    }
}
