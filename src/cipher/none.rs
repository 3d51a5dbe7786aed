use super::{CipherAlgo, Encrypt, Decrypt};

/// "none" cipher (no encryption).
///
/// This is the cipher in effect before the first key exchange completes.
pub static NONE: CipherAlgo = CipherAlgo {
    name: "none",
    block_len: 8,
    key_len: 0,
    iv_len: 0,
    make_encrypt: |_key, _iv| Ok(Box::new(Identity)),
    make_decrypt: |_key, _iv| Ok(Box::new(Identity)),
};

#[derive(Debug)]
pub(crate) struct Identity;

impl Encrypt for Identity {
    fn encrypt(&mut self, _data: &mut [u8]) {}
}

impl Decrypt for Identity {
    fn decrypt(&mut self, _data: &mut [u8]) {}
}
