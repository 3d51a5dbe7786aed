use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::cipher::generic_array::GenericArray;
use crate::error::{Error, Result};
use super::{CipherAlgo, Encrypt, Decrypt};

/// "aes128-cbc" cipher from RFC 4253.
pub static AES128_CBC: CipherAlgo = CipherAlgo {
    name: "aes128-cbc",
    block_len: 16,
    key_len: 16,
    iv_len: 16,
    make_encrypt: |key, iv| Ok(Box::new(BlockEncrypt {
        encrypt: new_cbc::<cbc::Encryptor<aes::Aes128>>(key, iv)?,
    })),
    make_decrypt: |key, iv| Ok(Box::new(BlockDecrypt {
        decrypt: new_cbc::<cbc::Decryptor<aes::Aes128>>(key, iv)?,
    })),
};

/// "aes256-cbc" cipher from RFC 4253.
pub static AES256_CBC: CipherAlgo = CipherAlgo {
    name: "aes256-cbc",
    block_len: 16,
    key_len: 32,
    iv_len: 16,
    make_encrypt: |key, iv| Ok(Box::new(BlockEncrypt {
        encrypt: new_cbc::<cbc::Encryptor<aes::Aes256>>(key, iv)?,
    })),
    make_decrypt: |key, iv| Ok(Box::new(BlockDecrypt {
        decrypt: new_cbc::<cbc::Decryptor<aes::Aes256>>(key, iv)?,
    })),
};

struct BlockEncrypt<T> {
    encrypt: T,
}

struct BlockDecrypt<T> {
    decrypt: T,
}

fn new_cbc<T: KeyIvInit>(key: &[u8], iv: &[u8]) -> Result<T> {
    T::new_from_slices(key, iv).map_err(|_| Error::Crypto("invalid key or iv length for cbc cipher"))
}

impl<T: BlockEncryptMut> Encrypt for BlockEncrypt<T> {
    fn encrypt(&mut self, data: &mut [u8]) {
        debug_assert!(data.len() % 16 == 0, "plaintext is not aligned to block");
        for block in data.chunks_exact_mut(16) {
            self.encrypt.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

impl<T: BlockDecryptMut> Decrypt for BlockDecrypt<T> {
    fn decrypt(&mut self, data: &mut [u8]) {
        debug_assert!(data.len() % 16 == 0, "ciphertext is not aligned to block");
        for block in data.chunks_exact_mut(16) {
            self.decrypt.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}
