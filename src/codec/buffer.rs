use bytes::Bytes;
use num_bigint_dig::{BigInt, BigUint, Sign};
use crate::error::{Error, Result};

/// Growable byte buffer with independent read and write cursors.
///
/// Writes append at the write cursor, reads consume from the read cursor. The encodings of SSH
/// primitive types follow RFC 4251, section 5. Reading past the write cursor fails with
/// [`Error::Underflow`], it never returns garbage.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    rpos: usize,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Buffer {
        Buffer { data: Vec::new(), rpos: 0 }
    }

    /// Creates an empty buffer that can hold `capacity` bytes without reallocation.
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer { data: Vec::with_capacity(capacity), rpos: 0 }
    }

    /// Creates a buffer with unread contents `data`.
    pub fn from_slice(data: &[u8]) -> Buffer {
        let mut buf = Buffer::with_capacity(data.len());
        buf.put_raw(data);
        buf
    }

    /// Number of bytes between the read and the write cursor.
    pub fn available(&self) -> usize {
        self.data.len() - self.rpos
    }

    /// True if there is nothing left to read.
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Position of the read cursor.
    pub fn rpos(&self) -> usize {
        self.rpos
    }

    /// Moves the read cursor. It cannot move past the write cursor.
    pub fn set_rpos(&mut self, rpos: usize) -> Result<()> {
        if rpos > self.data.len() {
            return Err(Error::Underflow("read cursor moved past the write cursor"))
        }
        self.rpos = rpos;
        Ok(())
    }

    /// Position of the write cursor.
    pub fn wpos(&self) -> usize {
        self.data.len()
    }

    /// Moves the write cursor. Moving it forward fills the gap with zeros, moving it backward
    /// discards the written data (and pulls the read cursor back if needed).
    pub fn set_wpos(&mut self, wpos: usize) {
        if wpos > self.data.len() {
            self.grow(wpos - self.data.len());
        }
        self.data.resize(wpos, 0);
        self.rpos = self.rpos.min(wpos);
    }

    /// Unread bytes.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.rpos..]
    }

    /// Unread bytes, mutably (used to decrypt data in place).
    pub fn unread_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.rpos..]
    }

    /// Shifts the unread bytes to offset 0, reclaiming the space of the bytes that were read.
    pub fn compact(&mut self) {
        if self.rpos > 0 {
            self.data.drain(..self.rpos);
            self.rpos = 0;
        }
    }

    /// Discards all data and resets both cursors.
    pub fn clear(&mut self) {
        self.data.clear();
        self.rpos = 0;
    }

    fn grow(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        if needed > self.data.capacity() {
            let new_cap = needed.next_power_of_two().max(64);
            self.data.reserve_exact(new_cap - self.data.len());
        }
    }

    /// Encode a `byte`.
    pub fn put_u8(&mut self, value: u8) {
        self.grow(1);
        self.data.push(value);
    }

    /// Encode a `boolean`.
    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    /// Encode a `uint32`.
    pub fn put_u32(&mut self, value: u32) {
        self.put_raw(&value.to_be_bytes());
    }

    /// Encode a `string` holding arbitrary bytes.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.grow(4 + value.len());
        self.put_u32(len_to_u32(value.len()));
        self.data.extend_from_slice(value);
    }

    /// Encode a `string` in UTF-8.
    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes())
    }

    /// Encode a `name-list`.
    pub fn put_name_list(&mut self, names: &[&str]) {
        self.put_str(&names.join(","))
    }

    /// Encode a `mpint` from a signed big integer in two's complement.
    pub fn put_mpint(&mut self, value: &BigInt) {
        match value.to_bytes_be() {
            (Sign::NoSign, _) => self.put_u32(0),
            (Sign::Plus, magnitude) => self.put_mpint_uint_be(&magnitude),
            (Sign::Minus, _) => {
                let bytes = value.to_signed_bytes_be();
                self.put_bytes(&bytes);
            },
        }
    }

    /// Encode a `mpint` from a non-negative big integer.
    pub fn put_biguint(&mut self, value: &BigUint) {
        self.put_mpint_uint_be(&value.to_bytes_be())
    }

    /// Encode a `mpint` from big-endian bytes of an unsigned integer.
    ///
    /// Leading zeros are stripped and a zero byte is prepended if the high bit of the first byte
    /// is set, so that the number is not interpreted as negative.
    pub fn put_mpint_uint_be(&mut self, value_be: &[u8]) {
        let first_nonzero = value_be.iter().position(|&b| b != 0).unwrap_or(value_be.len());
        let value_be = &value_be[first_nonzero..];
        if value_be.first().map_or(false, |&b| b & 0x80 != 0) {
            self.put_u32(len_to_u32(value_be.len() + 1));
            self.put_u8(0);
            self.put_raw(value_be);
        } else {
            self.put_bytes(value_be);
        }
    }

    /// Append raw bytes.
    pub fn put_raw(&mut self, data: &[u8]) {
        self.grow(data.len());
        self.data.extend_from_slice(data);
    }

    fn ensure(&self, len: usize) -> Result<()> {
        if self.available() >= len {
            Ok(())
        } else {
            Err(Error::Underflow("unexpected end of buffer"))
        }
    }

    /// Decode a `byte`.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_raw(1)?[0])
    }

    /// Decode a `boolean`.
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Decode a `uint32`.
    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes = self.get_raw(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Decode a `string` holding arbitrary bytes.
    pub fn get_bytes(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        if let Err(err) = self.ensure(len) {
            self.rpos -= 4;
            return Err(err)
        }
        Ok(Bytes::copy_from_slice(self.get_raw(len)?))
    }

    /// Decode a `string` that must be valid UTF-8.
    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Protocol("string is not valid UTF-8"))
    }

    /// Decode a `name-list`.
    pub fn get_name_list(&mut self) -> Result<Vec<String>> {
        let list = self.get_string()?;
        if list.is_empty() {
            return Ok(Vec::new())
        }
        Ok(list.split(',').map(|name| name.into()).collect())
    }

    /// Decode a `mpint` as a signed big integer.
    pub fn get_mpint(&mut self) -> Result<BigInt> {
        let bytes = self.get_bytes()?;
        Ok(BigInt::from_signed_bytes_be(&bytes))
    }

    /// Decode a `mpint` that must not be negative.
    pub fn get_biguint(&mut self) -> Result<BigUint> {
        let bytes = self.get_bytes()?;
        if bytes.first().map_or(false, |&b| b & 0x80 != 0) {
            return Err(Error::Protocol("expected non-negative mpint"))
        }
        Ok(BigUint::from_bytes_be(&bytes))
    }

    /// Decode a fixed-size `string`.
    pub fn get_byte_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.get_bytes()?;
        bytes.as_ref().try_into().map_err(|_| Error::Protocol("string has unexpected length"))
    }

    /// Consume `len` raw bytes.
    pub fn get_raw(&mut self, len: usize) -> Result<&[u8]> {
        self.ensure(len)?;
        let start = self.rpos;
        self.rpos += len;
        Ok(&self.data[start..self.rpos])
    }

    /// Skip `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.get_raw(len).map(|_| ())
    }

    /// Takes the unread bytes out of the buffer, leaving it empty.
    pub fn take_unread(&mut self) -> Bytes {
        let data = Bytes::copy_from_slice(self.unread());
        self.clear();
        data
    }

    /// Unwraps the unread bytes.
    pub fn finish(mut self) -> Bytes {
        if self.rpos == 0 {
            return Bytes::from(self.data)
        }
        self.take_unread()
    }
}

fn len_to_u32(len: usize) -> u32 {
    // the packet length is bounded far below 4 GiB by the codec, so this cannot overflow for
    // anything that ends up on the wire
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("rpos", &self.rpos)
            .field("wpos", &self.data.len())
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Buffer {
        Buffer { data: data.to_vec(), rpos: 0 }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Buffer {
        Buffer { data, rpos: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_uint32() {
        let mut b = Buffer::new();
        b.put_u32(10);
        b.put_u32(0xdeadbeef);
        assert_eq!(b.unread(), &[0,0,0,10, 0xde,0xad,0xbe,0xef]);
    }

    #[test]
    fn test_get_uint32() {
        let mut b = Buffer::from_slice(&[0,0,0,10, 0xde,0xad,0xbe,0xef, 1,2]);
        assert_eq!(b.get_u32().unwrap(), 10);
        assert_eq!(b.get_u32().unwrap(), 0xdeadbeef);
        assert!(matches!(b.get_u32(), Err(Error::Underflow(_))));
        assert_eq!(b.available(), 2);
    }

    #[test]
    fn test_put_string() {
        let mut b = Buffer::new();
        b.put_bytes(&[]);
        b.put_bytes(&[10, 20, 30]);
        b.put_str("ab");
        assert_eq!(b.unread(), &[0,0,0,0, 0,0,0,3,10,20,30, 0,0,0,2,b'a',b'b']);
    }

    #[test]
    fn test_get_string() {
        let mut b = Buffer::from_slice(&[0,0,0,3, b'f',b'o',b'o', 0,0,0,5, b'x']);
        assert_eq!(b.get_string().unwrap(), "foo");
        assert!(matches!(b.get_bytes(), Err(Error::Underflow(_))));
        // a failed read leaves the cursor where it was
        assert_eq!(b.available(), 5);

        let mut b = Buffer::from_slice(&[0,0,0,2, 0xff,0xfe]);
        assert!(matches!(b.get_string(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_name_list() {
        let mut b = Buffer::new();
        b.put_name_list(&[]);
        b.put_name_list(&["foo", "bar"]);
        assert_eq!(b.unread(), &[0,0,0,0, 0,0,0,7, b'f',b'o',b'o', b',', b'b',b'a',b'r']);
        assert_eq!(b.get_name_list().unwrap(), Vec::<String>::new());
        assert_eq!(b.get_name_list().unwrap(), vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn test_put_mpint() {
        fn check(value: i64, expected_bytes: &[u8]) {
            let mut b = Buffer::new();
            b.put_mpint(&BigInt::from(value));
            assert_eq!(b.unread(), expected_bytes, "encoding {}", value);
            assert_eq!(b.get_mpint().unwrap(), BigInt::from(value));
        }

        // examples from RFC 4251, section 5
        check(0, &[0,0,0,0]);
        check(0x80, &[0,0,0,2, 0x00,0x80]);
        check(-1234, &[0,0,0,2, 0xfb,0x2e]);
        check(-0xdeadbeef, &[0,0,0,5, 0xff,0x21,0x52,0x41,0x11]);
        check(0x7f, &[0,0,0,1, 0x7f]);
    }

    #[test]
    fn test_put_mpint_uint_be() {
        fn check(value_be: &[u8], expected_bytes: &[u8]) {
            let mut b = Buffer::new();
            b.put_mpint_uint_be(value_be);
            assert_eq!(b.unread(), expected_bytes);
        }

        check(&[], &[0,0,0,0]);
        check(&[0, 0], &[0,0,0,0]);
        check(&[0, 0x12, 0x34], &[0,0,0,2, 0x12,0x34]);
        check(&[0xff, 0x01], &[0,0,0,3, 0x00,0xff,0x01]);
    }

    #[test]
    fn test_get_biguint_rejects_negative() {
        let mut b = Buffer::from_slice(&[0,0,0,2, 0xfb,0x2e]);
        assert!(b.get_biguint().is_err());
        let mut b = Buffer::from_slice(&[0,0,0,2, 0x00,0x80]);
        assert_eq!(b.get_biguint().unwrap(), BigUint::from(0x80u32));
    }

    #[test]
    fn test_cursors_and_compact() {
        let mut b = Buffer::new();
        b.put_raw(&[1, 2, 3, 4, 5]);
        assert_eq!(b.get_raw(2).unwrap(), &[1, 2]);
        assert_eq!((b.rpos(), b.wpos()), (2, 5));

        b.compact();
        assert_eq!((b.rpos(), b.wpos()), (0, 3));
        assert_eq!(b.unread(), &[3, 4, 5]);

        b.set_wpos(5);
        assert_eq!(b.unread(), &[3, 4, 5, 0, 0]);
        b.set_wpos(1);
        assert_eq!(b.unread(), &[3]);
        assert!(b.set_rpos(2).is_err());
        b.set_rpos(1).unwrap();
        assert!(b.is_empty());
        assert!(matches!(b.get_u8(), Err(Error::Underflow(_))));
    }

    #[test]
    fn test_capacity_grows_geometrically() {
        let mut b = Buffer::new();
        let mut reallocs = 0;
        let mut capacity = b.data.capacity();
        for i in 0..10_000u32 {
            b.put_u32(i);
            if b.data.capacity() != capacity {
                capacity = b.data.capacity();
                assert!(capacity.is_power_of_two());
                reallocs += 1;
            }
        }
        assert!(reallocs <= 12, "reallocated {} times", reallocs);
    }

    #[test]
    fn test_finish() {
        let mut b = Buffer::new();
        b.put_u8(1);
        b.put_u8(2);
        b.get_u8().unwrap();
        assert_eq!(b.finish().as_ref(), &[2]);
    }
}
