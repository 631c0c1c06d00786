use std::mem::size_of;

use Error::BufferTooSmall;

use crate::error::Error;
use crate::error::Error::UnexpectedEndOfData;

/// A positioned cursor over a byte buffer that provides similar ergonomics to
/// Bytes/Buf while having a simplified interface and avoiding allocations.
///
/// All multi-byte accessors are big-endian; Marathon has no little-endian
/// fields on the wire.
pub struct ParseCursor<'a> {
    data: &'a mut [u8],
    position: usize,
}

impl<'a> ParseCursor<'a> {
    #[inline]
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, position: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Get a single byte, advancing the cursor
    #[inline]
    pub fn get_u8(&mut self) -> u8 {
        let value = self.data[self.position];
        self.position += 1;
        value
    }

    /// Try to get a single byte, advancing the cursor
    #[inline]
    pub fn try_get_u8(&mut self) -> Result<u8, Error> {
        if !self.has_remaining() {
            return Err(UnexpectedEndOfData(1, 0));
        }
        Ok(self.get_u8())
    }

    /// Get an u16 in big-endian format, advancing the cursor
    #[inline]
    pub fn get_u16(&mut self) -> u16 {
        const SIZE: usize = size_of::<u16>();

        let bytes = &self.data[self.position..self.position + SIZE];
        let value = u16::from_be_bytes([bytes[0], bytes[1]]);
        self.position += SIZE;
        value
    }

    /// Try to get an u16 in big-endian format, advancing the cursor
    #[inline]
    pub fn try_get_u16(&mut self) -> Result<u16, Error> {
        const SIZE: usize = size_of::<u16>();

        if self.remaining() < SIZE {
            return Err(UnexpectedEndOfData(SIZE, self.remaining()));
        }

        Ok(self.get_u16())
    }

    /// Get an u32 in big-endian format, advancing the cursor
    #[inline]
    pub fn get_u32(&mut self) -> u32 {
        const SIZE: usize = size_of::<u32>();

        let bytes = &self.data[self.position..self.position + SIZE];
        let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.position += SIZE;
        value
    }

    /// Try to get an u32 in big-endian format, advancing the cursor
    #[inline]
    pub fn try_get_u32(&mut self) -> Result<u32, Error> {
        const SIZE: usize = size_of::<u32>();

        if self.remaining() < SIZE {
            return Err(UnexpectedEndOfData(SIZE, self.remaining()));
        }

        Ok(self.get_u32())
    }

    /// Get an u64 in big-endian format, advancing the cursor
    #[inline]
    pub fn get_u64(&mut self) -> u64 {
        const SIZE: usize = size_of::<u64>();

        let bytes = &self.data[self.position..self.position + SIZE];
        let value = u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        self.position += SIZE;
        value
    }

    /// Try to get an u64 in big-endian format, advancing the cursor
    #[inline]
    pub fn try_get_u64(&mut self) -> Result<u64, Error> {
        const SIZE: usize = size_of::<u64>();

        if self.remaining() < SIZE {
            return Err(UnexpectedEndOfData(SIZE, self.remaining()));
        }

        Ok(self.get_u64())
    }

    /// Try to get an i64 in big-endian format, advancing the cursor
    #[inline]
    pub fn try_get_i64(&mut self) -> Result<i64, Error> {
        Ok(self.try_get_u64()? as i64)
    }

    /// Get a fixed-size array from the cursor, advancing by N bytes.
    /// This method allows the compiler to optimize bounds checks away in many cases.
    #[inline]
    pub fn get_fixed<const N: usize>(&mut self) -> [u8; N] {
        let mut result = [0u8; N];
        result.copy_from_slice(&self.data[self.position..self.position + N]);
        self.position += N;
        result
    }

    /// Try to get a fixed-size array from the cursor, advancing by N bytes.
    #[inline]
    pub fn try_get_fixed<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        if self.remaining() < N {
            return Err(UnexpectedEndOfData(N, self.remaining()));
        }
        Ok(self.get_fixed())
    }

    /// Transfer bytes from `self` into `dst`, advancing the cursor by the number of bytes read.
    #[inline]
    pub fn try_copy_to_slice(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        if self.remaining() < dst.len() {
            return Err(UnexpectedEndOfData(dst.len(), self.remaining()));
        }
        dst.copy_from_slice(&self.data[self.position..self.position + dst.len()]);
        self.position += dst.len();
        Ok(())
    }

    /// Take `n` bytes from the cursor into an owned `Vec`, advancing by `n`.
    #[inline]
    pub fn try_get_vec(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        if self.remaining() < n {
            return Err(UnexpectedEndOfData(n, self.remaining()));
        }
        let value = self.data[self.position..self.position + n].to_vec();
        self.position += n;
        Ok(value)
    }

    /// Write a single byte, advancing the cursor
    #[inline]
    pub fn put_u8(&mut self, value: u8) {
        self.data[self.position] = value;
        self.position += 1;
    }

    /// Try to write a single byte, advancing the cursor
    #[inline]
    pub fn try_put_u8(&mut self, value: u8) -> Result<(), Error> {
        if !self.has_remaining() {
            return Err(BufferTooSmall(1, 0));
        }
        self.put_u8(value);
        Ok(())
    }

    /// Write a u16 in big-endian format, advancing the cursor
    #[inline]
    pub fn put_u16(&mut self, value: u16) {
        let bytes = value.to_be_bytes();
        self.data[self.position..self.position + 2].copy_from_slice(&bytes);
        self.position += 2;
    }

    /// Try to write a u16 in big-endian format, advancing the cursor
    #[inline]
    pub fn try_put_u16(&mut self, value: u16) -> Result<(), Error> {
        const SIZE: usize = size_of::<u16>();
        if self.remaining() < SIZE {
            return Err(BufferTooSmall(SIZE, self.remaining()));
        }
        self.put_u16(value);
        Ok(())
    }

    /// Write a u32 in big-endian format, advancing the cursor
    #[inline]
    pub fn put_u32(&mut self, value: u32) {
        let bytes = value.to_be_bytes();
        self.data[self.position..self.position + 4].copy_from_slice(&bytes);
        self.position += 4;
    }

    /// Try to write a u32 in big-endian format, advancing the cursor
    #[inline]
    pub fn try_put_u32(&mut self, value: u32) -> Result<(), Error> {
        const SIZE: usize = size_of::<u32>();
        if self.remaining() < SIZE {
            return Err(BufferTooSmall(SIZE, self.remaining()));
        }
        self.put_u32(value);
        Ok(())
    }

    /// Write a u64 in big-endian format, advancing the cursor
    #[inline]
    pub fn put_u64(&mut self, value: u64) {
        let bytes = value.to_be_bytes();
        self.data[self.position..self.position + 8].copy_from_slice(&bytes);
        self.position += 8;
    }

    /// Try to write a u64 in big-endian format, advancing the cursor
    #[inline]
    pub fn try_put_u64(&mut self, value: u64) -> Result<(), Error> {
        const SIZE: usize = size_of::<u64>();
        if self.remaining() < SIZE {
            return Err(BufferTooSmall(SIZE, self.remaining()));
        }
        self.put_u64(value);
        Ok(())
    }

    /// Try to write an i64 in big-endian format, advancing the cursor
    #[inline]
    pub fn try_put_i64(&mut self, value: i64) -> Result<(), Error> {
        self.try_put_u64(value as u64)
    }

    /// Put a fixed-size array into the cursor, advancing by N bytes.
    #[inline]
    pub fn put_fixed<const N: usize>(&mut self, data: &[u8; N]) {
        self.data[self.position..self.position + N].copy_from_slice(data);
        self.position += N;
    }

    /// Try to put a fixed-size array into the cursor, advancing by N bytes.
    #[inline]
    pub fn try_put_fixed<const N: usize>(&mut self, data: &[u8; N]) -> Result<(), Error> {
        if self.remaining() < N {
            return Err(BufferTooSmall(N, self.remaining()));
        }
        self.put_fixed(data);
        Ok(())
    }

    /// Transfer bytes from `src` into `self` advancing the cursor by the number of bytes written.
    ///
    /// Panics if `self` does not have enough remaining capacity to contain all of `src`.
    #[inline]
    pub fn put_slice(&mut self, src: &[u8]) {
        self.data[self.position..self.position + src.len()].copy_from_slice(src);
        self.position += src.len();
    }

    /// Transfer bytes from `src` into `self` advancing the cursor by the number of bytes written.
    ///
    /// Returns `BufferTooSmall` if `self` does not have enough remaining capacity to contain all
    /// of `src`.
    #[inline]
    pub fn try_put_slice(&mut self, src: &[u8]) -> Result<(), Error> {
        if self.remaining() < src.len() {
            return Err(BufferTooSmall(src.len(), self.remaining()));
        }
        self.put_slice(src);
        Ok(())
    }

    /// Returns a slice of the remaining data without advancing the cursor
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.position..]
    }

    /// Advance the cursor by `n` bytes
    #[inline]
    pub fn advance(&mut self, n: usize) -> Result<(), Error> {
        if self.remaining() < n {
            return Err(UnexpectedEndOfData(n, self.remaining()));
        }
        self.position += n;
        Ok(())
    }

    /// Reset the cursor to the beginning
    #[inline]
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Get the current position
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Set the current position
    #[inline]
    pub fn set_position(&mut self, pos: usize) {
        self.position = pos;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_widths_are_big_endian() {
        let mut data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut cursor = ParseCursor::new(&mut data);

        assert_eq!(cursor.try_get_u16().unwrap(), 0x0102);
        assert_eq!(cursor.try_get_u32().unwrap(), 0x03040506);
        assert_eq!(cursor.remaining(), 2);
        assert_eq!(cursor.try_get_u8().unwrap(), 0x07);
    }

    #[test]
    fn read_past_end_is_an_error() {
        let mut data = [0x01, 0x02];
        let mut cursor = ParseCursor::new(&mut data);

        assert!(cursor.try_get_u32().is_err());
    }

    #[test]
    fn write_widths_are_big_endian() {
        let mut data = [0u8; 12];
        {
            let mut cursor = ParseCursor::new(&mut data);
            cursor.put_u32(0x12345678);
            assert_eq!(cursor.position(), 4);
            cursor.put_u64(0x1122334455667788);
            assert_eq!(cursor.position(), 12);
        }
        assert_eq!(&data[0..4], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&data[4..12], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
    }

    #[test]
    fn write_past_end_is_an_error() {
        let mut data = [0u8; 2];
        let mut cursor = ParseCursor::new(&mut data);

        assert!(cursor.try_put_u32(0x12345678).is_err());
    }

    #[test]
    fn fixed_and_vec_round_trip() {
        let mut data = [0u8; 8];
        {
            let mut cursor = ParseCursor::new(&mut data);
            cursor.put_fixed(&[0xaa, 0xbb, 0xcc, 0xdd]);
            cursor.put_slice(&[0x01, 0x02, 0x03, 0x04]);
        }

        let mut cursor = ParseCursor::new(&mut data);
        assert_eq!(cursor.try_get_fixed::<4>().unwrap(), [0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(cursor.try_get_vec(4).unwrap(), vec![0x01, 0x02, 0x03, 0x04]);
        assert!(!cursor.has_remaining());
    }

    #[test]
    fn i64_round_trip() {
        let mut data = [0u8; 8];
        {
            let mut cursor = ParseCursor::new(&mut data);
            cursor.try_put_i64(-42).unwrap();
        }
        let mut cursor = ParseCursor::new(&mut data);
        assert_eq!(cursor.try_get_i64().unwrap(), -42);
    }
}
