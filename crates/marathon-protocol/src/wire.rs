//! Serialization traits and the primitive shapes every payload is built from.
//!
//! The encoding is recursive over the declared shape of a message, all widths
//! big-endian:
//!
//! - fixed-width integers at their natural width
//! - booleans as one byte (0 or 1)
//! - enums as their tag integer
//! - f32/f64 as the u32/u64 of their IEEE-754 bit pattern
//! - `Option<T>` as a one-byte presence flag, then `T` if present
//! - fixed byte arrays as raw bytes
//! - variable-length sequences as a u32 count then the items; a sequence of
//!   bytes is one contiguous block
//! - composites as their fields in declared order

use Error::{InvalidBool, InvalidUtf8, LengthOverflow};

use crate::cursor::ParseCursor;
use crate::error::Error;

/// Largest single variable-length field we will decode. Anything bigger is a
/// protocol error, not a legitimate payload.
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Implementations can serialize themselves into the Marathon wire format.
pub trait ToWire {
    fn wire_size(&self) -> usize;
    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error>;

    /// Convenience method to serialize this value into a new `Vec<u8>`.
    ///
    /// In performance-critical cases consider `to_wire` instead.
    fn as_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; self.wire_size()];
        let mut cursor = ParseCursor::new(&mut buf);
        self.to_wire(&mut cursor)?;
        Ok(buf)
    }
}

pub trait FromWire: Sized {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error>;
}

/// Decode a `T` from `bytes`, requiring that the value consumes the buffer
/// exactly. Used for frame payloads where `payload_len` declares the size.
pub fn decode_exact<T: FromWire>(bytes: &mut [u8]) -> Result<T, Error> {
    let mut cursor = ParseCursor::new(bytes);
    let value = T::from_wire(&mut cursor)?;

    if cursor.has_remaining() {
        return Err(Error::TrailingBytes(cursor.remaining()));
    }

    Ok(value)
}

macro_rules! int_wire {
    ($ty:ty, $get:ident, $put:ident) => {
        impl ToWire for $ty {
            fn wire_size(&self) -> usize {
                size_of::<$ty>()
            }

            fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
                cursor.$put(*self)
            }
        }

        impl FromWire for $ty {
            fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
                cursor.$get()
            }
        }
    };
}

int_wire!(u8, try_get_u8, try_put_u8);
int_wire!(u16, try_get_u16, try_put_u16);
int_wire!(u32, try_get_u32, try_put_u32);
int_wire!(u64, try_get_u64, try_put_u64);
int_wire!(i64, try_get_i64, try_put_i64);

impl ToWire for bool {
    fn wire_size(&self) -> usize {
        1
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_u8(*self as u8)
    }
}

impl FromWire for bool {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        match cursor.try_get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(InvalidBool(other)),
        }
    }
}

impl ToWire for f32 {
    fn wire_size(&self) -> usize {
        4
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_u32(self.to_bits())
    }
}

impl FromWire for f32 {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(f32::from_bits(cursor.try_get_u32()?))
    }
}

impl ToWire for f64 {
    fn wire_size(&self) -> usize {
        8
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_u64(self.to_bits())
    }
}

impl FromWire for f64 {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(f64::from_bits(cursor.try_get_u64()?))
    }
}

impl<T: ToWire> ToWire for Option<T> {
    fn wire_size(&self) -> usize {
        match self {
            Some(value) => 1 + value.wire_size(),
            None => 1,
        }
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        match self {
            Some(value) => {
                cursor.try_put_u8(1)?;
                value.to_wire(cursor)
            }
            None => cursor.try_put_u8(0),
        }
    }
}

impl<T: FromWire> FromWire for Option<T> {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        match cursor.try_get_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::from_wire(cursor)?)),
            other => Err(InvalidBool(other)),
        }
    }
}

/// Byte sequences are a u32 count followed by one contiguous block. The
/// decoded vector owns its memory.
impl ToWire for Vec<u8> {
    fn wire_size(&self) -> usize {
        4 + self.len()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_u32(self.len() as u32)?;
        cursor.try_put_slice(self)
    }
}

impl FromWire for Vec<u8> {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        let len = cursor.try_get_u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(LengthOverflow(len, MAX_FIELD_LEN));
        }
        cursor.try_get_vec(len)
    }
}

/// Strings travel as their UTF-8 bytes; owned copies are taken on both sides.
impl ToWire for String {
    fn wire_size(&self) -> usize {
        4 + self.len()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_u32(self.len() as u32)?;
        cursor.try_put_slice(self.as_bytes())
    }
}

impl FromWire for String {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        let bytes = Vec::<u8>::from_wire(cursor)?;
        String::from_utf8(bytes).map_err(|_| InvalidUtf8)
    }
}

/// Wire size of a sequence of composite items: u32 count plus the items.
pub fn seq_wire_size<T: ToWire>(items: &[T]) -> usize {
    4 + items.iter().map(ToWire::wire_size).sum::<usize>()
}

/// Write a sequence of composite items: u32 count, then each item in order.
pub fn seq_to_wire<T: ToWire>(items: &[T], cursor: &mut ParseCursor) -> Result<(), Error> {
    cursor.try_put_u32(items.len() as u32)?;
    for item in items {
        item.to_wire(cursor)?;
    }
    Ok(())
}

/// Read a sequence of composite items. The declared count is sanity-checked
/// against the bytes actually remaining so a hostile count cannot trigger a
/// huge allocation.
pub fn seq_from_wire<T: FromWire>(cursor: &mut ParseCursor) -> Result<Vec<T>, Error> {
    let count = cursor.try_get_u32()? as usize;
    if count > cursor.remaining() {
        return Err(Error::UnexpectedEndOfData(count, cursor.remaining()));
    }

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::from_wire(cursor)?);
    }
    Ok(items)
}
