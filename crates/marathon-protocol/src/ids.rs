//! Opaque identifiers used throughout the platform. Identity is byte
//! equality; none of them carry structure beyond their fixed width.

use std::fmt::{Debug, Display, Formatter};

use crate::cursor::ParseCursor;
use crate::error::Error;
use crate::wire::{FromWire, ToWire};

fn write_hex(f: &mut Formatter<'_>, bytes: &[u8]) -> std::fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

macro_rules! make_id {
    ($name:ident, $size:literal, $label:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
        pub struct $name([u8; $size]);

        impl $name {
            pub const SIZE: usize = $size;

            pub fn new(bytes: [u8; $size]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $size] {
                &self.0
            }

            /// Parse from a lower-hex string, the form `Display` produces.
            pub fn from_hex(hex: &str) -> Option<Self> {
                if hex.len() != $size * 2 {
                    return None;
                }

                let mut bytes = [0u8; $size];
                for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
                    let digits = std::str::from_utf8(chunk).ok()?;
                    bytes[i] = u8::from_str_radix(digits, 16).ok()?;
                }
                Some(Self(bytes))
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}(", $label)?;
                write_hex(f, &self.0[..8.min($size)])?;
                if $size > 8 {
                    write!(f, "\u{2026}")?;
                }
                write!(f, ")")
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write_hex(f, &self.0)
            }
        }

        impl From<[u8; $size]> for $name {
            fn from(bytes: [u8; $size]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl ToWire for $name {
            fn wire_size(&self) -> usize {
                $size
            }

            fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
                cursor.try_put_fixed(&self.0)
            }
        }

        impl FromWire for $name {
            fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
                Ok(Self(cursor.try_get_fixed()?))
            }
        }
    };
}

make_id!(TaskId, 32, "task");
make_id!(NodeId, 16, "node");
make_id!(VmId, 16, "vm");
make_id!(ClientId, 16, "client");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_exact;

    #[test]
    fn identity_is_byte_equality() {
        let a = TaskId::new([7u8; 32]);
        let b = TaskId::new([7u8; 32]);
        let c = TaskId::new([8u8; 32]);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn wire_form_is_raw_bytes() {
        let id = NodeId::new([0xab; 16]);
        let mut bytes = ToWire::as_bytes(&id).unwrap();
        assert_eq!(bytes, vec![0xab; 16]);

        let decoded = decode_exact::<NodeId>(&mut bytes).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn display_and_from_hex_round_trip() {
        let mut raw = [0u8; 32];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = i as u8;
        }
        let id = TaskId::new(raw);

        let hex = id.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(TaskId::from_hex(&hex), Some(id));
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert_eq!(TaskId::from_hex("abcd"), None);
        assert_eq!(VmId::from_hex(&"zz".repeat(16)), None);
    }

    #[test]
    fn debug_is_truncated() {
        let id = TaskId::new([0xff; 32]);
        let debug = format!("{id:?}");
        assert!(debug.starts_with("task(ffffffffffffffff"));
        assert!(debug.len() < 32);
    }
}
