//! # Key and Value Serializer Traits
//!
//! The bucket layouts store keys and values as raw bytes and only decode on
//! demand. These traits describe everything a bucket needs to know about an
//! encoding:
//!
//! - the size an object will occupy before writing it (`serialized_size`)
//! - how to write it into a caller-positioned buffer (`write_to`)
//! - how to read it back (`read_from`)
//! - how large an already-encoded object is (`size_in_buffer`), so raw
//!   entries can be sliced out of a bucket without decoding
//!
//! Values additionally declare `FIXED_LENGTH`. The bonsai variant packs many
//! buckets into one page and requires fixed-length values; the standard
//! variant handles either and stores a link flag byte in front of the value.
//!
//! ## Encoding Conventions
//!
//! All multi-byte integers are little-endian, matching the bucket headers.
//! `String` is `[len: i32][utf8 bytes]`. Decoding checks buffer bounds and
//! UTF-8 validity; a short buffer is a corruption symptom and is reported as
//! an error, never a panic.

use eyre::{bail, ensure, Result};

/// An orderable key type with a self-describing binary encoding.
pub trait TreeKey: Ord + Clone {
    /// Stable one-byte serializer id, recorded in bucket headers for
    /// compatibility and never consulted on read.
    const SERIALIZER_ID: u8;

    fn serialized_size(&self) -> usize;

    /// Writes the encoding into `buf`, which is exactly `serialized_size`
    /// bytes long.
    fn write_to(&self, buf: &mut [u8]);

    /// Decodes one object from the front of `buf`.
    fn read_from(buf: &[u8]) -> Result<Self>;

    /// Reports the encoded size of the object at the front of `buf` without
    /// decoding it.
    fn size_in_buffer(buf: &[u8]) -> Result<usize>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.serialized_size()];
        self.write_to(&mut buf);
        buf
    }
}

/// A value type with a self-describing binary encoding.
pub trait TreeValue: Clone {
    /// Stable one-byte serializer id, recorded in bucket headers.
    const SERIALIZER_ID: u8;

    /// `Some(n)` if every value of this type encodes to exactly `n` bytes.
    /// The bonsai tree refuses value types where this is `None`.
    const FIXED_LENGTH: Option<usize>;

    fn serialized_size(&self) -> usize;

    fn write_to(&self, buf: &mut [u8]);

    fn read_from(buf: &[u8]) -> Result<Self>;

    fn size_in_buffer(buf: &[u8]) -> Result<usize>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.serialized_size()];
        self.write_to(&mut buf);
        buf
    }
}

macro_rules! fixed_int_key {
    ($ty:ty, $id:expr, $width:expr) => {
        impl TreeKey for $ty {
            const SERIALIZER_ID: u8 = $id;

            fn serialized_size(&self) -> usize {
                $width
            }

            fn write_to(&self, buf: &mut [u8]) {
                buf[..$width].copy_from_slice(&self.to_le_bytes());
            }

            fn read_from(buf: &[u8]) -> Result<Self> {
                ensure!(
                    buf.len() >= $width,
                    "buffer too small for {}: {} < {}",
                    stringify!($ty),
                    buf.len(),
                    $width
                );
                Ok(<$ty>::from_le_bytes(buf[..$width].try_into().unwrap()))
            }

            fn size_in_buffer(_buf: &[u8]) -> Result<usize> {
                Ok($width)
            }
        }
    };
}

macro_rules! fixed_int_value {
    ($ty:ty, $id:expr, $width:expr) => {
        impl TreeValue for $ty {
            const SERIALIZER_ID: u8 = $id;
            const FIXED_LENGTH: Option<usize> = Some($width);

            fn serialized_size(&self) -> usize {
                $width
            }

            fn write_to(&self, buf: &mut [u8]) {
                buf[..$width].copy_from_slice(&self.to_le_bytes());
            }

            fn read_from(buf: &[u8]) -> Result<Self> {
                ensure!(
                    buf.len() >= $width,
                    "buffer too small for {}: {} < {}",
                    stringify!($ty),
                    buf.len(),
                    $width
                );
                Ok(<$ty>::from_le_bytes(buf[..$width].try_into().unwrap()))
            }

            fn size_in_buffer(_buf: &[u8]) -> Result<usize> {
                Ok($width)
            }
        }
    };
}

fixed_int_key!(i32, 1, 4);
fixed_int_key!(i64, 2, 8);
fixed_int_key!(u64, 3, 8);

fixed_int_value!(i32, 1, 4);
fixed_int_value!(i64, 2, 8);
fixed_int_value!(u64, 3, 8);

const STRING_SERIALIZER_ID: u8 = 10;

fn string_size_in_buffer(buf: &[u8]) -> Result<usize> {
    ensure!(
        buf.len() >= 4,
        "buffer too small for string length prefix: {}",
        buf.len()
    );
    let len = i32::from_le_bytes(buf[..4].try_into().unwrap());
    if len < 0 {
        bail!("negative string length {} in buffer", len);
    }
    Ok(4 + len as usize)
}

impl TreeKey for String {
    const SERIALIZER_ID: u8 = STRING_SERIALIZER_ID;

    fn serialized_size(&self) -> usize {
        4 + self.len()
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&(self.len() as i32).to_le_bytes());
        buf[4..4 + self.len()].copy_from_slice(self.as_bytes());
    }

    fn read_from(buf: &[u8]) -> Result<Self> {
        let total = string_size_in_buffer(buf)?;
        ensure!(
            buf.len() >= total,
            "string extends beyond buffer: need {}, have {}",
            total,
            buf.len()
        );
        let s = std::str::from_utf8(&buf[4..total])
            .map_err(|e| eyre::eyre!("invalid utf-8 in stored string: {}", e))?;
        Ok(s.to_owned())
    }

    fn size_in_buffer(buf: &[u8]) -> Result<usize> {
        string_size_in_buffer(buf)
    }
}

impl TreeValue for String {
    const SERIALIZER_ID: u8 = STRING_SERIALIZER_ID;
    const FIXED_LENGTH: Option<usize> = None;

    fn serialized_size(&self) -> usize {
        4 + self.len()
    }

    fn write_to(&self, buf: &mut [u8]) {
        TreeKey::write_to(self, buf)
    }

    fn read_from(buf: &[u8]) -> Result<Self> {
        TreeKey::read_from(buf)
    }

    fn size_in_buffer(buf: &[u8]) -> Result<usize> {
        string_size_in_buffer(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i32_round_trip() {
        let mut buf = [0u8; 4];
        TreeKey::write_to(&-77i32, &mut buf);

        assert_eq!(<i32 as TreeKey>::read_from(&buf).unwrap(), -77);
        assert_eq!(<i32 as TreeKey>::size_in_buffer(&buf).unwrap(), 4);
    }

    #[test]
    fn i64_value_is_fixed_length() {
        assert_eq!(<i64 as TreeValue>::FIXED_LENGTH, Some(8));

        let mut buf = [0u8; 8];
        TreeValue::write_to(&0x1122_3344_5566_7788i64, &mut buf);
        assert_eq!(
            <i64 as TreeValue>::read_from(&buf).unwrap(),
            0x1122_3344_5566_7788
        );
    }

    #[test]
    fn i32_encoding_is_little_endian() {
        let mut buf = [0u8; 4];
        TreeKey::write_to(&0x0A0B0C0Di32, &mut buf);

        assert_eq!(buf, [0x0D, 0x0C, 0x0B, 0x0A]);
    }

    #[test]
    fn string_round_trip() {
        let s = "bucket".to_owned();
        let bytes = TreeKey::to_bytes(&s);

        assert_eq!(bytes.len(), 10);
        assert_eq!(<String as TreeKey>::size_in_buffer(&bytes).unwrap(), 10);
        assert_eq!(<String as TreeKey>::read_from(&bytes).unwrap(), s);
    }

    #[test]
    fn string_is_not_fixed_length() {
        assert_eq!(<String as TreeValue>::FIXED_LENGTH, None);
    }

    #[test]
    fn string_decode_rejects_truncated_buffer() {
        let bytes = TreeKey::to_bytes(&"hello".to_owned());

        let result = <String as TreeKey>::read_from(&bytes[..6]);
        assert!(result.is_err());
    }

    #[test]
    fn string_decode_rejects_negative_length() {
        let mut bytes = vec![0u8; 8];
        bytes[..4].copy_from_slice(&(-4i32).to_le_bytes());

        assert!(<String as TreeKey>::size_in_buffer(&bytes).is_err());
    }

    #[test]
    fn size_in_buffer_ignores_trailing_bytes() {
        let mut buf = vec![0u8; 32];
        TreeKey::write_to(&9i64, &mut buf[..8]);

        assert_eq!(<i64 as TreeKey>::size_in_buffer(&buf).unwrap(), 8);
    }
}
