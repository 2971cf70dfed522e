//! # Cohort Proto
//!
//! Wire-level layer of the cohort group-RPC runtime.
//!
//! This crate defines the identifiers shared by every node in a group, the
//! fixed-layout request/reply header that prefixes every RPC buffer, and a
//! small flat serialization trait family used for argument and reply
//! payloads.
//!
//! ## Encoding rules
//!
//! Everything on this wire is little-endian at a fixed offset:
//!
//! - Integers are written in little-endian of their declared width.
//! - `bool` is a single byte (0 or 1).
//! - `String` and `Vec<T>` carry a `u32` length prefix.
//! - `Option<T>` and `Result<T, E>` carry a one-byte tag.
//! - `[T; N]` is its elements back to back with no prefix; the count is
//!   part of the type.
//! - Tuples and structs are their fields back to back, in declared order.
//!
//! The encoded size of any value is computable from the value alone via
//! [`WireSize::wire_size`], without a trial encode, which is what lets the
//! dispatch layer allocate exact-size outbound buffers.

use std::io::{Read, Write};

pub mod header;

pub use header::{
    Header, Opcode, FLAG_CASCADE, FLAG_MASK, FLAG_RESERVED, FunctionTag, HEADER_BYTES,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Deserialize error: {0}")]
    Deserialize(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
}

/// Declares a transparent wire-codable id newtype.
#[macro_export]
macro_rules! cohort_newtype {
    ($name:ident, $inner:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub $inner);

        impl From<$inner> for $name {
            fn from(val: $inner) -> Self {
                $name(val)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $crate::WireSize for $name {
            const SIZE: Option<usize> = Some(std::mem::size_of::<$inner>());
        }

        impl $crate::WireSerialize for $name {
            fn write_to<W: std::io::Write>(&self, writer: &mut W) -> $crate::Result<()> {
                $crate::WireSerialize::write_to(&self.0, writer)
            }
        }

        impl $crate::WireDeserialize for $name {
            fn read_from<R: std::io::Read>(reader: &mut R) -> $crate::Result<Self> {
                Ok($name(<$inner as $crate::WireDeserialize>::read_from(
                    reader,
                )?))
            }
        }
    };
}

cohort_newtype!(NodeId, u32, "Identifies a process in the group.");
cohort_newtype!(SubgroupId, u32, "Identifies a replica set within the group.");
cohort_newtype!(
    SubgroupTypeId,
    u32,
    "Identifies the replicated-object type owning a subgroup."
);
cohort_newtype!(ViewId, u32, "Monotonic number of an installed view.");

/// Exact encoded size of a value, computable without encoding it.
pub trait WireSize {
    /// `Some(n)` when every value of this type encodes to exactly `n` bytes.
    const SIZE: Option<usize> = None;

    /// True when the in-memory representation is exactly the one-byte wire
    /// encoding, so arrays of the type can be copied as a single block.
    const IS_BYTE: bool = false;

    fn wire_size(&self) -> usize {
        Self::SIZE.expect("wire_size called on a dynamically sized type")
    }
}

pub trait WireSerialize: WireSize {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()>;
}

pub trait WireDeserialize: Sized {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self>;
}

macro_rules! impl_wire_int {
    ($ty:ty) => {
        impl WireSize for $ty {
            const SIZE: Option<usize> = Some(std::mem::size_of::<$ty>());
        }
        impl WireSerialize for $ty {
            fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
                writer.write_all(&self.to_le_bytes()).map_err(Error::Io)
            }
        }
        impl WireDeserialize for $ty {
            fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                reader.read_exact(&mut buf).map_err(Error::Io)?;
                Ok(<$ty>::from_le_bytes(buf))
            }
        }
    };
}

impl WireSize for u8 {
    const SIZE: Option<usize> = Some(1);
    const IS_BYTE: bool = true;
}
impl WireSerialize for u8 {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[*self]).map_err(Error::Io)
    }
}
impl WireDeserialize for u8 {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).map_err(Error::Io)?;
        Ok(buf[0])
    }
}

impl WireSize for i8 {
    const SIZE: Option<usize> = Some(1);
    const IS_BYTE: bool = true;
}
impl WireSerialize for i8 {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_le_bytes()).map_err(Error::Io)
    }
}
impl WireDeserialize for i8 {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).map_err(Error::Io)?;
        Ok(buf[0] as i8)
    }
}

impl_wire_int!(u16);
impl_wire_int!(u32);
impl_wire_int!(u64);
impl_wire_int!(i16);
impl_wire_int!(i32);
impl_wire_int!(i64);

impl WireSize for bool {
    const SIZE: Option<usize> = Some(1);
}
impl WireSerialize for bool {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer
            .write_all(&[if *self { 1 } else { 0 }])
            .map_err(Error::Io)
    }
}
impl WireDeserialize for bool {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).map_err(Error::Io)?;
        match buf[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Deserialize(format!("invalid bool byte: {}", other))),
        }
    }
}

impl WireSize for () {
    const SIZE: Option<usize> = Some(0);
}
impl WireSerialize for () {
    fn write_to<W: Write>(&self, _writer: &mut W) -> Result<()> {
        Ok(())
    }
}
impl WireDeserialize for () {
    fn read_from<R: Read>(_reader: &mut R) -> Result<Self> {
        Ok(())
    }
}

impl WireSize for String {
    fn wire_size(&self) -> usize {
        4 + self.len()
    }
}
impl WireSerialize for String {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        (self.len() as u32).write_to(writer)?;
        writer.write_all(self.as_bytes()).map_err(Error::Io)
    }
}
impl WireDeserialize for String {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let len = u32::read_from(reader)? as usize;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).map_err(Error::Io)?;
        String::from_utf8(buf).map_err(|e| Error::Deserialize(e.to_string()))
    }
}

impl<T: WireSize> WireSize for Vec<T> {
    fn wire_size(&self) -> usize {
        if let Some(item) = T::SIZE {
            4 + self.len() * item
        } else {
            4 + self.iter().map(|v| v.wire_size()).sum::<usize>()
        }
    }
}
impl<T: WireSerialize> WireSerialize for Vec<T> {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        (self.len() as u32).write_to(writer)?;
        for item in self {
            item.write_to(writer)?;
        }
        Ok(())
    }
}
impl<T: WireDeserialize> WireDeserialize for Vec<T> {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let len = u32::read_from(reader)? as usize;
        let mut vec = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            vec.push(T::read_from(reader)?);
        }
        Ok(vec)
    }
}

impl<T: WireSize> WireSize for Option<T> {
    fn wire_size(&self) -> usize {
        match self {
            Some(v) => 1 + v.wire_size(),
            None => 1,
        }
    }
}
impl<T: WireSerialize> WireSerialize for Option<T> {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Some(v) => {
                1u8.write_to(writer)?;
                v.write_to(writer)
            }
            None => 0u8.write_to(writer),
        }
    }
}
impl<T: WireDeserialize> WireDeserialize for Option<T> {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        match u8::read_from(reader)? {
            0 => Ok(None),
            1 => Ok(Some(T::read_from(reader)?)),
            other => Err(Error::Deserialize(format!(
                "invalid Option tag: {}",
                other
            ))),
        }
    }
}

impl<T: WireSize, E: WireSize> WireSize for std::result::Result<T, E> {
    fn wire_size(&self) -> usize {
        match self {
            Ok(v) => 1 + v.wire_size(),
            Err(e) => 1 + e.wire_size(),
        }
    }
}
impl<T: WireSerialize, E: WireSerialize> WireSerialize for std::result::Result<T, E> {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Ok(v) => {
                1u8.write_to(writer)?;
                v.write_to(writer)
            }
            Err(e) => {
                0u8.write_to(writer)?;
                e.write_to(writer)
            }
        }
    }
}
impl<T: WireDeserialize, E: WireDeserialize> WireDeserialize for std::result::Result<T, E> {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        match u8::read_from(reader)? {
            1 => Ok(Ok(T::read_from(reader)?)),
            0 => Ok(Err(E::read_from(reader)?)),
            other => Err(Error::Deserialize(format!(
                "invalid Result tag: {}",
                other
            ))),
        }
    }
}

impl<T: WireSize, const N: usize> WireSize for [T; N] {
    const SIZE: Option<usize> = match T::SIZE {
        Some(s) => Some(s * N),
        None => None,
    };
    const IS_BYTE: bool = T::IS_BYTE && N == 1;

    fn wire_size(&self) -> usize {
        match T::SIZE {
            Some(s) => s * N,
            None => self.iter().map(|v| v.wire_size()).sum(),
        }
    }
}
impl<T: WireSerialize, const N: usize> WireSerialize for [T; N] {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        // Byte-like element types go out as one block.
        if T::IS_BYTE {
            let ptr = self.as_ptr() as *const u8;
            let bytes = unsafe { std::slice::from_raw_parts(ptr, N) };
            return writer.write_all(bytes).map_err(Error::Io);
        }
        for item in self {
            item.write_to(writer)?;
        }
        Ok(())
    }
}
impl<T: WireDeserialize + WireSize, const N: usize> WireDeserialize for [T; N] {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        if T::IS_BYTE {
            let mut buf = [0u8; N];
            reader.read_exact(&mut buf).map_err(Error::Io)?;
            // IS_BYTE guarantees every byte pattern is a valid T.
            return Ok(unsafe { std::mem::transmute_copy::<[u8; N], [T; N]>(&buf) });
        }
        let mut vec = Vec::with_capacity(N);
        for _ in 0..N {
            vec.push(T::read_from(reader)?);
        }
        vec.try_into()
            .map_err(|_| Error::Deserialize("array length conversion failed".to_string()))
    }
}

macro_rules! sum_sizes {
    () => { Some(0) };
    ($head:ident $(, $tail:ident)*) => {
        match ($head::SIZE, sum_sizes!($($tail),*)) {
            (Some(s1), Some(s2)) => Some(s1 + s2),
            _ => None,
        }
    };
}

macro_rules! impl_wire_tuple {
    ($($ty:ident),+) => {
        impl<$($ty: WireSize),+> WireSize for ($($ty,)+) {
            const SIZE: Option<usize> = sum_sizes!($($ty),+);

            fn wire_size(&self) -> usize {
                #[allow(non_snake_case)]
                let ($($ty,)+) = self;
                0 $(+ $ty.wire_size())+
            }
        }
        impl<$($ty: WireSerialize),+> WireSerialize for ($($ty,)+) {
            fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
                #[allow(non_snake_case)]
                let ($($ty,)+) = self;
                $($ty.write_to(writer)?;)+
                Ok(())
            }
        }
        impl<$($ty: WireDeserialize),+> WireDeserialize for ($($ty,)+) {
            fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
                Ok(($($ty::read_from(reader)?,)+))
            }
        }
    };
}

impl_wire_tuple!(T1);
impl_wire_tuple!(T1, T2);
impl_wire_tuple!(T1, T2, T3);
impl_wire_tuple!(T1, T2, T3, T4);
impl_wire_tuple!(T1, T2, T3, T4, T5);
impl_wire_tuple!(T1, T2, T3, T4, T5, T6);
impl_wire_tuple!(T1, T2, T3, T4, T5, T6, T7);
impl_wire_tuple!(T1, T2, T3, T4, T5, T6, T7, T8);

// Serialization entry points
pub fn serialize<T: WireSerialize>(val: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(val.wire_size());
    val.write_to(&mut buf)?;
    Ok(buf)
}

pub fn deserialize<T: WireDeserialize>(bytes: &[u8]) -> Result<T> {
    let mut cursor = std::io::Cursor::new(bytes);
    T::read_from(&mut cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_size_matches_encoding() {
        let v = (7u64, vec![1u32, 2, 3], Some("hello".to_string()));
        let bytes = serialize(&v).unwrap();
        assert_eq!(bytes.len(), v.wire_size());
    }

    #[test]
    fn test_roundtrip_nested() {
        let v: (Vec<u64>, Option<bool>, std::result::Result<u32, String>) =
            (vec![9, 8, 7], None, Err("boom".to_string()));
        let bytes = serialize(&v).unwrap();
        let back = deserialize(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn test_array_roundtrip() {
        let v: ([u8; 4], [u32; 3], [bool; 2], [String; 2]) = (
            [1, 2, 3, 4],
            [7, 8, 9],
            [true, false],
            ["a".to_string(), "bc".to_string()],
        );
        let bytes = serialize(&v).unwrap();
        assert_eq!(bytes.len(), v.wire_size());
        // 4 raw bytes + 3 * 4 + 2 bools + 2 length-prefixed strings.
        assert_eq!(bytes.len(), 4 + 12 + 2 + (4 + 1) + (4 + 2));
        let back = deserialize(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn test_bool_array_rejects_invalid_byte() {
        assert!(deserialize::<[bool; 2]>(&[1, 2]).is_err());
        assert_eq!(deserialize::<[bool; 2]>(&[1, 0]).unwrap(), [true, false]);
    }
}
