use std::fmt;
use std::io;
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// A hash table key.
///
/// Keys must be trivially relocatable (`Copy`), define equality, and reserve
/// their all-zero byte pattern as the designated "empty" marker. The table
/// still accepts the zero key from callers: it is routed to a side slot so
/// that zeroed cells in the main buffer always mean "empty".
pub trait Key: Copy + PartialEq + fmt::Display + FromStr {
    /// Whether this is the designated all-zero key.
    fn is_zero(&self) -> bool;

    /// The designated all-zero key.
    fn zero() -> Self;

    /// Hash with the table's deterministic state.
    fn hash_with(&self, state: &ahash::RandomState) -> u64;

    fn write<W: io::Write>(&self, out: &mut W) -> io::Result<()>;
    fn read<R: io::Read>(input: &mut R) -> io::Result<Self>;
}

macro_rules! impl_wide_int_key {
    ($($ty:ty => ($write:ident, $read:ident)),+ $(,)?) => {
        $(
            impl Key for $ty {
                fn is_zero(&self) -> bool {
                    *self == 0
                }

                fn zero() -> Self {
                    0
                }

                fn hash_with(&self, state: &ahash::RandomState) -> u64 {
                    state.hash_one(*self)
                }

                fn write<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
                    out.$write::<LittleEndian>(*self)
                }

                fn read<R: io::Read>(input: &mut R) -> io::Result<Self> {
                    input.$read::<LittleEndian>()
                }
            }
        )+
    };
}

impl_wide_int_key! {
    u16 => (write_u16, read_u16),
    u32 => (write_u32, read_u32),
    u64 => (write_u64, read_u64),
    i16 => (write_i16, read_i16),
    i32 => (write_i32, read_i32),
    i64 => (write_i64, read_i64),
}

macro_rules! impl_byte_key {
    ($($ty:ty => ($write:ident, $read:ident)),+ $(,)?) => {
        $(
            impl Key for $ty {
                fn is_zero(&self) -> bool {
                    *self == 0
                }

                fn zero() -> Self {
                    0
                }

                fn hash_with(&self, state: &ahash::RandomState) -> u64 {
                    state.hash_one(*self)
                }

                fn write<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
                    out.$write(*self)
                }

                fn read<R: io::Read>(input: &mut R) -> io::Result<Self> {
                    input.$read()
                }
            }
        )+
    };
}

impl_byte_key! {
    u8 => (write_u8, read_u8),
    i8 => (write_i8, read_i8),
}

// Floats participate through their bit patterns: positive zero is the
// designated empty key, and hashing/serialization use the raw bits so the
// table never compares payloads through NaN semantics.
macro_rules! impl_float_key {
    ($($ty:ty => ($bits:ty, $write:ident, $read:ident)),+ $(,)?) => {
        $(
            impl Key for $ty {
                fn is_zero(&self) -> bool {
                    self.to_bits() == 0
                }

                fn zero() -> Self {
                    <$ty>::from_bits(0)
                }

                fn hash_with(&self, state: &ahash::RandomState) -> u64 {
                    state.hash_one(self.to_bits())
                }

                fn write<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
                    out.$write::<LittleEndian>(self.to_bits())
                }

                fn read<R: io::Read>(input: &mut R) -> io::Result<Self> {
                    Ok(<$ty>::from_bits(input.$read::<LittleEndian>()?))
                }
            }
        )+
    };
}

impl_float_key! {
    f32 => (u32, write_u32, read_u32),
    f64 => (u64, write_u64, read_u64),
}
