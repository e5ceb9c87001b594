use std::fmt;
use std::io;
use std::str::FromStr;

use crate::Key;

/// A value mapped to a key in a map-shaped table.
pub trait Mapped: Copy + Default + fmt::Display + FromStr {
    fn write<W: io::Write>(&self, out: &mut W) -> io::Result<()>;
    fn read<R: io::Read>(input: &mut R) -> io::Result<Self>;
}

macro_rules! impl_key_mapped {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Mapped for $ty {
                fn write<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
                    Key::write(self, out)
                }

                fn read<R: io::Read>(input: &mut R) -> io::Result<Self> {
                    <$ty as Key>::read(input)
                }
            }
        )+
    };
}

impl_key_mapped!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// A single slot of the hash table.
///
/// A cell carries its key plus, for map-shaped tables, the mapped value. The
/// capability set here (key access, zero handling, optional saved-hash
/// storage, serialization) is everything the table needs; the concrete
/// layout is up to the implementation.
pub trait Cell: Copy {
    type Key: Key;

    fn key(&self) -> Self::Key;

    /// Construct a cell for a freshly inserted key.
    fn from_key(key: Self::Key) -> Self;

    /// An all-zero cell, the "empty" marker in the main buffer.
    fn zeroed() -> Self {
        Self::from_key(Self::Key::zero())
    }

    fn is_zero(&self) -> bool {
        self.key().is_zero()
    }

    fn set_zero(&mut self) {
        *self = Self::zeroed();
    }

    /// Remember the hash value, if this cell type stores it.
    fn set_hash(&mut self, _hash: u64) {}

    fn write<W: io::Write>(&self, out: &mut W) -> io::Result<()>;
    fn read<R: io::Read>(input: &mut R) -> io::Result<Self>;

    /// Text form: double-quoted literals, comma separated inside the cell.
    fn write_text(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;

    /// Parse the cell back from unquoted text tokens. `None` on malformed or
    /// exhausted input.
    fn read_text<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Option<Self>;
}

/// Cell of a set-shaped table: just the key.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KeyCell<K: Key> {
    pub key: K,
}

impl<K: Key> Cell for KeyCell<K> {
    type Key = K;

    fn key(&self) -> K {
        self.key
    }

    fn from_key(key: K) -> Self {
        Self { key }
    }

    fn write<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        self.key.write(out)
    }

    fn read<R: io::Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self { key: K::read(input)? })
    }

    fn write_text(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.key)
    }

    fn read_text<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Option<Self> {
        let key = K::from_str(tokens.next()?).ok()?;
        Some(Self { key })
    }
}

/// Cell of a map-shaped table: key plus mapped value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PairCell<K: Key, V: Mapped> {
    pub key: K,
    pub value: V,
}

impl<K: Key, V: Mapped> PairCell<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

impl<K: Key, V: Mapped> Cell for PairCell<K, V> {
    type Key = K;

    fn key(&self) -> K {
        self.key
    }

    fn from_key(key: K) -> Self {
        Self {
            key,
            value: V::default(),
        }
    }

    fn write<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        self.key.write(out)?;
        self.value.write(out)
    }

    fn read<R: io::Read>(input: &mut R) -> io::Result<Self> {
        let key = K::read(input)?;
        let value = V::read(input)?;
        Ok(Self { key, value })
    }

    fn write_text(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\",\"{}\"", self.key, self.value)
    }

    fn read_text<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Option<Self> {
        let key = K::from_str(tokens.next()?).ok()?;
        let value = V::from_str(tokens.next()?).ok()?;
        Some(Self { key, value })
    }
}
