use std::fmt;
use std::io;

use crate::{Error, Grower, HashTable, Key, Mapped, PairCell, TwoPowerGrower};

/// Map-shaped hash table: unique keys with a mapped value per key.
///
/// This is the shape aggregate state uses; see `kestrel-aggregation` for the
/// usage contract.
#[derive(Clone)]
pub struct HashMap<K: Key, V: Mapped, G: Grower = TwoPowerGrower> {
    table: HashTable<PairCell<K, V>, G>,
}

impl<K: Key, V: Mapped> HashMap<K, V, TwoPowerGrower> {
    pub fn new() -> Self {
        Self {
            table: HashTable::new(),
        }
    }
}

impl<K: Key, V: Mapped> Default for HashMap<K, V, TwoPowerGrower> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Mapped, G: Grower> HashMap<K, V, G> {
    pub fn with_grower(grower: G) -> Self {
        Self {
            table: HashTable::with_grower(grower),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn buffer_cells(&self) -> usize {
        self.table.buffer_cells()
    }

    /// Insert `key → value` if the key is absent. Returns whether it was new.
    pub fn insert(&mut self, key: K, value: V) -> error_stack::Result<bool, Error> {
        self.table.insert(PairCell::new(key, value))
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.table.find(key).map(|cell| &cell.value)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.table.find_mut(key).map(|cell| &mut cell.value)
    }

    pub fn contains(&self, key: K) -> bool {
        self.table.contains(key)
    }

    /// The mapped value for `key`, default-initialized on first access.
    ///
    /// This is the accumulation entry point: `*map.entry(k)? += w`.
    pub fn entry(&mut self, key: K) -> error_stack::Result<&mut V, Error> {
        let (slot, _inserted) = self.table.emplace(key)?;
        Ok(&mut self.table.cell_mut(slot).value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.table.iter().map(|cell| (&cell.key, &cell.value))
    }

    pub fn clear(&mut self) {
        self.table.clear()
    }

    pub fn clear_and_shrink(&mut self) {
        self.table.clear_and_shrink()
    }

    pub fn write<W: io::Write>(&self, out: &mut W) -> error_stack::Result<(), Error> {
        self.table.write(out)
    }

    pub fn read<R: io::Read>(&mut self, input: &mut R) -> error_stack::Result<(), Error> {
        self.table.read(input)
    }

    pub fn read_text(&mut self, text: &str) -> error_stack::Result<(), Error> {
        self.table.read_text(text)
    }
}

impl<K: Key, V: Mapped, G: Grower> fmt::Display for HashMap<K, V, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.table.fmt(f)
    }
}

impl<K: Key, V: Mapped, G: Grower> fmt::Debug for HashMap<K, V, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<K: Key, V: Mapped + PartialEq, G: Grower> PartialEq for HashMap<K, V, G> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(key, value)| other.get(*key) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Reader;

    #[test]
    fn test_entry_accumulates() {
        let mut map = HashMap::<u64, u64>::new();
        *map.entry(10).unwrap() += 3;
        *map.entry(10).unwrap() += 2;
        *map.entry(20).unwrap() += 5;
        assert_eq!(map.get(10), Some(&5));
        assert_eq!(map.get(20), Some(&5));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_insert_keeps_first_value() {
        let mut map = HashMap::<u32, u64>::new();
        assert!(map.insert(1, 100).unwrap());
        assert!(!map.insert(1, 200).unwrap());
        assert_eq!(map.get(1), Some(&100));
    }

    #[test]
    fn test_zero_key_round_trip() {
        let mut map = HashMap::<u64, u64>::new();
        *map.entry(0).unwrap() = 7;
        *map.entry(1).unwrap() = 8;

        let mut bytes = Vec::new();
        map.write(&mut bytes).unwrap();

        let mut restored = HashMap::<u64, u64>::new();
        restored.read(&mut bytes.as_slice()).unwrap();
        assert_eq!(restored, map);
        assert_eq!(restored.get(0), Some(&7));
    }

    #[test]
    fn test_absent_zero_key_round_trip() {
        let mut map = HashMap::<u64, u64>::new();
        *map.entry(5).unwrap() = 1;

        let mut bytes = Vec::new();
        map.write(&mut bytes).unwrap();
        let mut restored = HashMap::<u64, u64>::new();
        restored.read(&mut bytes.as_slice()).unwrap();
        assert!(!restored.contains(0));
    }

    #[test]
    fn test_streaming_reader_merge() {
        let mut left = HashMap::<u64, u64>::new();
        *left.entry(1).unwrap() = 10;
        *left.entry(2).unwrap() = 20;

        let mut bytes = Vec::new();
        left.write(&mut bytes).unwrap();

        // Merge the serialized form into a map that already has overlap.
        let mut target = HashMap::<u64, u64>::new();
        *target.entry(2).unwrap() = 1;
        let mut input = bytes.as_slice();
        let mut reader = Reader::<PairCell<u64, u64>, _>::new(&mut input);
        while reader.next().unwrap() {
            let cell = *reader.get().unwrap();
            *target.entry(cell.key).unwrap() += cell.value;
        }
        assert_eq!(target.get(1), Some(&10));
        assert_eq!(target.get(2), Some(&21));
    }

    #[test]
    fn test_text_form() {
        let mut map = HashMap::<u64, u64>::new();
        *map.entry(5).unwrap() = 3;
        let text = map.to_string();
        assert_eq!(text, "1,\"5\",\"3\"");

        let mut restored = HashMap::<u64, u64>::new();
        restored.read_text(&text).unwrap();
        assert_eq!(restored, map);
    }
}
