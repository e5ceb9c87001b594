use std::fmt;
use std::io;

use error_stack::{IntoReport, ResultExt};
use kestrel_events::Event;
use smallvec::SmallVec;

use crate::varint::{read_var_u64, write_var_u64};
use crate::{Cell, Error, Grower, Key as _, TwoPowerGrower};

/// Number of cells kept inline before the buffer spills to the heap.
///
/// Short-lived tables (per-group aggregate states) start at a small degree
/// and often never leave the inline prefix.
const INLINE_CELLS: usize = 16;

type Buffer<C> = SmallVec<[C; INLINE_CELLS]>;

/// Position of a cell, usable while no rehash intervenes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotIndex {
    /// The side slot holding the entry with the all-zero key.
    Zero,
    /// A position in the main buffer.
    Buf(usize),
}

#[derive(Clone, Copy)]
struct ZeroSlot<C> {
    cell: C,
    has: bool,
}

/// Open-addressed hash table over cells `C` with growth policy `G`.
///
/// Keys are unique and insertion order is irrelevant. Lookup probes linearly
/// from `place(hash)`; a zeroed cell terminates the chain. The entry whose
/// key is all zeros lives in a side slot so the "zero means empty" invariant
/// holds for the main buffer.
#[derive(Clone)]
pub struct HashTable<C: Cell, G: Grower = TwoPowerGrower> {
    size: usize,
    grower: G,
    buf: Buffer<C>,
    zero: ZeroSlot<C>,
    hash_state: ahash::RandomState,
}

fn deterministic_state() -> ahash::RandomState {
    ahash::RandomState::with_seeds(1234, 5678, 9012, 3456)
}

impl<C: Cell> HashTable<C, TwoPowerGrower> {
    pub fn new() -> Self {
        Self::with_grower(TwoPowerGrower::default())
    }
}

impl<C: Cell> Default for HashTable<C, TwoPowerGrower> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Cell, G: Grower> HashTable<C, G> {
    pub fn with_grower(grower: G) -> Self {
        let mut buf = Buffer::new();
        buf.resize(grower.buf_size(), C::zeroed());
        Self {
            size: 0,
            grower,
            buf,
            zero: ZeroSlot {
                cell: C::zeroed(),
                has: false,
            },
            hash_state: deterministic_state(),
        }
    }

    pub fn hash(&self, key: &C::Key) -> u64 {
        key.hash_with(&self.hash_state)
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Current buffer capacity, in cells (the zero side slot not included).
    pub fn buffer_cells(&self) -> usize {
        self.grower.buf_size()
    }

    pub fn buffer_bytes(&self) -> usize {
        self.grower.buf_size() * std::mem::size_of::<C>()
    }

    pub fn cell(&self, slot: SlotIndex) -> &C {
        match slot {
            SlotIndex::Zero => &self.zero.cell,
            SlotIndex::Buf(pos) => &self.buf[pos],
        }
    }

    pub fn cell_mut(&mut self, slot: SlotIndex) -> &mut C {
        match slot {
            SlotIndex::Zero => &mut self.zero.cell,
            SlotIndex::Buf(pos) => &mut self.buf[pos],
        }
    }

    /// Probe for `key` starting at `place`: stops at a matching or empty cell.
    fn find_slot(&self, key: C::Key, place: usize) -> usize {
        let mut pos = place;
        while !self.buf[pos].is_zero() && self.buf[pos].key() != key {
            pos = self.grower.next(pos);
        }
        pos
    }

    /// Insert `key` if absent. Returns the slot and whether it was new.
    pub fn emplace(&mut self, key: C::Key) -> error_stack::Result<(SlotIndex, bool), Error> {
        let hash = self.hash(&key);
        self.emplace_with_hash(key, hash)
    }

    /// Like [`emplace`](Self::emplace) with a precomputed hash value.
    pub fn emplace_with_hash(
        &mut self,
        key: C::Key,
        hash: u64,
    ) -> error_stack::Result<(SlotIndex, bool), Error> {
        if key.is_zero() {
            let inserted = !self.zero.has;
            if inserted {
                self.zero.has = true;
                self.zero.cell = C::from_key(key);
                self.zero.cell.set_hash(hash);
                self.size += 1;
            }
            return Ok((SlotIndex::Zero, inserted));
        }

        let mut pos = self.find_slot(key, self.grower.place(hash));
        if !self.buf[pos].is_zero() {
            return Ok((SlotIndex::Buf(pos), false));
        }

        self.buf[pos] = C::from_key(key);
        self.buf[pos].set_hash(hash);
        self.size += 1;

        if self.grower.overflow(self.size) {
            if let Err(error) = self.resize() {
                // Roll back the insertion so the table stays consistent when
                // the caller observes the allocation failure.
                self.buf[pos].set_zero();
                self.size -= 1;
                return Err(error);
            }
            pos = self.find_slot(key, self.grower.place(hash));
            debug_assert!(!self.buf[pos].is_zero());
        }

        Ok((SlotIndex::Buf(pos), true))
    }

    /// Insert a full cell. The mapped part is only written for new keys.
    pub fn insert(&mut self, cell: C) -> error_stack::Result<bool, Error> {
        let hash = self.hash(&cell.key());
        let (slot, inserted) = self.emplace_with_hash(cell.key(), hash)?;
        if inserted {
            *self.cell_mut(slot) = cell;
            self.cell_mut(slot).set_hash(hash);
        }
        Ok(inserted)
    }

    pub fn find(&self, key: C::Key) -> Option<&C> {
        if key.is_zero() {
            return self.zero.has.then_some(&self.zero.cell);
        }
        let pos = self.find_slot(key, self.grower.place(self.hash(&key)));
        if self.buf[pos].is_zero() {
            None
        } else {
            Some(&self.buf[pos])
        }
    }

    pub fn find_mut(&mut self, key: C::Key) -> Option<&mut C> {
        if key.is_zero() {
            return self.zero.has.then_some(&mut self.zero.cell);
        }
        let pos = self.find_slot(key, self.grower.place(self.hash(&key)));
        if self.buf[pos].is_zero() {
            None
        } else {
            Some(&mut self.buf[pos])
        }
    }

    pub fn contains(&self, key: C::Key) -> bool {
        self.find(key).is_some()
    }

    /// Iterate non-empty cells, the zero side slot first.
    pub fn iter(&self) -> impl Iterator<Item = &C> + '_ {
        let zero = self.zero.has.then_some(&self.zero.cell);
        zero.into_iter()
            .chain(self.buf.iter().filter(|cell| !cell.is_zero()))
    }

    pub fn clear(&mut self) {
        for cell in self.buf.iter_mut() {
            cell.set_zero();
        }
        self.zero.has = false;
        self.size = 0;
    }

    /// Clear and shrink the buffer back to the initial capacity.
    pub fn clear_and_shrink(&mut self) {
        self.zero.has = false;
        self.size = 0;
        self.grower.set_for_elems(0);
        self.buf = Buffer::new();
        self.buf.resize(self.grower.buf_size(), C::zeroed());
    }

    fn resize(&mut self) -> error_stack::Result<(), Error> {
        let old_size = self.grower.buf_size();

        // The grower is only advanced after the buffer actually grew, so an
        // allocation failure leaves the table in its previous valid state.
        let mut new_grower = self.grower.clone();
        new_grower.increase_size();
        let new_cells = new_grower.buf_size();

        self.buf
            .try_reserve(new_cells - self.buf.len())
            .map_err(|_| error_stack::report!(Error::AllocationFailed(new_cells)))?;
        self.buf.resize(new_cells, C::zeroed());
        self.grower = new_grower;
        kestrel_events::increment(Event::HashTableResizes);

        // Re-place every element under the new mask. An element either stays,
        // moves into the grown region "on the right", or moves left because
        // the cells ahead of it in its chain have moved away.
        let mut i = 0;
        while i < old_size {
            if !self.buf[i].is_zero() {
                self.reinsert(i);
            }
            i += 1;
        }

        // An element that sat at the start of the old buffer only because its
        // chain wrapped around the old end may have landed just past the old
        // end now; keep walking that tail until the chain breaks.
        while i < self.buf.len() && !self.buf[i].is_zero() {
            self.reinsert(i);
            i += 1;
        }

        Ok(())
    }

    /// Move the cell at `pos` to its place under the current grower.
    fn reinsert(&mut self, pos: usize) {
        let key = self.buf[pos].key();
        let hash = self.hash(&key);
        let place = self.grower.place(hash);
        if place == pos {
            return;
        }

        let target = self.find_slot(key, place);
        if !self.buf[target].is_zero() {
            // Still reachable through its collision chain.
            return;
        }

        let moved = self.buf[pos];
        self.buf[target] = moved;
        self.buf[target].set_hash(hash);
        self.buf[pos].set_zero();
        kestrel_events::increment(Event::HashTableResizeMoves);
    }

    /// Binary form: varint size, the zero cell if present, then every
    /// non-empty cell in buffer order.
    pub fn write<W: io::Write>(&self, out: &mut W) -> error_stack::Result<(), Error> {
        write_var_u64(out, self.size as u64)
            .into_report()
            .change_context(Error::Write)?;
        if self.zero.has {
            self.zero
                .cell
                .write(out)
                .into_report()
                .change_context(Error::Write)?;
        }
        for cell in self.buf.iter() {
            if !cell.is_zero() {
                cell.write(out).into_report().change_context(Error::Write)?;
            }
        }
        Ok(())
    }

    /// Replace the contents with a serialized table. On failure the table is
    /// left empty.
    pub fn read<R: io::Read>(&mut self, input: &mut R) -> error_stack::Result<(), Error> {
        self.clear();
        let result = self.read_inner(input);
        if result.is_err() {
            self.clear();
        }
        result
    }

    fn read_inner<R: io::Read>(&mut self, input: &mut R) -> error_stack::Result<(), Error> {
        let claimed = read_var_u64(input)
            .into_report()
            .change_context(Error::NoAvailableData)?;
        let claimed = usize::try_from(claimed)
            .into_report()
            .change_context(Error::NoAvailableData)?;

        let mut new_grower = self.grower.clone();
        new_grower.set_for_elems(claimed);
        if new_grower.buf_size() > self.buf.len() {
            let new_cells = new_grower.buf_size();
            self.buf
                .try_reserve(new_cells - self.buf.len())
                .map_err(|_| error_stack::report!(Error::AllocationFailed(new_cells)))?;
            self.buf.resize(new_cells, C::zeroed());
            self.grower = new_grower;
        }

        for _ in 0..claimed {
            let cell = C::read(input)
                .into_report()
                .change_context(Error::NoAvailableData)?;
            self.insert(cell)?;
        }
        Ok(())
    }

    /// Replace the contents with the text form produced by `Display`.
    pub fn read_text(&mut self, text: &str) -> error_stack::Result<(), Error> {
        self.clear();
        let result = self.read_text_inner(text);
        if result.is_err() {
            self.clear();
        }
        result
    }

    fn read_text_inner(&mut self, text: &str) -> error_stack::Result<(), Error> {
        let mut parts = text.split(',');
        let size: usize = parts
            .next()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| error_stack::report!(Error::MalformedInput))?;

        let mut tokens = parts.map(|token| {
            token
                .strip_prefix('"')
                .and_then(|token| token.strip_suffix('"'))
        });
        let mut unquoted = std::iter::from_fn(|| tokens.next().flatten());

        let mut read = 0;
        while read < size {
            let cell = C::read_text(&mut unquoted)
                .ok_or_else(|| error_stack::report!(Error::MalformedInput))?;
            self.insert(cell)?;
            read += 1;
        }
        Ok(())
    }
}

/// Text form: `size[,"cell"]*`.
impl<C: Cell, G: Grower> fmt::Display for HashTable<C, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.size)?;
        if self.zero.has {
            write!(f, ",")?;
            self.zero.cell.write_text(f)?;
        }
        for cell in self.buf.iter() {
            if !cell.is_zero() {
                write!(f, ",")?;
                cell.write_text(f)?;
            }
        }
        Ok(())
    }
}

/// Streams cells of a serialized table one at a time, for merge-in-place
/// consumption without materializing a second table.
pub struct Reader<'a, C: Cell, R: io::Read> {
    input: &'a mut R,
    remaining: Option<u64>,
    current: Option<C>,
}

impl<'a, C: Cell, R: io::Read> Reader<'a, C, R> {
    pub fn new(input: &'a mut R) -> Self {
        Self {
            input,
            remaining: None,
            current: None,
        }
    }

    /// Advance to the next cell. Returns `false` at the end of the stream.
    pub fn next(&mut self) -> error_stack::Result<bool, Error> {
        let remaining = match self.remaining {
            Some(remaining) => remaining,
            None => {
                let size = read_var_u64(self.input)
                    .into_report()
                    .change_context(Error::NoAvailableData)?;
                self.remaining = Some(size);
                size
            }
        };

        if remaining == 0 {
            self.current = None;
            return Ok(false);
        }

        let cell = C::read(self.input)
            .into_report()
            .change_context(Error::NoAvailableData)?;
        self.current = Some(cell);
        self.remaining = Some(remaining - 1);
        Ok(true)
    }

    /// The cell read by the last successful [`next`](Self::next).
    pub fn get(&self) -> error_stack::Result<&C, Error> {
        self.current
            .as_ref()
            .ok_or_else(|| error_stack::report!(Error::NoAvailableData))
    }
}
