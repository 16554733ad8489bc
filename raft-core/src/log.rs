//! The in-memory entry log.
//!
//! A ring buffer of entries plus a reference-count table. Replication and
//! storage writes borrow slices of the log across asynchronous operations;
//! the count table keeps borrowed entries alive even when the log itself
//! truncates or compacts them away in the meantime.

use std::error::Error as StdError;

use bytes::Bytes;
use validit::Validate;

use crate::configuration::Configuration;
use crate::entry::Entry;
use crate::entry::EntryType;
use crate::LogIndex;
use crate::Term;

/// Initial capacity of the reference-count table.
const REFS_INITIAL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct RefEntry {
    index: LogIndex,
    term: Term,

    /// Outstanding borrows handed out by [`Log::acquire`].
    count: u32,

    /// Set when the entry was truncated or shifted out of the log while
    /// still borrowed; dropped when the last borrow is released.
    detached: Option<Entry>,
}

#[derive(Debug, Clone, Default)]
enum RefSlot {
    #[default]
    Empty,
    /// A removed slot; probing continues past it.
    Tombstone,
    Used(RefEntry),
}

/// Open-addressed table keyed by `(index, term)`, linear probing on the
/// index. Doubles in capacity when full, re-laying entries out from slot 0.
#[derive(Debug, Clone, Default)]
struct Refs {
    slots: Vec<RefSlot>,
    used: usize,
}

impl Refs {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn position_of(&self, index: LogIndex, term: Term) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let cap = self.capacity();
        let mut pos = index as usize & (cap - 1);
        for _ in 0..cap {
            match &self.slots[pos] {
                RefSlot::Empty => return None,
                RefSlot::Tombstone => {}
                RefSlot::Used(r) => {
                    if r.index == index && r.term == term {
                        return Some(pos);
                    }
                }
            }
            pos = (pos + 1) % cap;
        }
        None
    }

    fn insert(&mut self, index: LogIndex, term: Term) {
        debug_assert!(self.position_of(index, term).is_none());

        if self.slots.is_empty() {
            self.slots = vec![RefSlot::Empty; REFS_INITIAL_CAPACITY];
        } else if self.used == self.capacity() {
            self.grow(self.capacity() * 2);
        } else if self.free_slots() == 0 {
            // Only tombstones left; rehash in place to reclaim them.
            self.grow(self.capacity());
        }

        let cap = self.capacity();
        let mut pos = index as usize & (cap - 1);
        loop {
            match self.slots[pos] {
                RefSlot::Empty | RefSlot::Tombstone => break,
                RefSlot::Used(_) => pos = (pos + 1) % cap,
            }
        }
        self.slots[pos] = RefSlot::Used(RefEntry {
            index,
            term,
            count: 0,
            detached: None,
        });
        self.used += 1;
    }

    fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, RefSlot::Empty)).count()
    }

    fn grow(&mut self, new_capacity: usize) {
        let old = std::mem::replace(&mut self.slots, vec![RefSlot::Empty; new_capacity]);
        for slot in old {
            if let RefSlot::Used(r) = slot {
                let cap = self.capacity();
                let mut pos = r.index as usize & (cap - 1);
                while matches!(self.slots[pos], RefSlot::Used(_)) {
                    pos = (pos + 1) % cap;
                }
                self.slots[pos] = RefSlot::Used(r);
            }
        }
    }

    fn incr(&mut self, index: LogIndex, term: Term) {
        let pos = self.position_of(index, term).expect("ref entry must exist");
        if let RefSlot::Used(r) = &mut self.slots[pos] {
            r.count += 1;
        }
    }

    /// Decrement and return the remaining count.
    fn decr(&mut self, index: LogIndex, term: Term) -> u32 {
        let pos = self.position_of(index, term).expect("ref entry must exist");
        match &mut self.slots[pos] {
            RefSlot::Used(r) => {
                debug_assert!(r.count > 0);
                r.count -= 1;
                r.count
            }
            _ => unreachable!(),
        }
    }

    fn count(&self, index: LogIndex, term: Term) -> u32 {
        match self.position_of(index, term) {
            Some(pos) => match &self.slots[pos] {
                RefSlot::Used(r) => r.count,
                _ => 0,
            },
            None => 0,
        }
    }

    fn detach(&mut self, index: LogIndex, term: Term, entry: Entry) {
        let pos = self.position_of(index, term).expect("ref entry must exist");
        if let RefSlot::Used(r) = &mut self.slots[pos] {
            r.detached = Some(entry);
        }
    }

    fn remove(&mut self, index: LogIndex, term: Term) {
        if let Some(pos) = self.position_of(index, term) {
            self.slots[pos] = RefSlot::Tombstone;
            self.used -= 1;
        }
    }
}

/// The ring-buffered entry log.
///
/// Indexes are 1-based Raft indexes; the k-th live entry (k from 0) sits at
/// index `offset + k + 1`. After a snapshot, `offset` is advanced so the log
/// holds only a trailing window of entries.
#[derive(Debug, Clone, Default)]
pub struct Log {
    /// The ring. `len()` is the capacity; 0 until the first append.
    slots: Vec<Option<Entry>>,

    /// Ring position of the first live entry.
    front: usize,

    /// Ring position one past the last live entry. `back == front` means
    /// the log is empty.
    back: usize,

    /// Raft index of the entry preceding the first live one.
    offset: LogIndex,

    refs: Refs,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn n_entries(&self) -> usize {
        let size = self.size();
        if size == 0 {
            return 0;
        }
        (self.back + size - self.front) % size
    }

    /// Index of the first live entry, or 0 if the log is empty.
    pub fn first_index(&self) -> LogIndex {
        if self.n_entries() == 0 {
            0
        } else {
            self.offset + 1
        }
    }

    /// Index of the last live entry, or 0 if the log is empty.
    pub fn last_index(&self) -> LogIndex {
        if self.n_entries() == 0 {
            0
        } else {
            self.offset + self.n_entries() as LogIndex
        }
    }

    /// The index the next appended entry will take.
    pub fn next_index(&self) -> LogIndex {
        self.offset + self.n_entries() as LogIndex + 1
    }

    /// Term of the last live entry, or 0 if the log is empty.
    pub fn last_term(&self) -> Term {
        self.term_of(self.last_index())
    }

    /// Term of the entry at `index`, or 0 when out of range.
    pub fn term_of(&self, index: LogIndex) -> Term {
        self.get(index).map(|e| e.term).unwrap_or(0)
    }

    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        let n = self.n_entries() as LogIndex;
        if index <= self.offset || index > self.offset + n {
            return None;
        }
        let k = (index - self.offset - 1) as usize;
        let pos = (self.front + k) % self.size();
        self.slots[pos].as_ref()
    }

    /// Append one entry at `next_index()`.
    pub fn append(&mut self, term: Term, typ: EntryType, payload: Bytes) {
        let index = self.next_index();
        self.ensure_capacity();
        let pos = self.back;
        self.slots[pos] = Some(Entry { term, typ, payload });
        self.back = (self.back + 1) % self.size();
        self.refs.insert(index, term);
    }

    /// Serialize `configuration` deterministically and append it as a
    /// configuration entry.
    pub fn append_configuration(&mut self, term: Term, configuration: &Configuration) {
        self.append(term, EntryType::Configuration, configuration.encode());
    }

    /// Grow the ring when one more entry would make `back` collide with
    /// `front`. Capacity runs 2, 6, 14, 30, ... and surviving entries are
    /// re-laid out in index order from slot 0.
    fn ensure_capacity(&mut self) {
        let size = self.size();
        if size == 0 {
            self.slots = vec![None, None];
            return;
        }
        if (self.back + 1) % size != self.front {
            return;
        }

        let n = self.n_entries();
        let new_size = 2 * size + 2;
        let mut slots: Vec<Option<Entry>> = vec![None; new_size];
        for (k, slot) in slots.iter_mut().take(n).enumerate() {
            *slot = self.slots[(self.front + k) % size].take();
        }
        self.slots = slots;
        self.front = 0;
        self.back = n;
    }

    /// Borrow all entries from `from_index` to the end of the log.
    ///
    /// Each returned entry shares its payload with the log and has its
    /// reference count bumped; the borrow must be returned with
    /// [`Log::release`]. Returns an empty vector when `from_index` is out of
    /// the live range.
    pub fn acquire(&mut self, from_index: LogIndex) -> Vec<Entry> {
        if from_index <= self.offset || from_index > self.last_index() {
            return Vec::new();
        }
        let mut entries = Vec::with_capacity((self.last_index() - from_index + 1) as usize);
        for index in from_index..=self.last_index() {
            let entry = self.get(index).expect("index is in live range").clone();
            self.refs.incr(index, entry.term);
            entries.push(entry);
        }
        entries
    }

    /// Return a borrow taken with [`Log::acquire`].
    ///
    /// The terms of `entries` identify the borrowed generation, so a borrow
    /// that outlived a truncate-and-reappend cannot touch the new entries.
    /// An entry's detached storage is dropped once its count reaches zero.
    pub fn release(&mut self, from_index: LogIndex, entries: &[Entry]) {
        for (k, entry) in entries.iter().enumerate() {
            let index = from_index + k as LogIndex;
            let remaining = self.refs.decr(index, entry.term);
            if remaining == 0 && !self.is_live(index, entry.term) {
                self.refs.remove(index, entry.term);
            }
        }
    }

    fn is_live(&self, index: LogIndex, term: Term) -> bool {
        self.term_of(index) == term && term != 0
    }

    /// Discard the entry at `from_index` and everything after it.
    ///
    /// Entries still borrowed stay alive in the refs table, detached from
    /// the log, until their last borrow is released.
    pub fn truncate(&mut self, from_index: LogIndex) {
        while self.n_entries() > 0 && self.last_index() >= from_index {
            let pos = (self.back + self.size() - 1) % self.size();
            let index = self.last_index();
            let entry = self.slots[pos].take().expect("back slot is live");
            self.back = pos;
            self.drop_or_detach(index, entry);
        }
    }

    /// Discard all entries up to and including `up_to_index`, advancing the
    /// offset. Used after a snapshot has made the prefix redundant.
    pub fn shift(&mut self, up_to_index: LogIndex) {
        debug_assert!(up_to_index <= self.last_index());

        while self.n_entries() > 0 && self.first_index() <= up_to_index {
            let index = self.first_index();
            let entry = self.slots[self.front].take().expect("front slot is live");
            self.front = (self.front + 1) % self.size();
            self.offset += 1;
            self.drop_or_detach(index, entry);
        }
    }

    fn drop_or_detach(&mut self, index: LogIndex, entry: Entry) {
        if self.refs.count(index, entry.term) > 0 {
            self.refs.detach(index, entry.term, entry);
        } else {
            self.refs.remove(index, entry.term);
        }
    }

    /// Install the starting index after loading a snapshot into an empty
    /// log.
    pub fn set_offset(&mut self, offset: LogIndex) {
        debug_assert_eq!(0, self.n_entries());
        self.front = 0;
        self.back = 0;
        self.offset = offset;
    }

    #[cfg(test)]
    fn ring_state(&self) -> (usize, usize, usize, LogIndex) {
        (self.size(), self.front, self.back, self.offset)
    }

    #[cfg(test)]
    fn ref_count(&self, index: LogIndex, term: Term) -> u32 {
        self.refs.count(index, term)
    }

    #[cfg(test)]
    fn refs_capacity(&self) -> usize {
        self.refs.capacity()
    }
}

impl Validate for Log {
    fn validate(&self) -> Result<(), Box<dyn StdError>> {
        if self.size() == 0 {
            validit::equal!(self.front, 0);
            validit::equal!(self.back, 0);
            return Ok(());
        }
        validit::less_equal!(self.front, self.size() - 1);
        validit::less_equal!(self.back, self.size() - 1);

        // Entry terms never decrease along the log.
        if self.n_entries() > 0 {
            let mut prev_term = 0;
            for index in self.first_index()..=self.last_index() {
                let entry = self.get(index).ok_or("live range must be contiguous")?;
                validit::less_equal!(prev_term, entry.term);
                prev_term = entry.term;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn payload() -> Bytes {
        Bytes::from_static(b"hello")
    }

    fn append_n(log: &mut Log, term: Term, n: usize) {
        for _ in 0..n {
            log.append(term, EntryType::Command, payload());
        }
    }

    #[test]
    fn empty_log() {
        let log = Log::new();
        assert_eq!(0, log.n_entries());
        assert_eq!(0, log.first_index());
        assert_eq!(0, log.last_index());
        assert_eq!(0, log.last_term());
        assert_eq!(0, log.term_of(1));
        assert_eq!(1, log.next_index());
    }

    #[test]
    fn empty_log_with_offset() {
        let mut log = Log::new();
        log.set_offset(10);
        assert_eq!(0, log.n_entries());
        assert_eq!(0, log.first_index());
        assert_eq!(0, log.last_index());
        assert_eq!(0, log.term_of(10));
        assert_eq!(11, log.next_index());
    }

    #[test]
    fn one_entry() {
        let mut log = Log::new();
        log.append(3, EntryType::Command, payload());
        assert_eq!(1, log.n_entries());
        assert_eq!(1, log.first_index());
        assert_eq!(1, log.last_index());
        assert_eq!(3, log.last_term());
        assert_eq!(3, log.term_of(1));
        assert_eq!((2, 0, 1, 0), log.ring_state());
    }

    #[test]
    fn one_entry_with_offset() {
        let mut log = Log::new();
        log.set_offset(10);
        log.append(1, EntryType::Command, payload());
        assert_eq!(11, log.first_index());
        assert_eq!(11, log.last_index());
        assert_eq!(1, log.term_of(11));
        assert_eq!(0, log.term_of(10));
    }

    #[test]
    fn ring_growth_cadence() {
        let mut log = Log::new();
        append_n(&mut log, 1, 1);
        assert_eq!(2, log.ring_state().0);
        append_n(&mut log, 1, 1);
        assert_eq!(6, log.ring_state().0);
        append_n(&mut log, 1, 3);
        assert_eq!(6, log.ring_state().0);
        append_n(&mut log, 1, 1);
        assert_eq!(14, log.ring_state().0);
        append_n(&mut log, 1, 8);
        assert_eq!(30, log.ring_state().0);
        assert_eq!(14, log.n_entries());
        for index in 1..=14 {
            assert_eq!(1, log.term_of(index));
        }
    }

    #[test]
    fn wrapped_ring() {
        let mut log = Log::new();
        append_n(&mut log, 1, 5);
        log.shift(4);
        append_n(&mut log, 1, 3);
        // front is past back now; count and indexing still hold.
        let (size, front, back, offset) = log.ring_state();
        assert_eq!(4, log.n_entries());
        assert_eq!(4, offset);
        assert!(front > back, "ring must be wrapped: front={} back={}", front, back);
        assert_eq!(6, size);
        assert_eq!(5, log.first_index());
        assert_eq!(8, log.last_index());
        for index in 5..=8 {
            assert_eq!(1, log.term_of(index));
        }
    }

    #[test]
    fn get_out_of_range() {
        let mut log = Log::new();
        append_n(&mut log, 1, 3);
        log.shift(1);
        assert_eq!(None, log.get(0));
        assert_eq!(None, log.get(1));
        assert!(log.get(2).is_some());
        assert!(log.get(3).is_some());
        assert_eq!(None, log.get(4));
    }

    #[test]
    fn acquire_bumps_and_release_restores_refcounts() {
        let mut log = Log::new();
        append_n(&mut log, 1, 3);
        assert_eq!(0, log.ref_count(2, 1));

        let entries = log.acquire(2);
        assert_eq!(2, entries.len());
        assert_eq!(1, log.ref_count(2, 1));
        assert_eq!(1, log.ref_count(3, 1));
        assert_eq!(0, log.ref_count(1, 1));

        log.release(2, &entries);
        assert_eq!(0, log.ref_count(2, 1));
        assert_eq!(0, log.ref_count(3, 1));
    }

    #[test]
    fn acquire_out_of_range_is_empty() {
        let mut log = Log::new();
        append_n(&mut log, 1, 2);
        assert!(log.acquire(3).is_empty());
        log.shift(1);
        assert!(log.acquire(1).is_empty());
    }

    #[test]
    fn acquired_payload_shares_the_allocation() {
        let mut log = Log::new();
        log.append(1, EntryType::Command, payload());
        let entries = log.acquire(1);
        assert_eq!(log.get(1).unwrap().payload.as_ptr(), entries[0].payload.as_ptr());
        log.release(1, &entries);
    }

    #[test]
    fn batch_entries_share_one_allocation() {
        let batch = Bytes::from(vec![0u8; 24]);
        let mut log = Log::new();
        for k in 0..3 {
            log.append(1, EntryType::Command, batch.slice(k * 8..(k + 1) * 8));
        }
        let base = batch.as_ptr();
        for k in 0..3u64 {
            let entry = log.get(k + 1).unwrap();
            assert_eq!(unsafe { base.add(k as usize * 8) }, entry.payload.as_ptr());
        }
    }

    #[test]
    fn truncate_discards_tail() {
        let mut log = Log::new();
        append_n(&mut log, 1, 3);
        log.truncate(2);
        assert_eq!(1, log.n_entries());
        assert_eq!(1, log.last_index());
        assert_eq!(0, log.term_of(2));
    }

    #[test]
    fn truncate_everything() {
        let mut log = Log::new();
        append_n(&mut log, 1, 3);
        log.truncate(1);
        assert_eq!(0, log.n_entries());
        assert_eq!(0, log.last_index());
        assert_eq!(1, log.next_index());
    }

    #[test]
    fn truncate_then_append_returns_to_pre_append_size() {
        let mut log = Log::new();
        append_n(&mut log, 1, 2);
        let before = log.n_entries();
        append_n(&mut log, 1, 1);
        log.truncate(3);
        assert_eq!(before, log.n_entries());
    }

    #[test]
    fn truncated_entry_with_refs_stays_detached_until_release() {
        let mut log = Log::new();
        append_n(&mut log, 1, 2);
        let entries = log.acquire(2);
        log.truncate(2);

        // Unreachable through the log, but the borrow keeps it in the table.
        assert_eq!(None, log.get(2));
        assert_eq!(1, log.ref_count(2, 1));

        // The same index can be re-used with a different term now.
        log.append(2, EntryType::Command, payload());
        assert_eq!(2, log.term_of(2));
        assert_eq!(0, log.ref_count(2, 2));

        log.release(2, &entries);
        assert_eq!(0, log.ref_count(2, 1));
        // The new generation is untouched by the release.
        assert_eq!(2, log.term_of(2));
    }

    #[test]
    fn shift_advances_offset_and_keeps_last_index() {
        let mut log = Log::new();
        append_n(&mut log, 1, 5);
        log.shift(3);
        assert_eq!(4, log.first_index());
        assert_eq!(5, log.last_index());
        assert_eq!(2, log.n_entries());
        assert_eq!(0, log.term_of(3));
    }

    #[test]
    fn shift_everything_empties_the_log() {
        let mut log = Log::new();
        append_n(&mut log, 1, 3);
        log.shift(3);
        assert_eq!(0, log.n_entries());
        assert_eq!(0, log.first_index());
        assert_eq!(4, log.next_index());
    }

    #[test]
    fn shifted_entry_with_refs_stays_detached_until_release() {
        let mut log = Log::new();
        append_n(&mut log, 1, 3);
        let entries = log.acquire(1);
        log.shift(2);
        assert_eq!(1, log.ref_count(1, 1));
        assert_eq!(1, log.ref_count(2, 1));
        log.release(1, &entries);
        assert_eq!(0, log.ref_count(1, 1));
        assert_eq!(0, log.ref_count(2, 1));
        assert_eq!(3, log.last_index());
    }

    #[test]
    fn refs_table_resizes_at_256_entries() {
        let mut log = Log::new();
        assert_eq!(0, log.refs_capacity());
        append_n(&mut log, 1, 256);
        assert_eq!(256, log.refs_capacity());
        append_n(&mut log, 1, 1);
        assert_eq!(512, log.refs_capacity());
        for index in 1..=257 {
            assert_eq!(1, log.term_of(index));
        }
    }

    #[test]
    fn refs_table_resizes_at_4096_entries() {
        let mut log = Log::new();
        append_n(&mut log, 1, 4096);
        assert_eq!(4096, log.refs_capacity());
        append_n(&mut log, 1, 1);
        assert_eq!(8192, log.refs_capacity());
        assert_eq!(4097, log.n_entries());
        assert_eq!(1, log.term_of(4097));
    }

    #[test]
    fn append_configuration_round_trips() {
        let mut configuration = Configuration::new();
        configuration.add(1, "1", true).unwrap();
        configuration.add(2, "2", false).unwrap();

        let mut log = Log::new();
        log.append_configuration(4, &configuration);

        let entry = log.get(1).unwrap();
        assert_eq!(EntryType::Configuration, entry.typ);
        assert_eq!(4, entry.term);
        assert_eq!(configuration, Configuration::decode(&entry.payload).unwrap());
    }

    #[test]
    fn validate_holds_through_mutations() {
        let mut log = Log::new();
        append_n(&mut log, 1, 10);
        append_n(&mut log, 2, 5);
        log.validate().unwrap();
        log.shift(8);
        log.validate().unwrap();
        log.truncate(12);
        log.validate().unwrap();
        // Emptied but with capacity allocated.
        log.truncate(1);
        log.validate().unwrap();
        log.set_offset(40);
        log.validate().unwrap();
    }
}
