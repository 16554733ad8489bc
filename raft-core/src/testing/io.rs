use std::cell::Cell;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use crate::configuration::Configuration;
use crate::entry::Entry;
use crate::entry::EntryType;
use crate::error::Error;
use crate::io::InitialState;
use crate::io::Io;
use crate::io::IoCompletion;
use crate::message::Message;
use crate::snapshot::Snapshot;
use crate::LogIndex;
use crate::ServerId;
use crate::Term;

/// A message leaving a [`StubIo`], with the latency the virtual network
/// assigned to it.
#[derive(Debug)]
pub struct Delivery {
    pub from: ServerId,
    pub to: ServerId,
    pub message: Message,
    pub latency: u64,
}

/// In-memory [`Io`] implementation driven by a shared virtual clock.
///
/// Submissions queue up; nothing completes until [`StubIo::flush`] is
/// called, which the fixture does once per step. That models disk and
/// network asynchrony while keeping every run deterministic: randomness
/// comes from a per-engine seeded generator.
#[derive(Debug)]
pub struct StubIo {
    id: ServerId,
    clock: Rc<Cell<u64>>,
    rng: StdRng,

    // Durable state.
    term: Term,
    voted_for: ServerId,
    entries: BTreeMap<LogIndex, Entry>,
    snapshot: Option<Snapshot>,

    // Submitted but not yet completed work.
    pending_appends: VecDeque<(LogIndex, Vec<Entry>)>,
    pending_snapshot_put: Option<Snapshot>,
    pending_snapshot_get: bool,
    outbox: Vec<(u64, ServerId, Message)>,
    next_seq: u64,

    min_latency: u64,
    max_latency: u64,

    /// Number of upcoming append completions to fail.
    append_faults: u32,
}

impl StubIo {
    pub fn new(id: ServerId, clock: Rc<Cell<u64>>, seed: u64) -> Self {
        Self {
            id,
            clock,
            rng: StdRng::seed_from_u64(seed),
            term: 0,
            voted_for: 0,
            entries: BTreeMap::new(),
            snapshot: None,
            pending_appends: VecDeque::new(),
            pending_snapshot_put: None,
            pending_snapshot_get: false,
            outbox: Vec::new(),
            next_seq: 0,
            min_latency: 5,
            max_latency: 50,
            append_faults: 0,
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Complete all pending submissions: appends and snapshot operations
    /// become [`IoCompletion`]s, outbound messages become [`Delivery`]s
    /// with a random latency drawn from this engine's generator.
    pub fn flush(&mut self) -> (Vec<IoCompletion>, Vec<Delivery>) {
        let mut completions = Vec::new();
        let mut deliveries = Vec::new();

        while let Some((first_index, entries)) = self.pending_appends.pop_front() {
            if self.append_faults > 0 {
                self.append_faults -= 1;
                completions.push(IoCompletion::Append {
                    status: Err(Error::io("injected append fault")),
                });
                continue;
            }
            for (k, entry) in entries.into_iter().enumerate() {
                self.entries.insert(first_index + k as LogIndex, entry);
            }
            completions.push(IoCompletion::Append { status: Ok(()) });
        }

        if let Some(snapshot) = self.pending_snapshot_put.take() {
            let covered: Vec<LogIndex> = self.entries.range(..=snapshot.index).map(|(i, _)| *i).collect();
            for index in covered {
                self.entries.remove(&index);
            }
            self.snapshot = Some(snapshot);
            completions.push(IoCompletion::SnapshotPut { status: Ok(()) });
        }

        if self.pending_snapshot_get {
            self.pending_snapshot_get = false;
            let result = match &self.snapshot {
                Some(snapshot) => Ok(snapshot.clone()),
                None => Err(Error::io("no snapshot in storage")),
            };
            completions.push(IoCompletion::SnapshotGet { result });
        }

        let (min, max) = (self.min_latency, self.max_latency);
        for (seq, to, message) in self.outbox.drain(..) {
            completions.push(IoCompletion::Send { seq, status: Ok(()) });
            let latency = if max > min { self.rng.gen_range(min..=max) } else { min };
            deliveries.push(Delivery {
                from: self.id,
                to,
                message,
                latency,
            });
        }

        (completions, deliveries)
    }

    pub fn has_pending_work(&self) -> bool {
        !self.pending_appends.is_empty()
            || self.pending_snapshot_put.is_some()
            || self.pending_snapshot_get
            || !self.outbox.is_empty()
    }

    // --- Seeding, used by the fixture before `start` ---

    pub fn seed_term(&mut self, term: Term) {
        self.term = term;
    }

    pub fn seed_vote(&mut self, id: ServerId) {
        self.voted_for = id;
    }

    pub fn seed_entries(&mut self, start_index: LogIndex, entries: Vec<Entry>) {
        for (k, entry) in entries.into_iter().enumerate() {
            self.entries.insert(start_index + k as LogIndex, entry);
        }
    }

    pub fn seed_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshot = Some(snapshot);
    }

    pub fn set_latency(&mut self, min: u64, max: u64) {
        debug_assert!(min <= max);
        self.min_latency = min;
        self.max_latency = max;
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Make the next `n` append completions fail with an I/O error.
    pub fn inject_append_faults(&mut self, n: u32) {
        self.append_faults = n;
    }

    /// Forget all submitted-but-incomplete work, as a crash would.
    pub fn discard_pending(&mut self) {
        self.pending_appends.clear();
        self.pending_snapshot_put = None;
        self.pending_snapshot_get = false;
        self.outbox.clear();
    }
}

impl Io for StubIo {
    fn load(&mut self) -> Result<InitialState, Error> {
        let start_index = self.entries.keys().next().copied().unwrap_or(0);
        // The stored run must be contiguous.
        for (k, index) in self.entries.keys().enumerate() {
            if *index != start_index + k as LogIndex {
                return Err(Error::io(format!("stored entries have a gap at index {}", index)));
            }
        }
        Ok(InitialState {
            term: self.term,
            voted_for: self.voted_for,
            snapshot: self.snapshot.clone(),
            start_index,
            entries: self.entries.values().cloned().collect(),
        })
    }

    fn bootstrap(&mut self, configuration: &Configuration) -> Result<(), Error> {
        if self.term != 0 || !self.entries.is_empty() || self.snapshot.is_some() {
            return Err(Error::BadState);
        }
        self.entries.insert(
            1,
            Entry {
                term: 1,
                typ: EntryType::Configuration,
                payload: configuration.encode(),
            },
        );
        Ok(())
    }

    fn set_term(&mut self, term: Term) -> Result<(), Error> {
        self.term = term;
        self.voted_for = 0;
        Ok(())
    }

    fn set_vote(&mut self, id: ServerId) -> Result<(), Error> {
        self.voted_for = id;
        Ok(())
    }

    fn append(&mut self, first_index: LogIndex, entries: Vec<Entry>) -> Result<(), Error> {
        self.pending_appends.push_back((first_index, entries));
        Ok(())
    }

    fn truncate(&mut self, from_index: LogIndex) -> Result<(), Error> {
        let removed: Vec<LogIndex> = self.entries.range(from_index..).map(|(i, _)| *i).collect();
        for index in removed {
            self.entries.remove(&index);
        }
        Ok(())
    }

    fn snapshot_put(&mut self, snapshot: Snapshot) -> Result<(), Error> {
        debug_assert!(self.pending_snapshot_put.is_none());
        self.pending_snapshot_put = Some(snapshot);
        Ok(())
    }

    fn snapshot_get(&mut self) -> Result<(), Error> {
        self.pending_snapshot_get = true;
        Ok(())
    }

    fn send(&mut self, to: ServerId, _to_address: &str, message: Message) -> Result<u64, Error> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.outbox.push((seq, to, message));
        Ok(seq)
    }

    fn time(&mut self) -> u64 {
        self.clock.get()
    }

    fn random(&mut self, min: u64, max: u64) -> u64 {
        if max <= min {
            return min;
        }
        self.rng.gen_range(min..max)
    }
}
