use std::cell::Cell;
use std::collections::HashSet;
use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::oneshot;
use validit::Validate;

use crate::config::Config;
use crate::configuration::Configuration;
use crate::entry::Entry;
use crate::error::Error;
use crate::message::Message;
use crate::message::MessageKind;
use crate::raft::Raft;
use crate::raft::State;
use crate::snapshot::Snapshot;
use crate::testing::fsm::TestFsm;
use crate::testing::io::StubIo;
use crate::LogIndex;
use crate::ServerId;
use crate::Term;

/// Largest cluster the fixture will simulate.
pub const MAX_SERVERS: usize = 8;

struct Node {
    alive: bool,
    started: bool,
    raft: Raft<StubIo, TestFsm>,
}

struct InFlight {
    deliver_at: u64,
    from: ServerId,
    to: ServerId,
    message: Message,
}

/// A simulated cluster of engines sharing one virtual clock.
///
/// Each [`Cluster::step`] flushes every server's pending I/O, advances time
/// to the next interesting moment (a message delivery or a timer expiry),
/// delivers due messages, ticks every live engine, and then checks the
/// cluster-wide safety properties: Election Safety on every step, Leader
/// Append-Only whenever the same stable leader is observed twice in a row,
/// and each engine's internal invariants.
///
/// Server `i` (0-based) has id `i + 1`. All servers start connected.
pub struct Cluster {
    clock: Rc<Cell<u64>>,
    config: Config,
    nodes: Vec<Node>,
    in_flight: Vec<InFlight>,
    /// Directed pairs of server ids whose link is down.
    disconnected: HashSet<(ServerId, ServerId)>,
    /// Message kinds dropped on arrival at a given server id.
    drop_rules: HashSet<(MessageKind, ServerId)>,

    stable_leader: Option<usize>,
    prev_leader_log: Vec<(LogIndex, Term)>,
    prev_commit: LogIndex,
}

impl Cluster {
    pub fn new(n: usize) -> Self {
        Self::with_config(n, Config::default())
    }

    pub fn with_config(n: usize, config: Config) -> Self {
        assert!(n >= 1 && n <= MAX_SERVERS);
        super::init_tracing();

        let config = config.validate().expect("fixture config must be valid");
        let mut cluster = Cluster {
            clock: Rc::new(Cell::new(0)),
            config,
            nodes: Vec::new(),
            in_flight: Vec::new(),
            disconnected: HashSet::new(),
            drop_rules: HashSet::new(),
            stable_leader: None,
            prev_leader_log: Vec::new(),
            prev_commit: 0,
        };
        for _ in 0..n {
            cluster.push_node();
        }
        cluster
    }

    /// A cluster of `n` servers (the first `n_voting` of them voters),
    /// bootstrapped and started.
    pub fn bootstrapped(n: usize, n_voting: usize) -> Self {
        let mut cluster = Self::new(n);
        let configuration = cluster.configuration(n_voting);
        cluster.bootstrap(&configuration);
        cluster.start();
        cluster
    }

    fn push_node(&mut self) -> usize {
        let i = self.nodes.len();
        assert!(i < MAX_SERVERS, "fixture supports at most {} servers", MAX_SERVERS);

        let id = (i + 1) as ServerId;
        let io = StubIo::new(id, Rc::clone(&self.clock), 0x5eed + id);
        let raft = Raft::new(id, id.to_string(), io, TestFsm::new(), self.config.clone()).expect("engine init");
        self.nodes.push(Node {
            alive: true,
            started: false,
            raft,
        });
        i
    }

    /// Add a new, empty, not-yet-started server and return its index.
    pub fn grow(&mut self) -> usize {
        self.push_node()
    }

    /// A configuration holding every current server, the first `n_voting`
    /// of them as voters.
    pub fn configuration(&self, n_voting: usize) -> Configuration {
        let mut configuration = Configuration::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let id = node.raft.id();
            configuration.add(id, id.to_string(), i < n_voting).expect("distinct ids");
        }
        configuration
    }

    /// Bootstrap every server named in `configuration`.
    pub fn bootstrap(&mut self, configuration: &Configuration) {
        for node in &mut self.nodes {
            if configuration.get(node.raft.id()).is_some() {
                node.raft.bootstrap(configuration).expect("bootstrap");
            }
        }
    }

    /// Start every server that is not running yet.
    pub fn start(&mut self) {
        for i in 0..self.nodes.len() {
            if !self.nodes[i].started {
                self.start_server(i);
            }
        }
    }

    pub fn start_server(&mut self, i: usize) {
        let node = &mut self.nodes[i];
        node.raft.start().expect("start");
        node.started = true;
    }

    // --- Accessors ---

    pub fn n(&self) -> usize {
        self.nodes.len()
    }

    pub fn id_of(&self, i: usize) -> ServerId {
        self.nodes[i].raft.id()
    }

    fn index_by_id(&self, id: ServerId) -> Option<usize> {
        self.nodes.iter().position(|n| n.raft.id() == id)
    }

    pub fn raft(&self, i: usize) -> &Raft<StubIo, TestFsm> {
        &self.nodes[i].raft
    }

    pub fn raft_mut(&mut self, i: usize) -> &mut Raft<StubIo, TestFsm> {
        &mut self.nodes[i].raft
    }

    pub fn fsm(&self, i: usize) -> &TestFsm {
        self.nodes[i].raft.fsm()
    }

    pub fn alive(&self, i: usize) -> bool {
        self.nodes[i].alive
    }

    pub fn time(&self) -> u64 {
        self.clock.get()
    }

    /// Index of the current stable leader, if any: the highest-term leader
    /// acknowledged by a majority of the voters connected to it.
    pub fn leader_index(&self) -> Option<usize> {
        self.stable_leader
    }

    /// Propose a command on server `i`, which must be the leader.
    pub fn propose(&mut self, i: usize, payload: Bytes) -> oneshot::Receiver<Result<(), Error>> {
        self.nodes[i].raft.apply(payload).expect("propose on the leader")
    }

    // --- Fault & topology control ---

    /// Stop a server for good: no deliveries, no ticks.
    pub fn kill(&mut self, i: usize) {
        self.nodes[i].alive = false;
    }

    /// Crash-restart server `i`: volatile state and in-flight I/O are lost,
    /// a fresh engine is loaded from the surviving durable state.
    pub fn restart(&mut self, i: usize) {
        let id = self.id_of(i);
        let placeholder = StubIo::new(id, Rc::clone(&self.clock), 0);
        let placeholder =
            Raft::new(id, id.to_string(), placeholder, TestFsm::new(), self.config.clone()).expect("engine init");

        let old = std::mem::replace(&mut self.nodes[i].raft, placeholder);
        let (mut io, _fsm) = old.into_parts();
        io.discard_pending();

        self.nodes[i].raft =
            Raft::new(id, id.to_string(), io, TestFsm::new(), self.config.clone()).expect("engine init");
        self.nodes[i].alive = true;
        self.nodes[i].started = false;
        self.start_server(i);
    }

    pub fn disconnect(&mut self, i: usize, j: usize) {
        let (a, b) = (self.id_of(i), self.id_of(j));
        self.disconnected.insert((a, b));
        self.disconnected.insert((b, a));
    }

    pub fn reconnect(&mut self, i: usize, j: usize) {
        let (a, b) = (self.id_of(i), self.id_of(j));
        self.disconnected.remove(&(a, b));
        self.disconnected.remove(&(b, a));
    }

    pub fn connected(&self, i: usize, j: usize) -> bool {
        !self.disconnected.contains(&(self.id_of(i), self.id_of(j)))
    }

    /// Drop all messages of `kind` arriving at server `i`.
    pub fn drop_arriving(&mut self, kind: MessageKind, i: usize) {
        self.drop_rules.insert((kind, self.id_of(i)));
    }

    pub fn stop_dropping(&mut self, kind: MessageKind, i: usize) {
        self.drop_rules.remove(&(kind, self.id_of(i)));
    }

    /// Park server `i`'s election timer so it cannot start elections.
    pub fn pause_election_timer(&mut self, i: usize) {
        self.nodes[i].raft.election_timeout_rand = u64::MAX / 2;
    }

    /// Draw a fresh election timeout for server `i`.
    pub fn resume_election_timer(&mut self, i: usize) {
        self.nodes[i].raft.reset_election_timer();
    }

    // --- Seeding persistent state (before `start`) ---

    pub fn set_term(&mut self, i: usize, term: Term) {
        assert!(!self.nodes[i].started);
        self.nodes[i].raft.io_mut().seed_term(term);
    }

    pub fn set_entries(&mut self, i: usize, start_index: LogIndex, entries: Vec<Entry>) {
        assert!(!self.nodes[i].started);
        self.nodes[i].raft.io_mut().seed_entries(start_index, entries);
    }

    pub fn set_snapshot(&mut self, i: usize, snapshot: Snapshot) {
        assert!(!self.nodes[i].started);
        self.nodes[i].raft.io_mut().seed_snapshot(snapshot);
    }

    pub fn set_latency(&mut self, i: usize, min: u64, max: u64) {
        self.nodes[i].raft.io_mut().set_latency(min, max);
    }

    pub fn set_random_seed(&mut self, i: usize, seed: u64) {
        self.nodes[i].raft.io_mut().set_seed(seed);
    }

    // --- Driving ---

    /// Advance the cluster by the smallest step that makes progress.
    pub fn step(&mut self) {
        self.flush_io();
        self.advance_clock();
        self.deliver_due();
        for node in &mut self.nodes {
            if node.alive && node.started {
                node.raft.tick();
            }
        }
        self.check_invariants();
    }

    /// Step until `pred` holds or `max_ms` of virtual time elapsed.
    pub fn step_until(&mut self, mut pred: impl FnMut(&Cluster) -> bool, max_ms: u64) -> bool {
        let deadline = self.clock.get().saturating_add(max_ms);
        loop {
            if pred(self) {
                return true;
            }
            if self.clock.get() >= deadline {
                return false;
            }
            self.step();
        }
    }

    pub fn step_until_elapsed(&mut self, ms: u64) {
        let deadline = self.clock.get().saturating_add(ms);
        while self.clock.get() < deadline {
            self.step();
        }
    }

    pub fn step_until_has_leader(&mut self, max_ms: u64) -> bool {
        self.step_until(|c| c.stable_leader.is_some(), max_ms)
    }

    pub fn step_until_has_no_leader(&mut self, max_ms: u64) -> bool {
        self.step_until(|c| c.stable_leader.is_none(), max_ms)
    }

    /// Step until server `i` has applied `index`; with `i == n()`, until
    /// every live server has.
    pub fn step_until_applied(&mut self, i: usize, index: LogIndex, max_ms: u64) -> bool {
        if i == self.nodes.len() {
            self.step_until(
                |c| {
                    c.nodes.iter().all(|n| !n.alive || !n.started || n.raft.last_applied() >= index)
                },
                max_ms,
            )
        } else {
            self.step_until(|c| c.nodes[i].raft.last_applied() >= index, max_ms)
        }
    }

    /// Drive the cluster so that server `i` wins an election: everyone
    /// else's election timer is parked, `i`'s fires as early as possible.
    pub fn elect(&mut self, i: usize) {
        assert!(
            self.nodes.iter().all(|n| n.raft.state() != State::Leader),
            "cluster already has a leader"
        );

        let election_timeout = self.config.election_timeout;
        for j in 0..self.nodes.len() {
            if j == i {
                self.nodes[j].raft.election_timeout_rand = election_timeout;
            } else {
                self.pause_election_timer(j);
            }
        }

        let elected = self.step_until(|c| c.stable_leader == Some(i), 20 * election_timeout);
        assert!(elected, "server {} was not elected", i);

        for j in 0..self.nodes.len() {
            if j != i && self.nodes[j].started && self.nodes[j].alive {
                self.resume_election_timer(j);
            }
        }
    }

    /// Drive the current leader out of office by dropping the
    /// AppendEntries results it relies on to keep its authority.
    pub fn depose(&mut self) {
        let li = self.stable_leader.expect("no leader to depose");
        let leader_id = self.id_of(li);
        self.drop_rules.insert((MessageKind::AppendEntriesResult, leader_id));

        let max_ms = 5 * self.config.election_timeout;
        let deposed = self.step_until(|c| c.nodes[li].raft.state() != State::Leader, max_ms);

        self.drop_rules.remove(&(MessageKind::AppendEntriesResult, leader_id));
        assert!(deposed, "leader did not step down");
    }

    // --- Internals ---

    fn flush_io(&mut self) {
        let now = self.clock.get();
        let mut deliveries = Vec::new();
        for node in &mut self.nodes {
            if !node.alive {
                continue;
            }
            let (completions, outbound) = node.raft.io_mut().flush();
            for completion in completions {
                node.raft.io_completed(completion);
            }
            deliveries.extend(outbound);
        }
        for delivery in deliveries {
            self.in_flight.push(InFlight {
                deliver_at: now + delivery.latency,
                from: delivery.from,
                to: delivery.to,
                message: delivery.message,
            });
        }
    }

    /// Move the clock to the next message delivery or timer expiry,
    /// whichever comes first; always at least one millisecond.
    fn advance_clock(&mut self) {
        let now = self.clock.get();
        let mut next = u64::MAX;
        for m in &self.in_flight {
            next = next.min(m.deliver_at);
        }
        for node in &self.nodes {
            if node.alive && node.started && node.raft.state() != State::Unavailable {
                next = next.min(now + node.raft.next_timeout());
            }
        }
        let delta = if next == u64::MAX { 1 } else { next.saturating_sub(now).max(1) };
        self.clock.set(now + delta);
    }

    fn deliver_due(&mut self) {
        let now = self.clock.get();
        let mut due = Vec::new();
        let mut rest = Vec::new();
        for m in self.in_flight.drain(..) {
            if m.deliver_at <= now {
                due.push(m);
            } else {
                rest.push(m);
            }
        }
        self.in_flight = rest;
        due.sort_by_key(|m| m.deliver_at);

        for m in due {
            if self.disconnected.contains(&(m.from, m.to)) {
                continue;
            }
            if self.drop_rules.contains(&(m.message.kind(), m.to)) {
                continue;
            }
            let Some(i) = self.index_by_id(m.to) else {
                continue;
            };
            if !self.nodes[i].alive || !self.nodes[i].started {
                continue;
            }
            self.nodes[i].raft.recv(m.from, m.message);
        }
    }

    fn check_invariants(&mut self) {
        for node in &self.nodes {
            if node.alive && node.started {
                node.raft.validate().expect("engine invariant violated");
            }
        }
        self.update_stable_leader();
    }

    /// Detect the stable leader and check Election Safety and Leader
    /// Append-Only.
    fn update_stable_leader(&mut self) {
        let mut leaders: Vec<(usize, Term)> = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.alive && node.started && node.raft.state() == State::Leader {
                leaders.push((i, node.raft.current_term()));
            }
        }

        for a in 0..leaders.len() {
            for b in a + 1..leaders.len() {
                assert_ne!(
                    leaders[a].1, leaders[b].1,
                    "Election Safety violated: servers {} and {} both lead term {}",
                    leaders[a].0, leaders[b].0, leaders[a].1
                );
            }
        }

        let Some(&(li, term)) = leaders.iter().max_by_key(|(_, t)| *t) else {
            self.stable_leader = None;
            return;
        };

        // Stable: acknowledged by a majority of the voters connected to it.
        let leader_id = self.id_of(li);
        let configuration = self.nodes[li].raft.configuration().clone();
        let mut acked = 0;
        for server in configuration.servers() {
            if !server.voting {
                continue;
            }
            if server.id == leader_id {
                acked += 1;
                continue;
            }
            let Some(j) = self.index_by_id(server.id) else {
                continue;
            };
            let node = &self.nodes[j];
            if node.alive
                && node.started
                && !self.disconnected.contains(&(leader_id, server.id))
                && node.raft.current_term() == term
                && node.raft.current_leader() == Some(leader_id)
            {
                acked += 1;
            }
        }
        if acked <= configuration.n_voting() / 2 {
            self.stable_leader = None;
            return;
        }

        if self.stable_leader == Some(li) {
            let raft = &self.nodes[li].raft;
            for &(index, entry_term) in &self.prev_leader_log {
                if index <= raft.snapshot_index() {
                    // Compacted by a snapshot since the copy was taken.
                    continue;
                }
                assert_eq!(
                    entry_term,
                    raft.log().term_of(index),
                    "Leader Append-Only violated at index {}",
                    index
                );
            }
            if let Some(&(last, _)) = self.prev_leader_log.last() {
                assert!(raft.local_last_index() >= last, "Leader Append-Only violated: log shrank");
            }
            assert!(raft.commit_index() >= self.prev_commit, "commit index moved backwards");
        }

        self.stable_leader = Some(li);
        let raft = &self.nodes[li].raft;
        self.prev_leader_log = (raft.log().first_index()..=raft.log().last_index())
            .filter(|index| *index > 0)
            .map(|index| (index, raft.log().term_of(index)))
            .collect();
        self.prev_commit = raft.commit_index();
    }
}
