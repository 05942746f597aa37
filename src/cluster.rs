//! Deterministic in-process cluster for tests.
//!
//! Nodes share a virtual clock that only moves when the test calls [`Cluster::tick`]
//! or [`Cluster::advance`]. Messages are delivered with zero latency unless the link
//! is cut. Crashing a node keeps its storage, so it can be restarted from it.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info};

use crate::command::Command;
use crate::machine::{AtomicValueMachine, ClientCommand, CommandOutput};
use crate::membership::{Membership, MembershipError};
use crate::node::{Node, Role};
use crate::primitive::{self, ClientReply, ClientRequest, Submission};
use crate::runtime::{Applied, Event, Runtime, StateMachine, TimerConfig};
use crate::storage::{MemoryStorage, MemoryStorageError};
use crate::types::{LogIndex, Message, NodeId, Term};

/// Granularity of the virtual clock.
pub const TICK: Duration = Duration::from_millis(10);

/// A message in flight between nodes.
struct InFlight<C> {
    from: NodeId,
    to: NodeId,
    message: Message<C>,
}

type SimRuntime<C, S> = Runtime<C, S, MemoryStorage<C>>;

/// Simulated cluster for testing.
pub struct Cluster<C, S: StateMachine<C>> {
    membership: Membership,
    runtimes: Vec<Option<SimRuntime<C, S>>>,
    /// Durable state of crashed nodes.
    stopped: Vec<Option<MemoryStorage<C>>>,
    applied: Vec<Vec<Applied<S::Output>>>,
    messages: VecDeque<InFlight<C>>,
    blocked: HashSet<(NodeId, NodeId)>,
    config: TimerConfig,
    snapshot_threshold: u64,
    now: Instant,
    wall_ms: u64,
}

impl<C, S> Cluster<C, S>
where
    C: Clone,
    S: StateMachine<C> + Default + Serialize + DeserializeOwned,
{
    /// Create a cluster with the given number of nodes and default timers.
    pub fn new(size: usize) -> Result<Self, MembershipError> {
        Self::with_config(size, TimerConfig::default(), 0)
    }

    pub fn with_config(
        size: usize,
        config: TimerConfig,
        snapshot_threshold: u64,
    ) -> Result<Self, MembershipError> {
        let membership = Membership::new((1..=size).map(|i| NodeId::from(i as u64)))?;
        let now = Instant::now();

        let runtimes = membership
            .members()
            .iter()
            .map(|&id| {
                let node = Node::new(id, membership.clone(), MemoryStorage::new(), config.election_timeout);
                let mut runtime = Runtime::new(node, S::default(), config.clone())
                    .with_snapshot_threshold(snapshot_threshold);
                runtime.reset_timers_at(now);
                Some(runtime)
            })
            .collect::<Vec<_>>();
        let size = runtimes.len();

        Ok(Self {
            membership,
            runtimes,
            stopped: (0..size).map(|_| None).collect(),
            applied: (0..size).map(|_| Vec::new()).collect(),
            messages: VecDeque::new(),
            blocked: HashSet::new(),
            config,
            snapshot_threshold,
            now,
            wall_ms: 1_000_000,
        })
    }

    pub fn size(&self) -> usize {
        self.runtimes.len()
    }

    pub fn id(&self, index: usize) -> NodeId {
        self.membership.members()[index]
    }

    /// Current virtual time.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Virtual wall clock in milliseconds, as stamped onto client commands.
    pub fn wall_ms(&self) -> u64 {
        self.wall_ms
    }

    /// A node's runtime by index (0-based), `None` while it is crashed.
    pub fn runtime(&self, index: usize) -> Option<&SimRuntime<C, S>> {
        self.runtimes.get(index)?.as_ref()
    }

    pub fn runtime_mut(&mut self, index: usize) -> Option<&mut SimRuntime<C, S>> {
        self.runtimes.get_mut(index)?.as_mut()
    }

    pub fn is_up(&self, index: usize) -> bool {
        self.runtime(index).is_some()
    }

    /// Trigger election timeout on a specific node.
    pub fn election_timeout(&mut self, index: usize) {
        self.drive(index, Event::ElectionTimeout);
    }

    /// Trigger heartbeat timeout on a specific node.
    pub fn heartbeat_timeout(&mut self, index: usize) {
        self.drive(index, Event::HeartbeatTimeout);
    }

    /// Deliver all pending messages, including the ones sent in response.
    pub fn deliver_all(&mut self) {
        while let Some(msg) = self.messages.pop_front() {
            self.deliver(msg);
        }
    }

    /// Move the clock one tick, fire due timers and deliver the resulting traffic.
    pub fn tick(&mut self) {
        // Replication of commands submitted directly to a runtime.
        for index in 0..self.size() {
            self.flush(index);
        }
        self.now += TICK;
        self.wall_ms += TICK.as_millis() as u64;
        for index in 0..self.size() {
            let event = self
                .runtime(index)
                .and_then(|rt| rt.poll_timers_at(self.now));
            if let Some(event) = event {
                self.drive(index, event);
            }
        }
        self.deliver_all();
    }

    /// Tick for `duration`.
    pub fn advance(&mut self, duration: Duration) {
        let ticks = duration.as_millis().div_ceil(TICK.as_millis());
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Tick until some live node leads the highest term seen, for at most `limit`.
    pub fn run_until_leader(&mut self, limit: Duration) -> Option<usize> {
        let deadline = self.now + limit;
        while self.now < deadline {
            if let Some(leader) = self.leader() {
                return Some(leader);
            }
            self.tick();
        }
        self.leader()
    }

    /// Cut every link between nodes in different groups. Nodes not listed end up
    /// alone.
    pub fn partition(&mut self, groups: &[&[usize]]) {
        self.heal();
        let group_of = |index: usize| groups.iter().position(|g| g.contains(&index));
        for a in 0..self.size() {
            for b in 0..self.size() {
                if a == b {
                    continue;
                }
                let same = matches!((group_of(a), group_of(b)), (Some(x), Some(y)) if x == y);
                if !same {
                    self.blocked.insert((self.id(a), self.id(b)));
                }
            }
        }
    }

    /// Cut the link between two nodes, in both directions.
    pub fn cut(&mut self, a: usize, b: usize) {
        self.blocked.insert((self.id(a), self.id(b)));
        self.blocked.insert((self.id(b), self.id(a)));
    }

    /// Cut `index` off from everyone else.
    pub fn isolate(&mut self, index: usize) {
        for other in 0..self.size() {
            if other != index {
                self.cut(index, other);
            }
        }
    }

    /// Restore every link.
    pub fn heal(&mut self) {
        self.blocked.clear();
    }

    /// Stop a node, keeping only what it made durable.
    pub fn crash(&mut self, index: usize) {
        let Some(runtime) = self.runtimes.get_mut(index).and_then(Option::take) else {
            return;
        };
        let id = runtime.node().id;
        info!(node = %id, "simulated crash");
        self.stopped[index] = Some(runtime.into_storage());
        self.applied[index].clear();
        self.messages.retain(|m| m.from != id && m.to != id);
    }

    /// Start a crashed node again from its storage (and snapshot, if any).
    pub fn restart(&mut self, index: usize) -> Result<(), MemoryStorageError> {
        let Some(storage) = self.stopped.get_mut(index).and_then(Option::take) else {
            return Ok(());
        };
        let id = self.id(index);
        let mut runtime = Runtime::from_storage(
            id,
            self.membership.clone(),
            S::default(),
            storage,
            self.config.clone(),
        )?
        .with_snapshot_threshold(self.snapshot_threshold);
        runtime.reset_timers_at(self.now);
        info!(node = %id, "simulated restart");
        self.runtimes[index] = Some(runtime);
        Ok(())
    }

    /// The live leader with the highest term, if any.
    pub fn leader(&self) -> Option<usize> {
        self.leaders()
            .into_iter()
            .max_by_key(|&index| self.term(index))
    }

    /// Every live node that currently believes it is leader.
    pub fn leaders(&self) -> Vec<usize> {
        (0..self.size())
            .filter(|&i| self.runtime(i).is_some_and(|rt| rt.is_leader()))
            .collect()
    }

    /// Current term of a live node.
    pub fn term(&self, index: usize) -> Option<Term> {
        self.runtime(index)?.node().current_term().ok()
    }

    /// Count live nodes in each role.
    pub fn role_counts(&self) -> (usize, usize, usize) {
        let mut followers = 0;
        let mut candidates = 0;
        let mut leaders = 0;

        for rt in self.runtimes.iter().flatten() {
            match rt.node().role {
                Role::Follower(_) => followers += 1,
                Role::Candidate(_) => candidates += 1,
                Role::Leader(_) => leaders += 1,
            }
        }

        (followers, candidates, leaders)
    }

    /// Drain what a node has applied since the last call.
    pub fn take_applied(&mut self, index: usize) -> Vec<Applied<S::Output>> {
        self.applied
            .get_mut(index)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Feed one event to a node. A storage failure halts that node, as it would
    /// halt a real server.
    fn drive(&mut self, index: usize, event: Event<C>) {
        let now = self.now;
        let Some(runtime) = self.runtime_mut(index) else {
            return;
        };
        match runtime.handle_at(event, now) {
            Ok(commands) => {
                self.collect_outputs(index);
                self.queue_commands(index, commands);
            }
            Err(e) => {
                error!(node = %self.id(index), error = %e, "storage failure, halting node");
                self.crash(index);
            }
        }
    }

    /// Queue the messages a node produced outside event handling.
    fn flush(&mut self, index: usize) {
        if let Some(commands) = self.runtime_mut(index).map(Runtime::take_commands) {
            self.queue_commands(index, commands);
        }
    }

    fn collect_outputs(&mut self, index: usize) {
        if let Some(outputs) = self.runtime_mut(index).map(Runtime::take_outputs) {
            self.applied[index].extend(outputs);
        }
    }

    /// Deliver a single message if its link is up and the receiver is alive.
    fn deliver(&mut self, inflight: InFlight<C>) {
        if self.blocked.contains(&(inflight.from, inflight.to)) {
            return;
        }
        if let Some(index) = self.node_index(inflight.to) {
            self.drive(
                index,
                Event::Message {
                    from: inflight.from,
                    message: inflight.message,
                },
            );
        }
    }

    /// Queue outgoing commands from a node.
    fn queue_commands(&mut self, from_index: usize, commands: Vec<Command<C>>) {
        let from = self.id(from_index);
        for command in commands {
            match command {
                Command::Send { to, message } => self.push(from, to, message),
                Command::Broadcast { message } => {
                    for to in self.membership.peers_of(from) {
                        self.push(from, to, message.clone());
                    }
                }
                Command::ResetElectionTimer | Command::ResetHeartbeatTimer => {}
            }
        }
    }

    fn push(&mut self, from: NodeId, to: NodeId, message: Message<C>) {
        if !self.blocked.contains(&(from, to)) {
            self.messages.push_back(InFlight { from, to, message });
        }
    }

    /// Find runtime index by node ID.
    fn node_index(&self, id: NodeId) -> Option<usize> {
        self.membership.members().iter().position(|&m| m == id)
    }
}

impl Cluster<ClientCommand, AtomicValueMachine> {
    /// Submit a request at one node and run the cluster until it is answered or
    /// `limit` passes, in which case the reply is `Timeout`.
    pub fn request(&mut self, index: usize, request: ClientRequest, limit: Duration) -> ClientReply {
        let now = self.now;
        let wall_ms = self.wall_ms;
        let Some(runtime) = self.runtime_mut(index) else {
            return ClientReply::Timeout;
        };
        let submitted = primitive::submit(runtime, request, now, wall_ms);
        self.collect_outputs(index);
        self.flush(index);
        self.deliver_all();

        let (pending_index, pending_term) = match submitted {
            Ok(Submission::Done(reply)) => return reply,
            Ok(Submission::Pending { index, term }) => (index, term),
            Err(e) => {
                error!(node = %self.id(index), error = %e, "storage failure, halting node");
                self.crash(index);
                return ClientReply::Timeout;
            }
        };

        let deadline = self.now + limit;
        loop {
            if let Some(output) = self.take_output_at(index, pending_index, pending_term) {
                return output.map_or_else(
                    || ClientReply::NotLeader {
                        leader_hint: self.runtime(index).and_then(|rt| rt.node().leader_hint()),
                    },
                    ClientReply::from,
                );
            }
            if !self.runtime(index).is_some_and(|rt| rt.is_leader()) {
                return ClientReply::NotLeader {
                    leader_hint: self.runtime(index).and_then(|rt| rt.node().leader_hint()),
                };
            }
            if self.now >= deadline {
                return ClientReply::Timeout;
            }
            self.tick();
        }
    }

    /// Output applied at `at` on `node`: `Some(Some(output))` if it was our entry,
    /// `Some(None)` if another term's entry landed there instead.
    fn take_output_at(
        &mut self,
        node: usize,
        at: LogIndex,
        term: Term,
    ) -> Option<Option<CommandOutput>> {
        let applied = &mut self.applied[node];
        let position = applied.iter().position(|a| a.index == at)?;
        let entry = applied.remove(position);
        Some((entry.term == term).then_some(entry.output))
    }
}
