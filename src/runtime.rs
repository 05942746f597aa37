use std::time::{Duration, Instant};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::command::Command;
use crate::membership::Membership;
use crate::node::{Node, Role};
use crate::storage::{SnapshotMeta, Storage};
use crate::types::{LogEntry, LogIndex, Message, NodeId, Term};

/// Trait for state machines that apply committed log entries.
pub trait StateMachine<C> {
    type Output;

    /// Apply the next committed entry. Entries arrive in index order, each once.
    /// An entry at or below `last_applied` is refused and yields `None`, as does a
    /// no-op entry (which still advances `last_applied`).
    fn apply(&mut self, entry: &LogEntry<C>) -> Option<Self::Output>;

    fn last_applied(&self) -> LogIndex;
}

/// Events that drive the runtime.
pub enum Event<C> {
    ElectionTimeout,
    HeartbeatTimeout,
    Message { from: NodeId, message: Message<C> },
}

/// Timer configuration.
#[derive(Clone, Debug)]
pub struct TimerConfig {
    /// Minimum election timeout; the actual timeout is drawn from [T, 2T].
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// How long a majority acknowledgement lets the leader answer reads alone.
    pub lease_duration: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(100),
            lease_duration: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TimerConfigError {
    #[error("heartbeat interval {heartbeat:?} must be shorter than election timeout {election:?}")]
    HeartbeatTooSlow {
        heartbeat: Duration,
        election: Duration,
    },
    #[error("lease {lease:?} must not exceed election timeout {election:?}")]
    LeaseTooLong { lease: Duration, election: Duration },
}

impl TimerConfig {
    /// Check the relations the protocol relies on.
    pub fn validate(&self) -> Result<(), TimerConfigError> {
        if self.heartbeat_interval >= self.election_timeout {
            return Err(TimerConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                election: self.election_timeout,
            });
        }
        // Followers honour a leader for one minimum election timeout after
        // hearing from it; the lease must not outlive that.
        if self.lease_duration > self.election_timeout {
            return Err(TimerConfigError::LeaseTooLong {
                lease: self.lease_duration,
                election: self.election_timeout,
            });
        }
        Ok(())
    }
}

/// Output of applying one committed entry.
#[derive(Debug)]
pub struct Applied<O> {
    pub index: LogIndex,
    pub term: Term,
    pub output: O,
}

/// Runtime that wraps a Raft node with timer management, ordered application
/// and periodic snapshots.
pub struct Runtime<C, S: StateMachine<C>, St> {
    node: Node<C, St>,
    state_machine: S,
    config: TimerConfig,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    outputs: Vec<Applied<S::Output>>,
    /// Messages produced outside `handle`, waiting for the caller to send them.
    outbox: Vec<Command<C>>,
    snapshot_threshold: Option<u64>,
    last_snapshot: LogIndex,
}

impl<C, S, St> Runtime<C, S, St>
where
    C: Clone,
    S: StateMachine<C> + Serialize + DeserializeOwned,
    St: Storage<C>,
{
    pub fn new(node: Node<C, St>, state_machine: S, config: TimerConfig) -> Self {
        let now = Instant::now();
        let mut runtime = Self {
            node,
            state_machine,
            election_deadline: now,
            heartbeat_deadline: now,
            config,
            outputs: Vec::new(),
            outbox: Vec::new(),
            snapshot_threshold: None,
            last_snapshot: LogIndex::default(),
        };
        runtime.reset_timers_at(now);
        runtime
    }

    /// Rebuild a runtime from durable state: term, vote and log come from
    /// `storage`; the state machine starts from the latest snapshot if there is
    /// one, or from `state_machine` otherwise. Entries after the snapshot are
    /// replayed once they are known to be committed.
    pub fn from_storage(
        id: NodeId,
        membership: Membership,
        state_machine: S,
        storage: St,
        config: TimerConfig,
    ) -> Result<Self, St::Error> {
        let snapshot = storage.load_snapshot::<S>()?;
        let mut node = Node::new(id, membership, storage, config.election_timeout);

        let state_machine = match snapshot {
            Some((meta, restored)) => {
                tracing::info!(node = %id, index = %meta.last_index, "restored snapshot");
                node.restore_applied(meta.last_index);
                restored
            }
            None => state_machine,
        };

        let mut runtime = Self::new(node, state_machine, config);
        runtime.last_snapshot = runtime.state_machine.last_applied();
        Ok(runtime)
    }

    /// Snapshot the state machine every `threshold` applied entries.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = (threshold > 0).then_some(threshold);
        self
    }

    pub fn node(&self) -> &Node<C, St> {
        &self.node
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub fn state_machine_mut(&mut self) -> &mut S {
        &mut self.state_machine
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.node.role, Role::Leader(_))
    }

    /// Give the storage back, e.g. to restart a node from it.
    pub fn into_storage(self) -> St {
        self.node.into_storage()
    }

    /// Process an event and return commands to execute.
    pub fn handle(&mut self, event: Event<C>) -> Result<Vec<Command<C>>, St::Error> {
        self.handle_at(event, Instant::now())
    }

    /// Process an event observed at `now`.
    pub fn handle_at(
        &mut self,
        event: Event<C>,
        now: Instant,
    ) -> Result<Vec<Command<C>>, St::Error> {
        let commands = match event {
            Event::ElectionTimeout => self.node.election_timeout(now)?,
            Event::HeartbeatTimeout => self.node.heartbeat_timeout(now)?,
            Event::Message { from, message } => self.handle_message(from, message, now)?,
        };

        self.process_commands(&commands, now);
        self.apply_committed()?;

        Ok(commands)
    }

    /// §5.2: if election timeout elapses without receiving AppendEntries or granting a vote,
    /// the server starts an election. Leaders suppress elections by sending heartbeats
    /// within each interval. Timeouts should be randomized in [T, 2T] to avoid split votes.
    pub fn poll_timers(&self) -> Option<Event<C>> {
        self.poll_timers_at(Instant::now())
    }

    pub fn poll_timers_at(&self, now: Instant) -> Option<Event<C>> {
        if self.is_leader() {
            if now >= self.heartbeat_deadline {
                return Some(Event::HeartbeatTimeout);
            }
            return None;
        }

        if now >= self.election_deadline {
            return Some(Event::ElectionTimeout);
        }

        None
    }

    /// Treat `now` as the moment this node started: re-arm both timers and hold
    /// its vote for one election timeout. Nodes driven by a virtual clock call
    /// this after construction.
    pub fn reset_timers_at(&mut self, now: Instant) {
        self.node.hold_votes_from(now);
        self.reset_election_deadline(now);
        self.heartbeat_deadline = now + self.config.heartbeat_interval;
    }

    /// Time until next timer fires.
    pub fn next_deadline(&self) -> Instant {
        if self.is_leader() {
            self.heartbeat_deadline
        } else {
            self.election_deadline
        }
    }

    /// Submit a client command. Returns the index and term it was appended at if
    /// this node is leader, None otherwise. The AppendEntries replicating it wait
    /// in [`Runtime::take_commands`].
    pub fn submit(&mut self, command: C) -> Result<Option<(LogIndex, Term)>, St::Error> {
        let Some(appended) = self.node.submit_command(command)? else {
            return Ok(None);
        };
        self.outbox.extend(appended.commands);
        // A single-member cluster commits on append.
        self.apply_committed()?;
        Ok(Some((appended.index, appended.term)))
    }

    /// Drain messages queued by [`Runtime::submit`].
    pub fn take_commands(&mut self) -> Vec<Command<C>> {
        std::mem::take(&mut self.outbox)
    }

    /// The state machine, if this node may answer a read from it without a log
    /// round: it is leader, holds an unexpired lease, has committed an entry of
    /// its own term and has applied everything committed.
    pub fn lease_read(&self, now: Instant) -> Option<&S> {
        let applied = self.state_machine.last_applied();
        (self.node.lease_valid(now, self.config.lease_duration)
            && applied == self.node.volatile.commit_index)
            .then_some(&self.state_machine)
    }

    /// Drain outputs of entries applied since the last call.
    pub fn take_outputs(&mut self) -> Vec<Applied<S::Output>> {
        std::mem::take(&mut self.outputs)
    }

    fn handle_message(
        &mut self,
        from: NodeId,
        message: Message<C>,
        now: Instant,
    ) -> Result<Vec<Command<C>>, St::Error> {
        match message {
            Message::RequestVote(req) => self.node.handle_request_vote(from, req, now),
            Message::RequestVoteResponse(resp) => {
                self.node.handle_request_vote_response(from, resp, now)
            }
            Message::AppendEntries(req) => self.node.handle_append_entries(from, req, now),
            Message::AppendEntriesResponse(resp) => {
                self.node.handle_append_entries_response(from, resp, now)
            }
        }
    }

    fn reset_election_deadline(&mut self, now: Instant) {
        // §5.2: randomize in [T, 2T] so nodes time out at different moments,
        // preventing repeated split votes when multiple candidates start at once.
        let base = self.config.election_timeout;
        let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64);
        self.election_deadline = now + base + Duration::from_millis(jitter_ms);
    }

    fn process_commands(&mut self, commands: &[Command<C>], now: Instant) {
        for command in commands {
            match command {
                Command::ResetElectionTimer => self.reset_election_deadline(now),
                Command::ResetHeartbeatTimer => {
                    self.heartbeat_deadline = now + self.config.heartbeat_interval;
                }
                Command::Send { .. } | Command::Broadcast { .. } => {
                    // Sending is handled by caller.
                }
            }
        }
    }

    // Figure 2, Rules for Servers (All Servers): if commitIndex > lastApplied, apply the
    // next entry to the state machine. §5.3: state machines process entries in log order.
    fn apply_committed(&mut self) -> Result<(), St::Error> {
        while let Some(entry) = self.node.take_entry_to_apply()? {
            if let Some(output) = self.state_machine.apply(&entry) {
                self.outputs.push(Applied {
                    index: entry.index,
                    term: entry.term,
                    output,
                });
            }
        }
        self.maybe_snapshot()
    }

    fn maybe_snapshot(&mut self) -> Result<(), St::Error> {
        let Some(threshold) = self.snapshot_threshold else {
            return Ok(());
        };
        let applied = self.state_machine.last_applied();
        if applied.get().saturating_sub(self.last_snapshot.get()) < threshold {
            return Ok(());
        }

        let meta = SnapshotMeta {
            last_index: applied,
            last_term: self.node.storage().term_at(applied)?.unwrap_or_default(),
        };
        self.node.storage_mut().save_snapshot(meta, &self.state_machine)?;
        self.last_snapshot = applied;
        tracing::debug!(node = %self.node.id, index = %applied, "snapshot saved");
        Ok(())
    }
}
