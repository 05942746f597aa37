use std::marker::PhantomData;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::command::Command;
use crate::membership::Membership;
use crate::state::{Candidate, Follower, Leader};
use crate::storage::Storage;
use crate::types::{
    AppendEntries, AppendEntriesResponse, LogEntry, LogIndex, Message, NodeId, RequestVote,
    RequestVoteResponse, Term,
};

/// Upper bound on entries carried by one AppendEntries message.
pub const MAX_ENTRIES_PER_MESSAGE: usize = 64;

/// Volatile state on all servers.
pub struct VolatileState {
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

/// A command accepted by the leader.
pub struct Appended<C> {
    pub index: LogIndex,
    pub term: Term,
    /// AppendEntries carrying the new entry to each peer.
    pub commands: Vec<Command<C>>,
}

/// Server role with associated state.
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower(_) => "follower",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
        }
    }
}

/// A Raft node. Persistent state (term, vote, log) lives in `St`; the node
/// itself performs no I/O beyond storage and returns the messages to send.
pub struct Node<C, St> {
    pub id: NodeId,
    membership: Membership,
    storage: St,
    pub volatile: VolatileState,
    pub role: Role,
    /// Minimum election timeout, also the window in which a live leader is honoured.
    election_timeout: Duration,
    _command: PhantomData<C>,
}

impl<C: Clone, St: Storage<C>> Node<C, St> {
    /// Create a new node. Starts as follower with no known leader.
    pub fn new(id: NodeId, membership: Membership, storage: St, election_timeout: Duration) -> Self {
        Self {
            id,
            membership,
            storage,
            volatile: VolatileState {
                commit_index: LogIndex::default(),
                last_applied: LogIndex::default(),
            },
            role: Role::Follower(Follower::new()),
            election_timeout,
            _command: PhantomData,
        }
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn storage(&self) -> &St {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut St {
        &mut self.storage
    }

    pub fn into_storage(self) -> St {
        self.storage
    }

    pub fn current_term(&self) -> Result<Term, St::Error> {
        self.storage.current_term()
    }

    /// Best guess at the current leader: this node, or the one a follower last heard from.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match &self.role {
            Role::Leader(_) => Some(self.id),
            Role::Follower(f) => f.leader_id,
            Role::Candidate(_) => None,
        }
    }

    /// Disregard vote requests until one election timeout after `now`, as if a
    /// leader had just been heard from. Called on start: an acknowledgement sent
    /// before a crash may still be backing some leader's lease.
    pub fn hold_votes_from(&mut self, now: Instant) {
        if let Role::Follower(follower) = &mut self.role {
            follower.last_heard = Some(now);
        }
    }

    /// Everything up to `index` was applied before a restart (via a snapshot).
    pub fn restore_applied(&mut self, index: LogIndex) {
        self.volatile.last_applied = index;
        self.volatile.commit_index = self.volatile.commit_index.max(index);
    }

    /// Called when election timer fires. Follower/Candidate starts new election.
    pub fn election_timeout(&mut self, now: Instant) -> Result<Vec<Command<C>>, St::Error> {
        match &self.role {
            Role::Leader(_) => Ok(Vec::new()),
            Role::Follower(_) | Role::Candidate(_) => self.start_election(now),
        }
    }

    /// Called when the heartbeat timer fires. Leaders start a new replication round.
    pub fn heartbeat_timeout(&mut self, now: Instant) -> Result<Vec<Command<C>>, St::Error> {
        if !matches!(self.role, Role::Leader(_)) {
            return Ok(Vec::new());
        }
        let mut commands = self.broadcast_append_entries(now)?;
        commands.push(Command::ResetHeartbeatTimer);
        Ok(commands)
    }

    fn start_election(&mut self, now: Instant) -> Result<Vec<Command<C>>, St::Error> {
        let term = self.storage.current_term()?.increment();
        self.storage.set_term_and_vote(term, Some(self.id))?;
        self.role = Role::Candidate(Candidate::new(self.id));
        info!(node = %self.id, %term, "election timeout, starting election");

        let request = RequestVote {
            term,
            candidate_id: self.id,
            last_log_index: self.storage.last_log_index()?,
            last_log_term: self.storage.last_log_term()?,
        };

        let mut commands = Vec::new();
        if self.membership.len() > 1 {
            commands.push(Command::Broadcast {
                message: Message::RequestVote(request),
            });
        }
        commands.push(Command::ResetElectionTimer);

        let won = match &self.role {
            Role::Candidate(candidate) => candidate.has_majority(&self.membership),
            _ => false,
        };
        if won {
            commands.extend(self.become_leader(now)?);
        }
        Ok(commands)
    }

    /// §5.1: any message with a higher term moves this node to follower in that term.
    fn become_follower(&mut self, term: Term) -> Result<(), St::Error> {
        let current = self.storage.current_term()?;
        if term > current {
            self.storage.set_term_and_vote(term, None)?;
            if !matches!(self.role, Role::Follower(_)) {
                info!(node = %self.id, role = self.role.name(), %term, "observed higher term, stepping down");
            }
            self.role = Role::Follower(Follower::new());
        } else if !matches!(self.role, Role::Follower(_)) {
            self.role = Role::Follower(Follower::new());
        }
        Ok(())
    }

    fn become_leader(&mut self, now: Instant) -> Result<Vec<Command<C>>, St::Error> {
        let term = self.storage.current_term()?;
        let last = self.storage.last_log_index()?;
        let peers = self.membership.peers_of(self.id);
        self.role = Role::Leader(Leader::new(&peers, last));
        info!(node = %self.id, %term, "won election, now leader");

        // §5.4.2: entries from earlier terms only commit behind one of our own.
        self.storage.append(LogEntry {
            term,
            index: last.next(),
            command: None,
        })?;

        let mut commands = self.broadcast_append_entries(now)?;
        commands.push(Command::ResetHeartbeatTimer);
        self.advance_commit_index()?;
        Ok(commands)
    }

    /// §4.2.3 (dissertation): true while a leader is believed alive, during which
    /// vote requests are disregarded. Leaders always consider themselves alive.
    fn honours_live_leader(&self, now: Instant) -> bool {
        match &self.role {
            Role::Leader(_) => true,
            Role::Follower(f) => f.heard_from_leader_within(now, self.election_timeout),
            Role::Candidate(_) => false,
        }
    }

    /// §5.2, §5.4.1: grant at most one vote per term, and only to a candidate whose
    /// log is at least as up to date as ours.
    pub fn handle_request_vote(
        &mut self,
        from: NodeId,
        req: RequestVote,
        now: Instant,
    ) -> Result<Vec<Command<C>>, St::Error> {
        let current = self.storage.current_term()?;

        if req.term > current && self.honours_live_leader(now) {
            debug!(node = %self.id, candidate = %from, term = %req.term, "leader is live, ignoring vote request");
            return Ok(vec![vote_reply(from, current, false)]);
        }

        if req.term > current {
            self.become_follower(req.term)?;
        }
        let term = self.storage.current_term()?;

        let granted = if req.term < term {
            debug!(node = %self.id, candidate = %from, stale = %req.term, %term, "rejecting vote request from stale term");
            false
        } else {
            let voted_for = self.storage.voted_for()?;
            let can_vote = voted_for.is_none() || voted_for == Some(req.candidate_id);
            let ours = (self.storage.last_log_term()?, self.storage.last_log_index()?);
            let theirs = (req.last_log_term, req.last_log_index);
            can_vote && theirs >= ours
        };

        let mut commands = Vec::new();
        if granted {
            self.storage.set_term_and_vote(term, Some(req.candidate_id))?;
            debug!(node = %self.id, candidate = %req.candidate_id, %term, "granted vote");
            commands.push(Command::ResetElectionTimer);
        }
        commands.push(vote_reply(from, term, granted));
        Ok(commands)
    }

    pub fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        resp: RequestVoteResponse,
        now: Instant,
    ) -> Result<Vec<Command<C>>, St::Error> {
        let current = self.storage.current_term()?;
        if resp.term > current {
            self.become_follower(resp.term)?;
            return Ok(Vec::new());
        }
        if resp.term < current || !resp.vote_granted {
            return Ok(Vec::new());
        }

        let Role::Candidate(candidate) = &mut self.role else {
            return Ok(Vec::new());
        };
        candidate.record_vote(from);
        if candidate.has_majority(&self.membership) {
            return self.become_leader(now);
        }
        Ok(Vec::new())
    }

    /// §5.3: accept entries only if our log contains the entry preceding them;
    /// conflicting suffixes are replaced by the leader's entries.
    pub fn handle_append_entries(
        &mut self,
        from: NodeId,
        req: AppendEntries<C>,
        now: Instant,
    ) -> Result<Vec<Command<C>>, St::Error> {
        let current = self.storage.current_term()?;
        if req.term < current {
            debug!(node = %self.id, leader = %from, stale = %req.term, term = %current, "rejecting append from stale term");
            let last = self.storage.last_log_index()?;
            return Ok(vec![append_reply(from, current, false, last, req.round)]);
        }

        self.become_follower(req.term)?;
        if let Role::Follower(follower) = &mut self.role {
            follower.set_leader(req.leader_id, now);
        }
        let mut commands = vec![Command::ResetElectionTimer];

        let matches_prev = self.storage.term_at(req.prev_log_index)? == Some(req.prev_log_term);
        if !matches_prev {
            let last = self.storage.last_log_index()?;
            debug!(node = %self.id, prev = %req.prev_log_index, last = %last, "log mismatch at previous entry");
            commands.push(append_reply(from, req.term, false, last, req.round));
            return Ok(commands);
        }

        let match_index = req.prev_log_index.advance(req.entries.len());
        if !req.entries.is_empty() {
            self.storage.append_entries(req.prev_log_index, req.entries)?;
        }

        // Only entries known to match the leader may be marked committed.
        let commit = req.leader_commit.min(match_index);
        if commit > self.volatile.commit_index {
            self.volatile.commit_index = commit;
        }

        commands.push(append_reply(from, req.term, true, match_index, req.round));
        Ok(commands)
    }

    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        resp: AppendEntriesResponse,
        _now: Instant,
    ) -> Result<Vec<Command<C>>, St::Error> {
        let current = self.storage.current_term()?;
        if resp.term > current {
            self.become_follower(resp.term)?;
            return Ok(Vec::new());
        }
        if resp.term < current {
            debug!(node = %self.id, peer = %from, stale = %resp.term, "ignoring response from stale term");
            return Ok(Vec::new());
        }

        let Role::Leader(leader) = &mut self.role else {
            return Ok(Vec::new());
        };
        // Success or not, the follower accepted this node as leader for the term.
        leader.record_round_ack(from, resp.round);
        let round = leader.current_round();

        if resp.success {
            leader.record_success(from, resp.match_index);
            let caught_up = leader.match_index_for(from).unwrap_or_default();
            self.advance_commit_index()?;
            if caught_up >= self.storage.last_log_index()? {
                return Ok(Vec::new());
            }
        } else {
            leader.record_failure(from, resp.match_index);
        }

        Ok(self.append_entries_for(from, round)?.into_iter().collect())
    }

    /// Submit a client command. Returns where it was appended together with the
    /// messages replicating it, or None if this node is not the leader.
    pub fn submit_command(&mut self, command: C) -> Result<Option<Appended<C>>, St::Error> {
        let Role::Leader(leader) = &self.role else {
            return Ok(None);
        };
        let round = leader.current_round();
        let term = self.storage.current_term()?;
        let index = self.storage.last_log_index()?.next();
        self.storage.append(LogEntry {
            term,
            index,
            command: Some(command),
        })?;
        self.advance_commit_index()?;

        let mut commands = Vec::new();
        for peer in self.membership.peers_of(self.id) {
            commands.extend(self.append_entries_for(peer, round)?);
        }
        Ok(Some(Appended {
            index,
            term,
            commands,
        }))
    }

    /// Next committed entry not yet handed to the state machine.
    pub fn take_entry_to_apply(&mut self) -> Result<Option<LogEntry<C>>, St::Error> {
        if self.volatile.last_applied >= self.volatile.commit_index {
            return Ok(None);
        }
        let next = self.volatile.last_applied.next();
        let entry = self.storage.entry(next)?;
        if entry.is_some() {
            self.volatile.last_applied = next;
        }
        Ok(entry)
    }

    /// Whether this leader may serve reads locally: its no-op has committed and a
    /// majority acknowledged a heartbeat round that started less than `lease` ago.
    pub fn lease_valid(&self, now: Instant, lease: Duration) -> bool {
        let Role::Leader(leader) = &self.role else {
            return false;
        };
        if self.volatile.commit_index < leader.term_start {
            return false;
        }
        if self.membership.quorum() == 1 {
            return true;
        }
        leader
            .lease_expiry(&self.membership, lease)
            .is_some_and(|expiry| now < expiry)
    }

    fn broadcast_append_entries(&mut self, now: Instant) -> Result<Vec<Command<C>>, St::Error> {
        let Role::Leader(leader) = &mut self.role else {
            return Ok(Vec::new());
        };
        let round = leader.start_round(now);

        let mut commands = Vec::new();
        for peer in self.membership.peers_of(self.id) {
            commands.extend(self.append_entries_for(peer, round)?);
        }
        Ok(commands)
    }

    fn append_entries_for(&self, peer: NodeId, round: u64) -> Result<Option<Command<C>>, St::Error> {
        let Role::Leader(leader) = &self.role else {
            return Ok(None);
        };
        let next = leader.next_index_for(peer).unwrap_or(LogIndex::from(1));
        let prev_log_index = next.prev().unwrap_or_default();
        let prev_log_term = self.storage.term_at(prev_log_index)?.unwrap_or_default();
        let entries = self.storage.entries_from(next, MAX_ENTRIES_PER_MESSAGE)?;

        Ok(Some(Command::Send {
            to: peer,
            message: Message::AppendEntries(AppendEntries {
                term: self.storage.current_term()?,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.volatile.commit_index,
                round,
            }),
        }))
    }

    /// §5.3, §5.4.2: commit the highest index stored on a majority, provided the
    /// entry there is from the current term.
    fn advance_commit_index(&mut self) -> Result<(), St::Error> {
        let Role::Leader(leader) = &self.role else {
            return Ok(());
        };
        let term_start = leader.term_start;
        let mut replicated: Vec<LogIndex> = self
            .membership
            .peers_of(self.id)
            .into_iter()
            .map(|peer| leader.match_index_for(peer).unwrap_or_default())
            .collect();
        replicated.push(self.storage.last_log_index()?);
        replicated.sort_unstable_by(|a, b| b.cmp(a));

        let Some(&candidate) = replicated.get(self.membership.quorum() - 1) else {
            return Ok(());
        };
        if candidate <= self.volatile.commit_index || candidate < term_start {
            return Ok(());
        }
        if self.storage.term_at(candidate)? != Some(self.storage.current_term()?) {
            return Ok(());
        }
        debug!(node = %self.id, from = %self.volatile.commit_index, to = %candidate, "commit index advanced");
        self.volatile.commit_index = candidate;
        Ok(())
    }
}

fn vote_reply<C>(to: NodeId, term: Term, vote_granted: bool) -> Command<C> {
    Command::Send {
        to,
        message: Message::RequestVoteResponse(RequestVoteResponse { term, vote_granted }),
    }
}

fn append_reply<C>(
    to: NodeId,
    term: Term,
    success: bool,
    match_index: LogIndex,
    round: u64,
) -> Command<C> {
    Command::Send {
        to,
        message: Message::AppendEntriesResponse(AppendEntriesResponse {
            term,
            success,
            match_index,
            round,
        }),
    }
}
