use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::membership::Membership;
use crate::types::{LogIndex, NodeId};

/// Heartbeat rounds a leader remembers for dating its lease.
const LEASE_ROUND_HISTORY: usize = 64;

/// §5.1: followers are passive — they issue no requests, only respond to RPCs from
/// leaders and candidates. If a follower receives no communication, it starts an election.
pub struct Follower {
    pub leader_id: Option<NodeId>,
    /// Local time of the last AppendEntries accepted from `leader_id`.
    pub last_heard: Option<Instant>,
}

impl Follower {
    pub fn new() -> Self {
        Self {
            leader_id: None,
            last_heard: None,
        }
    }

    pub fn set_leader(&mut self, leader_id: NodeId, now: Instant) {
        self.leader_id = Some(leader_id);
        self.last_heard = Some(now);
    }

    /// §4.2.3 of the dissertation: a follower that heard from a leader within the
    /// minimum election timeout disregards vote requests.
    pub fn heard_from_leader_within(&self, now: Instant, window: Duration) -> bool {
        self.last_heard
            .is_some_and(|at| now.saturating_duration_since(at) < window)
    }
}

impl Default for Follower {
    fn default() -> Self {
        Self::new()
    }
}

/// §5.2: a candidate requests votes from peers to win an election. It votes for itself
/// and wins if it receives votes from a majority of servers in the full cluster.
pub struct Candidate {
    votes_received: Vec<NodeId>,
}

impl Candidate {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            votes_received: vec![self_id],
        }
    }

    /// Record a granted vote. Duplicated responses are counted once.
    pub fn record_vote(&mut self, from: NodeId) {
        if !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
    }

    pub fn has_majority(&self, membership: &Membership) -> bool {
        let votes = self
            .votes_received
            .iter()
            .filter(|&&id| membership.contains(id))
            .count();
        membership.is_quorum(votes)
    }
}

/// §5.3, Figure 2, Volatile state on leaders (reinitialized after election).
/// The leader maintains next_index and match_index for each follower to track replication,
/// plus the heartbeat rounds each follower has acknowledged for the read lease.
pub struct Leader {
    next_index: HashMap<NodeId, LogIndex>,  // next log index to send to each server
    match_index: HashMap<NodeId, LogIndex>, // highest log index known to be replicated
    /// Index of the no-op appended on election; nothing earlier may be counted
    /// towards the commit index until it commits.
    pub term_start: LogIndex,
    round: u64,
    round_started: VecDeque<(u64, Instant)>,
    acked_round: HashMap<NodeId, u64>,
}

impl Leader {
    // nextIndex initialized to leader last log index + 1 (optimistic).
    // matchIndex initialized to 0 (conservative, increases monotonically).
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        Self {
            next_index: peers.iter().map(|&p| (p, last_log_index.next())).collect(),
            match_index: peers.iter().map(|&p| (p, LogIndex::default())).collect(),
            term_start: last_log_index.next(),
            round: 0,
            round_started: VecDeque::new(),
            acked_round: HashMap::new(),
        }
    }

    /// Get next_index for a peer.
    pub fn next_index_for(&self, peer: NodeId) -> Option<LogIndex> {
        self.next_index.get(&peer).copied()
    }

    pub fn match_index_for(&self, peer: NodeId) -> Option<LogIndex> {
        self.match_index.get(&peer).copied()
    }

    /// Update follower progress after successful replication. Stale or duplicated
    /// responses never move match_index backwards.
    pub fn record_success(&mut self, from: NodeId, match_index: LogIndex) {
        let known = self.match_index.entry(from).or_default();
        if match_index > *known {
            *known = match_index;
        }
        let next = known.next();
        let current = self.next_index.entry(from).or_insert(next);
        if next > *current {
            *current = next;
        }
    }

    /// Back off next_index after failed replication, jumping to just past the
    /// follower's last entry when that is further back.
    pub fn record_failure(&mut self, from: NodeId, follower_last: LogIndex) {
        if let Some(&current) = self.next_index.get(&from) {
            if let Some(prev) = current.prev() {
                let hinted = follower_last.next();
                let backed_off = prev.min(hinted).max(LogIndex::from(1));
                self.next_index.insert(from, backed_off);
            }
        }
    }

    /// Begin a new heartbeat round at `now`, returning its number.
    pub fn start_round(&mut self, now: Instant) -> u64 {
        self.round += 1;
        self.round_started.push_back((self.round, now));
        while self.round_started.len() > LEASE_ROUND_HISTORY {
            self.round_started.pop_front();
        }
        self.round
    }

    /// Number of the round in progress.
    pub fn current_round(&self) -> u64 {
        self.round
    }

    pub fn record_round_ack(&mut self, from: NodeId, round: u64) {
        let acked = self.acked_round.entry(from).or_insert(0);
        if round > *acked {
            *acked = round;
        }
    }

    /// The lease runs from the start of the newest round a quorum (this leader
    /// included) has acknowledged. Returns when it expires, if it was ever granted.
    /// A single-member cluster needs no acknowledgements and has no expiry to report.
    pub fn lease_expiry(&self, membership: &Membership, lease: Duration) -> Option<Instant> {
        let needed_from_peers = membership.quorum().saturating_sub(1);
        if needed_from_peers == 0 {
            return None;
        }

        let mut acked: Vec<u64> = self
            .acked_round
            .iter()
            .filter(|(id, _)| membership.contains(**id))
            .map(|(_, &round)| round)
            .collect();
        acked.sort_unstable_by(|a, b| b.cmp(a));

        let round = *acked.get(needed_from_peers - 1)?;
        self.round_started
            .iter()
            .find(|(r, _)| *r == round)
            .map(|(_, started)| *started + lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(ids: &[u64]) -> Membership {
        Membership::new(ids.iter().map(|&i| NodeId::from(i))).unwrap()
    }

    #[test]
    fn leader_new_initializes_correctly() {
        let peers = vec![NodeId::from(1), NodeId::from(2), NodeId::from(3)];
        let last_log_index = LogIndex::from(5);
        let leader = Leader::new(&peers, last_log_index);

        // next_index should be last_log_index + 1 for all peers
        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(6)));
        assert_eq!(leader.next_index_for(NodeId::from(2)), Some(LogIndex::from(6)));
        assert_eq!(leader.next_index_for(NodeId::from(3)), Some(LogIndex::from(6)));
        assert_eq!(leader.term_start, LogIndex::from(6));

        // match_index should be 0 for all peers
        assert!(peers
            .iter()
            .all(|&p| leader.match_index_for(p) == Some(LogIndex::default())));
    }

    #[test]
    fn next_index_for_returns_none_for_unknown_peer() {
        let peers = vec![NodeId::from(1)];
        let leader = Leader::new(&peers, LogIndex::from(0));

        assert_eq!(leader.next_index_for(NodeId::from(99)), None);
    }

    #[test]
    fn record_success_updates_both_indices() {
        let peers = vec![NodeId::from(1), NodeId::from(2)];
        let mut leader = Leader::new(&peers, LogIndex::from(0));

        leader.record_success(NodeId::from(1), LogIndex::from(5));

        assert_eq!(leader.match_index_for(NodeId::from(1)), Some(LogIndex::from(5)));
        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(6)));
        // peer 2 should remain unchanged
        assert_eq!(leader.next_index_for(NodeId::from(2)), Some(LogIndex::from(1)));
    }

    #[test]
    fn stale_success_does_not_regress_match_index() {
        let peers = vec![NodeId::from(1)];
        let mut leader = Leader::new(&peers, LogIndex::from(0));

        leader.record_success(NodeId::from(1), LogIndex::from(5));
        leader.record_success(NodeId::from(1), LogIndex::from(3));

        assert_eq!(leader.match_index_for(NodeId::from(1)), Some(LogIndex::from(5)));
        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(6)));
    }

    #[test]
    fn record_failure_decrements_next_index() {
        let peers = vec![NodeId::from(1)];
        let mut leader = Leader::new(&peers, LogIndex::from(10));

        // Follower claims a long log: plain decrement.
        leader.record_failure(NodeId::from(1), LogIndex::from(20));
        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(10)));

        leader.record_failure(NodeId::from(1), LogIndex::from(20));
        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(9)));
    }

    #[test]
    fn record_failure_jumps_to_follower_hint() {
        let peers = vec![NodeId::from(1)];
        let mut leader = Leader::new(&peers, LogIndex::from(10));

        leader.record_failure(NodeId::from(1), LogIndex::from(3));

        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(4)));
    }

    #[test]
    fn record_failure_never_goes_below_first_index() {
        let peers = vec![NodeId::from(1)];
        let mut leader = Leader::new(&peers, LogIndex::from(0));

        leader.record_failure(NodeId::from(1), LogIndex::from(0));
        leader.record_failure(NodeId::from(1), LogIndex::from(0));

        assert_eq!(leader.next_index_for(NodeId::from(1)), Some(LogIndex::from(1)));
    }

    #[test]
    fn record_failure_for_unknown_peer_does_nothing() {
        let peers = vec![NodeId::from(1)];
        let mut leader = Leader::new(&peers, LogIndex::from(5));

        leader.record_failure(NodeId::from(99), LogIndex::from(0));

        assert_eq!(leader.next_index_for(NodeId::from(99)), None);
    }

    #[test]
    fn candidate_counts_each_voter_once() {
        let members = membership(&[1, 2, 3, 4, 5]);
        let mut candidate = Candidate::new(NodeId::from(1));

        candidate.record_vote(NodeId::from(2));
        candidate.record_vote(NodeId::from(2));
        assert!(!candidate.has_majority(&members));

        candidate.record_vote(NodeId::from(3));
        assert!(candidate.has_majority(&members));
    }

    #[test]
    fn lease_requires_quorum_of_round_acks() {
        let members = membership(&[1, 2, 3]);
        let peers = members.peers_of(NodeId::from(1));
        let mut leader = Leader::new(&peers, LogIndex::from(0));
        let lease = Duration::from_millis(100);

        let t0 = Instant::now();
        let r1 = leader.start_round(t0);
        assert_eq!(leader.lease_expiry(&members, lease), None);

        leader.record_round_ack(NodeId::from(2), r1);
        assert_eq!(leader.lease_expiry(&members, lease), Some(t0 + lease));

        // A newer round renews the lease from its own start time.
        let t1 = t0 + Duration::from_millis(40);
        let r2 = leader.start_round(t1);
        leader.record_round_ack(NodeId::from(3), r2);
        assert_eq!(leader.lease_expiry(&members, lease), Some(t1 + lease));
    }

    #[test]
    fn follower_stickiness_window() {
        let mut follower = Follower::new();
        let t0 = Instant::now();
        let window = Duration::from_millis(300);

        assert!(!follower.heard_from_leader_within(t0, window));

        follower.set_leader(NodeId::from(1), t0);
        assert!(follower.heard_from_leader_within(t0 + Duration::from_millis(100), window));
        assert!(!follower.heard_from_leader_within(t0 + window, window));
    }
}
