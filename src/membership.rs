//! Cluster configuration: the ordered set of voting members of one replication group.

use crate::types::NodeId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MembershipError {
    #[error("cluster must have at least one member")]
    Empty,
    #[error("duplicate member: {0}")]
    Duplicate(NodeId),
}

/// Fixed membership of a replication group, ordered by node id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership {
    members: Vec<NodeId>,
}

impl Membership {
    pub fn new(members: impl IntoIterator<Item = NodeId>) -> Result<Self, MembershipError> {
        let mut members: Vec<NodeId> = members.into_iter().collect();
        members.sort();
        if let Some(pair) = members.windows(2).find(|w| w[0] == w[1]) {
            return Err(MembershipError::Duplicate(pair[0]));
        }
        if members.is_empty() {
            return Err(MembershipError::Empty);
        }
        Ok(Self { members })
    }

    /// Membership made of `local` plus `peers`, checking `local` is not listed twice.
    pub fn with_local(
        local: NodeId,
        peers: impl IntoIterator<Item = NodeId>,
    ) -> Result<Self, MembershipError> {
        Self::new(std::iter::once(local).chain(peers))
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.binary_search(&id).is_ok()
    }

    /// Every member except `id`.
    pub fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.members.iter().copied().filter(|&m| m != id).collect()
    }

    /// ⌊N/2⌋ + 1: votes needed to win an election or replicas needed to commit.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn is_quorum(&self, count: usize) -> bool {
        count >= self.quorum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<NodeId> {
        raw.iter().map(|&i| NodeId::from(i)).collect()
    }

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(Membership::new(ids(&[1])).unwrap().quorum(), 1);
        assert_eq!(Membership::new(ids(&[1, 2])).unwrap().quorum(), 2);
        assert_eq!(Membership::new(ids(&[1, 2, 3])).unwrap().quorum(), 2);
        assert_eq!(Membership::new(ids(&[1, 2, 3, 4])).unwrap().quorum(), 3);
        assert_eq!(Membership::new(ids(&[1, 2, 3, 4, 5])).unwrap().quorum(), 3);
    }

    #[test]
    fn members_are_ordered() {
        let m = Membership::new(ids(&[3, 1, 2])).unwrap();
        assert_eq!(m.members(), ids(&[1, 2, 3]).as_slice());
        assert_eq!(m.peers_of(NodeId::from(2)), ids(&[1, 3]));
        assert!(m.contains(NodeId::from(3)));
        assert!(!m.contains(NodeId::from(4)));
    }

    #[test]
    fn rejects_empty_and_duplicates() {
        assert_eq!(Membership::new(Vec::new()), Err(MembershipError::Empty));
        assert_eq!(
            Membership::with_local(NodeId::from(1), ids(&[2, 1])),
            Err(MembershipError::Duplicate(NodeId::from(1)))
        );
    }
}
