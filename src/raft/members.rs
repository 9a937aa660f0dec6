use super::types::{LogIndex, RaftServer};
use crate::error::{Error, Result};

use itertools::Itertools as _;

/// The cluster member set: full voting members plus observers. Observers
/// receive all entries but have no vote and don't count towards quorums.
///
/// Serialized as `node1,node2|observer1` text, stored in the journal next to
/// the membership epoch. A new member set takes effect immediately upon
/// append, not commit; the previous set is persisted alongside so that a
/// rollback of uncommitted entries can restore it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RaftMembers {
    pub nodes: Vec<RaftServer>,
    pub observers: Vec<RaftServer>,
}

/// A member set together with the epoch (journal index) at which it took
/// effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership {
    pub nodes: Vec<RaftServer>,
    pub observers: Vec<RaftServer>,
    pub epoch: LogIndex,
}

impl Membership {
    /// True if the given server is a full voting member.
    pub fn contains(&self, server: &RaftServer) -> bool {
        self.nodes.contains(server)
    }
}

impl RaftMembers {
    pub fn new(nodes: Vec<RaftServer>, observers: Vec<RaftServer>) -> Self {
        Self { nodes, observers }
    }

    /// Serializes the member set.
    pub fn encode(&self) -> Vec<u8> {
        format!("{}|{}", self.nodes.iter().join(","), self.observers.iter().join(","))
            .into_bytes()
    }

    /// Parses a serialized member set.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::InvalidData("invalid member set encoding".to_string()))?;
        let (nodes, observers) = s
            .split_once('|')
            .ok_or_else(|| Error::InvalidData(format!("cannot parse member set: {s}")))?;
        Ok(Self { nodes: split(nodes)?, observers: split(observers)? })
    }

    /// True if the given server is a full voting member.
    pub fn contains(&self, server: &RaftServer) -> bool {
        self.nodes.contains(server)
    }

    /// True if the given server is in the member set in any role.
    pub fn in_any_role(&self, server: &RaftServer) -> bool {
        self.nodes.contains(server) || self.observers.contains(server)
    }

    /// Adds an observer. It must not already be part of the cluster.
    pub fn add_observer(&mut self, observer: &RaftServer) -> Result<()> {
        if self.in_any_role(observer) {
            return Err(Error::InvalidInput(format!("{observer} is already part of the cluster")));
        }
        self.observers.push(observer.clone());
        Ok(())
    }

    /// Removes a node or observer from the cluster.
    pub fn remove_member(&mut self, member: &RaftServer) -> Result<()> {
        if !self.in_any_role(member) {
            return Err(Error::InvalidInput(format!("{member} is not part of the cluster")));
        }
        self.nodes.retain(|n| n != member);
        self.observers.retain(|n| n != member);
        Ok(())
    }

    /// Promotes an observer to a full voting member.
    pub fn promote_observer(&mut self, observer: &RaftServer) -> Result<()> {
        if !self.observers.contains(observer) {
            return Err(Error::InvalidInput(format!("{observer} is not an observer")));
        }
        self.observers.retain(|n| n != observer);
        self.nodes.push(observer.clone());
        Ok(())
    }

    /// Demotes a full voting member to an observer.
    pub fn demote_to_observer(&mut self, member: &RaftServer) -> Result<()> {
        if !self.nodes.contains(member) {
            return Err(Error::InvalidInput(format!("{member} is not a full member")));
        }
        self.nodes.retain(|n| n != member);
        self.observers.push(member.clone());
        Ok(())
    }
}

fn split(s: &str) -> Result<Vec<RaftServer>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(',').map(RaftServer::parse).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(i: u16) -> RaftServer {
        RaftServer::new(format!("n{i}"), 7000 + i)
    }

    #[test]
    fn encode_roundtrip() -> Result<()> {
        let members = RaftMembers::new(vec![server(1), server(2)], vec![server(3)]);
        assert_eq!(members.encode(), b"n1:7001,n2:7002|n3:7003");
        assert_eq!(RaftMembers::decode(&members.encode())?, members);

        let empty_observers = RaftMembers::new(vec![server(1)], vec![]);
        assert_eq!(RaftMembers::decode(&empty_observers.encode())?, empty_observers);
        Ok(())
    }

    #[test]
    fn membership_changes() -> Result<()> {
        let mut members = RaftMembers::new(vec![server(1), server(2)], vec![]);

        members.add_observer(&server(3))?;
        assert!(members.add_observer(&server(3)).is_err());
        assert!(members.add_observer(&server(1)).is_err());

        members.promote_observer(&server(3))?;
        assert!(members.contains(&server(3)));
        assert!(members.promote_observer(&server(3)).is_err());

        members.demote_to_observer(&server(2))?;
        assert!(!members.contains(&server(2)));
        assert!(members.in_any_role(&server(2)));

        members.remove_member(&server(2))?;
        assert!(!members.in_any_role(&server(2)));
        assert!(members.remove_member(&server(2)).is_err());
        Ok(())
    }
}
