use super::NodeID;
use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The role of a cluster member. Only active members vote in elections and
/// count towards quorums; passive and promotable members replicate the log
/// but can't affect consensus. Promotable members are expected to be promoted
/// to active once they have caught up, passive members never are.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Active,
    Passive,
    Promotable,
}

/// A cluster member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// The member's node ID.
    pub id: NodeID,
    /// The member's client-facing address. Replicated with the
    /// configuration, so client proxies can resolve redirect hints. The
    /// node-to-node transport addresses are deployment configuration and
    /// live outside the cluster state.
    pub addr: String,
    /// The member's role.
    pub role: MemberRole,
}

impl Member {
    /// Creates a new member.
    pub fn new(id: NodeID, addr: impl Into<String>, role: MemberRole) -> Self {
        Self { id, addr: addr.into(), role }
    }

    /// Returns true if the member votes in elections and counts towards
    /// quorums.
    pub fn is_voter(&self) -> bool {
        self.role == MemberRole::Active
    }
}

/// A cluster membership change, expressed against the current configuration.
/// Committed as a Configuration log entry. Only one change can be in flight
/// at a time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Change {
    /// Adds a new member, typically as promotable until it has caught up.
    Join(Member),
    /// Removes a member.
    Leave(NodeID),
    /// Promotes a member to active (voting).
    Promote(NodeID),
    /// Demotes an active member to passive.
    Demote(NodeID),
}

/// The cluster configuration: the current member set. There is exactly one
/// current configuration at any time, replaced wholesale when a Configuration
/// log entry commits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    members: BTreeMap<NodeID, Member>,
}

impl Cluster {
    /// Creates a cluster configuration from a member set. Errors on duplicate
    /// IDs or if there are no voters.
    pub fn new(members: Vec<Member>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for member in members {
            if map.insert(member.id, member.clone()).is_some() {
                return Err(Error::InvalidInput(format!("duplicate member ID {}", member.id)));
            }
        }
        if !map.values().any(|m| m.is_voter()) {
            return Err(Error::InvalidInput("cluster must have at least one voter".to_string()));
        }
        Ok(Self { members: map })
    }

    /// Fetches a member, or None if it does not exist.
    pub fn get(&self, id: NodeID) -> Option<&Member> {
        self.members.get(&id)
    }

    /// Returns true if the node is a member.
    pub fn contains(&self, id: NodeID) -> bool {
        self.members.contains_key(&id)
    }

    /// Returns true if the node is a voting member.
    pub fn is_voter(&self, id: NodeID) -> bool {
        self.members.get(&id).map(Member::is_voter).unwrap_or(false)
    }

    /// Returns the member set as a vector, ordered by node ID.
    pub fn to_vec(&self) -> Vec<Member> {
        self.members.values().cloned().collect()
    }

    /// Returns the IDs of all members except the given node, in order. These
    /// are the replication targets of a leader, regardless of role.
    pub fn peers(&self, id: NodeID) -> Vec<NodeID> {
        self.members.keys().copied().filter(|peer| *peer != id).collect()
    }

    /// Returns the IDs of all voting members, in order.
    pub fn voters(&self) -> Vec<NodeID> {
        self.members.values().filter(|m| m.is_voter()).map(|m| m.id).collect()
    }

    /// Returns the quorum size (strict majority) of the voting members.
    pub fn quorum_size(&self) -> u8 {
        self.voters().len() as u8 / 2 + 1
    }

    /// Computes the member set resulting from a membership change, without
    /// modifying the current configuration. The result is proposed as a
    /// Configuration entry and takes effect when it commits.
    pub fn apply(&self, change: &Change) -> Result<Vec<Member>> {
        let mut members = self.members.clone();
        match change {
            Change::Join(member) => {
                if members.contains_key(&member.id) {
                    return Err(Error::InvalidInput(format!(
                        "node {} is already a member",
                        member.id
                    )));
                }
                members.insert(member.id, member.clone());
            }
            Change::Leave(id) => {
                if members.remove(id).is_none() {
                    return Err(Error::InvalidInput(format!("node {id} is not a member")));
                }
            }
            Change::Promote(id) => match members.get_mut(id) {
                Some(member) if member.is_voter() => {
                    return Err(Error::InvalidInput(format!("node {id} is already active")));
                }
                Some(member) => member.role = MemberRole::Active,
                None => return Err(Error::InvalidInput(format!("node {id} is not a member"))),
            },
            Change::Demote(id) => match members.get_mut(id) {
                Some(member) if !member.is_voter() => {
                    return Err(Error::InvalidInput(format!("node {id} is not active")));
                }
                Some(member) => member.role = MemberRole::Passive,
                None => return Err(Error::InvalidInput(format!("node {id} is not a member"))),
            },
        }
        if !members.values().any(|m| m.is_voter()) {
            return Err(Error::InvalidInput("can't remove the last voter".to_string()));
        }
        Ok(members.into_values().collect())
    }
}
