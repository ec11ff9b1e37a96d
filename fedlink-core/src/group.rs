//! Federated group resolution
//!
//! [`analysis`] turns a [`Topology`] into the list of groups a node takes part
//! in, each with a rectified address (world size and rank).

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use serde::{Deserialize, Serialize};

use crate::topology::{Address, Node, Topology};
use crate::{Error, Result};

/// Rank of the leader inside any group
pub const LEADER_RANK: usize = 0;
/// Rank of the single follower inside a two-member group
pub const FOLLOWER_RANK: usize = 1;

/// Which side of a group a node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Aggregates contributions from its followers
    Leader,
    /// Reports to exactly one leader
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }

    /// The role on the other end of a pipe
    pub fn anti(&self) -> Role {
        match self {
            Role::Leader => Role::Follower,
            Role::Follower => Role::Leader,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peers a node talks to directly for one role instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedGroup {
    role: Role,
    anchor: Node,
    peers: Vec<Node>,
}

impl FederatedGroup {
    pub fn new(role: Role, anchor: Node) -> Self {
        Self {
            role,
            anchor,
            peers: Vec::new(),
        }
    }

    /// Try to admit a peer. Follower groups hold at most one leader.
    pub fn admit(&mut self, peer: Node) -> bool {
        if self.role == Role::Follower && !self.peers.is_empty() {
            return false;
        }
        if self.peers.contains(&peer) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn anchor(&self) -> &Node {
        &self.anchor
    }

    pub fn peers(&self) -> &[Node] {
        &self.peers
    }

    pub fn world_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Properties before rank rectification.
    fn properties(&self) -> GroupProperties {
        let address = match self.role {
            Role::Leader => self.anchor.address_or_null(),
            Role::Follower => self
                .peers
                .first()
                .map(Node::address_or_null)
                .unwrap_or_else(Address::null),
        };
        GroupProperties {
            role: self.role,
            nick_name: self.anchor.nick_name.clone(),
            address,
            max_tries: self.anchor.max_tries,
        }
    }
}

/// Derived description of one group membership of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupProperties {
    pub role: Role,
    pub nick_name: String,
    pub address: Address,
    pub max_tries: u32,
}

impl GroupProperties {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn world_size(&self) -> usize {
        self.address.world_size
    }

    pub fn rank(&self) -> usize {
        self.address.rank
    }
}

/// Build the raw groups of `node`: leader groups first, then follower groups.
///
/// World sizes and ranks are not rectified here; use [`analysis`].
pub fn build_groups(topology: &Topology, node: &Node) -> (Vec<FederatedGroup>, Vec<FederatedGroup>) {
    let mut leaders: Vec<FederatedGroup> = Vec::new();
    let mut followers: Vec<FederatedGroup> = Vec::new();

    for edge in topology.edges() {
        let (groups, role, peer) = if edge.end() == node {
            (&mut leaders, Role::Leader, edge.start())
        } else if edge.start() == node {
            (&mut followers, Role::Follower, edge.end())
        } else {
            continue;
        };

        if groups.iter_mut().any(|g| g.admit(peer.clone())) {
            continue;
        }
        let mut group = FederatedGroup::new(role, node.clone());
        group.admit(peer.clone());
        groups.push(group);
    }

    (leaders, followers)
}

/// Resolve every group `nick_name` takes part in.
///
/// Two-member groups use [`LEADER_RANK`]/[`FOLLOWER_RANK`]. Larger groups
/// rank followers `1..N` by the sorted nick names of the leader's peers.
pub fn analysis(topology: &Topology, nick_name: &str) -> Result<Vec<GroupProperties>> {
    let node = topology.fetch_node(nick_name).ok_or(Error::UnknownNode)?;
    // `Edge::new` refuses self loops but a deserialized topology may carry one.
    if topology.edges().iter().any(|e| e.start() == node && e.end() == node) {
        return Err(Error::TopologyInconsistency);
    }
    let (leader_groups, follower_groups) = build_groups(topology, node);

    let mut props = Vec::with_capacity(leader_groups.len() + follower_groups.len());

    for group in &leader_groups {
        let mut p = group.properties();
        p.address = p.address.with_geometry(group.world_size(), LEADER_RANK);
        props.push(p);
    }

    // Each follower group comes from an edge that also puts `node` in the
    // leader's group, so the lookups below only fail on a corrupted topology.
    for group in &follower_groups {
        let leader = group.peers().first().ok_or(Error::TopologyInconsistency)?;
        let (leader_side, _) = build_groups(topology, leader);
        let owning = leader_side
            .iter()
            .find(|g| g.peers().contains(node))
            .ok_or(Error::TopologyInconsistency)?;

        let world_size = owning.world_size();
        let rank = if world_size == 2 {
            FOLLOWER_RANK
        } else {
            let mut names: Vec<&str> = owning.peers().iter().map(|n| n.nick_name.as_str()).collect();
            names.sort_unstable();
            names
                .iter()
                .position(|n| *n == node.nick_name)
                .map(|i| i + 1)
                .ok_or(Error::TopologyInconsistency)?
        };

        let mut p = group.properties();
        p.address = p.address.with_geometry(world_size, rank);
        props.push(p);
    }

    tracing::debug!(nick_name, groups = props.len(), "topology analysed");
    Ok(props)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Edge;

    fn server() -> Node {
        Node::new(
            "aggregator",
            Some(Address::new("local", "tcp://localhost:1994").unwrap()),
        )
    }

    fn star(followers: &[&str]) -> Topology {
        let mut topo = Topology::new();
        for name in followers {
            topo.add_edge(Edge::new(Node::new(*name, None), server()).unwrap());
        }
        topo
    }

    #[test]
    fn two_party_group_uses_fixed_ranks() {
        let topo = star(&["alpha"]);

        let leader = analysis(&topo, "aggregator").unwrap();
        assert_eq!(leader.len(), 1);
        assert!(leader[0].is_leader());
        assert_eq!((leader[0].world_size(), leader[0].rank()), (2, LEADER_RANK));

        let follower = analysis(&topo, "alpha").unwrap();
        assert_eq!(follower.len(), 1);
        assert_eq!(follower[0].role, Role::Follower);
        assert_eq!((follower[0].world_size(), follower[0].rank()), (2, FOLLOWER_RANK));
        assert_eq!(follower[0].address.endpoint, "tcp://localhost:1994");
    }

    #[test]
    fn followers_ranked_by_sorted_nick_name() {
        let topo = star(&["beta", "alpha"]);

        let alpha = analysis(&topo, "alpha").unwrap();
        let beta = analysis(&topo, "beta").unwrap();
        let agg = analysis(&topo, "aggregator").unwrap();

        assert_eq!((alpha[0].world_size(), alpha[0].rank()), (3, 1));
        assert_eq!((beta[0].world_size(), beta[0].rank()), (3, 2));
        assert_eq!(agg.len(), 1);
        assert_eq!((agg[0].world_size(), agg[0].rank()), (3, 0));
    }

    #[test]
    fn one_entry_per_role_played() {
        let mut topo = star(&["alpha", "beta"]);
        let root = Node::new("root", None);
        topo.add_edge(Edge::new(server(), root).unwrap());

        let props = analysis(&topo, "aggregator").unwrap();
        assert_eq!(props.len(), 2);
        assert!(props[0].is_leader());
        assert_eq!(props[0].world_size(), 3);
        assert_eq!(props[1].role, Role::Follower);
        assert_eq!((props[1].world_size(), props[1].rank()), (2, FOLLOWER_RANK));
        assert!(props[1].address.is_null());
    }

    #[test]
    fn follower_binds_each_leader_separately() {
        let mut topo = Topology::new();
        let alpha = Node::new("alpha", None);
        topo.add_edge(Edge::new(alpha.clone(), Node::new("left", None)).unwrap());
        topo.add_edge(Edge::new(alpha.clone(), Node::new("right", None)).unwrap());

        let (leaders, followers) = build_groups(&topo, &alpha);
        assert!(leaders.is_empty());
        assert_eq!(followers.len(), 2);
        assert!(followers.iter().all(|g| g.peers().len() == 1));
    }

    #[test]
    fn deserialized_self_loop_is_inconsistent() {
        let mut value = serde_json::to_value(star(&["alpha"])).unwrap();
        let start = value["edges"][0]["start"].clone();
        value["edges"][0]["end"] = start;
        let topo: Topology = serde_json::from_value(value).unwrap();

        assert_eq!(analysis(&topo, "alpha"), Err(Error::TopologyInconsistency));
        // Nodes the loop does not touch still resolve.
        assert_eq!(analysis(&topo, "aggregator"), Ok(Vec::new()));
    }

    #[test]
    fn unknown_node_is_an_error() {
        let topo = star(&["alpha"]);
        assert_eq!(analysis(&topo, "ghost"), Err(Error::UnknownNode));
    }

    #[test]
    fn isolated_node_has_no_groups() {
        let mut topo = star(&["alpha"]);
        topo.add_node(Node::new("idle", None));
        assert!(analysis(&topo, "idle").unwrap().is_empty());
    }
}
