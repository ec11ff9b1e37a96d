//! Declarative participant graph
//!
//! A [`Topology`] is a set of [`Node`]s connected by directed [`Edge`]s. An
//! edge `a -> b` means "a reports to b": `b` aggregates what `a` uploads.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default number of connection attempts for a node
pub const DEFAULT_MAX_TRIES: u32 = 5;

/// Endpoint value standing in for "no address"
pub const NULL_ENDPOINT: &str = "null";

/// Where a node can be reached and how large its group is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Transport backend name (e.g. `local`, `tcp`)
    pub backend: String,
    /// `tcp://host:port`, `file:///path` or `null`
    pub endpoint: String,
    /// Group size including the leader
    pub world_size: usize,
    /// Rank of the owner within the group
    pub rank: usize,
}

impl Address {
    /// Create an address, validating the endpoint scheme.
    pub fn new(backend: impl Into<String>, endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        if !(endpoint.starts_with("tcp://")
            || endpoint.starts_with("file://")
            || endpoint == NULL_ENDPOINT)
        {
            return Err(Error::InvalidAddress);
        }
        Ok(Self {
            backend: backend.into(),
            endpoint,
            world_size: 0,
            rank: 0,
        })
    }

    /// Placeholder address for nodes without one.
    pub fn null() -> Self {
        Self {
            backend: NULL_ENDPOINT.to_string(),
            endpoint: NULL_ENDPOINT.to_string(),
            world_size: 0,
            rank: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.endpoint == NULL_ENDPOINT
    }

    /// Same endpoint, rectified group geometry.
    pub fn with_geometry(mut self, world_size: usize, rank: usize) -> Self {
        self.world_size = world_size;
        self.rank = rank;
        self
    }
}

/// A topology participant. Equality is by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub nick_name: String,
    pub address: Option<Address>,
    pub max_tries: u32,
}

impl Node {
    /// Create a node with the default retry budget
    pub fn new(nick_name: impl Into<String>, address: Option<Address>) -> Self {
        Self {
            nick_name: nick_name.into(),
            address,
            max_tries: DEFAULT_MAX_TRIES,
        }
    }

    /// Set the retry budget
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Address, or [`Address::null`] if none was given
    pub fn address_or_null(&self) -> Address {
        self.address.clone().unwrap_or_else(Address::null)
    }
}

/// Directed "start reports to end" relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    start: Node,
    end: Node,
}

impl Edge {
    pub fn new(start: Node, end: Node) -> Result<Self> {
        if start == end {
            return Err(Error::InvalidEdge);
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> &Node {
        &self.start
    }

    pub fn end(&self) -> &Node {
        &self.end
    }
}

/// Set of nodes and edges, mutated only through explicit add/remove calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Add a node. Returns `false` (and warns) if it is already present.
    pub fn add_node(&mut self, node: Node) -> bool {
        if self.nodes.contains(&node) {
            tracing::warn!(nick_name = %node.nick_name, "duplicate node ignored");
            return false;
        }
        self.nodes.push(node);
        true
    }

    /// Add an edge, adding its endpoints as nodes if missing.
    ///
    /// Returns `false` (and warns) if the edge is already present.
    pub fn add_edge(&mut self, edge: Edge) -> bool {
        if self.edges.contains(&edge) {
            tracing::warn!(
                start = %edge.start.nick_name,
                end = %edge.end.nick_name,
                "duplicate edge ignored"
            );
            return false;
        }
        for node in [&edge.start, &edge.end] {
            if !self.nodes.contains(node) {
                self.nodes.push(node.clone());
            }
        }
        self.edges.push(edge);
        true
    }

    /// Connect two known nodes by nick name.
    pub fn connect(&mut self, start: &str, end: &str) -> Result<bool> {
        let start = self.fetch_node(start).cloned().ok_or(Error::UnknownNode)?;
        let end = self.fetch_node(end).cloned().ok_or(Error::UnknownNode)?;
        Ok(self.add_edge(Edge::new(start, end)?))
    }

    pub fn remove_edge(&mut self, index: usize) -> Option<Edge> {
        (index < self.edges.len()).then(|| self.edges.remove(index))
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, index: usize) -> Option<Node> {
        if index >= self.nodes.len() {
            return None;
        }
        let node = self.nodes.remove(index);
        self.edges.retain(|e| e.start != node && e.end != node);
        Some(node)
    }

    /// Drop nodes that appear in no edge.
    pub fn clear_useless_nodes(&mut self) {
        let edges = &self.edges;
        self.nodes
            .retain(|n| edges.iter().any(|e| &e.start == n || &e.end == n));
    }

    pub fn fetch_node(&self, nick_name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.nick_name == nick_name)
    }

    pub fn is_edge(&self, start: &str, end: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.start.nick_name == start && e.end.nick_name == end)
    }

    /// Edges ending at `node`, in insertion order.
    pub fn edges_into<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| &e.end == node)
    }

    /// Edges starting at `node`, in insertion order.
    pub fn edges_from<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| &e.start == node)
    }
}

/// Adjacency matrix: row reports to column where marked `^`.
impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .nodes
            .iter()
            .map(|n| n.nick_name.len())
            .max()
            .unwrap_or(0)
            .max(1);

        write!(f, "{:width$}", "")?;
        for node in &self.nodes {
            write!(f, " {:>width$}", node.nick_name)?;
        }
        writeln!(f)?;

        for row in &self.nodes {
            write!(f, "{:width$}", row.nick_name)?;
            for col in &self.nodes {
                let mark = if self.is_edge(&row.nick_name, &col.nick_name) {
                    "^"
                } else {
                    "."
                };
                write!(f, " {mark:>width$}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn star() -> Topology {
        let mut topo = Topology::new();
        let agg = Node::new("aggregator", Some(Address::new("local", "tcp://localhost:1994").unwrap()));
        let alpha = Node::new("alpha", None);
        let beta = Node::new("beta", None);
        topo.add_edge(Edge::new(alpha, agg.clone()).unwrap());
        topo.add_edge(Edge::new(beta, agg).unwrap());
        topo
    }

    #[test]
    fn address_rejects_unknown_scheme() {
        assert_eq!(
            Address::new("local", "http://example.com"),
            Err(Error::InvalidAddress)
        );
        assert!(Address::new("local", "file:///tmp/rendezvous").is_ok());
        assert!(Address::new("local", "null").unwrap().is_null());
    }

    #[test]
    fn self_edge_is_rejected() {
        let a = Node::new("a", None);
        assert_eq!(Edge::new(a.clone(), a), Err(Error::InvalidEdge));
    }

    #[test]
    fn add_edge_adds_missing_nodes_and_ignores_duplicates() {
        let mut topo = star();
        assert_eq!(topo.nodes().len(), 3);
        assert_eq!(topo.edges().len(), 2);

        let alpha = topo.fetch_node("alpha").cloned().unwrap();
        let agg = topo.fetch_node("aggregator").cloned().unwrap();
        assert!(!topo.add_edge(Edge::new(alpha.clone(), agg).unwrap()));
        assert!(!topo.add_node(alpha));
        assert_eq!(topo.edges().len(), 2);
    }

    #[test]
    fn remove_node_drops_incident_edges() {
        let mut topo = star();
        let removed = topo.remove_node(0).unwrap();
        assert_eq!(removed.nick_name, "alpha");
        assert_eq!(topo.edges().len(), 1);
        assert!(topo.is_edge("beta", "aggregator"));
        assert!(topo.remove_node(10).is_none());
    }

    #[test]
    fn clear_useless_nodes_keeps_connected_ones() {
        let mut topo = star();
        topo.add_node(Node::new("idle", None));
        assert_eq!(topo.nodes().len(), 4);
        topo.clear_useless_nodes();
        assert_eq!(topo.nodes().len(), 3);
        assert!(topo.fetch_node("idle").is_none());
    }

    #[test]
    fn connect_requires_known_nodes() {
        let mut topo = star();
        assert_eq!(topo.connect("alpha", "ghost"), Err(Error::UnknownNode));
        assert_eq!(topo.connect("alpha", "beta"), Ok(true));
        assert!(topo.is_edge("alpha", "beta"));
        assert!(topo.remove_edge(2).is_some());
        assert!(!topo.is_edge("alpha", "beta"));
    }

    #[test]
    fn display_marks_edges() {
        let rendered = star().to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("alpha"));
        assert!(lines[1].ends_with('.'));
        assert!(lines[1].contains('^'));
        assert!(lines[2].starts_with("aggregator"));
        assert!(!lines[2].contains('^'));
    }

    #[test]
    fn topology_serializes_to_json() {
        let topo = star();
        let json = serde_json::to_string(&topo).unwrap();
        let back: Topology = serde_json::from_str(&json).unwrap();
        assert_eq!(back, topo);
    }
}
